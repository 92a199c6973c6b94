use std::path::Path;
use std::time::Duration;

use observation::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::findings::Finding;
use supervisor::{diagnostic_output, run_command};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error(transparent)]
    Supervisor(#[from] supervisor::SupervisorError),
    #[error("gh {command} failed: {detail}")]
    CommandFailed { command: &'static str, detail: String },
}

/// Marker embedded in ticket bodies so later sweeps find the tracking ticket
/// for a finding key.
pub fn finding_marker(key: &str) -> String {
    format!("[patrol-finding:{key}]")
}

/// Per-finding filing policy: critical/high always, medium at two
/// occurrences, low at three.
pub fn should_file(finding: &Finding) -> bool {
    match finding.severity {
        Severity::Critical | Severity::High => true,
        Severity::Medium => finding.occurrence_count >= 2,
        Severity::Low => finding.occurrence_count >= 3,
    }
}

/// The significant words of a title: longer than three characters, first
/// four terms, lowercased.
pub fn significant_terms(title: &str) -> Vec<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .take(4)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of `title`'s significant terms that also appear in `other`.
pub fn title_similarity(title: &str, other: &str) -> f64 {
    let terms = significant_terms(title);
    if terms.is_empty() {
        return 0.0;
    }
    let other_terms = significant_terms(other);
    let shared = terms.iter().filter(|t| other_terms.contains(t)).count();
    shared as f64 / terms.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketAction {
    Created,
    Corroborated,
    AlreadyTracked,
    Skipped,
    AcceptedPendingCreation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketOutcome {
    pub key: String,
    pub action: TicketAction,
    pub issue: Option<u64>,
}

/// Files tracking tickets through the `gh` CLI.
///
/// Ticket filing is a side effect: when the CLI is missing or failing, every
/// remaining candidate is marked `accepted_pending_creation` and aggregation
/// output is unaffected.
pub async fn file_tickets(findings: &[Finding]) -> Vec<TicketOutcome> {
    let mut outcomes = Vec::new();
    let mut unavailable = false;

    for finding in findings {
        if !should_file(finding) {
            outcomes.push(TicketOutcome {
                key: finding.key.clone(),
                action: TicketAction::Skipped,
                issue: None,
            });
            continue;
        }
        if unavailable {
            outcomes.push(TicketOutcome {
                key: finding.key.clone(),
                action: TicketAction::AcceptedPendingCreation,
                issue: None,
            });
            continue;
        }
        match file_one(finding).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(error) => {
                warn!(%error, key = %finding.key, "ticket system unavailable");
                unavailable = true;
                outcomes.push(TicketOutcome {
                    key: finding.key.clone(),
                    action: TicketAction::AcceptedPendingCreation,
                    issue: None,
                });
            }
        }
    }
    outcomes
}

async fn file_one(finding: &Finding) -> Result<TicketOutcome, TicketError> {
    let marker = finding_marker(&finding.key);

    // A ticket already carrying the marker wins outright.
    if let Some(number) = search_issue(&marker).await? {
        return Ok(TicketOutcome {
            key: finding.key.clone(),
            action: TicketAction::AlreadyTracked,
            issue: Some(number),
        });
    }

    // Half of the significant title words shared: corroborate instead of
    // opening a near-duplicate.
    if let Some((number, _title)) = similar_issue(&finding.title).await? {
        comment_issue(number, finding).await?;
        return Ok(TicketOutcome {
            key: finding.key.clone(),
            action: TicketAction::Corroborated,
            issue: Some(number),
        });
    }

    let number = create_issue(finding).await?;
    Ok(TicketOutcome {
        key: finding.key.clone(),
        action: TicketAction::Created,
        issue: number,
    })
}

async fn gh(args: &[&str]) -> Result<supervisor::CommandOutput, TicketError> {
    let mut command = Command::new("gh");
    command.args(args);
    Ok(run_command(command, Path::new("gh"), Some(Duration::from_secs(60))).await?)
}

async fn search_issue(marker: &str) -> Result<Option<u64>, TicketError> {
    let output = gh(&[
        "issue", "list", "--state", "open", "--search", marker, "--json", "number",
    ])
    .await?;
    if !output.status.success() {
        return Err(TicketError::CommandFailed {
            command: "issue list",
            detail: diagnostic_output(&output),
        });
    }
    let parsed: Value = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
    Ok(parsed
        .as_array()
        .and_then(|issues| issues.first())
        .and_then(|issue| issue.get("number"))
        .and_then(Value::as_u64))
}

async fn similar_issue(title: &str) -> Result<Option<(u64, String)>, TicketError> {
    let output = gh(&[
        "issue", "list", "--state", "open", "--limit", "100", "--json", "number,title",
    ])
    .await?;
    if !output.status.success() {
        return Ok(None);
    }
    let parsed: Value = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
    let Some(issues) = parsed.as_array() else {
        return Ok(None);
    };
    for issue in issues {
        let (Some(number), Some(existing)) = (
            issue.get("number").and_then(Value::as_u64),
            issue.get("title").and_then(Value::as_str),
        ) else {
            continue;
        };
        if title_similarity(title, existing) >= 0.5 {
            return Ok(Some((number, existing.to_string())));
        }
    }
    Ok(None)
}

fn ticket_body(finding: &Finding) -> String {
    let mut body = String::new();
    body.push_str(&finding.detail);
    body.push_str("\n\n");
    if let Some(fix) = &finding.suggested_fix {
        body.push_str(&format!("Suggested fix: {fix}\n\n"));
    }
    body.push_str(&format!(
        "Severity: {} | Occurrences: {} | Repos: {}\n\n",
        finding.severity.as_str(),
        finding.occurrence_count,
        finding
            .repos
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    ));
    body.push_str(&finding_marker(&finding.key));
    body
}

async fn create_issue(finding: &Finding) -> Result<Option<u64>, TicketError> {
    let title = format!("[patrol] {}", finding.title);
    let body = ticket_body(finding);
    let output = gh(&["issue", "create", "--title", &title, "--body", &body]).await?;
    if !output.status.success() {
        return Err(TicketError::CommandFailed {
            command: "issue create",
            detail: diagnostic_output(&output),
        });
    }
    // `gh issue create` prints the issue URL; the trailing segment is the
    // number.
    let url = String::from_utf8_lossy(&output.stdout);
    let number = url
        .trim()
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse().ok());
    info!(key = %finding.key, ?number, "opened tracking ticket");
    Ok(number)
}

async fn comment_issue(number: u64, finding: &Finding) -> Result<(), TicketError> {
    let body = format!(
        "Corroborated by a new patrol occurrence.\n\n{}",
        ticket_body(finding)
    );
    let issue = number.to_string();
    let output = gh(&["issue", "comment", &issue, "--body", &body]).await?;
    if !output.status.success() {
        warn!(number, "failed to add corroboration comment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn finding(severity: Severity, occurrences: u32) -> Finding {
        Finding {
            key: "quality:example".to_string(),
            category: "quality".to_string(),
            severity,
            title: "example".to_string(),
            detail: "detail".to_string(),
            suggested_fix: None,
            effort_estimate: None,
            nps_impact: None,
            repos: BTreeSet::from(["alpha".to_string()]),
            occurrence_count: occurrences,
            first_seen: "2026-01-01T00:00:00Z".to_string(),
            transcripts: BTreeSet::new(),
        }
    }

    #[test]
    fn filing_policy_scales_with_severity() {
        assert!(should_file(&finding(Severity::Critical, 1)));
        assert!(should_file(&finding(Severity::High, 1)));
        assert!(!should_file(&finding(Severity::Medium, 1)));
        assert!(should_file(&finding(Severity::Medium, 2)));
        assert!(!should_file(&finding(Severity::Low, 2)));
        assert!(should_file(&finding(Severity::Low, 3)));
    }

    #[test]
    fn significant_terms_filter_short_words_and_cap_at_four() {
        assert_eq!(
            significant_terms("the query pack was not relevant to my question"),
            vec!["query", "pack", "relevant", "question"]
        );
        assert!(significant_terms("a an it to").is_empty());
    }

    #[test]
    fn similarity_is_fraction_of_shared_terms() {
        let a = "query pack irrelevant results";
        let b = "irrelevant pack returned for query";
        assert!(title_similarity(a, b) >= 0.5);
        assert_eq!(title_similarity(a, "totally different words here"), 0.0);
    }

    #[test]
    fn marker_embeds_the_key() {
        assert_eq!(
            finding_marker("quality:patrol-run-missing-observation"),
            "[patrol-finding:quality:patrol-run-missing-observation]"
        );
    }
}
