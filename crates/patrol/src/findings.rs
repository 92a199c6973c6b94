use std::collections::{BTreeMap, BTreeSet};

use observation::{ReportedFinding, Severity};
use serde::{Deserialize, Serialize};

use crate::config::Mode;
use crate::report::{PatrolReport, RunRecord};

/// Lowercase, alphanumeric runs joined by single dashes.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Deterministic dedup identity: `slug(category):slug(title)`.
pub fn finding_key(category: &str, title: &str) -> String {
    format!("{}:{}", slug(category), slug(title))
}

/// A deduplicated, severity-tagged finding carried across runs. Derived each
/// aggregation pass; owns no resources and has no persisted identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub key: String,
    pub category: String,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
    pub suggested_fix: Option<String>,
    pub effort_estimate: Option<String>,
    pub nps_impact: Option<f64>,
    pub repos: BTreeSet<String>,
    pub occurrence_count: u32,
    pub first_seen: String,
    pub transcripts: BTreeSet<String>,
}

impl Finding {
    fn from_reported(
        reported: &ReportedFinding,
        repo: &str,
        first_seen: &str,
        transcript: Option<&str>,
    ) -> Self {
        Finding {
            key: finding_key(&reported.category, &reported.title),
            category: reported.category.clone(),
            severity: reported.severity,
            title: reported.title.clone(),
            detail: reported.detail.clone(),
            suggested_fix: reported
                .suggested_fix
                .clone()
                .filter(|fix| !fix.trim().is_empty()),
            effort_estimate: reported.effort_estimate.clone(),
            nps_impact: reported.nps_impact,
            repos: BTreeSet::from([repo.to_string()]),
            occurrence_count: 1,
            first_seen: first_seen.to_string(),
            transcripts: transcript.map(str::to_string).into_iter().collect(),
        }
    }
}

/// Key-addressed set of findings with the merge rules applied on insert.
#[derive(Debug, Default)]
pub struct FindingsSet {
    map: BTreeMap<String, Finding>,
}

impl FindingsSet {
    pub fn upsert(&mut self, candidate: Finding) {
        match self.map.get_mut(&candidate.key) {
            None => {
                self.map.insert(candidate.key.clone(), candidate);
            }
            Some(existing) => {
                existing.occurrence_count += candidate.occurrence_count;
                existing.repos.extend(candidate.repos);
                existing.transcripts.extend(candidate.transcripts);
                if candidate.detail.len() > existing.detail.len() {
                    existing.detail = candidate.detail;
                }
                if existing.suggested_fix.is_none() {
                    existing.suggested_fix = candidate.suggested_fix;
                }
                if candidate.severity < existing.severity {
                    existing.severity = candidate.severity;
                }
            }
        }
    }

    /// Most severe first, then most frequent, then key for a stable order.
    pub fn into_sorted(self) -> Vec<Finding> {
        let mut findings: Vec<Finding> = self.map.into_values().collect();
        findings.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(b.occurrence_count.cmp(&a.occurrence_count))
                .then(a.key.cmp(&b.key))
        });
        findings
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Severity for an evidence gap depends on how much the mode demands.
fn missing_observation_severity(mode: Mode) -> Severity {
    match mode {
        Mode::Quick => Severity::Medium,
        Mode::Full => Severity::High,
        Mode::Release => Severity::Critical,
    }
}

fn synthetic(
    category: &str,
    title: &str,
    severity: Severity,
    detail: String,
    repo: &str,
    first_seen: &str,
) -> Finding {
    Finding {
        key: finding_key(category, title),
        category: category.to_string(),
        severity,
        title: title.to_string(),
        detail,
        suggested_fix: None,
        effort_estimate: None,
        nps_impact: None,
        repos: BTreeSet::from([repo.to_string()]),
        occurrence_count: 1,
        first_seen: first_seen.to_string(),
        transcripts: BTreeSet::new(),
    }
}

/// Synthesizes a finding for an operational failure of one run, if any.
///
/// Precedence: execution error, then timeout/stall, then non-zero exit, then
/// the quality gap of a clean run with no observation. Runs that produced an
/// observation (terminal or incremental) synthesize nothing.
fn operational_finding(run: &RunRecord, mode: Mode, first_seen: &str) -> Option<Finding> {
    if run.observation.is_some() {
        return None;
    }

    if let Some(error) = run.spawn_error.as_deref().or(run.provisioning_error.as_deref()) {
        return Some(synthetic(
            "runtime",
            "patrol run execution error",
            Severity::High,
            format!("run against `{}` never started: {error}", run.repo),
            &run.repo,
            first_seen,
        ));
    }
    if run.timed_or_stalled() {
        return Some(synthetic(
            "runtime",
            "patrol run timeout no observation",
            Severity::High,
            format!(
                "run against `{}` was terminated ({}) before emitting any observation",
                run.repo,
                run.termination_reason.as_str()
            ),
            &run.repo,
            first_seen,
        ));
    }
    if run.exit_code != Some(0) {
        return Some(synthetic(
            "runtime",
            "patrol run nonzero no observation",
            Severity::High,
            format!(
                "run against `{}` exited with {:?} and emitted no observation",
                run.repo, run.exit_code
            ),
            &run.repo,
            first_seen,
        ));
    }
    Some(synthetic(
        "quality",
        "patrol run missing observation",
        missing_observation_severity(mode),
        format!(
            "run against `{}` completed cleanly but emitted no observation block or markers",
            run.repo
        ),
        &run.repo,
        first_seen,
    ))
}

/// Walks every run of every report and derives the deduplicated findings
/// list: agent-reported negatives plus synthesized operational findings.
pub fn derive_findings(reports: &[PatrolReport]) -> Vec<Finding> {
    let mut set = FindingsSet::default();

    for report in reports {
        for run in &report.runs {
            let transcript = run
                .transcript_path
                .as_ref()
                .map(|p| p.display().to_string());
            if let Some(observation) = &run.observation {
                for reported in &observation.negative_findings {
                    set.upsert(Finding::from_reported(
                        reported,
                        &run.repo,
                        &report.created_at,
                        transcript.as_deref(),
                    ));
                }
            }
            if let Some(finding) = operational_finding(run, report.mode, &report.created_at) {
                set.upsert(finding);
            }
        }

        if report.policy.blocked() {
            set.upsert(synthetic(
                "policy",
                "patrol policy gate blocked",
                Severity::Critical,
                format!(
                    "policy gate blocked: required {} but observed {}",
                    report.policy.required.as_str(),
                    report.policy.observed.as_str()
                ),
                "patrol",
                &report.created_at,
            ));
        }
    }

    set.into_sorted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy;
    use crate::report::test_support::{run_with_observation, run_without_observation};
    use crate::report::{compute_aggregate, StorageTelemetry, REPORT_KIND};
    use observation::ReportedFinding;
    use supervisor::TerminationReason;

    fn report(mode: Mode, runs: Vec<RunRecord>) -> PatrolReport {
        PatrolReport {
            kind: REPORT_KIND.to_string(),
            mode,
            created_at: "2026-02-01T00:00:00Z".to_string(),
            commit_sha: None,
            aggregate: compute_aggregate(&runs),
            policy: policy::evaluate(mode, &runs),
            storage_telemetry: StorageTelemetry {
                tmp_root: std::path::PathBuf::from("/tmp"),
                total_bytes: 0,
                entry_count: 0,
            },
            runs,
        }
    }

    fn reported(title: &str, severity: Severity, detail: &str) -> ReportedFinding {
        ReportedFinding {
            category: "query".to_string(),
            severity,
            title: title.to_string(),
            detail: detail.to_string(),
            suggested_fix: None,
            effort_estimate: None,
            nps_impact: None,
        }
    }

    #[test]
    fn keys_are_deterministic_slugs() {
        assert_eq!(slug("Patrol Run: Missing Observation!"), "patrol-run-missing-observation");
        assert_eq!(
            finding_key("quality", "patrol run missing observation"),
            "quality:patrol-run-missing-observation"
        );
    }

    #[test]
    fn same_key_findings_merge_across_runs() {
        let mut first = run_with_observation("alpha", 6);
        first
            .observation
            .as_mut()
            .unwrap()
            .negative_findings
            .push(reported("slow query", Severity::Medium, "short"));
        let mut second = run_with_observation("bravo", 7);
        let mut again = reported("slow query", Severity::High, "a much longer description");
        again.suggested_fix = Some("add cache".to_string());
        second
            .observation
            .as_mut()
            .unwrap()
            .negative_findings
            .push(again);

        let findings = derive_findings(&[report(Mode::Quick, vec![first, second])]);
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.occurrence_count, 2);
        assert_eq!(finding.repos.len(), 2);
        assert!(finding.occurrence_count as usize >= finding.repos.len());
        assert_eq!(finding.detail, "a much longer description");
        assert_eq!(finding.suggested_fix.as_deref(), Some("add cache"));
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.transcripts.len(), 2);
    }

    #[test]
    fn release_mode_missing_observations_synthesize_critical_quality_findings() {
        let runs = vec![
            run_without_observation("alpha", TerminationReason::Normal, Some(0)),
            run_without_observation("bravo", TerminationReason::Normal, Some(0)),
            run_without_observation("charlie", TerminationReason::Normal, Some(0)),
        ];
        let findings = derive_findings(&[report(Mode::Release, runs)]);

        let quality = findings
            .iter()
            .find(|f| f.key == "quality:patrol-run-missing-observation")
            .expect("quality finding");
        assert_eq!(quality.occurrence_count, 3);
        assert_eq!(quality.repos.len(), 3);
        assert_eq!(quality.severity, Severity::Critical);

        // Release + no observations also blocks the policy gate.
        assert!(findings
            .iter()
            .any(|f| f.key == "policy:patrol-policy-gate-blocked"));
    }

    #[test]
    fn stalled_run_with_markers_synthesizes_nothing() {
        let mut run = run_without_observation("alpha", TerminationReason::Stall, None);
        run.observation = Some(observation::Observation::default());
        let findings = derive_findings(&[report(Mode::Quick, vec![run])]);
        assert!(findings
            .iter()
            .all(|f| f.key != "runtime:patrol-run-timeout-no-observation"));
    }

    #[test]
    fn stalled_run_without_markers_synthesizes_timeout_finding() {
        let run = run_without_observation("alpha", TerminationReason::Stall, None);
        let findings = derive_findings(&[report(Mode::Quick, vec![run])]);
        assert!(findings
            .iter()
            .any(|f| f.key == "runtime:patrol-run-timeout-no-observation"));
    }

    #[test]
    fn spawn_error_synthesizes_execution_error() {
        let run = run_without_observation("alpha", TerminationReason::SpawnError, None);
        let findings = derive_findings(&[report(Mode::Quick, vec![run])]);
        assert!(findings
            .iter()
            .any(|f| f.key == "runtime:patrol-run-execution-error"));
    }

    #[test]
    fn nonzero_exit_synthesizes_runtime_finding() {
        let run = run_without_observation("alpha", TerminationReason::Normal, Some(2));
        let findings = derive_findings(&[report(Mode::Quick, vec![run])]);
        assert!(findings
            .iter()
            .any(|f| f.key == "runtime:patrol-run-nonzero-no-observation"));
    }

    #[test]
    fn sorted_output_puts_most_severe_first() {
        let mut run = run_with_observation("alpha", 5);
        run.observation.as_mut().unwrap().negative_findings.extend([
            reported("minor nit", Severity::Low, "x"),
            reported("broken bootstrap", Severity::Critical, "y"),
        ]);
        let findings = derive_findings(&[report(Mode::Quick, vec![run])]);
        assert_eq!(findings[0].severity, Severity::Critical);
    }
}
