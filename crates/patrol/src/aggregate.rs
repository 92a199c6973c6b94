use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::drift::{drift_signals, DriftSignal};
use crate::findings::{derive_findings, Finding};
use crate::ledger::{load_ledger, Ledger};
use crate::report::{load_report, now_rfc3339, PatrolReport, ReportError};
use crate::tickets::{file_tickets, TicketOutcome};

/// Merges saved report artifacts (and optionally the ledger) into a
/// deduplicated findings summary, offline.
#[derive(Debug, Parser)]
pub struct Args {
    /// Report artifact; repeat for several.
    #[arg(long = "report", required = true)]
    pub reports: Vec<PathBuf>,

    /// Evidence ledger for drift context.
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// JSON summary output path (stdout when omitted).
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Markdown summary output path.
    #[arg(long)]
    pub markdown_out: Option<PathBuf>,

    /// Open/corroborate tracking tickets for qualifying findings.
    #[arg(long)]
    pub file_tickets: bool,
}

pub const AGGREGATION_KIND: &str = "PatrolAggregation.v1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationOutput {
    pub kind: String,
    pub created_at: String,
    pub report_count: usize,
    pub findings: Vec<Finding>,
    pub construction_coverage: Vec<String>,
    pub drift: Vec<DriftSignal>,
    pub tickets: Vec<TicketOutcome>,
}

/// Pure aggregation pass: findings are re-derived from the union of inputs,
/// coverage is the union of per-report coverage, drift compares the most
/// recent report against the trailing ledger window.
pub fn aggregate_reports(reports: &[PatrolReport], ledger: Option<&Ledger>) -> AggregationOutput {
    let findings = derive_findings(reports);

    let coverage: BTreeSet<String> = reports
        .iter()
        .flat_map(|report| report.aggregate.construction_coverage.iter().cloned())
        .collect();

    let drift = match (ledger, reports.last()) {
        (Some(ledger), Some(latest)) => drift_signals(&ledger.entries, &latest.aggregate),
        _ => Vec::new(),
    };

    AggregationOutput {
        kind: AGGREGATION_KIND.to_string(),
        created_at: now_rfc3339(),
        report_count: reports.len(),
        findings,
        construction_coverage: coverage.into_iter().collect(),
        drift,
        tickets: Vec::new(),
    }
}

pub fn render_markdown(output: &AggregationOutput) -> String {
    let mut md = String::new();
    md.push_str("# Patrol findings\n\n");
    md.push_str(&format!(
        "{} report(s), {} deduplicated finding(s)\n\n",
        output.report_count,
        output.findings.len()
    ));

    if output.findings.is_empty() {
        md.push_str("No findings.\n");
    } else {
        md.push_str("| Severity | Key | Occurrences | Repos | Title |\n");
        md.push_str("|---|---|---|---|---|\n");
        for finding in &output.findings {
            md.push_str(&format!(
                "| {} | `{}` | {} | {} | {} |\n",
                finding.severity.as_str(),
                finding.key,
                finding.occurrence_count,
                finding.repos.len(),
                finding.title
            ));
        }
    }

    if !output.construction_coverage.is_empty() {
        md.push_str("\n## Construction coverage\n\n");
        for id in &output.construction_coverage {
            md.push_str(&format!("- `{id}`\n"));
        }
    }

    if !output.drift.is_empty() {
        md.push_str("\n## Drift signals\n\n");
        for signal in &output.drift {
            md.push_str(&format!(
                "- **{}**: {:.2} against a window mean of {:.2} (delta {:+.2})\n",
                signal.metric, signal.current, signal.window_mean, signal.delta
            ));
        }
    }

    md
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub async fn run(args: &Args) -> Result<i32, AggregateError> {
    let mut reports = Vec::new();
    for path in &args.reports {
        reports.push(load_report(path)?);
    }
    // Drift compares the most recent report; keep inputs in time order.
    reports.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let ledger = args.ledger.as_deref().map(|path| load_ledger(path).ledger);
    let mut output = aggregate_reports(&reports, ledger.as_ref());

    if args.file_tickets {
        output.tickets = file_tickets(&output.findings).await;
    }

    let json = serde_json::to_string_pretty(&output).map_err(|e| AggregateError::Write {
        path: args.out.clone().unwrap_or_else(|| PathBuf::from("-")),
        source: io::Error::other(e),
    })?;
    match &args.out {
        Some(path) => write_text(path, &json)?,
        None => println!("{json}"),
    }
    if let Some(path) = &args.markdown_out {
        write_text(path, &render_markdown(&output))?;
    }

    info!(
        findings = output.findings.len(),
        drift = output.drift.len(),
        "aggregation complete"
    );
    Ok(0)
}

fn write_text(path: &Path, body: &str) -> Result<(), AggregateError> {
    let write_err = |source: io::Error| AggregateError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, body).map_err(write_err)
}
