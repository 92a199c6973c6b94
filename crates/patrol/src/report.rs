use std::{
    fs, io,
    path::{Path, PathBuf},
};

use observation::{ImplicitSignals, Observation, TaskVariant};
use serde::{Deserialize, Serialize};
use supervisor::{RecoveryAudit, TerminationReason};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::Mode;
use crate::policy::PolicyVerdict;

pub const REPORT_KIND: &str = "PatrolReport.v1";

/// One invocation's output bundle. Written once, then immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatrolReport {
    pub kind: String,
    pub mode: Mode,
    pub created_at: String,
    pub commit_sha: Option<String>,
    pub runs: Vec<RunRecord>,
    pub aggregate: RunAggregate,
    pub policy: PolicyVerdict,
    pub storage_telemetry: StorageTelemetry,
}

/// One agent run inside one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub repo: String,
    pub language: String,
    pub task_variant: TaskVariant,
    pub started_at: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub termination_reason: TerminationReason,
    pub transcript_path: Option<PathBuf>,
    pub observation: Option<Observation>,
    pub implicit_signals: ImplicitSignals,
    #[serde(default)]
    pub spawn_error: Option<String>,
    #[serde(default)]
    pub provisioning_error: Option<String>,
    #[serde(default)]
    pub bootstrap_ok: bool,
    #[serde(default)]
    pub recovery: Option<RecoveryAudit>,
}

impl RunRecord {
    /// A run that started, finished on its own, and exited zero.
    pub fn successful(&self) -> bool {
        self.termination_reason == TerminationReason::Normal
            && self.exit_code == Some(0)
            && self.spawn_error.is_none()
            && self.provisioning_error.is_none()
    }

    pub fn timed_or_stalled(&self) -> bool {
        matches!(
            self.termination_reason,
            TerminationReason::Timeout | TerminationReason::Stall
        )
    }
}

/// Per-invocation quality metrics derived from the runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAggregate {
    pub run_count: usize,
    pub observation_count: usize,
    pub mean_nps: Option<f64>,
    pub would_recommend_rate: Option<f64>,
    pub implicit_fallback_rate: f64,
    pub construction_coverage: Vec<String>,
    pub composition_success_rate: Option<f64>,
    pub registry_discoverability_rate: Option<f64>,
}

pub fn compute_aggregate(runs: &[RunRecord]) -> RunAggregate {
    let observations: Vec<&Observation> =
        runs.iter().filter_map(|run| run.observation.as_ref()).collect();

    let mean_nps = (!observations.is_empty()).then(|| {
        observations.iter().map(|o| o.verdict.nps as f64).sum::<f64>() / observations.len() as f64
    });
    let would_recommend_rate = (!observations.is_empty()).then(|| {
        observations.iter().filter(|o| o.verdict.would_recommend).count() as f64
            / observations.len() as f64
    });

    let implicit_fallback_rate = if runs.is_empty() {
        0.0
    } else {
        runs.iter()
            .filter(|run| run.implicit_signals.any_fallback())
            .count() as f64
            / runs.len() as f64
    };

    let mut construction_coverage: Vec<String> = observations
        .iter()
        .flat_map(|o| o.constructions_used.iter())
        .map(|c| c.construction_id.clone())
        .collect();
    construction_coverage.sort();
    construction_coverage.dedup();

    let compositions: Vec<bool> = observations
        .iter()
        .flat_map(|o| o.compositions_attempted.iter())
        .map(|c| c.succeeded)
        .collect();
    let composition_success_rate = (!compositions.is_empty()).then(|| {
        compositions.iter().filter(|ok| **ok).count() as f64 / compositions.len() as f64
    });

    let registry_discoverability_rate = (!observations.is_empty()).then(|| {
        observations.iter().filter(|o| o.registry.discoverable).count() as f64
            / observations.len() as f64
    });

    RunAggregate {
        run_count: runs.len(),
        observation_count: observations.len(),
        mean_nps,
        would_recommend_rate,
        implicit_fallback_rate,
        construction_coverage,
        composition_success_rate,
        registry_discoverability_rate,
    }
}

/// Snapshot of transient storage at report time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageTelemetry {
    pub tmp_root: PathBuf,
    pub total_bytes: u64,
    pub entry_count: u64,
}

pub fn storage_telemetry(tmp_root: &Path) -> StorageTelemetry {
    let (total_bytes, entry_count) = tree_size(tmp_root);
    StorageTelemetry {
        tmp_root: tmp_root.to_path_buf(),
        total_bytes,
        entry_count,
    }
}

pub(crate) fn tree_size(root: &Path) -> (u64, u64) {
    let mut bytes = 0u64;
    let mut entries = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in read.flatten() {
            entries += 1;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                bytes += meta.len();
            }
        }
    }
    (bytes, entries)
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Resolves the source workspace HEAD for the report stamp.
pub async fn commit_sha(workspace: &Path) -> Option<String> {
    let mut command = tokio::process::Command::new("git");
    command.arg("-C").arg(workspace).arg("rev-parse").arg("HEAD");
    let output = supervisor::run_command(
        command,
        Path::new("git"),
        Some(std::time::Duration::from_secs(10)),
    )
    .await
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report `{path}` already exists; reports are immutable once written")]
    AlreadyExists { path: PathBuf },
    #[error("failed to write report `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read report `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse report `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn write_report(path: &Path, report: &PatrolReport) -> Result<(), ReportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    if path.exists() {
        return Err(ReportError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    let body = serde_json::to_vec_pretty(report).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source: io::Error::other(source),
    })?;
    fs::write(path, body).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_report(path: &Path) -> Result<PatrolReport, ReportError> {
    let bytes = fs::read(path).map_err(|source| ReportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ReportError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn default_artifact_path(workspace: &Path) -> PathBuf {
    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    workspace
        .join(".patrol")
        .join("reports")
        .join(format!("patrol-{stamp}.json"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use observation::Verdict;

    pub fn run_with_observation(repo: &str, nps: u8) -> RunRecord {
        let mut observation = Observation::default();
        observation.verdict = Verdict {
            nps,
            would_recommend: nps >= 7,
            summary: String::new(),
        };
        RunRecord {
            repo: repo.to_string(),
            language: "ts".to_string(),
            task_variant: TaskVariant::Explore,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            duration_ms: 30_000,
            exit_code: Some(0),
            termination_reason: TerminationReason::Normal,
            transcript_path: Some(PathBuf::from(format!("/tmp/{repo}.txt"))),
            observation: Some(observation),
            implicit_signals: ImplicitSignals::default(),
            spawn_error: None,
            provisioning_error: None,
            bootstrap_ok: true,
            recovery: None,
        }
    }

    pub fn run_without_observation(
        repo: &str,
        termination: TerminationReason,
        exit_code: Option<i32>,
    ) -> RunRecord {
        RunRecord {
            repo: repo.to_string(),
            language: "ts".to_string(),
            task_variant: TaskVariant::Explore,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            duration_ms: 10_000,
            exit_code,
            termination_reason: termination,
            transcript_path: None,
            observation: None,
            implicit_signals: ImplicitSignals::default(),
            spawn_error: matches!(termination, TerminationReason::SpawnError)
                .then(|| "spawn refused".to_string()),
            provisioning_error: None,
            bootstrap_ok: true,
            recovery: None,
        }
    }
}
