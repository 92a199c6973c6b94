use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::Mode;
use crate::policy::Enforcement;
use crate::report::PatrolReport;

pub const LEDGER_KIND: &str = "PatrolLedger.v1";
/// Bounded ring: at most this many entries are retained, oldest evicted.
pub const LEDGER_CAP: usize = 50;

/// Compact summary of one report, retained for drift windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub created_at: String,
    pub mode: Mode,
    pub mean_nps: Option<f64>,
    pub would_recommend_rate: Option<f64>,
    pub implicit_fallback_rate: f64,
    pub observation_count: usize,
    pub run_count: usize,
    pub enforcement: Enforcement,
}

impl LedgerEntry {
    pub fn from_report(report: &PatrolReport) -> Self {
        LedgerEntry {
            created_at: report.created_at.clone(),
            mode: report.mode,
            mean_nps: report.aggregate.mean_nps,
            would_recommend_rate: report.aggregate.would_recommend_rate,
            implicit_fallback_rate: report.aggregate.implicit_fallback_rate,
            observation_count: report.aggregate.observation_count,
            run_count: report.aggregate.run_count,
            enforcement: report.policy.enforcement,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub kind: String,
    pub entries: Vec<LedgerEntry>,
}

impl Default for Ledger {
    fn default() -> Self {
        Ledger {
            kind: LEDGER_KIND.to_string(),
            entries: Vec::new(),
        }
    }
}

impl Ledger {
    /// Appends an entry, evicting the oldest beyond [`LEDGER_CAP`].
    pub fn append(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
        while self.entries.len() > LEDGER_CAP {
            self.entries.remove(0);
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to write ledger `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of loading the ledger; a corrupt file starts fresh and preserves
/// the unreadable contents in a sidecar for post-mortem.
#[derive(Debug)]
pub struct LoadedLedger {
    pub ledger: Ledger,
    pub recovered_from_corruption: bool,
}

pub fn load_ledger(path: &Path) -> LoadedLedger {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => {
            return LoadedLedger {
                ledger: Ledger::default(),
                recovered_from_corruption: false,
            }
        }
    };
    match serde_json::from_slice::<Ledger>(&bytes) {
        Ok(ledger) => LoadedLedger {
            ledger,
            recovered_from_corruption: false,
        },
        Err(error) => {
            let sidecar = sidecar_path(path);
            warn!(
                path = %path.display(),
                sidecar = %sidecar.display(),
                %error,
                "ledger did not parse; starting empty and preserving prior contents"
            );
            if let Err(rename_error) = fs::rename(path, &sidecar) {
                warn!(%rename_error, "failed to preserve corrupt ledger");
            }
            LoadedLedger {
                ledger: Ledger::default(),
                recovered_from_corruption: true,
            }
        }
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger.json".to_string());
    name.push_str(".corrupt");
    path.with_file_name(name)
}

pub fn save_ledger(path: &Path, ledger: &Ledger) -> Result<(), LedgerError> {
    let write_err = |source: io::Error| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let body = serde_json::to_vec_pretty(ledger).map_err(|e| write_err(io::Error::other(e)))?;
    fs::write(path, body).map_err(write_err)
}

pub fn default_ledger_path(workspace: &Path) -> PathBuf {
    workspace.join(".patrol").join("ledger.json")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn entry_with_nps(nps: f64) -> LedgerEntry {
        LedgerEntry {
            created_at: "2026-01-01T00:00:00Z".to_string(),
            mode: Mode::Quick,
            mean_nps: Some(nps),
            would_recommend_rate: Some(1.0),
            implicit_fallback_rate: 0.0,
            observation_count: 1,
            run_count: 1,
            enforcement: Enforcement::Allowed,
        }
    }
}
