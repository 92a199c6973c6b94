use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::terminal::contains_block_start;

/// Behaviour inferred from the raw transcript rather than reported by the
/// agent: tool-avoidance fallbacks, failed commands, and early aborts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImplicitSignals {
    pub grep_fallback: bool,
    pub file_read_fallback: bool,
    pub command_failures: u32,
    pub aborted_early: bool,
}

impl ImplicitSignals {
    pub fn any_fallback(&self) -> bool {
        self.grep_fallback || self.file_read_fallback
    }
}

/// Transcripts shorter than this with no terminal sentinel are treated as
/// aborted-early runs.
const ABORTED_EARLY_MAX_LEN: usize = 400;

const FAILURE_TOKENS: [&str; 5] = [
    "command not found",
    "No such file or directory",
    "ENOENT",
    "npm ERR!",
    "Permission denied",
];

fn grep_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(\bgrep\b\s+-[A-Za-z]*r|\bgrep\b.*--recursive|\brg\b\s|\bfind\b[^\n]*\s-name\b)")
            .unwrap()
    })
}

fn file_read_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)\b(cat|head|tail)\b[^\n|;&]*\.(ts|tsx|js|jsx|mjs|cjs|py|rs|go|java|rb|c|h|cpp|hpp)\b",
        )
        .unwrap()
    })
}

/// Scans the assembled raw output for fallback behaviour the agent did not
/// self-report.
pub fn detect_implicit_signals(raw: &str) -> ImplicitSignals {
    let command_failures = FAILURE_TOKENS
        .iter()
        .map(|token| raw.matches(token).count() as u32)
        .sum();
    ImplicitSignals {
        grep_fallback: grep_fallback_re().is_match(raw),
        file_read_fallback: file_read_re().is_match(raw),
        command_failures,
        aborted_early: raw.len() < ABORTED_EARLY_MAX_LEN && !contains_block_start(raw),
    }
}
