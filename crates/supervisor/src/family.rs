use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::process::{diagnostic_output, run_command};

/// The two supported agent provider families, distinguished only by the
/// binary's file name. Each needs different flags to run non-interactively
/// and delivers the prompt differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFamily {
    Codex,
    Claude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    /// Prompt appended as the final positional argument.
    Positional,
    /// Prompt piped through stdin, closed after the trailing newline.
    Stdin,
}

impl AgentFamily {
    pub fn detect(binary: &Path) -> AgentFamily {
        let stem = binary
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if stem.contains("claude") {
            AgentFamily::Claude
        } else {
            AgentFamily::Codex
        }
    }

    /// Flags that make the family run headless to completion.
    pub fn non_interactive_args(self) -> Vec<OsString> {
        match self {
            AgentFamily::Codex => ["exec", "--color", "never", "--skip-git-repo-check"]
                .into_iter()
                .map(OsString::from)
                .collect(),
            AgentFamily::Claude => [
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .into_iter()
            .map(OsString::from)
            .collect(),
        }
    }

    pub fn prompt_delivery(self) -> PromptDelivery {
        match self {
            AgentFamily::Codex => PromptDelivery::Positional,
            AgentFamily::Claude => PromptDelivery::Stdin,
        }
    }

    /// Whether stdout is a line-oriented JSON event stream (branching is by
    /// family, never by sniffing content).
    pub fn emits_event_stream(self) -> bool {
        matches!(self, AgentFamily::Claude)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentFamily::Codex => "codex",
            AgentFamily::Claude => "claude",
        }
    }
}

/// Result of probing the agent binary once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub binary: PathBuf,
    pub family: AgentFamily,
    pub version: Option<semver::Version>,
}

impl AgentProfile {
    /// Family detection without touching the binary; used by tests and by
    /// callers that already probed.
    pub fn offline(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let family = AgentFamily::detect(&binary);
        Self {
            binary,
            family,
            version: None,
        }
    }
}

/// Probes `<binary> --version` for log/report metadata. Probe failure is not
/// fatal: the profile falls back to name-based detection alone.
pub async fn probe_agent(binary: &Path) -> AgentProfile {
    let family = AgentFamily::detect(binary);
    let mut command = tokio::process::Command::new(binary);
    command.arg("--version");
    let version = match run_command(command, binary, Some(std::time::Duration::from_secs(10))).await
    {
        Ok(output) => parse_version_output(&diagnostic_output(&output)),
        Err(error) => {
            warn!(?error, binary = %binary.display(), "agent --version probe failed");
            None
        }
    };
    debug!(
        family = family.as_str(),
        version = version.as_ref().map(|v| v.to_string()),
        "agent capability probe"
    );
    AgentProfile {
        binary: binary.to_path_buf(),
        family,
        version,
    }
}

/// Extracts the first semver-shaped token from a version banner.
pub fn parse_version_output(text: &str) -> Option<semver::Version> {
    for token in text.split_whitespace() {
        let token = token.trim_start_matches('v');
        let candidate: String = token
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || c.is_ascii_alphanumeric())
            .collect();
        if let Ok(version) = semver::Version::parse(&candidate) {
            return Some(version);
        }
    }
    None
}

/// Binary resolution order: explicit flag, then the snapshotted environment
/// override, then `claude` on PATH.
pub fn resolve_agent_binary(explicit: Option<PathBuf>, env_override: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(value) = env_override {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    PathBuf::from("claude")
}
