use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors that may occur while supervising or running helper subprocesses.
///
/// Agent-level terminal states (timeout, stall, spawn refusal) are *not*
/// errors: they surface as [`crate::TerminationReason`] on the run outcome.
/// This enum covers plumbing failures the supervisor itself cannot absorb.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for child process: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },
    #[error("child stdout unavailable")]
    StdoutUnavailable,
    #[error("child stderr unavailable")]
    StderrUnavailable,
    #[error("child stdin unavailable")]
    StdinUnavailable,
    #[error("failed to write to child stdin: {0}")]
    StdinWrite(#[source] std::io::Error),
    #[error("failed to capture child output: {0}")]
    CaptureIo(#[from] std::io::Error),
    #[error("failed to join capture task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("command `{command}` exceeded timeout of {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
}
