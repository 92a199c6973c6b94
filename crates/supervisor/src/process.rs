use std::{
    io::{self, Write},
    path::Path,
    process::ExitStatus,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task,
};
use tracing::debug;

use crate::SupervisorError;

/// Inserted once into a captured stream when the per-stream byte cap is hit.
pub const TRUNCATION_MARKER: &str = "\n[output truncated: stream byte cap reached]\n";

#[derive(Clone, Copy)]
pub(crate) enum ConsoleTarget {
    Stdout,
    Stderr,
}

/// Last-byte bookkeeping shared between the capture tasks and the stall
/// sampler / heartbeat. `touch` is called on every chunk; the sampler may
/// `refresh` when subtree CPU activity counts as progress.
#[derive(Debug)]
pub struct StreamActivity {
    last: Mutex<Instant>,
    bytes: AtomicU64,
}

impl StreamActivity {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn touch(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        self.refresh();
    }

    pub fn refresh(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    pub fn bytes_captured(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Default for StreamActivity {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct CapturedStream {
    pub(crate) bytes: Vec<u8>,
    pub(crate) truncated: bool,
}

/// Reads a child stream to EOF, buffering at most `byte_cap` bytes.
///
/// Past the cap the marker is appended once and further data is drained
/// without buffering so the child never blocks on a full pipe. Every chunk
/// (buffered or not) counts as activity.
pub(crate) async fn capture_stream<R>(
    mut reader: R,
    target: ConsoleTarget,
    mirror_console: bool,
    byte_cap: usize,
    activity: std::sync::Arc<StreamActivity>,
) -> Result<CapturedStream, io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        activity.touch(n as u64);
        if mirror_console {
            task::block_in_place(|| match target {
                ConsoleTarget::Stdout => {
                    let mut out = io::stdout();
                    out.write_all(&chunk[..n])?;
                    out.flush()
                }
                ConsoleTarget::Stderr => {
                    let mut out = io::stderr();
                    out.write_all(&chunk[..n])?;
                    out.flush()
                }
            })?;
        }
        if truncated {
            continue;
        }
        if buffer.len() + n > byte_cap {
            let room = byte_cap.saturating_sub(buffer.len());
            buffer.extend_from_slice(&chunk[..room]);
            buffer.extend_from_slice(TRUNCATION_MARKER.as_bytes());
            truncated = true;
            continue;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(CapturedStream {
        bytes: buffer,
        truncated,
    })
}

const SPAWN_ATTEMPTS: u32 = 4;
const SPAWN_BACKOFF_START: Duration = Duration::from_millis(5);
const SPAWN_BACKOFF_CAP: Duration = Duration::from_millis(80);

/// Transient spawn failures worth a short, bounded wait: ETXTBSY when a
/// freshly unpacked indexer binary is still being written by a sibling
/// provisioner, EAGAIN under fork pressure when several sandbox helpers
/// start at once. Everything else is a real refusal.
#[cfg(unix)]
pub(crate) fn spawn_retryable(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
pub(crate) fn spawn_retryable(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn spawn_supervised(
    command: &mut Command,
    binary: &Path,
) -> Result<tokio::process::Child, SupervisorError> {
    let mut backoff = SPAWN_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) if attempt < SPAWN_ATTEMPTS && spawn_retryable(&source) => {
                debug!(
                    binary = %binary.display(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "spawn busy; backing off"
                );
                std::thread::sleep(backoff);
                backoff = std::cmp::min(backoff * 2, SPAWN_BACKOFF_CAP);
                attempt += 1;
            }
            Err(source) => {
                return Err(SupervisorError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Folds a finished helper command's streams into one diagnostic string for
/// audit records and error details. stderr is appended under a `[stderr]`
/// marker only when both streams carry content.
pub fn diagnostic_output(output: &CommandOutput) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n[stderr] {stderr}"),
    }
}

/// Runs a short helper command (git, npm, ps) to completion with an optional
/// wall-clock timeout. Helper commands are not agent runs: a timeout here is
/// an error, not a recorded terminal state.
pub async fn run_command(
    mut command: Command,
    binary: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput, SupervisorError> {
    command.stdin(std::process::Stdio::null());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());
    command.kill_on_drop(true);

    let mut child = spawn_supervised(&mut command, binary)?;

    let stdout = child
        .stdout
        .take()
        .ok_or(SupervisorError::StdoutUnavailable)?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SupervisorError::StderrUnavailable)?;

    let activity = std::sync::Arc::new(StreamActivity::new());
    let stdout_task = tokio::spawn(capture_stream(
        stdout,
        ConsoleTarget::Stdout,
        false,
        usize::MAX,
        activity.clone(),
    ));
    let stderr_task = tokio::spawn(capture_stream(
        stderr,
        ConsoleTarget::Stderr,
        false,
        usize::MAX,
        activity,
    ));

    let wait_fut = child.wait();
    let status = if let Some(dur) = timeout {
        tokio::time::timeout(dur, wait_fut)
            .await
            .map_err(|_| SupervisorError::CommandTimeout {
                command: binary.display().to_string(),
                timeout: dur,
            })?
            .map_err(|source| SupervisorError::Wait { source })?
    } else {
        wait_fut
            .await
            .map_err(|source| SupervisorError::Wait { source })?
    };

    let stdout = stdout_task.await??.bytes;
    let stderr = stderr_task.await??.bytes;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}
