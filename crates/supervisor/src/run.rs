use std::{
    collections::BTreeMap,
    ffi::OsString,
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{io::AsyncWriteExt, process::Command};
use tracing::info;

use crate::{
    events::{assemble_agent_text, EventStreamStats},
    family::{AgentProfile, PromptDelivery},
    lineage,
    process::{capture_stream, spawn_supervised, ConsoleTarget, StreamActivity},
    terminate::{RecoveryAudit, TerminationReason, Terminator},
    SupervisorError,
};

/// Interval at which the stall sampler re-checks output activity.
const STALL_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Subtree CPU (percent) above which a silent agent still counts as making
/// progress.
pub const DEFAULT_CPU_PROGRESS_THRESHOLD: f64 = 5.0;

/// Stand-in period for disabled timers; never expected to elapse.
const DISABLED_PERIOD: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// One supervised subprocess invocation. Zero durations disable the
/// corresponding trigger.
#[derive(Debug, Clone)]
pub struct SuperviseSpec {
    pub binary: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub wall_clock: Duration,
    pub stall_timeout: Duration,
    pub heartbeat: Duration,
    pub stream_byte_cap: usize,
    pub grace: Duration,
    pub cpu_progress_threshold: f64,
    pub mirror_output: bool,
    pub label: String,
}

impl SuperviseSpec {
    pub fn new(binary: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            stdin: None,
            wall_clock: Duration::ZERO,
            stall_timeout: Duration::ZERO,
            heartbeat: Duration::ZERO,
            stream_byte_cap: 4 * 1024 * 1024,
            grace: Duration::from_millis(1500),
            cpu_progress_threshold: DEFAULT_CPU_PROGRESS_THRESHOLD,
            mirror_output: false,
            label: "child".to_string(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn wall_clock(mut self, budget: Duration) -> Self {
        self.wall_clock = budget;
        self
    }

    pub fn stall_timeout(mut self, budget: Duration) -> Self {
        self.stall_timeout = budget;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Everything recorded about one supervised invocation. Spawn refusal is a
/// recorded terminal state (`termination == SpawnError`), not an `Err`.
#[derive(Debug)]
pub struct SuperviseOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub termination: TerminationReason,
    pub recovery: Option<RecoveryAudit>,
    pub duration: Duration,
    pub bytes_captured: u64,
    pub spawn_error: Option<String>,
}

impl SuperviseOutcome {
    fn spawn_refused(message: String, duration: Duration) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            termination: TerminationReason::SpawnError,
            recovery: None,
            duration,
            bytes_captured: 0,
            spawn_error: Some(message),
        }
    }

    pub fn timed_out(&self) -> bool {
        self.termination == TerminationReason::Timeout
    }
}

/// Strictness of the stall trigger: a threshold exactly met is not a stall.
pub(crate) fn stall_exceeded(idle: Duration, threshold: Duration) -> bool {
    idle > threshold
}

/// Supervises one subprocess under the three termination triggers.
///
/// The triggers converge through a single idempotent [`Terminator`]; a second
/// trigger after the first is audit-only. Captured streams preserve arrival
/// order and are bounded by the byte cap.
pub async fn supervise(spec: SuperviseSpec) -> Result<SuperviseOutcome, SupervisorError> {
    let started = Instant::now();

    let mut command = Command::new(&spec.binary);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    command.stdin(if spec.stdin.is_some() {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    });
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    // New process group so termination can be scoped to the agent's own
    // lineage and never touch unrelated workloads.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match spawn_supervised(&mut command, &spec.binary) {
        Ok(child) => child,
        Err(SupervisorError::Spawn { source, .. }) => {
            return Ok(SuperviseOutcome::spawn_refused(
                source.to_string(),
                started.elapsed(),
            ));
        }
        Err(other) => return Err(other),
    };

    if let Some(prompt) = &spec.stdin {
        let mut stdin = child.stdin.take().ok_or(SupervisorError::StdinUnavailable)?;
        for payload in [prompt.as_bytes(), b"\n".as_slice()] {
            if let Err(source) = stdin.write_all(payload).await {
                if source.kind() != ErrorKind::BrokenPipe {
                    return Err(SupervisorError::StdinWrite(source));
                }
            }
        }
        if let Err(source) = stdin.shutdown().await {
            if source.kind() != ErrorKind::BrokenPipe {
                return Err(SupervisorError::StdinWrite(source));
            }
        }
    } else {
        let _ = child.stdin.take();
    }

    let stdout = child
        .stdout
        .take()
        .ok_or(SupervisorError::StdoutUnavailable)?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SupervisorError::StderrUnavailable)?;

    let activity = Arc::new(StreamActivity::new());
    let stdout_task = tokio::spawn(capture_stream(
        stdout,
        ConsoleTarget::Stdout,
        spec.mirror_output,
        spec.stream_byte_cap,
        activity.clone(),
    ));
    let stderr_task = tokio::spawn(capture_stream(
        stderr,
        ConsoleTarget::Stderr,
        spec.mirror_output,
        spec.stream_byte_cap,
        activity.clone(),
    ));

    let pid = child.id().map(|p| p as i32);
    let terminator = Terminator::new(pid, spec.grace);
    let mut recovery: Option<RecoveryAudit> = None;

    let wall_enabled = !spec.wall_clock.is_zero();
    let stall_enabled = !spec.stall_timeout.is_zero();
    let heartbeat_enabled = !spec.heartbeat.is_zero();

    let wall = tokio::time::sleep(if wall_enabled {
        spec.wall_clock
    } else {
        DISABLED_PERIOD
    });
    tokio::pin!(wall);

    let mut stall_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + STALL_SAMPLE_INTERVAL,
        STALL_SAMPLE_INTERVAL,
    );
    stall_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let heartbeat_period = if heartbeat_enabled {
        spec.heartbeat
    } else {
        DISABLED_PERIOD
    };
    let mut heartbeat_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);
    heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let status = loop {
        tokio::select! {
            result = child.wait() => {
                break result.map_err(|source| SupervisorError::Wait { source })?;
            }
            _ = &mut wall, if wall_enabled && recovery.is_none() => {
                recovery = terminator.terminate(TerminationReason::Timeout).await;
            }
            _ = stall_tick.tick(), if stall_enabled && recovery.is_none() => {
                if stall_exceeded(activity.idle_for(), spec.stall_timeout) {
                    let busy = match pid {
                        Some(root) => {
                            let table = lineage::snapshot().await;
                            lineage::subtree_cpu_busy(&table, root, spec.cpu_progress_threshold)
                        }
                        None => false,
                    };
                    if busy {
                        activity.refresh();
                    } else {
                        recovery = terminator.terminate(TerminationReason::Stall).await;
                    }
                }
            }
            _ = heartbeat_tick.tick(), if heartbeat_enabled => {
                info!(
                    label = %spec.label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    bytes_captured = activity.bytes_captured(),
                    "supervisor heartbeat"
                );
            }
            interrupt = tokio::signal::ctrl_c(), if recovery.is_none() => {
                // The child runs in its own process group and will not see
                // the terminal's SIGINT; perform the full termination
                // sequence before the process goes down.
                if interrupt.is_ok() {
                    tracing::warn!(label = %spec.label, "interrupt received; terminating supervised child");
                    recovery = terminator.terminate(TerminationReason::None).await;
                }
            }
        }
    };

    terminator.mark_normal();

    let stdout = stdout_task.await??;
    let stderr = stderr_task.await??;
    let termination = terminator
        .fired_reason()
        .unwrap_or(TerminationReason::Normal);

    Ok(SuperviseOutcome {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        termination,
        recovery,
        duration: started.elapsed(),
        bytes_captured: activity.bytes_captured(),
        spawn_error: None,
    })
}

/// Time and volume budgets for one agent run.
#[derive(Debug, Clone, Copy)]
pub struct RunBudgets {
    pub wall_clock: Duration,
    pub stall_timeout: Duration,
    pub heartbeat: Duration,
    pub stream_byte_cap: usize,
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(900),
            stall_timeout: Duration::from_secs(300),
            heartbeat: Duration::from_secs(30),
            stream_byte_cap: 4 * 1024 * 1024,
        }
    }
}

/// One agent invocation inside a provisioned sandbox.
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub profile: AgentProfile,
    pub prompt: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub budgets: RunBudgets,
    pub mirror_output: bool,
}

/// Supervision outcome plus the agent's assembled textual output.
#[derive(Debug)]
pub struct AgentOutcome {
    pub supervise: SuperviseOutcome,
    pub agent_text: String,
    pub event_stats: Option<EventStreamStats>,
}

/// Spawns the agent with family-appropriate flags and prompt delivery, then
/// assembles its text (event-stream families) or takes stdout verbatim.
pub async fn run_agent(launch: AgentLaunch) -> Result<AgentOutcome, SupervisorError> {
    let family = launch.profile.family;
    let mut args = family.non_interactive_args();
    let stdin = match family.prompt_delivery() {
        PromptDelivery::Positional => {
            args.push(OsString::from(launch.prompt.clone()));
            None
        }
        PromptDelivery::Stdin => Some(launch.prompt.clone()),
    };

    let spec = SuperviseSpec {
        binary: launch.profile.binary.clone(),
        args,
        cwd: launch.cwd.clone(),
        env: launch.env.clone(),
        stdin,
        wall_clock: launch.budgets.wall_clock,
        stall_timeout: launch.budgets.stall_timeout,
        heartbeat: launch.budgets.heartbeat,
        stream_byte_cap: launch.budgets.stream_byte_cap,
        grace: Duration::from_millis(1500),
        cpu_progress_threshold: DEFAULT_CPU_PROGRESS_THRESHOLD,
        mirror_output: launch.mirror_output,
        label: format!("agent:{}", family.as_str()),
    };

    let outcome = supervise(spec).await?;
    let (agent_text, event_stats) = if family.emits_event_stream() {
        let assembled = assemble_agent_text(&outcome.stdout);
        (assembled.text, Some(assembled.stats))
    } else {
        (outcome.stdout.trim().to_string(), None)
    };

    Ok(AgentOutcome {
        supervise: outcome,
        agent_text,
        event_stats,
    })
}
