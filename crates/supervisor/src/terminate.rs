use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::lineage::{self, ProcessRecord};

/// How a supervised run reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Normal,
    Timeout,
    Stall,
    SpawnError,
    None,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Normal => "normal",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Stall => "stall",
            TerminationReason::SpawnError => "spawn_error",
            TerminationReason::None => "none",
        }
    }
}

/// Audit trail of one forced termination. `target_still_alive_pids` is always
/// a subset of `target_descendant_pids`; pids outside the recorded lineage
/// are never signalled and never appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAudit {
    pub reason: TerminationReason,
    pub polite_signal: String,
    pub forceful_signal: String,
    pub grace_ms: u64,
    pub target_descendant_pids: Vec<i32>,
    pub pre_termination: Vec<ProcessRecord>,
    pub target_still_alive_pids: Vec<i32>,
    pub secondary_triggers: Vec<String>,
    pub leaked_descendants: bool,
}

/// Single funnel that converts the three asynchronous triggers into one
/// terminal state. The first caller wins; later triggers are audit-only.
pub struct Terminator {
    child_pid: Option<i32>,
    grace: Duration,
    state: Mutex<TerminatorState>,
}

#[derive(Default)]
struct TerminatorState {
    fired: Option<TerminationReason>,
    secondary: Vec<String>,
}

impl Terminator {
    pub fn new(child_pid: Option<i32>, grace: Duration) -> Self {
        Self {
            child_pid,
            grace,
            state: Mutex::new(TerminatorState::default()),
        }
    }

    /// Records a clean exit so that later timer wakeups become audit-only.
    pub fn mark_normal(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fired.is_none() {
            state.fired = Some(TerminationReason::Normal);
        }
    }

    pub fn fired_reason(&self) -> Option<TerminationReason> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fired
    }

    fn claim(&self, reason: TerminationReason) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.fired {
            None => {
                state.fired = Some(reason);
                true
            }
            Some(first) => {
                debug!(
                    first = first.as_str(),
                    second = reason.as_str(),
                    "secondary termination trigger"
                );
                state.secondary.push(reason.as_str().to_string());
                false
            }
        }
    }

    /// Terminates the child's process group: lineage snapshot, SIGTERM to the
    /// group, SIGKILL after the grace interval, post-termination liveness
    /// check. Scope is the recorded subtree; nothing else is ever signalled.
    ///
    /// Returns `None` when another trigger already claimed the termination.
    pub async fn terminate(&self, reason: TerminationReason) -> Option<RecoveryAudit> {
        if !self.claim(reason) {
            return None;
        }

        let Some(pid) = self.child_pid else {
            return Some(self.audit(reason, Vec::new(), Vec::new(), Vec::new()));
        };

        let table = lineage::snapshot().await;
        let descendants = lineage::descendants_of(&table, pid);
        let pre: Vec<ProcessRecord> = lineage::subtree_rows(&table, pid)
            .into_iter()
            .cloned()
            .collect();

        signal_group(pid, Signal::Term);
        tokio::time::sleep(self.grace).await;
        if any_alive(&descendants) {
            signal_group(pid, Signal::Kill);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let still_alive: Vec<i32> = descendants
            .iter()
            .copied()
            .filter(|p| pid_alive(*p))
            .collect();
        if !still_alive.is_empty() {
            warn!(?still_alive, "descendants survived forced termination");
        }

        Some(self.audit(reason, descendants, pre, still_alive))
    }

    fn audit(
        &self,
        reason: TerminationReason,
        descendants: Vec<i32>,
        pre: Vec<ProcessRecord>,
        still_alive: Vec<i32>,
    ) -> RecoveryAudit {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        RecoveryAudit {
            reason,
            polite_signal: "SIGTERM".to_string(),
            forceful_signal: "SIGKILL".to_string(),
            grace_ms: self.grace.as_millis() as u64,
            target_descendant_pids: descendants,
            pre_termination: pre,
            leaked_descendants: !still_alive.is_empty(),
            target_still_alive_pids: still_alive,
            secondary_triggers: state.secondary.clone(),
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: i32, signal: Signal) {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child was launched as a new group leader, so its pid names the
    // group. Unrelated workloads live in other groups and are untouched.
    let rc = unsafe { libc::killpg(pid, signo) };
    if rc != 0 {
        debug!(pid, signo, "killpg returned non-zero (group likely gone)");
    }
}

#[cfg(not(unix))]
fn signal_group(pid: i32, signal: Signal) {
    let _ = (pid, signal);
    warn!(pid, "process-group signalling unsupported on this platform");
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

fn any_alive(pids: &[i32]) -> bool {
    pids.iter().any(|p| pid_alive(*p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_trigger_wins() {
        let terminator = Terminator::new(None, Duration::from_millis(1));
        let first = terminator.terminate(TerminationReason::Timeout).await;
        assert!(first.is_some());
        let second = terminator.terminate(TerminationReason::Stall).await;
        assert!(second.is_none());
        assert_eq!(
            terminator.fired_reason(),
            Some(TerminationReason::Timeout)
        );
    }

    #[tokio::test]
    async fn secondary_triggers_are_audit_only() {
        let terminator = Terminator::new(None, Duration::from_millis(1));
        terminator.terminate(TerminationReason::Timeout).await;
        terminator.terminate(TerminationReason::Stall).await;
        let audit = terminator
            .audit(TerminationReason::Timeout, vec![], vec![], vec![]);
        assert_eq!(audit.secondary_triggers, vec!["stall".to_string()]);
    }

    #[tokio::test]
    async fn normal_exit_blocks_later_triggers() {
        let terminator = Terminator::new(None, Duration::from_millis(1));
        terminator.mark_normal();
        assert!(terminator
            .terminate(TerminationReason::Timeout)
            .await
            .is_none());
        assert_eq!(terminator.fired_reason(), Some(TerminationReason::Normal));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn still_alive_is_subset_of_descendants() {
        let terminator = Terminator::new(Some(std::process::id() as i32 + 777_000), Duration::from_millis(1));
        let audit = terminator
            .terminate(TerminationReason::Stall)
            .await
            .expect("first trigger");
        for pid in &audit.target_still_alive_pids {
            assert!(audit.target_descendant_pids.contains(pid));
        }
    }
}
