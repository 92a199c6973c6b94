//! Subprocess supervision for agent patrol runs.
//!
//! This crate owns everything between "we have a target repo" and "the agent
//! produced bytes": sandbox provisioning (workspace copy or shallow clone,
//! indexer install, fast bootstrap), supervised execution under wall-clock /
//! stall / spawn-error triggers, process-group-scoped termination with a
//! lineage audit, and assembly of agent text from line-oriented JSON event
//! streams.
//!
//! Terminal states of the *supervised* process (timeout, stall, spawn
//! refusal) are recorded outcomes, never `Err`; errors are reserved for the
//! supervisor's own plumbing. See [`supervise`] and [`run_agent`].

mod error;
mod events;
mod family;
mod lineage;
mod process;
mod run;
mod sandbox;
mod terminate;

pub use error::SupervisorError;
pub use events::{assemble_agent_text, AssembledText, EventStreamStats};
pub use family::{
    parse_version_output, probe_agent, resolve_agent_binary, AgentFamily, AgentProfile,
    PromptDelivery,
};
pub use lineage::{
    descendants_of, parse_ps_table, snapshot, subtree_cpu_busy, subtree_rows, ProcessRecord,
};
pub use process::{diagnostic_output, run_command, CommandOutput, StreamActivity, TRUNCATION_MARKER};
pub use run::{
    run_agent, supervise, AgentLaunch, AgentOutcome, RunBudgets, SuperviseOutcome, SuperviseSpec,
    DEFAULT_CPU_PROGRESS_THRESHOLD,
};
pub use sandbox::{
    copy_tree, default_tmp_parent, pack_indexer, provision, ProvisionRequest, RepoSource, Sandbox,
    SandboxError, TeardownOutcome, KEEP_MARKER,
};
pub use terminate::{RecoveryAudit, TerminationReason, Terminator};
