use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::warn;

use crate::process::run_command;

/// One row of the process table, as sampled by `ps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
    pub user: String,
    pub elapsed: String,
    pub cpu: f64,
    pub command: String,
}

/// Parses `ps -eo pid=,ppid=,user=,etime=,pcpu=,args=` output. Rows that do
/// not split into at least six columns are skipped.
pub fn parse_ps_table(text: &str) -> Vec<ProcessRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(pid), Some(ppid), Some(user), Some(elapsed), Some(cpu)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            continue;
        };
        let (Ok(pid), Ok(ppid), Ok(cpu)) =
            (pid.parse::<i32>(), ppid.parse::<i32>(), cpu.parse::<f64>())
        else {
            continue;
        };
        let command = parts.collect::<Vec<_>>().join(" ");
        if command.is_empty() {
            continue;
        }
        records.push(ProcessRecord {
            pid,
            ppid,
            user: user.to_string(),
            elapsed: elapsed.to_string(),
            cpu,
            command,
        });
    }
    records
}

/// Samples the live process table. Failure to run or parse `ps` yields an
/// empty table; callers treat that as "no lineage evidence", never as license
/// to widen the termination scope.
pub async fn snapshot() -> Vec<ProcessRecord> {
    let mut command = Command::new("ps");
    command.args(["-eo", "pid=,ppid=,user=,etime=,pcpu=,args="]);
    match run_command(
        command,
        Path::new("ps"),
        Some(std::time::Duration::from_secs(5)),
    )
    .await
    {
        // The table rides stdout; `ps` chatter on stderr is not row data.
        Ok(output) => parse_ps_table(&String::from_utf8_lossy(&output.stdout)),
        Err(error) => {
            warn!(?error, "process table snapshot failed");
            Vec::new()
        }
    }
}

/// The pid subtree rooted at `root`, including `root` itself when present in
/// the table (and always as the first element, so signalling a vanished root
/// is still recorded in the audit).
pub fn descendants_of(table: &[ProcessRecord], root: i32) -> Vec<i32> {
    let mut out = vec![root];
    let mut seen: BTreeSet<i32> = BTreeSet::new();
    seen.insert(root);
    let mut queue: VecDeque<i32> = VecDeque::new();
    queue.push_back(root);
    while let Some(parent) = queue.pop_front() {
        for record in table {
            if record.ppid == parent && seen.insert(record.pid) {
                out.push(record.pid);
                queue.push_back(record.pid);
            }
        }
    }
    out
}

/// Rows of `table` whose pid belongs to the subtree rooted at `root`.
pub fn subtree_rows<'a>(table: &'a [ProcessRecord], root: i32) -> Vec<&'a ProcessRecord> {
    let pids: BTreeSet<i32> = descendants_of(table, root).into_iter().collect();
    table.iter().filter(|r| pids.contains(&r.pid)).collect()
}

/// True when any process in the subtree is consuming CPU above `threshold`
/// percent. Used by the stall sampler: a busy-but-silent agent is progress.
pub fn subtree_cpu_busy(table: &[ProcessRecord], root: i32, threshold: f64) -> bool {
    subtree_rows(table, root).iter().any(|r| r.cpu > threshold)
}
