use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use clap::Parser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{EnvSnapshot, ENV_EMBEDDING_MODEL, ENV_EMBEDDING_PROVIDER};
use crate::report::now_rfc3339;
use supervisor::{
    diagnostic_output, run_command, supervise, SuperviseSpec, SupervisorError,
    TerminationReason,
};

/// Drives the indexer end-to-end inside a fresh clone of the source
/// workspace and verifies health, durability, and query relevance.
#[derive(Debug, Parser)]
pub struct Args {
    /// Output artifact path.
    #[arg(long)]
    pub artifact: Option<PathBuf>,

    /// Workspace to clone and exercise.
    #[arg(long, default_value = ".")]
    pub source_workspace: PathBuf,

    /// Preserve the sandbox clone on exit.
    #[arg(long)]
    pub keep_sandbox: bool,

    /// Embedding provider passed through to the indexer.
    #[arg(long)]
    pub embedding_provider: Option<String>,

    /// Embedding model passed through to the indexer.
    #[arg(long)]
    pub embedding_model: Option<String>,

    /// Let bootstrap proceed without a configured embedding provider.
    #[arg(long)]
    pub allow_providerless: bool,

    #[arg(long, default_value_t = 120_000)]
    pub command_timeout_ms: u64,

    #[arg(long, default_value_t = 600_000)]
    pub bootstrap_timeout_ms: u64,

    #[arg(long, default_value_t = 300_000)]
    pub bootstrap_stall_timeout_ms: u64,
}

pub const GATE_KIND: &str = "CleanCloneGate.v1";

/// Lock tokens recognized in subcommand output and attached to the audit.
pub const LOCK_TOKENS: [&str; 4] = ["index.lock", "storage.lock", "lock held", "EBUSY"];

/// Reference questions with expected-relevant file patterns, checked against
/// the query output.
const REFERENCE_QUESTIONS: [(&str, &[&str]); 3] = [
    (
        "Where is the command line entry point defined?",
        &["bin/", "cli", "main"],
    ),
    (
        "How are embeddings persisted between runs?",
        &["storage", "embed"],
    ),
    (
        "Which module decides whether a bootstrap is required?",
        &["bootstrap", "status"],
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAudit {
    pub name: String,
    pub exit_code: Option<i32>,
    pub termination: TerminationReason,
    pub duration_ms: u64,
    pub lock_signals: Vec<String>,
    pub output_tail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCheck {
    pub question: String,
    pub expected_patterns: Vec<String>,
    pub matched: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurabilityOutcome {
    pub scenario: String,
    pub expected_relation: String,
    pub relation_ok: bool,
    pub recovered: bool,
    pub query_ok: bool,
}

impl DurabilityOutcome {
    pub fn ok(&self) -> bool {
        self.relation_ok && self.recovered && self.query_ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub storage_state: String,
    pub bootstrap_required: bool,
    pub function_count: u64,
    pub embedding_count: u64,
    pub semantic_coverage: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub kind: String,
    pub created_at: String,
    pub pass: bool,
    pub error: Option<String>,
    pub commands: Vec<CommandAudit>,
    pub health: Option<HealthSummary>,
    pub query_checks: Vec<QueryCheck>,
    pub durability: Vec<DurabilityOutcome>,
    pub sandbox_kept: Option<PathBuf>,
}

/// Parsed shape of `indexer status --format json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusDoc {
    pub storage: StorageSection,
    pub bootstrap: BootstrapSection,
    pub functions: CountSection,
    pub embeddings: CountSection,
    pub coverage: CoverageSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSection {
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapSection {
    pub required: bool,
    pub reasons: ReasonSection,
    pub relation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReasonSection {
    pub mvp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CountSection {
    pub count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoverageSection {
    pub semantic: f64,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to clone `{workspace}`: {detail}")]
    CloneFailed { workspace: PathBuf, detail: String },
    #[error("`{command}` did not complete ({termination}): exit {exit_code:?}")]
    CommandFailed {
        command: String,
        termination: String,
        exit_code: Option<i32>,
    },
    #[error("failed to parse status output: {0}")]
    StatusParse(#[source] serde_json::Error),
    #[error("health assertion failed: {0}")]
    HealthAssertion(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Sandbox(#[from] supervisor::SandboxError),
    #[error("sandbox io failure at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Minimum semantic coverage; exactly this value passes.
pub const MIN_SEMANTIC_COVERAGE: f64 = 80.0;

pub fn assert_health(status: &StatusDoc) -> Result<HealthSummary, String> {
    if status.storage.state != "ready" {
        return Err(format!(
            "storage state is `{}`, expected `ready`",
            status.storage.state
        ));
    }
    if status.bootstrap.required {
        return Err("mvp bootstrap still flagged as required".to_string());
    }
    if status.functions.count == 0 {
        return Err("function count is zero".to_string());
    }
    if status.embeddings.count == 0 {
        return Err("embedding count is zero".to_string());
    }
    if status.coverage.semantic < MIN_SEMANTIC_COVERAGE {
        return Err(format!(
            "semantic coverage {:.2}% is below {MIN_SEMANTIC_COVERAGE}%",
            status.coverage.semantic
        ));
    }
    Ok(HealthSummary {
        storage_state: status.storage.state.clone(),
        bootstrap_required: status.bootstrap.required,
        function_count: status.functions.count,
        embedding_count: status.embeddings.count,
        semantic_coverage: status.coverage.semantic,
    })
}

/// A passing gate requires a non-empty query battery with every check
/// matched, and every durability scenario recovered.
pub fn compute_pass(query_checks: &[QueryCheck], durability: &[DurabilityOutcome]) -> bool {
    !query_checks.is_empty()
        && query_checks.iter().all(|check| check.matched)
        && durability.iter().all(DurabilityOutcome::ok)
}

pub fn scan_lock_signals(output: &str) -> Vec<String> {
    LOCK_TOKENS
        .iter()
        .filter(|token| output.contains(*token))
        .map(|token| token.to_string())
        .collect()
}

/// Reason text expected after a history rewrite moved HEAD behind the
/// indexed commit.
pub fn history_rewrite_reason_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"branch/reset moved HEAD behind indexed commit").unwrap())
}

struct GateLane {
    workspace: PathBuf,
    indexer_bin: PathBuf,
    env: BTreeMap<String, String>,
    command_timeout: Duration,
    bootstrap_timeout: Duration,
    bootstrap_stall_timeout: Duration,
    commands: Vec<CommandAudit>,
}

impl GateLane {
    /// Runs one indexer subcommand under the supervisor's timeout/stall
    /// semantics and records its audit row (including lock signals).
    async fn indexer(
        &mut self,
        name: &str,
        args: &[&str],
        wall: Duration,
        stall: Duration,
    ) -> Result<String, GateError> {
        let mut spec = SuperviseSpec::new(&self.indexer_bin, &self.workspace)
            .args(args.iter().copied())
            .wall_clock(wall)
            .stall_timeout(stall)
            .label(format!("indexer-{name}"));
        spec.env = self.env.clone();

        let outcome = supervise(spec).await?;
        let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
        self.commands.push(CommandAudit {
            name: name.to_string(),
            exit_code: outcome.exit_code,
            termination: outcome.termination,
            duration_ms: outcome.duration.as_millis() as u64,
            lock_signals: scan_lock_signals(&combined),
            output_tail: tail(&combined, 2000),
        });

        if outcome.termination != TerminationReason::Normal || outcome.exit_code != Some(0) {
            return Err(GateError::CommandFailed {
                command: format!("indexer {name}"),
                termination: outcome.termination.as_str().to_string(),
                exit_code: outcome.exit_code,
            });
        }
        Ok(outcome.stdout)
    }

    async fn git(&mut self, name: &str, args: &[&str]) -> Result<(), GateError> {
        let mut command = tokio::process::Command::new("git");
        command
            .arg("-C")
            .arg(&self.workspace)
            .args([
                "-c",
                "user.email=patrol@invalid",
                "-c",
                "user.name=patrol",
            ])
            .args(args);
        let output = run_command(command, Path::new("git"), Some(self.command_timeout)).await?;
        if !output.status.success() {
            return Err(GateError::CommandFailed {
                command: format!("git {name}: {}", diagnostic_output(&output)),
                termination: "normal".to_string(),
                exit_code: output.status.code(),
            });
        }
        Ok(())
    }

    async fn status(&mut self) -> Result<StatusDoc, GateError> {
        let stdout = self
            .indexer(
                "status",
                &["status", "--format", "json"],
                self.command_timeout,
                Duration::ZERO,
            )
            .await?;
        parse_status(&stdout)
    }

    async fn update(&mut self) -> Result<(), GateError> {
        self.indexer(
            "update",
            &["update"],
            self.command_timeout,
            Duration::ZERO,
        )
        .await
        .map(|_| ())
    }

    async fn query_battery(&mut self) -> Result<Vec<QueryCheck>, GateError> {
        let mut checks = Vec::new();
        for (question, patterns) in REFERENCE_QUESTIONS {
            checks.push(self.query_check(question, patterns).await?);
        }
        Ok(checks)
    }

    async fn query_check(
        &mut self,
        question: &str,
        patterns: &[&str],
    ) -> Result<QueryCheck, GateError> {
        let started = std::time::Instant::now();
        let stdout = self
            .indexer(
                "query",
                &["query", question, "--format", "json"],
                self.command_timeout,
                Duration::ZERO,
            )
            .await?;
        let haystack = stdout.to_lowercase();
        let matched = patterns
            .iter()
            .any(|pattern| haystack.contains(&pattern.to_lowercase()));
        Ok(QueryCheck {
            question: question.to_string(),
            expected_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            matched,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// One durability scenario: manipulate history, check the reported
    /// relation, recover with `update`, and re-verify query relevance.
    async fn durability(
        &mut self,
        scenario: &str,
        expected_relation: &str,
        manipulate: &[(&str, &[&str])],
        check_rewrite_reason: bool,
    ) -> Result<DurabilityOutcome, GateError> {
        for (name, args) in manipulate {
            match *name {
                "update" => self.update().await?,
                _ => self.git(name, args).await?,
            }
        }

        let status = self.status().await?;
        let relation = status.bootstrap.relation.clone().unwrap_or_default();
        let mut relation_ok = relation == expected_relation;
        if check_rewrite_reason && !history_rewrite_reason_re().is_match(&status.bootstrap.reasons.mvp)
        {
            relation_ok = false;
        }

        self.update().await?;
        let recovered = !self.status().await?.bootstrap.required;

        let (question, patterns) = REFERENCE_QUESTIONS[0];
        let query_ok = self.query_check(question, patterns).await?.matched;

        Ok(DurabilityOutcome {
            scenario: scenario.to_string(),
            expected_relation: expected_relation.to_string(),
            relation_ok,
            recovered,
            query_ok,
        })
    }
}

pub fn parse_status(stdout: &str) -> Result<StatusDoc, GateError> {
    // Tolerate log lines before the JSON document.
    let start = stdout.find('{').unwrap_or(0);
    serde_json::from_str(&stdout[start..]).map_err(GateError::StatusParse)
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let cut = text.len() - max;
    let cut = (cut..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[cut..].to_string()
}

fn resolve_indexer_entry(workspace: &Path) -> PathBuf {
    let installed = workspace.join("node_modules").join(".bin").join("indexer");
    if installed.exists() {
        return installed;
    }
    let local = workspace.join("bin").join("indexer");
    if local.exists() {
        return local;
    }
    PathBuf::from("indexer")
}

async fn clone_source(source: &Path, destination: &Path) -> Result<(), GateError> {
    let canonical = fs::canonicalize(source).map_err(|e| GateError::Io {
        path: source.to_path_buf(),
        source: e,
    })?;
    let url = format!("file://{}", canonical.display());
    let mut command = tokio::process::Command::new("git");
    command
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(&url)
        .arg(destination);
    let output = run_command(command, Path::new("git"), Some(Duration::from_secs(300))).await?;
    if !output.status.success() {
        return Err(GateError::CloneFailed {
            workspace: source.to_path_buf(),
            detail: diagnostic_output(&output),
        });
    }
    Ok(())
}

async fn npm_install(workspace: &Path, timeout: Duration) -> Result<(), GateError> {
    let mut command = tokio::process::Command::new("npm");
    command
        .arg("install")
        .arg("--no-audit")
        .arg("--no-fund")
        .current_dir(workspace);
    let output = run_command(command, Path::new("npm"), Some(timeout)).await?;
    if !output.status.success() {
        return Err(GateError::CommandFailed {
            command: format!("npm install: {}", diagnostic_output(&output)),
            termination: "normal".to_string(),
            exit_code: output.status.code(),
        });
    }
    Ok(())
}

async fn gate_lane(args: &Args, env: &EnvSnapshot) -> Result<GateReport, GateError> {
    let tmp_parent = supervisor::default_tmp_parent(&args.source_workspace);
    fs::create_dir_all(&tmp_parent).map_err(|e| GateError::Io {
        path: tmp_parent.clone(),
        source: e,
    })?;
    let sandbox = tmp_parent.join(format!("clean-clone-{}", std::process::id()));
    if sandbox.exists() {
        fs::remove_dir_all(&sandbox).map_err(|e| GateError::Io {
            path: sandbox.clone(),
            source: e,
        })?;
    }

    clone_source(&args.source_workspace, &sandbox).await?;

    let bootstrap_timeout = Duration::from_millis(args.bootstrap_timeout_ms);
    npm_install(&sandbox, bootstrap_timeout).await?;

    let mut indexer_env = env.indexer_env();
    if let Some(provider) = &args.embedding_provider {
        indexer_env.insert(ENV_EMBEDDING_PROVIDER.to_string(), provider.clone());
    }
    if let Some(model) = &args.embedding_model {
        indexer_env.insert(ENV_EMBEDDING_MODEL.to_string(), model.clone());
    }
    indexer_env.insert("CI".to_string(), "1".to_string());

    let mut lane = GateLane {
        indexer_bin: resolve_indexer_entry(&sandbox),
        workspace: sandbox.clone(),
        env: indexer_env,
        command_timeout: Duration::from_millis(args.command_timeout_ms),
        bootstrap_timeout,
        bootstrap_stall_timeout: Duration::from_millis(args.bootstrap_stall_timeout_ms),
        commands: Vec::new(),
    };

    let mut bootstrap_args = vec!["bootstrap", "--mode", "fast", "--yes"];
    if args.allow_providerless {
        bootstrap_args.push("--allow-providerless");
    }
    lane.indexer(
        "bootstrap",
        &bootstrap_args,
        lane.bootstrap_timeout,
        lane.bootstrap_stall_timeout,
    )
    .await?;
    lane.update().await?;

    let status = lane.status().await?;
    let health = if env.skip_health_assert {
        warn!("health assertion disabled by environment");
        None
    } else {
        Some(assert_health(&status).map_err(GateError::HealthAssertion)?)
    };

    let query_checks = lane.query_battery().await?;

    let mut durability = Vec::new();
    durability.push(
        lane.durability(
            "branch_switch",
            "indexed_ancestor",
            &[("checkout", &["checkout", "-b", "probe/branch-switch"])],
            false,
        )
        .await?,
    );
    durability.push(
        lane.durability(
            "history_rewrite",
            "head_ancestor",
            &[
                ("commit", &["commit", "--allow-empty", "-m", "empty probe commit"]),
                ("update", &[]),
                ("reset", &["reset", "--hard", "HEAD~1"]),
            ],
            true,
        )
        .await?,
    );
    durability.push(
        lane.durability(
            "divergent_rebase",
            "diverged",
            &[
                ("commit", &["commit", "--allow-empty", "-m", "probe commit"]),
                ("update", &[]),
                (
                    "amend",
                    &["commit", "--amend", "--allow-empty", "-m", "probe rewritten"],
                ),
            ],
            false,
        )
        .await?,
    );

    let pass = compute_pass(&query_checks, &durability);

    let sandbox_kept = if args.keep_sandbox {
        fs::write(sandbox.join(supervisor::KEEP_MARKER), b"").map_err(|e| GateError::Io {
            path: sandbox.clone(),
            source: e,
        })?;
        Some(sandbox)
    } else {
        if let Err(error) = fs::remove_dir_all(&sandbox) {
            warn!(%error, "failed to remove gate sandbox");
        }
        None
    };

    Ok(GateReport {
        kind: GATE_KIND.to_string(),
        created_at: now_rfc3339(),
        pass,
        error: None,
        commands: lane.commands,
        health,
        query_checks,
        durability,
        sandbox_kept,
    })
}

/// Runs the lane, writes the artifact best-effort (also on failure, with
/// `pass=false` and a single-line error), and returns the exit code.
pub async fn run(args: &Args, env: &EnvSnapshot) -> i32 {
    let report = match gate_lane(args, env).await {
        Ok(report) => report,
        Err(error) => GateReport {
            kind: GATE_KIND.to_string(),
            created_at: now_rfc3339(),
            pass: false,
            error: Some(error.to_string().replace('\n', " ")),
            commands: Vec::new(),
            health: None,
            query_checks: Vec::new(),
            durability: Vec::new(),
            sandbox_kept: None,
        },
    };

    let artifact = args.artifact.clone().unwrap_or_else(|| {
        args.source_workspace
            .join(".patrol")
            .join("clean-clone-gate.json")
    });
    if let Some(parent) = artifact.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(&report) {
        Ok(body) => {
            if let Err(error) = fs::write(&artifact, body) {
                warn!(%error, path = %artifact.display(), "failed to write gate artifact");
            }
        }
        Err(error) => warn!(%error, "failed to serialize gate artifact"),
    }

    if report.pass {
        info!("clean-clone gate passed");
        0
    } else {
        eprintln!(
            "clean-clone gate failed: {}",
            report.error.as_deref().unwrap_or("checks did not pass")
        );
        1
    }
}
