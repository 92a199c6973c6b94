use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::Parser;
use observation::{extract, TaskVariant, BLOCK_END, BLOCK_START, MARKER_SENTINEL};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{mode_defaults, EnvSnapshot, Mode, ModeDefaults};
use crate::drift::{drift_signals, DriftSignal};
use crate::findings::{derive_findings, Finding};
use crate::ledger::{default_ledger_path, load_ledger, save_ledger, LedgerEntry};
use crate::manifest::{load_manifest, resolve_repo, select_repos, ManifestError};
use crate::policy::evaluate;
use crate::report::{
    commit_sha, compute_aggregate, default_artifact_path, now_rfc3339, storage_telemetry,
    write_report, PatrolReport, RunRecord, REPORT_KIND,
};
use crate::tickets::file_tickets;
use supervisor::{
    pack_indexer, probe_agent, provision, resolve_agent_binary, run_agent, AgentLaunch,
    AgentProfile, ProvisionRequest, RepoSource, RunBudgets, Sandbox, TerminationReason,
};

/// Deploys supervised agent runs across the selected target repos and gates
/// the collected evidence.
#[derive(Debug, Parser)]
pub struct Args {
    /// Patrol mode; also sets the required evidence level.
    #[arg(long, value_enum, default_value_t = Mode::Quick)]
    pub mode: Mode,

    /// Restrict to one manifest entry.
    #[arg(long)]
    pub repo: Option<String>,

    /// Override the mode's repo count.
    #[arg(long)]
    pub max_repos: Option<usize>,

    /// Per-run wall clock in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Preserve sandboxes on exit (marks their trees protected).
    #[arg(long)]
    pub keep: bool,

    /// Report artifact path.
    #[arg(long)]
    pub artifact: Option<PathBuf>,

    /// Force a specific agent binary.
    #[arg(long)]
    pub agent_bin: Option<PathBuf>,

    /// Pause between sandbox stages awaiting stdin.
    #[arg(long, short = 'i')]
    pub interactive: bool,

    /// Target repo manifest.
    #[arg(long, default_value = "repos.json")]
    pub manifest: PathBuf,

    /// Source workspace holding the indexer to package.
    #[arg(long, default_value = ".")]
    pub source_workspace: PathBuf,

    /// Open/corroborate tracking tickets for qualifying findings.
    #[arg(long)]
    pub file_tickets: bool,
}

#[derive(Debug, Error)]
enum DriveError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

pub async fn run(args: Args, env: &EnvSnapshot) -> i32 {
    match drive(args, env).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("patrol run failed: {error}");
            1
        }
    }
}

const TASK_VARIANTS: [TaskVariant; 3] = [
    TaskVariant::Explore,
    TaskVariant::Guided,
    TaskVariant::Construction,
];

async fn drive(args: Args, env: &EnvSnapshot) -> Result<i32, DriveError> {
    let defaults = mode_defaults(args.mode);

    // Schema-level failures (bad manifest, unknown repo) abort before any
    // run; everything past this point is recorded, not thrown.
    let manifest = load_manifest(&args.manifest)?;
    let manifest_root = args
        .manifest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let mut rng = rand::thread_rng();
    let selected = select_repos(
        &manifest,
        args.mode,
        args.repo.as_deref(),
        args.max_repos,
        &mut rng,
    )?;
    info!(
        mode = args.mode.as_str(),
        repos = selected.len(),
        "starting patrol"
    );

    let agent_binary = resolve_agent_binary(args.agent_bin.clone(), env.agent_bin.as_deref());
    let profile = probe_agent(&agent_binary).await;

    let tmp_parent = supervisor::default_tmp_parent(&args.source_workspace);
    let packages_dir = args.source_workspace.join(".patrol").join("packages");
    let tarball = match pack_indexer(&args.source_workspace, &packages_dir).await {
        Ok(tarball) => Some(tarball),
        Err(error) => {
            warn!(%error, "failed to package the indexer; runs will record provisioning failures");
            None
        }
    };

    let budgets = RunBudgets {
        wall_clock: args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.agent_wall_clock),
        stall_timeout: defaults.stall_timeout,
        heartbeat: defaults.heartbeat,
        stream_byte_cap: 4 * 1024 * 1024,
    };

    let mut runs: Vec<RunRecord> = Vec::new();
    for (index, entry) in selected.iter().enumerate() {
        let variant = TASK_VARIANTS[index % TASK_VARIANTS.len()];
        let repo = resolve_repo(&manifest_root, entry);
        let record = run_one(
            &args, env, &defaults, &profile, repo, variant, tarball.as_deref(), &tmp_parent,
            budgets,
        )
        .await;
        let interrupted = record.termination_reason == TerminationReason::None
            && record.provisioning_error.is_none()
            && record.spawn_error.is_none();
        runs.push(record);
        if interrupted {
            warn!("interrupt during agent run; skipping remaining repos");
            break;
        }
    }

    let aggregate = compute_aggregate(&runs);
    let policy = evaluate(args.mode, &runs);
    let report = PatrolReport {
        kind: REPORT_KIND.to_string(),
        mode: args.mode,
        created_at: now_rfc3339(),
        commit_sha: commit_sha(&args.source_workspace).await,
        runs,
        aggregate,
        policy,
        storage_telemetry: storage_telemetry(&tmp_parent),
    };

    // Artifact writes are best-effort: a failing run must still leave
    // diagnostic evidence behind.
    let artifact = args
        .artifact
        .clone()
        .unwrap_or_else(|| default_artifact_path(&args.source_workspace));
    if let Err(error) = write_report(&artifact, &report) {
        warn!(%error, "failed to write patrol report");
    } else {
        info!(path = %artifact.display(), "patrol report written");
    }

    let ledger_path = default_ledger_path(&args.source_workspace);
    let mut loaded = load_ledger(&ledger_path);
    let drift = drift_signals(&loaded.ledger.entries, &report.aggregate);
    loaded.ledger.append(LedgerEntry::from_report(&report));
    if let Err(error) = save_ledger(&ledger_path, &loaded.ledger) {
        warn!(%error, "failed to save evidence ledger");
    }

    let findings = derive_findings(std::slice::from_ref(&report));
    if args.file_tickets {
        let outcomes = file_tickets(&findings).await;
        info!(tickets = outcomes.len(), "ticket filing complete");
    }

    print_summary(&report, &findings, &drift);

    let ok = report.aggregate.observation_count > 0 && !report.policy.blocked();
    Ok(if ok { 0 } else { 1 })
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    args: &Args,
    env: &EnvSnapshot,
    defaults: &ModeDefaults,
    profile: &AgentProfile,
    repo: RepoSource,
    variant: TaskVariant,
    tarball: Option<&Path>,
    tmp_parent: &Path,
    budgets: RunBudgets,
) -> RunRecord {
    let started_at = now_rfc3339();
    let started = Instant::now();
    let mut record = RunRecord {
        repo: repo.name.clone(),
        language: repo.language.clone(),
        task_variant: variant,
        started_at,
        duration_ms: 0,
        exit_code: None,
        termination_reason: TerminationReason::None,
        transcript_path: None,
        observation: None,
        implicit_signals: Default::default(),
        spawn_error: None,
        provisioning_error: None,
        bootstrap_ok: false,
        recovery: None,
    };

    let Some(tarball) = tarball else {
        record.provisioning_error = Some("indexer tarball unavailable".to_string());
        record.duration_ms = started.elapsed().as_millis() as u64;
        return record;
    };

    let cheap_model_env = env.indexer_env();
    let request = ProvisionRequest {
        repo: &repo,
        tarball,
        tmp_parent,
        cheap_model_env: &cheap_model_env,
        interactive: args.interactive,
        install_timeout: defaults.command_timeout,
        bootstrap_timeout: defaults.bootstrap_timeout,
        bootstrap_stall_timeout: defaults.bootstrap_stall_timeout,
        mirror_output: true,
    };
    let mut sandbox: Sandbox = match provision(request).await {
        Ok(sandbox) => sandbox,
        Err(error) => {
            record.provisioning_error = Some(error.to_string());
            record.duration_ms = started.elapsed().as_millis() as u64;
            return record;
        }
    };
    record.bootstrap_ok = sandbox.bootstrap_ok;

    let mut agent_env: BTreeMap<String, String> = cheap_model_env;
    agent_env.insert("CI".to_string(), "1".to_string());
    let launch = AgentLaunch {
        profile: profile.clone(),
        prompt: prompt_for(variant, &repo.name),
        cwd: sandbox.workspace.clone(),
        env: agent_env,
        budgets,
        mirror_output: false,
    };

    match run_agent(launch).await {
        Ok(outcome) => {
            record.exit_code = outcome.supervise.exit_code;
            record.termination_reason = outcome.supervise.termination;
            record.spawn_error = outcome.supervise.spawn_error.clone();
            record.recovery = outcome.supervise.recovery.clone();
            record.transcript_path = write_transcript(
                &args.source_workspace,
                &repo.name,
                &outcome.agent_text,
                &outcome.supervise.stderr,
            );

            let extraction = extract(&outcome.agent_text);
            record.observation = extraction.observation;
            record.implicit_signals = extraction.implicit;
        }
        Err(error) => {
            record.spawn_error = Some(error.to_string());
            record.termination_reason = TerminationReason::SpawnError;
        }
    }
    record.duration_ms = started.elapsed().as_millis() as u64;

    if args.keep {
        sandbox.mark_keep();
    }
    match sandbox.teardown() {
        Ok(outcome) => {
            if let supervisor::TeardownOutcome::Kept(path) = outcome {
                info!(path = %path.display(), "sandbox kept");
            }
        }
        Err(error) => warn!(%error, "sandbox teardown failed"),
    }

    record
}

fn write_transcript(
    workspace: &Path,
    repo: &str,
    agent_text: &str,
    stderr: &str,
) -> Option<PathBuf> {
    let dir = workspace.join(".patrol").join("transcripts");
    if let Err(error) = fs::create_dir_all(&dir) {
        warn!(%error, "failed to create transcript directory");
        return None;
    }
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let path = dir.join(format!("{repo}-{stamp}.txt"));
    let body = format!("{agent_text}\n\n--- stderr ---\n{stderr}\n");
    match fs::write(&path, body) {
        Ok(()) => Some(path),
        Err(error) => {
            warn!(%error, "failed to write transcript");
            None
        }
    }
}

fn prompt_for(variant: TaskVariant, repo_name: &str) -> String {
    let task = match variant {
        TaskVariant::Explore => {
            "Explore this repository using the installed `indexer` CLI. Ask it real \
             questions you would ask while onboarding, and judge the relevance of \
             every answer."
        }
        TaskVariant::Guided => {
            "Use the installed `indexer` CLI to complete these steps in order: run \
             `indexer status --format json`, query for the main entry point, query \
             for the test setup, then try one query in your own words. Judge each \
             result."
        }
        TaskVariant::Construction => {
            "Use the installed `indexer` CLI's constructions to assemble context for \
             a small change to this repository. Record every construction you use by \
             its id, and whether composing them worked."
        }
    };
    format!(
        "You are evaluating a codebase-intelligence tool inside the `{repo_name}` \
         repository.\n\n{task}\n\nWhile you work, report incrementally: whenever you \
         learn something, print a single line of the form\n\
         `{MARKER_SENTINEL}: {{\"type\": ..., ...}}`\n\
         with type one of feature, construction, negative, positive, implicit, \
         verdict, bootstrap, nps_roadmap, path_to_10, recommendation. Report at \
         least two negative findings with category, severity (critical|high|medium|\
         low), title, and detail.\n\nWhen you are done, print the full observation \
         as a JSON document between these exact lines:\n{BLOCK_START}\n{{ ... }}\n\
         {BLOCK_END}\n\nThe document needs sessionSummary, bootstrap, featuresUsed, \
         constructionsUsed, compositionsAttempted, registry, negativeFindings, \
         positiveFindings, implicitFlags, verdict (with an integer nps from 0 to 10 \
         and wouldRecommend), npsRoadmap, pathTo10, and fixRecommendations."
    )
}

fn print_summary(report: &PatrolReport, findings: &[Finding], drift: &[DriftSignal]) {
    let aggregate = &report.aggregate;
    println!(
        "patrol: {} repo(s), {} observation(s), mean NPS {}, fallback rate {:.2}, \
         {} construction(s) covered, policy {} (required {}, observed {})",
        aggregate.run_count,
        aggregate.observation_count,
        aggregate
            .mean_nps
            .map(|n| format!("{n:.1}"))
            .unwrap_or_else(|| "n/a".to_string()),
        aggregate.implicit_fallback_rate,
        aggregate.construction_coverage.len(),
        if report.policy.blocked() { "blocked" } else { "allowed" },
        report.policy.required.as_str(),
        report.policy.observed.as_str(),
    );
    if !findings.is_empty() {
        println!("patrol: {} deduplicated finding(s)", findings.len());
    }
    for signal in drift {
        println!(
            "patrol: drift on {}: {:.2} vs window mean {:.2}",
            signal.metric, signal.current, signal.window_mean
        );
    }
    if report.policy.blocked() {
        println!(
            "patrol: FAILED: policy gate blocked (required {}, observed {})",
            report.policy.required.as_str(),
            report.policy.observed.as_str()
        );
    } else if report.aggregate.observation_count == 0 {
        println!("patrol: FAILED: no observation was extracted from any run");
    }
}
