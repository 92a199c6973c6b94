//! End-to-end scenario flows over the pure cores: transcripts go through
//! extraction, into run records, through aggregation and the policy gate.

use std::path::PathBuf;

use observation::{extract, ExtractionSource, ImplicitSignals, TaskVariant};
use patrol::config::Mode;
use patrol::findings::derive_findings;
use patrol::ledger::{Ledger, LedgerEntry, LEDGER_CAP};
use patrol::policy::{evaluate, Enforcement, EvidenceLevel};
use patrol::report::{compute_aggregate, PatrolReport, RunRecord, StorageTelemetry, REPORT_KIND};
use supervisor::TerminationReason;

fn record_from_transcript(repo: &str, transcript: &str, termination: TerminationReason) -> RunRecord {
    let extraction = extract(transcript);
    RunRecord {
        repo: repo.to_string(),
        language: "ts".to_string(),
        task_variant: TaskVariant::Explore,
        started_at: "2026-04-01T00:00:00Z".to_string(),
        duration_ms: 30_000,
        exit_code: (termination == TerminationReason::Normal).then_some(0),
        termination_reason: termination,
        transcript_path: Some(PathBuf::from(format!("/tmp/{repo}.txt"))),
        observation: extraction.observation,
        implicit_signals: extraction.implicit,
        spawn_error: None,
        provisioning_error: None,
        bootstrap_ok: true,
        recovery: None,
    }
}

fn report_for(mode: Mode, runs: Vec<RunRecord>) -> PatrolReport {
    PatrolReport {
        kind: REPORT_KIND.to_string(),
        mode,
        created_at: "2026-04-01T00:05:00Z".to_string(),
        commit_sha: Some("0123456789abcdef".to_string()),
        aggregate: compute_aggregate(&runs),
        policy: evaluate(mode, &runs),
        storage_telemetry: StorageTelemetry {
            tmp_root: PathBuf::from("/tmp/.patrol-tmp"),
            total_bytes: 0,
            entry_count: 0,
        },
        runs,
    }
}

const HAPPY_TRANSCRIPT: &str = r#"I explored the repo and used the indexer heavily.
=== BEGIN AGENT OBSERVATION ===
{
  "sessionSummary": "indexer answered most onboarding questions",
  "negativeFindings": [
    {"category": "query", "severity": "medium", "title": "vague questions return fixtures", "detail": "broad questions surfaced test fixtures first"},
    {"category": "bootstrap", "severity": "medium", "title": "slow first index", "detail": "cold bootstrap took noticeably long"}
  ],
  "verdict": {"nps": 8, "wouldRecommend": true, "summary": "solid"}
}
=== END AGENT OBSERVATION ===
"#;

#[test]
fn happy_path_quick_mode_allows_and_aggregates() {
    let run = record_from_transcript("alpha", HAPPY_TRANSCRIPT, TerminationReason::Normal);
    assert!(run.observation.is_some());

    let report = report_for(Mode::Quick, vec![run]);
    assert_eq!(report.aggregate.mean_nps, Some(8.0));
    assert_eq!(report.aggregate.would_recommend_rate, Some(1.0));
    assert_eq!(report.policy.required, EvidenceLevel::Dry);
    assert_eq!(report.policy.observed, EvidenceLevel::Wet);
    assert_eq!(report.policy.enforcement, Enforcement::Allowed);

    // Driver exit condition: at least one observation and an allowed verdict.
    assert!(report.aggregate.observation_count > 0 && !report.policy.blocked());

    let findings = derive_findings(std::slice::from_ref(&report));
    assert_eq!(findings.len(), 2, "two reported negatives, no synthetics");
}

#[test]
fn release_mode_with_silent_agents_blocks_and_synthesizes() {
    let silent = "I looked around and printed nothing structured. Plenty of prose \
                  though, more than enough to not count as an early abort. "
        .repeat(8);
    let runs: Vec<RunRecord> = ["alpha", "bravo", "charlie"]
        .into_iter()
        .map(|repo| record_from_transcript(repo, &silent, TerminationReason::Normal))
        .collect();
    assert!(runs.iter().all(|r| r.observation.is_none()));

    let report = report_for(Mode::Release, runs);
    assert_eq!(report.policy.required, EvidenceLevel::Wet);
    assert_eq!(report.policy.observed, EvidenceLevel::None);
    assert!(report.policy.blocked());

    let findings = derive_findings(std::slice::from_ref(&report));
    let quality = findings
        .iter()
        .find(|f| f.key == "quality:patrol-run-missing-observation")
        .expect("synthesized quality finding");
    assert_eq!(quality.occurrence_count, 3);
    assert_eq!(quality.repos.len(), 3);
    assert!(findings
        .iter()
        .any(|f| f.key == "policy:patrol-policy-gate-blocked"));
}

#[test]
fn stalled_run_keeps_partial_incremental_observations() {
    let transcript = format!(
        "{}: {}\n{}: {}\npartial work before going silent\n",
        observation::MARKER_SENTINEL,
        r#"{"type": "negative", "category": "query", "severity": "high", "title": "stalls on big repos", "detail": "query hung"}"#,
        observation::MARKER_SENTINEL,
        r#"{"type": "verdict", "nps": 4, "wouldRecommend": false}"#,
    );
    let run = record_from_transcript("alpha", &transcript, TerminationReason::Stall);

    let extraction_source = extract(&transcript).source;
    assert_eq!(extraction_source, ExtractionSource::Incremental);
    assert!(run.observation.is_some(), "markers preserved through a stall");

    let report = report_for(Mode::Quick, vec![run]);
    let findings = derive_findings(std::slice::from_ref(&report));
    assert!(
        findings
            .iter()
            .all(|f| f.key != "runtime:patrol-run-timeout-no-observation"),
        "timeout synthetic suppressed when markers were captured"
    );

    // Without any markers the synthetic fires.
    let bare = record_from_transcript("bravo", "silence", TerminationReason::Stall);
    let report = report_for(Mode::Quick, vec![bare]);
    let findings = derive_findings(std::slice::from_ref(&report));
    assert!(findings
        .iter()
        .any(|f| f.key == "runtime:patrol-run-timeout-no-observation"));
}

#[test]
fn implicit_fallback_shows_up_in_the_aggregate() {
    let transcript = format!(
        "I gave up on the indexer and ran grep -rn \"registerRoute\" src/ instead.{}",
        " filler".repeat(100)
    );
    let run = record_from_transcript("alpha", &transcript, TerminationReason::Normal);
    assert!(run.implicit_signals.grep_fallback);

    let report = report_for(Mode::Quick, vec![run]);
    assert_eq!(report.aggregate.implicit_fallback_rate, 1.0);
}

#[test]
fn ledger_eviction_boundary_holds_at_capacity() {
    let entry = |nps: f64| LedgerEntry {
        created_at: "2026-04-01T00:00:00Z".to_string(),
        mode: Mode::Quick,
        mean_nps: Some(nps),
        would_recommend_rate: Some(1.0),
        implicit_fallback_rate: 0.0,
        observation_count: 1,
        run_count: 1,
        enforcement: Enforcement::Allowed,
    };

    let mut ledger = Ledger::default();
    for i in 0..LEDGER_CAP {
        ledger.append(entry(i as f64));
    }
    ledger.append(entry(1234.0));
    assert_eq!(ledger.entries.len(), LEDGER_CAP);
    assert_eq!(ledger.entries[0].mean_nps, Some(1.0));
    assert_eq!(ledger.entries.last().unwrap().mean_nps, Some(1234.0));
}

#[test]
fn policy_is_a_pure_function_of_mode_and_runs() {
    let runs = vec![
        record_from_transcript("alpha", HAPPY_TRANSCRIPT, TerminationReason::Normal),
        record_from_transcript("bravo", "nothing structured", TerminationReason::Timeout),
    ];
    let baseline = evaluate(Mode::Release, &runs);
    for _ in 0..25 {
        assert_eq!(evaluate(Mode::Release, &runs), baseline);
    }
}

#[test]
fn spawn_error_runs_carry_no_implicit_noise() {
    let run = RunRecord {
        repo: "alpha".to_string(),
        language: "ts".to_string(),
        task_variant: TaskVariant::Guided,
        started_at: "2026-04-01T00:00:00Z".to_string(),
        duration_ms: 5,
        exit_code: None,
        termination_reason: TerminationReason::SpawnError,
        transcript_path: None,
        observation: None,
        implicit_signals: ImplicitSignals::default(),
        spawn_error: Some("No such file or directory".to_string()),
        provisioning_error: None,
        bootstrap_ok: false,
        recovery: None,
    };
    let report = report_for(Mode::Quick, vec![run]);
    let findings = derive_findings(std::slice::from_ref(&report));
    assert!(findings
        .iter()
        .any(|f| f.key == "runtime:patrol-run-execution-error"));
}
