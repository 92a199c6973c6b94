use serde::{Deserialize, Serialize};

use crate::config::Mode;
use crate::report::RunRecord;

/// Monotone scale of agent-observation completeness.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceLevel {
    None,
    Dry,
    Mixed,
    Wet,
}

impl EvidenceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceLevel::None => "none",
            EvidenceLevel::Dry => "dry",
            EvidenceLevel::Mixed => "mixed",
            EvidenceLevel::Wet => "wet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    Allowed,
    Blocked,
}

/// The release-block signal attached to every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVerdict {
    pub required: EvidenceLevel,
    pub observed: EvidenceLevel,
    pub enforcement: Enforcement,
}

impl PolicyVerdict {
    pub fn blocked(&self) -> bool {
        self.enforcement == Enforcement::Blocked
    }
}

pub fn required_level(mode: Mode) -> EvidenceLevel {
    match mode {
        Mode::Release => EvidenceLevel::Wet,
        Mode::Full => EvidenceLevel::Mixed,
        Mode::Quick => EvidenceLevel::Dry,
    }
}

/// Evidence level the runs actually produced. An observation assembled from
/// incremental markers alone counts the same as a terminal block.
pub fn observed_level(runs: &[RunRecord]) -> EvidenceLevel {
    let successful: Vec<&RunRecord> = runs.iter().filter(|run| run.successful()).collect();
    if successful.is_empty() {
        return EvidenceLevel::None;
    }
    let with_observation = successful
        .iter()
        .filter(|run| run.observation.is_some())
        .count();
    if with_observation == 0 {
        EvidenceLevel::None
    } else if with_observation == successful.len() {
        EvidenceLevel::Wet
    } else {
        EvidenceLevel::Mixed
    }
}

/// Pure over `(mode, runs)`: no clock, no environment. Fail-closed for wet
/// and mixed requirements; a `dry` requirement never blocks (the driver's
/// separate at-least-one-observation exit condition still catches empty
/// invocations).
pub fn evaluate(mode: Mode, runs: &[RunRecord]) -> PolicyVerdict {
    let required = required_level(mode);
    let observed = observed_level(runs);
    let fail_closed = matches!(required, EvidenceLevel::Wet | EvidenceLevel::Mixed);
    let enforcement = if fail_closed && observed < required {
        Enforcement::Blocked
    } else {
        Enforcement::Allowed
    };
    PolicyVerdict {
        required,
        observed,
        enforcement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::test_support::{run_with_observation, run_without_observation};
    use supervisor::TerminationReason;

    #[test]
    fn evidence_levels_are_ordered() {
        assert!(EvidenceLevel::None < EvidenceLevel::Dry);
        assert!(EvidenceLevel::Dry < EvidenceLevel::Mixed);
        assert!(EvidenceLevel::Mixed < EvidenceLevel::Wet);
    }

    #[test]
    fn quick_mode_with_full_evidence_allows() {
        let runs = vec![run_with_observation("alpha", 8)];
        let verdict = evaluate(Mode::Quick, &runs);
        assert_eq!(verdict.required, EvidenceLevel::Dry);
        assert_eq!(verdict.observed, EvidenceLevel::Wet);
        assert_eq!(verdict.enforcement, Enforcement::Allowed);
    }

    #[test]
    fn release_mode_without_observations_blocks() {
        let runs = vec![
            run_without_observation("alpha", TerminationReason::Normal, Some(0)),
            run_without_observation("bravo", TerminationReason::Normal, Some(0)),
            run_without_observation("charlie", TerminationReason::Normal, Some(0)),
        ];
        let verdict = evaluate(Mode::Release, &runs);
        assert_eq!(verdict.required, EvidenceLevel::Wet);
        assert_eq!(verdict.observed, EvidenceLevel::None);
        assert!(verdict.blocked());
    }

    #[test]
    fn partial_observations_are_mixed() {
        let runs = vec![
            run_with_observation("alpha", 7),
            run_without_observation("bravo", TerminationReason::Normal, Some(0)),
        ];
        assert_eq!(observed_level(&runs), EvidenceLevel::Mixed);
        assert!(evaluate(Mode::Release, &runs).blocked());
        assert_eq!(
            evaluate(Mode::Full, &runs).enforcement,
            Enforcement::Allowed
        );
    }

    #[test]
    fn timed_out_runs_do_not_count_toward_wet() {
        let runs = vec![
            run_with_observation("alpha", 7),
            run_without_observation("bravo", TerminationReason::Timeout, None),
        ];
        // The timed-out run is not successful, so the remaining successful
        // run is fully observed.
        assert_eq!(observed_level(&runs), EvidenceLevel::Wet);
    }

    #[test]
    fn no_successful_runs_is_none() {
        let runs = vec![
            run_without_observation("alpha", TerminationReason::SpawnError, None),
            run_without_observation("bravo", TerminationReason::Stall, None),
        ];
        assert_eq!(observed_level(&runs), EvidenceLevel::None);
    }

    #[test]
    fn dry_requirement_never_blocks() {
        let runs: Vec<crate::report::RunRecord> = Vec::new();
        let verdict = evaluate(Mode::Quick, &runs);
        assert_eq!(verdict.observed, EvidenceLevel::None);
        assert_eq!(verdict.enforcement, Enforcement::Allowed);
    }

    #[test]
    fn verdict_is_deterministic_for_identical_inputs() {
        let runs = vec![
            run_with_observation("alpha", 8),
            run_without_observation("bravo", TerminationReason::Timeout, None),
        ];
        let first = evaluate(Mode::Release, &runs);
        for _ in 0..10 {
            assert_eq!(evaluate(Mode::Release, &runs), first);
        }
    }
}
