use serde::Deserialize;
use thiserror::Error;

use crate::schema::{
    BootstrapExperience, ConstructionUse, FeatureUse, FixRecommendation, Observation,
    ReportedFinding, Verdict,
};

/// Fixed sentinel prefixing every incremental marker line. The wire form is
/// `AGENT_OBSERVATION: <single-line JSON object>`.
pub const MARKER_SENTINEL: &str = "AGENT_OBSERVATION";

/// One incremental marker, tagged by `type`. Summary variants overwrite their
/// section when folded; enumerative variants append.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncrementalMarker {
    Feature(FeatureUse),
    Construction(ConstructionUse),
    Negative(ReportedFinding),
    Positive(ReportedFinding),
    Implicit { flag: String },
    Verdict(Verdict),
    Bootstrap(BootstrapExperience),
    NpsRoadmap { steps: Vec<String> },
    #[serde(rename = "path_to_10")]
    PathTo10 { vision: String },
    Recommendation(FixRecommendation),
}

#[derive(Debug, Error)]
#[error("invalid incremental marker: {message}")]
pub struct MarkerParseError {
    pub message: String,
}

/// Counters from one folding pass; malformed and unknown-type lines are
/// dropped, never fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerStats {
    pub applied: usize,
    pub dropped: usize,
}

/// Returns the JSON payload when `line` is a marker line (optionally
/// indented), `None` otherwise.
pub fn marker_line_payload(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix(MARKER_SENTINEL)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim())
}

pub fn parse_marker(payload: &str) -> Result<IncrementalMarker, MarkerParseError> {
    serde_json::from_str(payload).map_err(|err| MarkerParseError {
        message: err.to_string(),
    })
}

/// Collects every marker line of `text` and folds it, in arrival order, into
/// a default-shaped [`Observation`]. Later summary markers overwrite earlier
/// ones. Returns `None` when no marker applied.
pub fn fold_markers(text: &str) -> (Option<Observation>, MarkerStats) {
    let mut observation = Observation::default();
    let mut stats = MarkerStats::default();

    for line in text.lines() {
        let Some(payload) = marker_line_payload(line) else {
            continue;
        };
        match parse_marker(payload) {
            Ok(marker) => {
                apply_marker(&mut observation, marker);
                stats.applied += 1;
            }
            Err(_) => stats.dropped += 1,
        }
    }

    if stats.applied == 0 {
        return (None, stats);
    }
    observation.normalize();
    (Some(observation), stats)
}

fn apply_marker(observation: &mut Observation, marker: IncrementalMarker) {
    match marker {
        IncrementalMarker::Feature(feature) => observation.features_used.push(feature),
        IncrementalMarker::Construction(construction) => {
            observation.constructions_used.push(construction)
        }
        IncrementalMarker::Negative(finding) => observation.negative_findings.push(finding),
        IncrementalMarker::Positive(finding) => observation.positive_findings.push(finding),
        IncrementalMarker::Implicit { flag } => {
            if !observation.implicit_flags.contains(&flag) {
                observation.implicit_flags.push(flag);
            }
        }
        IncrementalMarker::Verdict(verdict) => observation.verdict = verdict,
        IncrementalMarker::Bootstrap(bootstrap) => observation.bootstrap = bootstrap,
        IncrementalMarker::NpsRoadmap { steps } => observation.nps_roadmap = steps,
        IncrementalMarker::PathTo10 { vision } => observation.path_to_ten = vision,
        IncrementalMarker::Recommendation(rec) => observation.fix_recommendations.push(rec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Severity;

    fn marker(json: &str) -> String {
        format!("{MARKER_SENTINEL}: {json}")
    }

    #[test]
    fn payload_requires_sentinel_and_colon() {
        assert_eq!(
            marker_line_payload("AGENT_OBSERVATION: {\"a\":1}"),
            Some("{\"a\":1}")
        );
        assert_eq!(
            marker_line_payload("  AGENT_OBSERVATION: {}"),
            Some("{}")
        );
        assert!(marker_line_payload("AGENT_OBSERVATION {}").is_none());
        assert!(marker_line_payload("chatter about AGENT_OBSERVATION: x").is_none());
    }

    #[test]
    fn enumerative_markers_append_in_arrival_order() {
        let text = [
            marker("{\"type\":\"negative\",\"category\":\"query\",\"severity\":\"high\",\"title\":\"first\",\"detail\":\"d1\"}"),
            marker("{\"type\":\"negative\",\"category\":\"query\",\"severity\":\"low\",\"title\":\"second\",\"detail\":\"d2\"}"),
            marker("{\"type\":\"feature\",\"feature\":\"semantic-search\",\"outcome\":\"worked\"}"),
        ]
        .join("\n");
        let (observation, stats) = fold_markers(&text);
        let observation = observation.unwrap();
        assert_eq!(stats.applied, 3);
        assert_eq!(observation.negative_findings.len(), 2);
        assert_eq!(observation.negative_findings[0].title, "first");
        assert_eq!(observation.negative_findings[1].severity, Severity::Low);
        assert_eq!(observation.features_used[0].feature, "semantic-search");
    }

    #[test]
    fn later_summary_markers_overwrite_earlier_ones() {
        let text = [
            marker("{\"type\":\"verdict\",\"nps\":4,\"wouldRecommend\":false}"),
            marker("{\"type\":\"verdict\",\"nps\":9,\"wouldRecommend\":true,\"summary\":\"better\"}"),
            marker("{\"type\":\"path_to_10\",\"vision\":\"faster bootstrap\"}"),
        ]
        .join("\n");
        let (observation, _) = fold_markers(&text);
        let observation = observation.unwrap();
        assert_eq!(observation.verdict.nps, 9);
        assert!(observation.verdict.would_recommend);
        assert_eq!(observation.path_to_ten, "faster bootstrap");
    }

    #[test]
    fn unknown_types_and_malformed_json_are_dropped() {
        let text = [
            marker("{\"type\":\"hologram\",\"x\":1}"),
            marker("{not json"),
            marker("{\"type\":\"implicit\",\"flag\":\"grep_fallback\"}"),
        ]
        .join("\n");
        let (observation, stats) = fold_markers(&text);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(
            observation.unwrap().implicit_flags,
            vec!["grep_fallback".to_string()]
        );
    }

    #[test]
    fn implicit_flags_are_a_set() {
        let text = [
            marker("{\"type\":\"implicit\",\"flag\":\"grep_fallback\"}"),
            marker("{\"type\":\"implicit\",\"flag\":\"grep_fallback\"}"),
        ]
        .join("\n");
        let (observation, _) = fold_markers(&text);
        assert_eq!(observation.unwrap().implicit_flags.len(), 1);
    }

    #[test]
    fn no_markers_yields_none() {
        let (observation, stats) = fold_markers("plain chatter\nnothing here\n");
        assert!(observation.is_none());
        assert_eq!(stats, MarkerStats::default());
    }

    #[test]
    fn out_of_range_nps_is_clamped() {
        let (observation, _) =
            fold_markers(&marker("{\"type\":\"verdict\",\"nps\":99}"));
        assert_eq!(observation.unwrap().verdict.nps, 10);
    }
}
