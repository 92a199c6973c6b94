use serde::{Deserialize, Serialize};

use crate::{
    implicit::{detect_implicit_signals, ImplicitSignals},
    markers::{fold_markers, MarkerStats},
    schema::Observation,
    terminal::extract_terminal_block,
};

/// Which parsing mode produced the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Terminal,
    Incremental,
    None,
}

/// Result of one extraction pass over an agent transcript.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub observation: Option<Observation>,
    pub source: ExtractionSource,
    pub implicit: ImplicitSignals,
    pub marker_stats: MarkerStats,
}

/// Extracts an observation from assembled agent output.
///
/// The terminal block is tried first and wins for the sections it defines;
/// when it is absent the observation is assembled from incremental markers.
/// Enumerative sections are never merged across the two forms. Implicit
/// signal detection always runs on the raw text. Never fails: a transcript
/// with no usable structure yields `observation: None`.
pub fn extract(raw: &str) -> Extraction {
    let implicit = detect_implicit_signals(raw);
    let (incremental, marker_stats) = fold_markers(raw);

    if let Some(observation) = extract_terminal_block(raw) {
        return Extraction {
            observation: Some(observation),
            source: ExtractionSource::Terminal,
            implicit,
            marker_stats,
        };
    }

    match incremental {
        Some(observation) => Extraction {
            observation: Some(observation),
            source: ExtractionSource::Incremental,
            implicit,
            marker_stats,
        },
        None => Extraction {
            observation: None,
            source: ExtractionSource::None,
            implicit,
            marker_stats,
        },
    }
}
