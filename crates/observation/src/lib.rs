#![forbid(unsafe_code)]
//! Observation schema and extraction for agent patrol transcripts.
//!
//! Agents report on their session in two wire forms that must agree: a
//! terminal sentinel-bracketed JSON block, and incremental one-line markers
//! (`AGENT_OBSERVATION: {...}`) emitted as the session progresses. This crate
//! parses both, folds markers into the schema in arrival order, and detects
//! implicit behaviour signals (grep/file-read fallbacks, failed commands,
//! early aborts) from the raw transcript.
//!
//! Extraction never fails: unusable input yields `observation: None` and the
//! caller treats that as missing evidence.

mod extract;
mod implicit;
mod markers;
mod schema;
mod terminal;

pub use extract::{extract, Extraction, ExtractionSource};
pub use implicit::{detect_implicit_signals, ImplicitSignals};
pub use markers::{
    fold_markers, marker_line_payload, parse_marker, IncrementalMarker, MarkerParseError,
    MarkerStats, MARKER_SENTINEL,
};
pub use schema::{
    BootstrapExperience, CompositionAttempt, ConstructionUse, FeatureUse, FixRecommendation,
    Observation, RegistryExperience, ReportedFinding, Severity, TaskVariant, Verdict,
};
pub use terminal::{contains_block_start, extract_terminal_block, BLOCK_END, BLOCK_START};
