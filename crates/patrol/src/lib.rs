//! Release-gate harnesses for the indexer.
//!
//! Four lanes share this crate: the agent patrol driver (supervised LLM
//! agent runs inside sandboxed repo copies), the clean-clone gate (a
//! deterministic indexer health lane), the retention engine
//! (storage-hygiene sweeps over transient artifacts), and the offline
//! aggregator (deduplicated findings across saved reports).
//!
//! The pure cores — policy gate, findings dedup, drift detection, retention
//! selection — take plain data and touch neither clock nor environment;
//! subprocess work goes through the `supervisor` crate.

pub mod aggregate;
pub mod config;
pub mod drift;
pub mod findings;
pub mod gate;
pub mod ledger;
pub mod manifest;
pub mod policy;
pub mod report;
pub mod retention;
pub mod run;
pub mod tickets;
