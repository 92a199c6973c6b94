use serde::{Deserialize, Serialize};

use crate::ledger::LedgerEntry;
use crate::report::RunAggregate;

/// Trailing-window size: the last `min(10, len)` ledger entries.
pub const DRIFT_WINDOW_MAX: usize = 10;
/// Mean NPS must not fall more than this below the window mean.
pub const NPS_DRIFT_THRESHOLD: f64 = 1.5;
/// Rates must not move more than this against the window mean.
pub const RATE_DRIFT_THRESHOLD: f64 = 0.15;

/// A statistically notable degradation against the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftSignal {
    pub metric: String,
    pub current: f64,
    pub window_mean: f64,
    pub delta: f64,
}

/// Compares the current aggregate against the trailing ledger window on mean
/// NPS (degrades downward), would-recommend rate (downward), and implicit
/// fallback rate (degrades upward).
pub fn drift_signals(history: &[LedgerEntry], current: &RunAggregate) -> Vec<DriftSignal> {
    let window_start = history.len().saturating_sub(DRIFT_WINDOW_MAX);
    let window = &history[window_start..];
    if window.is_empty() {
        return Vec::new();
    }

    let mut signals = Vec::new();

    let nps_window: Vec<f64> = window.iter().filter_map(|e| e.mean_nps).collect();
    if let (Some(current_nps), Some(mean)) = (current.mean_nps, mean(&nps_window)) {
        if current_nps < mean - NPS_DRIFT_THRESHOLD {
            signals.push(DriftSignal {
                metric: "nps".to_string(),
                current: current_nps,
                window_mean: mean,
                delta: current_nps - mean,
            });
        }
    }

    let recommend_window: Vec<f64> = window
        .iter()
        .filter_map(|e| e.would_recommend_rate)
        .collect();
    if let (Some(current_rate), Some(mean)) =
        (current.would_recommend_rate, mean(&recommend_window))
    {
        if current_rate < mean - RATE_DRIFT_THRESHOLD {
            signals.push(DriftSignal {
                metric: "would_recommend_rate".to_string(),
                current: current_rate,
                window_mean: mean,
                delta: current_rate - mean,
            });
        }
    }

    let fallback_window: Vec<f64> = window.iter().map(|e| e.implicit_fallback_rate).collect();
    if let Some(mean) = mean(&fallback_window) {
        let current_rate = current.implicit_fallback_rate;
        if current_rate > mean + RATE_DRIFT_THRESHOLD {
            signals.push(DriftSignal {
                metric: "implicit_fallback_rate".to_string(),
                current: current_rate,
                window_mean: mean,
                delta: current_rate - mean,
            });
        }
    }

    signals
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
