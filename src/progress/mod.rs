//! Aggregate progress reporting.
//!
//! A [`ProgressSnapshot`] is a pure derived read for the UI layer; nothing
//! in it is persisted. The ETA is recomputed from elapsed time and the
//! completion rate observed since the current pass began.

pub mod reconcile;

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Point-in-time view of a run's aggregate progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Total item count for the run.
    pub total: usize,
    /// Items that have reached success.
    pub completed: usize,
    /// Items currently in error.
    pub errored: usize,
    /// `completed / total`, in `0.0..=1.0`.
    pub percent_complete: f64,
    /// Whether a stop has been recorded for the run.
    pub stopped: bool,
    /// Estimated remaining time, when enough progress exists to estimate.
    pub eta: Option<Duration>,
    /// In-flight per-item completion hints (presentation only).
    pub item_percent_hints: HashMap<usize, u8>,
}

impl ProgressSnapshot {
    /// Snapshot of a run that has not started.
    pub fn empty() -> Self {
        Self {
            total: 0,
            completed: 0,
            errored: 0,
            percent_complete: 0.0,
            stopped: false,
            eta: None,
            item_percent_hints: HashMap::new(),
        }
    }

    /// Human-readable remaining-time string for the UI.
    pub fn eta_text(&self) -> String {
        match self.eta {
            Some(eta) => format!("{} remaining", format_duration(eta)),
            None => "estimating time remaining".to_string(),
        }
    }
}

/// Remaining-time estimator for one scheduler pass.
///
/// Only completions observed since the pass began count toward the rate;
/// items already finished when a run resumes would otherwise make the
/// estimate wildly optimistic.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    started: Instant,
    baseline_completed: usize,
}

impl EtaEstimator {
    /// Start estimating, given how many items were already complete.
    pub fn new(baseline_completed: usize) -> Self {
        Self {
            started: Instant::now(),
            baseline_completed,
        }
    }

    /// Estimate remaining time from the current completion count.
    pub fn estimate(&self, completed: usize, total: usize) -> Option<Duration> {
        let done_this_pass = completed.checked_sub(self.baseline_completed)?;
        if done_this_pass == 0 || completed >= total {
            return if completed >= total && total > 0 {
                Some(Duration::ZERO)
            } else {
                None
            };
        }
        let per_item = self.started.elapsed().div_f64(done_this_pass as f64);
        Some(per_item.mul_f64((total - completed) as f64))
    }
}

/// Coarse human formatting: "about 4m 10s", "less than a minute".
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        return "less than a minute".to_string();
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("about {}h {}m", hours, minutes)
    } else {
        format!("about {}m {}s", minutes, seconds)
    }
}
