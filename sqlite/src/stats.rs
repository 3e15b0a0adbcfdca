//! Query counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Total and failed query counters, safe to update from any thread.
///
/// The counters live outside the store lock so they can be read while a
/// long query holds the connection.
#[derive(Debug, Default)]
pub struct QueryStats {
    total: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of [`QueryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Queries attempted against an open connection.
    pub total: u64,
    /// Queries that failed in the engine.
    pub failed: u64,
    /// Percentage of queries that succeeded, in `[0, 100]`.
    pub success_rate: f64,
}

impl QueryStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one successful query.
    pub fn record_success(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts one failed query.
    ///
    /// `total` is bumped before `failed`, so a reader that loads `failed`
    /// first never observes more failures than queries.
    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of queries attempted.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Number of queries that failed.
    pub fn failed(&self) -> u64 {
        self.snapshot().failed
    }

    /// Success percentage; `100.0` when nothing has run yet.
    pub fn success_rate(&self) -> f64 {
        self.snapshot().success_rate
    }

    /// Reads both counters consistently.
    pub fn snapshot(&self) -> StatsSnapshot {
        let failed = self.failed.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        // A reset racing this read can zero `total` between the two loads.
        let failed = failed.min(total);
        StatsSnapshot {
            total,
            failed,
            success_rate: success_rate(total, failed),
        }
    }

    /// Zeroes both counters.
    pub fn reset(&self) {
        self.failed.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
    }
}

fn success_rate(total: u64, failed: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    100.0 * (total - failed) as f64 / total as f64
}
