//! Run progress counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time view of a run.
///
/// `total` counts queued units. `completed` counts queued units that reached a
/// final state (success, failure, or found already done when dequeued).
/// `skipped` covers units dropped at submission plus those found done at dequeue.
/// `unrecorded` counts units whose records were stored but whose ledger entry
/// could not be written; they are included in `completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unrecorded: usize,
    pub percent: f64,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped_on_submit: AtomicUsize,
    skipped_on_dequeue: AtomicUsize,
    unrecorded: AtomicUsize,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_queued(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped_on_submit(&self, n: usize) {
        self.skipped_on_submit.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrecorded(&self) {
        self.unrecorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skipped_on_dequeue.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let dequeue_skips = self.skipped_on_dequeue.load(Ordering::Relaxed);
        let unrecorded = self.unrecorded.load(Ordering::Relaxed);
        let completed = succeeded + failed + dequeue_skips + unrecorded;
        let percent = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64 * 100.0).min(100.0)
        };
        ProgressSnapshot {
            total,
            completed,
            succeeded,
            failed,
            skipped: self.skipped_on_submit.load(Ordering::Relaxed) + dequeue_skips,
            unrecorded,
            percent,
        }
    }
}
