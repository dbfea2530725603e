//! Pipeline throughput counters
//!
//! Lightweight, lock-free counters shared by all pipeline stages. One
//! instance per pipeline, wrapped in `Arc`. Every counter is monotonic;
//! `snapshot()` reads a consistent-enough view for the periodic monitor
//! log line (exactness across counters is not required).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Thread-safe throughput counters for the ingestion pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Reports offered to `ingest()` (including rejected ones).
    received: AtomicU64,
    /// Reports accepted onto the incoming queue.
    accepted: AtomicU64,
    /// Items dropped anywhere in the pipeline because a queue was full.
    dropped: AtomicU64,
    /// Reports whose data reached a committed transaction.
    committed: AtomicU64,
    /// Transactions that rolled back.
    failed_commits: AtomicU64,
    /// Breaker flag: true while the incoming queue is saturated.
    breaker: AtomicBool,
}

/// Point-in-time view of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub committed: u64,
    pub failed_commits: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a committed transaction carrying `num_merged` reports.
    pub fn record_committed(&self, num_merged: u64) {
        self.committed.fetch_add(num_merged, Ordering::Relaxed);
    }

    pub fn record_failed_commit(&self) {
        self.failed_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Trip the breaker (incoming queue saturated).
    pub fn trip_breaker(&self) {
        self.breaker.store(true, Ordering::Relaxed);
    }

    /// Reset the breaker once the incoming queue has drained.
    pub fn reset_breaker(&self) {
        self.breaker.store(false, Ordering::Relaxed);
    }

    /// True while the pipeline is pushing back on callers.
    pub fn breaker_tripped(&self) -> bool {
        self.breaker.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
        }
    }
}
