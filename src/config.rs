//! Pipeline configuration
//!
//! All knobs of the ingestion pipeline in one place. The surrounding
//! service constructs a `PipelineConfig` once at startup and hands it to
//! `Pipeline::start`; nothing here is read from global state afterwards.

use std::time::Duration;

/// Default capacity of the incoming report queue.
pub const DEFAULT_INGEST_QUEUE: usize = 25_000;

/// Default number of merged batches buffered in front of the DB pusher.
pub const DEFAULT_DB_QUEUE: usize = 100;

/// Default flush threshold for the batch accumulator.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// 1 GB ceiling per resolver mapping before whole-map eviction.
pub const DEFAULT_RESOLVER_CEILING_BYTES: u64 = 1024 * 1024 * 1024;

/// Configuration for [`crate::pipeline::Pipeline`].
///
/// Queue capacities and timers; every stage hand-off is a bounded queue
/// sized here. Defaults match the production tuning of the original
/// deployment, except worker counts which assume OS threads.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the incoming queue behind `ingest()`.
    pub ingest_queue: usize,
    /// Capacity of the fan-out queue (one entry per dedup window).
    pub fanout_queue: usize,
    /// Capacity of the per-report resolver and preparer queues.
    pub worker_queue: usize,
    /// Capacity of the resolver-delta queue into the updater.
    pub resolver_queue: usize,
    /// Capacity of the prepared-batch queue into the accumulator.
    pub batch_queue: usize,
    /// Capacity of the merged-batch queue into the DB pusher.
    pub db_queue: usize,

    /// Resolver Computer worker pool size.
    pub resolver_workers: usize,
    /// Graph Preparer worker pool size.
    pub preparer_workers: usize,

    /// How long reports from the same host collapse to the latest one.
    pub dedup_window: Duration,
    /// Interval of the resolver merge-and-publish task.
    pub resolver_interval: Duration,
    /// Max resolver deltas merged per publish.
    pub resolver_batch_size: usize,
    /// Byte ceiling per resolver mapping; breach clears the whole mapping.
    pub resolver_ceiling_bytes: u64,

    /// Accumulator flushes after this many reports...
    pub batch_flush_count: usize,
    /// ...or after this much time, whichever comes first.
    pub batch_flush_interval: Duration,

    /// Interval of the queue-depth monitor log line.
    pub monitor_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_queue: DEFAULT_INGEST_QUEUE,
            fanout_queue: DEFAULT_DB_QUEUE,
            worker_queue: DEFAULT_BATCH_SIZE,
            resolver_queue: DEFAULT_BATCH_SIZE,
            batch_queue: DEFAULT_BATCH_SIZE,
            db_queue: DEFAULT_DB_QUEUE,
            resolver_workers: 8,
            preparer_workers: 8,
            dedup_window: Duration::from_secs(30),
            resolver_interval: Duration::from_secs(10),
            resolver_batch_size: DEFAULT_BATCH_SIZE,
            resolver_ceiling_bytes: DEFAULT_RESOLVER_CEILING_BYTES,
            batch_flush_count: DEFAULT_BATCH_SIZE,
            batch_flush_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Defaults with environment overrides applied.
    ///
    /// `FLEETGRAPH_INGEST_QUEUE` resizes the incoming queue and
    /// `FLEETGRAPH_BATCH_SIZE` the accumulator flush threshold. Unparsable
    /// values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(n) = read_usize(&lookup, "FLEETGRAPH_INGEST_QUEUE") {
            cfg.ingest_queue = n;
        }
        if let Some(n) = read_usize(&lookup, "FLEETGRAPH_BATCH_SIZE") {
            cfg.batch_flush_count = n;
        }
        cfg
    }

    /// Shrink every timer and queue for tests so windows expire in
    /// milliseconds instead of tens of seconds.
    pub fn fast_for_tests() -> Self {
        Self {
            ingest_queue: 64,
            fanout_queue: 16,
            worker_queue: 64,
            resolver_queue: 64,
            batch_queue: 64,
            db_queue: 16,
            resolver_workers: 2,
            preparer_workers: 2,
            dedup_window: Duration::from_millis(30),
            resolver_interval: Duration::from_millis(30),
            resolver_batch_size: 64,
            resolver_ceiling_bytes: DEFAULT_RESOLVER_CEILING_BYTES,
            batch_flush_count: 64,
            batch_flush_interval: Duration::from_millis(30),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

fn read_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    lookup(key)?.parse().ok()
}
