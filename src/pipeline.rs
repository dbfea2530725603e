//! Staged ingestion pipeline.
//!
//! Reports flow through dedicated threads joined by bounded channels:
//!
//! ```text
//! ingest() -> enqueuer (dedup window) -> fanout -+-> resolver pool -> updater -> cache
//!                                                +-> preparer pool -> accumulator -> db pusher
//! ```
//!
//! Every hand-off uses `try_send`: a full downstream queue drops the
//! work with a warning instead of blocking the stage. Newer reports
//! supersede dropped ones within a report interval, so the pipeline
//! prefers staying live over processing everything.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::batch::IngestionBatch;
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::graph::{GraphStore, GraphWriter};
use crate::metrics::Metrics;
use crate::prepare::prepare;
use crate::report::Report;
use crate::resolvers::{
    compute_resolvers, merge_resolvers, EndpointResolvers, KeyValueStore, ResolverCache,
};

/// Running ingestion pipeline. Construct with [`Pipeline::start`], feed
/// with [`Pipeline::ingest`], shut down with [`Pipeline::close`].
pub struct Pipeline {
    ingest_tx: Option<Sender<Report>>,
    shutdown_tx: Option<Sender<()>>,
    metrics: Arc<Metrics>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Bootstrap the graph schema and spawn every stage.
    pub fn start(
        config: PipelineConfig,
        kv_store: Arc<dyn KeyValueStore>,
        graph_store: Arc<dyn GraphStore>,
    ) -> Result<Self> {
        let writer = GraphWriter::new(graph_store);
        writer.ensure_schema()?;

        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(ResolverCache::new(kv_store, config.resolver_ceiling_bytes));

        let (ingest_tx, ingest_rx) = bounded::<Report>(config.ingest_queue);
        let (fanout_tx, fanout_rx) = bounded::<Vec<Report>>(config.fanout_queue);
        let (resolver_tx, resolver_rx) = bounded::<Arc<Report>>(config.worker_queue);
        let (preparer_tx, preparer_rx) = bounded::<Arc<Report>>(config.worker_queue);
        let (delta_tx, delta_rx) = bounded::<EndpointResolvers>(config.resolver_queue);
        let (batch_tx, batch_rx) = bounded::<IngestionBatch>(config.batch_queue);
        let (db_tx, db_rx) = bounded::<IngestionBatch>(config.db_queue);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        // Depth watches for the monitor. Dropped when the monitor exits,
        // so they never hold a stage's receiver open during shutdown.
        let fanout_watch = fanout_tx.clone();
        let resolver_watch = resolver_tx.clone();
        let preparer_watch = preparer_tx.clone();
        let delta_watch = delta_tx.clone();
        let batch_watch = batch_tx.clone();
        let db_watch = db_tx.clone();

        let mut handles = Vec::new();

        handles.push(spawn_named("enqueuer", {
            let metrics = Arc::clone(&metrics);
            let window = config.dedup_window;
            move || enqueuer(ingest_rx, fanout_tx, window, metrics)
        }));

        handles.push(spawn_named("fanout", {
            let metrics = Arc::clone(&metrics);
            move || fanout(fanout_rx, resolver_tx, preparer_tx, metrics)
        }));

        for i in 0..config.resolver_workers {
            let rx = resolver_rx.clone();
            let tx = delta_tx.clone();
            let metrics = Arc::clone(&metrics);
            handles.push(spawn_named(
                &format!("resolver-{i}"),
                move || resolver_worker(rx, tx, metrics),
            ));
        }
        drop(resolver_rx);
        drop(delta_tx);

        for i in 0..config.preparer_workers {
            let rx = preparer_rx.clone();
            let tx = batch_tx.clone();
            let cache = Arc::clone(&cache);
            let metrics = Arc::clone(&metrics);
            handles.push(spawn_named(
                &format!("preparer-{i}"),
                move || preparer_worker(rx, tx, cache, metrics),
            ));
        }
        drop(preparer_rx);
        drop(batch_tx);

        handles.push(spawn_named("resolver-updater", {
            let cache = Arc::clone(&cache);
            let interval = config.resolver_interval;
            let batch_size = config.resolver_batch_size;
            move || resolver_updater(delta_rx, cache, interval, batch_size)
        }));

        handles.push(spawn_named("accumulator", {
            let metrics = Arc::clone(&metrics);
            let count = config.batch_flush_count;
            let interval = config.batch_flush_interval;
            move || accumulator(batch_rx, db_tx, count, interval, metrics)
        }));

        handles.push(spawn_named("db-pusher", {
            let metrics = Arc::clone(&metrics);
            move || db_pusher(db_rx, writer, metrics)
        }));

        handles.push(spawn_named("monitor", {
            let metrics = Arc::clone(&metrics);
            let depths = QueueDepths {
                ingest: ingest_tx.clone(),
                fanout: fanout_watch,
                resolver: resolver_watch,
                preparer: preparer_watch,
                delta: delta_watch,
                batch: batch_watch,
                db: db_watch,
            };
            let interval = config.monitor_interval;
            move || monitor(shutdown_rx, depths, interval, metrics)
        }));

        Ok(Self {
            ingest_tx: Some(ingest_tx),
            shutdown_tx: Some(shutdown_tx),
            metrics,
            handles,
        })
    }

    /// Hand one report to the pipeline. Fails fast when the incoming
    /// queue is saturated; the report is dropped and the breaker trips
    /// so callers can shed load upstream.
    pub fn ingest(&self, report: Report) -> Result<()> {
        self.metrics.record_received();
        let Some(tx) = self.ingest_tx.as_ref() else {
            return Err(IngestError::Closed);
        };
        match tx.try_send(report) {
            Ok(()) => {
                self.metrics.record_accepted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_dropped(1);
                self.metrics.trip_breaker();
                Err(IngestError::QueueFull("ingest"))
            }
            Err(TrySendError::Disconnected(_)) => Err(IngestError::Closed),
        }
    }

    /// True while the incoming queue has headroom. Flips false when
    /// `ingest` hits saturation, back to true once the monitor sees the
    /// queue drained.
    pub fn is_ready(&self) -> bool {
        !self.metrics.breaker_tripped()
    }

    /// Shared counter handle; stays valid across `close()`.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop accepting reports, drain every stage, and join the threads.
    /// In-flight work is flushed, not discarded.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the senders disconnects each stage in turn; every
        // worker drains its receiver before exiting.
        self.shutdown_tx.take();
        self.ingest_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("pipeline worker panicked");
            }
        }
        debug!("pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("fleetgraph-{name}"))
        .spawn(f)
        .unwrap_or_else(|e| panic!("failed to spawn pipeline thread: {e}"))
}

/// Collapses reports per source within the dedup window, last write
/// wins, and forwards one window batch at a time.
fn enqueuer(
    rx: Receiver<Report>,
    fanout_tx: Sender<Vec<Report>>,
    window: std::time::Duration,
    metrics: Arc<Metrics>,
) {
    let ticker = tick(window);
    let mut pending: HashMap<String, Report> = HashMap::new();
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(report) => {
                    let key = report.dedup_key().to_string();
                    if pending.insert(key, report).is_some() {
                        debug!("superseded report within dedup window");
                    }
                }
                Err(_) => {
                    flush_window(&mut pending, &fanout_tx, &metrics);
                    return;
                }
            },
            recv(ticker) -> _ => {
                flush_window(&mut pending, &fanout_tx, &metrics);
            }
        }
    }
}

fn flush_window(
    pending: &mut HashMap<String, Report>,
    fanout_tx: &Sender<Vec<Report>>,
    metrics: &Metrics,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<Report> = pending.drain().map(|(_, report)| report).collect();
    let n = batch.len();
    if let Err(TrySendError::Full(_)) = fanout_tx.try_send(batch) {
        warn!(dropped = n, "fanout queue full, dropping window");
        metrics.record_dropped(n as u64);
    }
}

/// Duplicates each report toward the resolver and preparer pools.
fn fanout(
    rx: Receiver<Vec<Report>>,
    resolver_tx: Sender<Arc<Report>>,
    preparer_tx: Sender<Arc<Report>>,
    metrics: Arc<Metrics>,
) {
    for batch in rx.iter() {
        for report in batch {
            let report = Arc::new(report);
            if let Err(TrySendError::Full(_)) = resolver_tx.try_send(Arc::clone(&report)) {
                warn!("resolver queue full, dropping report");
                metrics.record_dropped(1);
            }
            if let Err(TrySendError::Full(_)) = preparer_tx.try_send(report) {
                warn!("preparer queue full, dropping report");
                metrics.record_dropped(1);
            }
        }
    }
}

fn resolver_worker(
    rx: Receiver<Arc<Report>>,
    delta_tx: Sender<EndpointResolvers>,
    metrics: Arc<Metrics>,
) {
    for report in rx.iter() {
        let delta = compute_resolvers(&report);
        if delta.is_empty() {
            continue;
        }
        if let Err(TrySendError::Full(_)) = delta_tx.try_send(delta) {
            warn!("resolver update queue full, dropping delta");
            metrics.record_dropped(1);
        }
    }
}

fn preparer_worker(
    rx: Receiver<Arc<Report>>,
    batch_tx: Sender<IngestionBatch>,
    cache: Arc<ResolverCache>,
    metrics: Arc<Metrics>,
) {
    for report in rx.iter() {
        let batch = prepare(&report, &cache);
        if batch.is_empty() {
            continue;
        }
        if let Err(TrySendError::Full(_)) = batch_tx.try_send(batch) {
            warn!("batch queue full, dropping prepared report");
            metrics.record_dropped(1);
        }
    }
}

/// Merges resolver deltas and publishes them to the cache either when
/// enough have piled up or on each interval tick.
fn resolver_updater(
    rx: Receiver<EndpointResolvers>,
    cache: Arc<ResolverCache>,
    interval: std::time::Duration,
    batch_size: usize,
) {
    let ticker = tick(interval);
    let mut deltas: Vec<EndpointResolvers> = Vec::new();
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(delta) => {
                    deltas.push(delta);
                    if deltas.len() >= batch_size {
                        publish_deltas(&mut deltas, &cache);
                    }
                }
                Err(_) => {
                    publish_deltas(&mut deltas, &cache);
                    return;
                }
            },
            recv(ticker) -> _ => {
                publish_deltas(&mut deltas, &cache);
            }
        }
    }
}

fn publish_deltas(deltas: &mut Vec<EndpointResolvers>, cache: &ResolverCache) {
    if deltas.is_empty() {
        return;
    }
    let merged = merge_resolvers(std::mem::take(deltas));
    cache.apply(&merged);
}

/// Size-or-time batch accumulator in front of the DB pusher.
fn accumulator(
    rx: Receiver<IngestionBatch>,
    db_tx: Sender<IngestionBatch>,
    flush_count: usize,
    flush_interval: std::time::Duration,
    metrics: Arc<Metrics>,
) {
    let ticker = tick(flush_interval);
    let mut pending: Vec<IngestionBatch> = Vec::new();
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(batch) => {
                    pending.push(batch);
                    if pending.len() >= flush_count {
                        flush_batches(&mut pending, &db_tx, &metrics);
                    }
                }
                Err(_) => {
                    flush_batches(&mut pending, &db_tx, &metrics);
                    return;
                }
            },
            recv(ticker) -> _ => {
                flush_batches(&mut pending, &db_tx, &metrics);
            }
        }
    }
}

fn flush_batches(pending: &mut Vec<IngestionBatch>, db_tx: &Sender<IngestionBatch>, metrics: &Metrics) {
    if pending.is_empty() {
        return;
    }
    let merged = IngestionBatch::merge_all(std::mem::take(pending));
    let num_merged = merged.num_merged;
    if let Err(TrySendError::Full(_)) = db_tx.try_send(merged) {
        warn!(dropped = num_merged, "db queue full, dropping merged batch");
        metrics.record_dropped(num_merged as u64);
    }
}

fn db_pusher(rx: Receiver<IngestionBatch>, writer: GraphWriter, metrics: Arc<Metrics>) {
    for batch in rx.iter() {
        let num_merged = batch.num_merged;
        match writer.commit(&batch) {
            Ok(()) => {
                metrics.record_committed(num_merged as u64);
                debug!(num_merged, "committed batch");
            }
            Err(e) => {
                metrics.record_failed_commit();
                error!(error = %e, num_merged, "batch commit failed, discarding");
            }
        }
    }
}

/// Per-stage depth watches held by the monitor.
struct QueueDepths {
    ingest: Sender<Report>,
    fanout: Sender<Vec<Report>>,
    resolver: Sender<Arc<Report>>,
    preparer: Sender<Arc<Report>>,
    delta: Sender<EndpointResolvers>,
    batch: Sender<IngestionBatch>,
    db: Sender<IngestionBatch>,
}

/// Periodic queue-depth log line; also resets the breaker once the
/// incoming queue has fully drained.
fn monitor(
    shutdown_rx: Receiver<()>,
    depths: QueueDepths,
    interval: std::time::Duration,
    metrics: Arc<Metrics>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(shutdown_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
            }
            recv(ticker) -> _ => {
                let ingest_depth = depths.ingest.len();
                let snapshot = metrics.snapshot();
                info!(
                    ingest = ingest_depth,
                    fanout = depths.fanout.len(),
                    resolver = depths.resolver.len(),
                    preparer = depths.preparer.len(),
                    delta = depths.delta.len(),
                    batch = depths.batch.len(),
                    db = depths.db.len(),
                    received = snapshot.received,
                    accepted = snapshot.accepted,
                    dropped = snapshot.dropped,
                    committed = snapshot.committed,
                    failed_commits = snapshot.failed_commits,
                    "queue depths",
                );
                if ingest_depth == 0 && metrics.breaker_tripped() {
                    metrics.reset_breaker();
                    info!("ingest queue drained, breaker reset");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::graph::memory::MemoryGraphStore;
    use crate::report::Metadata;
    use crate::resolvers::MemoryKeyValueStore;

    fn host_report(host: &str) -> Report {
        let mut rpt = Report::default();
        rpt.host.insert(
            host.to_string(),
            Metadata {
                node_id: host.to_string(),
                host_name: Some(host.to_string()),
                ..Default::default()
            },
        );
        rpt
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_report_reaches_graph() {
        let graph = Arc::new(MemoryGraphStore::new());
        let pipeline = Pipeline::start(
            PipelineConfig::fast_for_tests(),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&graph) as Arc<dyn GraphStore>,
        )
        .unwrap();

        pipeline.ingest(host_report("webA")).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            graph.node("Node", "webA").is_some()
        }));
        pipeline.close();
    }

    #[test]
    fn test_close_flushes_in_flight_reports() {
        let graph = Arc::new(MemoryGraphStore::new());
        let mut config = PipelineConfig::fast_for_tests();
        // Long timers: the flush must come from the shutdown drain.
        config.dedup_window = Duration::from_secs(30);
        config.batch_flush_interval = Duration::from_secs(30);
        let pipeline = Pipeline::start(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&graph) as Arc<dyn GraphStore>,
        )
        .unwrap();

        pipeline.ingest(host_report("webA")).unwrap();
        pipeline.close();
        assert!(graph.node("Node", "webA").is_some());
    }

    #[test]
    fn test_saturated_ingest_trips_breaker() {
        let graph = Arc::new(MemoryGraphStore::new());
        let mut config = PipelineConfig::fast_for_tests();
        // Capacity 1: back-to-back sends outrun the enqueuer's dequeue.
        config.ingest_queue = 1;
        let pipeline = Pipeline::start(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&graph) as Arc<dyn GraphStore>,
        )
        .unwrap();

        assert!(pipeline.is_ready());
        let mut saturated = false;
        for i in 0..64 {
            if matches!(
                pipeline.ingest(host_report(&format!("host-{i}"))),
                Err(IngestError::QueueFull("ingest"))
            ) {
                saturated = true;
                break;
            }
        }
        assert!(saturated);
        assert!(!pipeline.is_ready());
        pipeline.close();
    }

    #[test]
    fn test_breaker_resets_after_queue_drains() {
        let graph = Arc::new(MemoryGraphStore::new());
        let mut config = PipelineConfig::fast_for_tests();
        config.ingest_queue = 1;
        config.monitor_interval = Duration::from_millis(10);
        let pipeline = Pipeline::start(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&graph) as Arc<dyn GraphStore>,
        )
        .unwrap();

        let mut saturated = false;
        for i in 0..64 {
            if pipeline.ingest(host_report(&format!("host-{i}"))).is_err() {
                saturated = true;
                break;
            }
        }
        assert!(saturated);
        assert!(!pipeline.is_ready());

        // No further sends: the enqueuer drains the queue, then the
        // next monitor tick resets the breaker.
        assert!(wait_for(Duration::from_secs(5), || pipeline.is_ready()));
        pipeline.close();
    }

    #[test]
    fn test_count_threshold_flushes_before_interval() {
        let graph = Arc::new(MemoryGraphStore::new());
        let mut config = PipelineConfig::fast_for_tests();
        config.batch_flush_count = 1;
        // An interval this long cannot fire within the deadline, so the
        // commit can only come from the count threshold.
        config.batch_flush_interval = Duration::from_secs(60);
        let pipeline = Pipeline::start(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&graph) as Arc<dyn GraphStore>,
        )
        .unwrap();

        pipeline.ingest(host_report("webA")).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            graph.node("Node", "webA").is_some()
        }));
        pipeline.close();
    }

    #[test]
    fn test_dedup_window_keeps_latest_report() {
        let graph = Arc::new(MemoryGraphStore::new());
        let mut config = PipelineConfig::fast_for_tests();
        config.dedup_window = Duration::from_millis(150);
        let pipeline = Pipeline::start(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&graph) as Arc<dyn GraphStore>,
        )
        .unwrap();

        let mut first = host_report("webA");
        if let Some(meta) = first.host.get_mut("webA") {
            meta.cloud_provider = Some("stale".to_string());
        }
        let mut second = host_report("webA");
        if let Some(meta) = second.host.get_mut("webA") {
            meta.cloud_provider = Some("fresh".to_string());
        }
        pipeline.ingest(first).unwrap();
        pipeline.ingest(second).unwrap();
        pipeline.close();

        let node = graph.node("Node", "webA").unwrap();
        assert_eq!(node["cloud_provider"], "fresh");
    }
}
