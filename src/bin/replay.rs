//! Replay: feed recorded topology reports through the full pipeline.
//!
//! Reads newline-delimited JSON reports from a file (or stdin with `-`),
//! runs them through an in-memory pipeline, and prints what landed in
//! the graph. Useful for eyeballing what a captured fleet snapshot turns
//! into without a database.
//!
//! Run: cargo run --release --bin replay -- reports.jsonl

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use fleetgraph::graph::memory::MemoryGraphStore;
use fleetgraph::graph::GraphStore;
use fleetgraph::resolvers::MemoryKeyValueStore;
use fleetgraph::{Pipeline, PipelineConfig, Report};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let path = match args.as_slice() {
        [path] => path.clone(),
        _ => bail!("usage: replay <reports.jsonl | ->"),
    };

    let reader: Box<dyn BufRead> = if path == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(&path).with_context(|| format!("open {path}"))?;
        Box::new(BufReader::new(file))
    };

    let mut config = PipelineConfig::from_env();
    // Replay is offline, no reason to sit in the 30s window.
    config.dedup_window = Duration::from_millis(100);
    config.batch_flush_interval = Duration::from_millis(100);
    config.resolver_interval = Duration::from_millis(50);

    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = Pipeline::start(
        config,
        Arc::new(MemoryKeyValueStore::new()),
        Arc::clone(&graph) as Arc<dyn GraphStore>,
    )?;

    let mut lines = 0usize;
    let mut malformed = 0usize;
    for line in reader.lines() {
        let line = line.context("read input")?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        match serde_json::from_str::<Report>(&line) {
            Ok(report) => {
                if let Err(e) = pipeline.ingest(report) {
                    eprintln!("line {lines}: {e}");
                }
            }
            Err(e) => {
                malformed += 1;
                eprintln!("line {lines}: bad report: {e}");
            }
        }
    }

    // Resolver cache warms up over multiple passes; a second window would
    // attribute connections the first one could not. Single pass keeps the
    // output honest about what one interval sees.
    let metrics = pipeline.metrics();
    pipeline.close();
    let counters = metrics.snapshot();

    let snapshot = graph.snapshot();
    println!("Replay summary");
    println!("==============");
    println!("{:<24} {:>10}", "reports read", lines);
    println!("{:<24} {:>10}", "malformed", malformed);
    println!("{:<24} {:>10}", "accepted", counters.accepted);
    println!("{:<24} {:>10}", "dropped", counters.dropped);
    println!("{:<24} {:>10}", "committed", counters.committed);
    println!();
    println!(
        "{:<24} {:>10}",
        "hosts",
        graph.node_count("Node").saturating_sub(2) // minus the two sentinels
    );
    for label in [
        "Process",
        "Container",
        "ContainerImage",
        "ImageStub",
        "Pod",
        "KubernetesCluster",
        "CloudProvider",
        "CloudRegion",
    ] {
        println!("{:<24} {:>10}", label, graph.node_count(label));
    }
    println!("{:<24} {:>10}", "edges", snapshot.edges.len());
    println!("{:<24} {:>10}", "connections", snapshot.connections.len());

    if !snapshot.connections.is_empty() {
        println!();
        println!("Connections");
        println!("-----------");
        for (src, dst, left_pid, right_pid) in &snapshot.connections {
            println!("{src} ({left_pid}) -> {dst} ({right_pid})");
        }
    }

    Ok(())
}
