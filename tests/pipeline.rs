//! End-to-end pipeline tests against the in-memory stores.
//!
//! Reports go in through `ingest()` and assertions run against the graph
//! after the dedup window, resolver publish, and batch flush have all had
//! a chance to fire. Timers come from `PipelineConfig::fast_for_tests`,
//! and assertions poll with a deadline instead of assuming stage timing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetgraph::graph::memory::MemoryGraphStore;
use fleetgraph::graph::GraphStore;
use fleetgraph::report::Metadata;
use fleetgraph::resolvers::MemoryKeyValueStore;
use fleetgraph::{Pipeline, PipelineConfig, Report};

/// webA serves 10.0.0.5:80 from pid 100; nothing observed on the far side
/// of its socket.
fn web_a_report() -> Report {
    let mut rpt = Report::default();
    rpt.host.insert(
        "webA".to_string(),
        Metadata {
            node_id: "webA".to_string(),
            host_name: Some("webA".to_string()),
            interface_ips: vec!["10.0.0.5".to_string()],
            cloud_provider: Some("aws".to_string()),
            cloud_region: Some("us-east-1".to_string()),
            ..Default::default()
        },
    );
    rpt.endpoint.insert(
        "webA;10.0.0.5;80".to_string(),
        Metadata {
            node_id: "webA;10.0.0.5;80".to_string(),
            host_name: Some("webA".to_string()),
            pid: Some(100),
            ..Default::default()
        },
    );
    rpt.process.insert(
        "webA;100".to_string(),
        Metadata {
            node_id: "webA;100".to_string(),
            host_name: Some("webA".to_string()),
            pid: Some(100),
            ..Default::default()
        },
    );
    rpt
}

/// webB's pid 55 talks to webA's server socket.
fn web_b_report() -> Report {
    let mut rpt = Report::default();
    rpt.host.insert(
        "webB".to_string(),
        Metadata {
            node_id: "webB".to_string(),
            host_name: Some("webB".to_string()),
            interface_ips: vec!["10.0.0.9".to_string()],
            ..Default::default()
        },
    );
    rpt.endpoint.insert(
        "webB;10.0.0.9;41234".to_string(),
        Metadata {
            node_id: "webB;10.0.0.9;41234".to_string(),
            host_name: Some("webB".to_string()),
            pid: Some(55),
            ..Default::default()
        },
    );
    rpt.process.insert(
        "webB;55".to_string(),
        Metadata {
            node_id: "webB;55".to_string(),
            host_name: Some("webB".to_string()),
            pid: Some(55),
            ..Default::default()
        },
    );
    rpt.endpoint_adjacency.insert(
        "webB;10.0.0.9;41234".to_string(),
        vec!["webA;10.0.0.5;80".to_string()],
    );
    rpt
}

fn start(graph: &Arc<MemoryGraphStore>) -> Pipeline {
    Pipeline::start(
        PipelineConfig::fast_for_tests(),
        Arc::new(MemoryKeyValueStore::new()),
        Arc::clone(graph) as Arc<dyn GraphStore>,
    )
    .expect("pipeline start")
}

/// Re-ingest the given reports until the condition holds. The resolver
/// cache fills from one report interval and pays off in the next, so a
/// single round is not enough for cross-host attribution.
fn ingest_until(
    pipeline: &Pipeline,
    reports: &[Report],
    deadline: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        for report in reports {
            let _ = pipeline.ingest(report.clone());
        }
        std::thread::sleep(Duration::from_millis(50));
        if done() {
            return true;
        }
    }
    done()
}

#[test]
fn test_cross_host_connection_attributed_after_cache_warmup() {
    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = start(&graph);

    let reports = [web_a_report(), web_b_report()];
    let attributed = ingest_until(&pipeline, &reports, Duration::from_secs(10), || {
        graph
            .connections()
            .contains(&("webB".to_string(), "webA".to_string(), 55, 100))
    });
    assert!(attributed, "webB -> webA never got pid attribution");

    // Entity side of the same reports.
    assert!(graph.node("Node", "webA").is_some());
    assert!(graph.node("Node", "webB").is_some());
    assert!(graph.node("Process", "webA;100").is_some());
    assert!(graph.has_edge("webA", "HOSTS", "webA;100"));
    assert!(graph.has_edge("aws", "HOSTS", "us-east-1"));
    assert!(graph.has_edge("us-east-1", "HOSTS", "webA"));

    // webA's server socket still has nothing observed on the far side, so
    // its inbound placeholder persists alongside the attributed edge.
    assert!(graph
        .connections()
        .contains(&("in-the-internet".to_string(), "webA".to_string(), 0, 100)));

    pipeline.close();
}

#[test]
fn test_unresolved_remote_goes_out_the_internet() {
    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = start(&graph);

    // webB alone: 10.0.0.5 is never published to the cache.
    let reports = [web_b_report()];
    let reached = ingest_until(&pipeline, &reports, Duration::from_secs(10), || {
        graph
            .connections()
            .contains(&("webB".to_string(), "out-the-internet".to_string(), 55, 0))
    });
    assert!(reached, "unattributed traffic never reached the sentinel");
    pipeline.close();
}

#[test]
fn test_reingest_is_idempotent() {
    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = start(&graph);

    let reports = [web_a_report(), web_b_report()];
    assert!(ingest_until(
        &pipeline,
        &reports,
        Duration::from_secs(10),
        || graph
            .connections()
            .contains(&("webB".to_string(), "webA".to_string(), 55, 100))
    ));

    // Once the cache is warm the graph is a fixed point of re-ingestion.
    let settled = graph.snapshot();
    assert!(ingest_until(
        &pipeline,
        &reports,
        Duration::from_secs(5),
        || graph.snapshot() == settled
    ));
    pipeline.close();
}

#[test]
fn test_kubernetes_topology_lands_in_graph() {
    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = start(&graph);

    let mut rpt = Report::default();
    rpt.host.insert(
        "node-1".to_string(),
        Metadata {
            node_id: "node-1".to_string(),
            host_name: Some("node-1".to_string()),
            kubernetes_cluster_id: Some("prod".to_string()),
            ..Default::default()
        },
    );
    rpt.kubernetes_cluster.insert(
        "prod".to_string(),
        Metadata {
            node_id: "prod".to_string(),
            node_name: Some("prod".to_string()),
            ..Default::default()
        },
    );
    rpt.pod.insert(
        "pod-1".to_string(),
        Metadata {
            node_id: "pod-1".to_string(),
            host_name: Some("node-1".to_string()),
            kubernetes_cluster_id: Some("prod".to_string()),
            ..Default::default()
        },
    );
    rpt.container.insert(
        "c-1".to_string(),
        Metadata {
            node_id: "c-1".to_string(),
            host_name: Some("node-1".to_string()),
            docker_container_state: Some("running".to_string()),
            ..Default::default()
        },
    );
    rpt.container_image.insert(
        "sha:abc".to_string(),
        Metadata {
            node_id: "sha:abc".to_string(),
            host_name: Some("node-1".to_string()),
            docker_image_name: Some("nginx".to_string()),
            docker_image_tag: Some("1.27".to_string()),
            ..Default::default()
        },
    );

    let reports = [rpt];
    assert!(ingest_until(
        &pipeline,
        &reports,
        Duration::from_secs(10),
        || graph.node("Pod", "pod-1").is_some()
    ));

    assert!(graph.node("KubernetesCluster", "prod").is_some());
    assert!(graph.has_edge("prod", "INSTANCIATE", "node-1"));
    assert!(graph.has_edge("prod", "HOSTS", "pod-1"));
    assert!(graph.has_edge("node-1", "HOSTS", "pod-1"));
    assert!(graph.has_edge("node-1", "HOSTS", "c-1"));
    assert!(graph.has_edge("node-1", "HOSTS", "sha:abc"));
    assert!(graph.has_edge("sha:abc", "IS", "nginx"));
    assert_eq!(graph.node("Container", "c-1").unwrap()["active"], true);

    pipeline.close();
}
