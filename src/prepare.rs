//! Graph Preparer: one report in, one graph-shaped batch out
//!
//! The most intricate stage of the pipeline. Walks a report's topologies
//! and emits node upsert rows plus the edges joining them, resolving
//! cross-host endpoint fragments through the shared [`ResolverCache`].
//!
//! Edge-case policy (load-bearing, see the tests):
//! - loopback endpoints are never resolved, so they are silently excluded
//!   from connection edges regardless of adjacency contents;
//! - an endpoint with an empty adjacency list but a live process becomes an
//!   inbound edge from the `in-the-internet` sentinel;
//! - a remote endpoint whose IP is absent from the resolver cache becomes
//!   an edge to the `out-the-internet` sentinel rather than being dropped,
//!   preserving directional traffic signal without attribution;
//! - connections between two endpoints of the same host are skipped.

use std::collections::{BTreeMap, BTreeSet};

use crate::batch::{edge_sets, ConnectionEdge, ConnectionSet, IngestionBatch};
use crate::report::{
    pid_from_ip_pid, process_node_id, split_endpoint_node_id, Report, IN_THE_INTERNET,
    LOOPBACK_IP, OUT_THE_INTERNET,
};
use crate::resolvers::ResolverCache;

/// Image name/tag value Docker reports for dangling images.
const UNTAGGED: &str = "<none>";

/// Transform one report into an [`IngestionBatch`].
///
/// Reads the resolver cache but never writes it. Entries lacking required
/// fields are skipped at the point of use; nothing here fails the report.
pub fn prepare(rpt: &Report, resolvers: &ResolverCache) -> IngestionBatch {
    let mut batch = IngestionBatch::new();

    let mut cluster_host_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for meta in rpt.host.values() {
        let mut scope = crate::batch::Row::new();
        scope.insert(
            "node_id".to_string(),
            serde_json::Value::String(meta.node_id.clone()),
        );
        batch.hosts.push(scope);
        if let Some(cluster_id) = meta.kubernetes_cluster_id.as_deref().filter(|c| !c.is_empty()) {
            cluster_host_edges
                .entry(cluster_id.to_string())
                .or_default()
                .push(meta.node_id.clone());
        }
        batch.host_batch.push(meta.to_row());
    }

    for meta in rpt.kubernetes_cluster.values() {
        batch.kubernetes_cluster_batch.push(meta.to_row());
    }

    // Only processes that actually own an observed endpoint are upserted;
    // everything else in the process topology is churn.
    let mut processes_to_keep: BTreeSet<String> = BTreeSet::new();
    for meta in rpt.endpoint.values() {
        let (Some(host), Some(pid)) = (meta.host_name(), meta.pid) else {
            continue;
        };
        processes_to_keep.insert(process_node_id(host, pid));
    }

    batch.connection_edges = connection_edges(rpt, resolvers);

    let mut process_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut container_process_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for meta in rpt.process.values() {
        if !processes_to_keep.contains(&meta.node_id) {
            continue;
        }
        let Some(host) = meta.host_name() else {
            continue;
        };
        batch.process_batch.push(meta.to_row());
        process_edges
            .entry(host.to_string())
            .or_default()
            .push(meta.node_id.clone());
        if let Some(container) = rpt
            .process_parents
            .get(&meta.node_id)
            .and_then(|p| p.container.as_deref())
            .filter(|c| !c.is_empty())
        {
            container_process_edges
                .entry(container.to_string())
                .or_default()
                .push(meta.node_id.clone());
        }
    }

    let mut container_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for meta in rpt.container.values() {
        let Some(host) = meta.host_name() else {
            continue;
        };
        batch.container_batch.push(meta.to_row());
        container_edges
            .entry(host.to_string())
            .or_default()
            .push(meta.node_id.clone());
    }

    let mut container_image_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for meta in rpt.container_image.values() {
        let Some(host) = meta.host_name() else {
            continue;
        };
        if meta.docker_image_name.as_deref() == Some(UNTAGGED)
            || meta.docker_image_tag.as_deref() == Some(UNTAGGED)
        {
            continue;
        }
        batch.container_image_batch.push(meta.to_row());
        container_image_edges
            .entry(host.to_string())
            .or_default()
            .push(meta.node_id.clone());
    }

    // Pods may arrive in a cluster-level report that never touches the
    // underlying host; the host is then resolved from the pod's own IP.
    let mut pod_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut pod_host_edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for meta in rpt.pod.values() {
        let Some(cluster_id) = meta.kubernetes_cluster_id.as_deref().filter(|c| !c.is_empty())
        else {
            continue;
        };
        let host = meta.host_name().map(str::to_string).or_else(|| {
            meta.kubernetes_ip
                .as_deref()
                .and_then(|ip| resolvers.get_host(ip))
        });

        let mut pod = meta.clone();
        pod.host_name = host.clone();
        batch.pod_batch.push(pod.to_row());

        pod_edges
            .entry(cluster_id.to_string())
            .or_default()
            .push(meta.node_id.clone());
        if let Some(host) = host {
            pod_host_edges
                .entry(host)
                .or_default()
                .push(meta.node_id.clone());
        }
    }

    batch.process_edges = edge_sets(process_edges);
    batch.container_edges = edge_sets(container_edges);
    batch.container_process_edges = edge_sets(container_process_edges);
    batch.container_image_edges = edge_sets(container_image_edges);
    batch.pod_edges = edge_sets(pod_edges);
    batch.pod_host_edges = edge_sets(pod_host_edges);
    batch.cluster_host_edges = edge_sets(cluster_host_edges);

    batch
}

/// Resolve a report's endpoints into directed connection edges.
fn connection_edges(rpt: &Report, resolvers: &ResolverCache) -> Vec<ConnectionSet> {
    let mut sets = Vec::new();
    let mut inbound = Vec::new();

    for meta in rpt.endpoint.values() {
        let Some((ip, _port)) = split_endpoint_node_id(&meta.node_id) else {
            continue;
        };
        if ip == LOOPBACK_IP {
            continue;
        }
        // Owning host: the entry's own host name, else the resolver cache.
        // Unresolvable endpoints are dropped.
        let Some(host) = meta
            .host_name()
            .map(str::to_string)
            .or_else(|| resolvers.get_host(ip))
        else {
            continue;
        };
        let Some(pid) = meta.pid else {
            continue;
        };

        let adjacency = rpt.adjacency(&meta.node_id);
        if adjacency.is_empty() {
            // Nothing observed on the other side: traffic arrived from
            // outside the fleet.
            inbound.push(ConnectionEdge {
                destination: host,
                left_pid: 0,
                right_pid: pid,
            });
            continue;
        }

        let mut edges = Vec::new();
        for adjacent in adjacency {
            if adjacent == &meta.node_id {
                continue;
            }
            let Some((remote_ip, remote_port)) = split_endpoint_node_id(adjacent) else {
                continue;
            };
            match resolvers.get_host(remote_ip) {
                Some(remote_host) => {
                    if remote_host == host {
                        continue;
                    }
                    let Some(right_pid) = resolvers
                        .get_ip_pid(remote_ip, remote_port)
                        .as_deref()
                        .and_then(pid_from_ip_pid)
                    else {
                        // Host known but no listener identity yet; the
                        // peer's next report fills the gap.
                        continue;
                    };
                    edges.push(ConnectionEdge {
                        destination: remote_host,
                        left_pid: pid,
                        right_pid,
                    });
                }
                None => edges.push(ConnectionEdge {
                    destination: OUT_THE_INTERNET.to_string(),
                    left_pid: pid,
                    right_pid: 0,
                }),
            }
        }
        if !edges.is_empty() {
            sets.push(ConnectionSet {
                source: host,
                edges,
            });
        }
    }

    if !inbound.is_empty() {
        sets.push(ConnectionSet {
            source: IN_THE_INTERNET.to_string(),
            edges: inbound,
        });
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Metadata;
    use crate::resolvers::{EndpointResolvers, MemoryKeyValueStore, ResolverCache};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn empty_cache() -> ResolverCache {
        ResolverCache::new(Arc::new(MemoryKeyValueStore::new()), u64::MAX)
    }

    fn seeded_cache(net: &[(&str, &str)], pids: &[(&str, &str)]) -> ResolverCache {
        let cache = empty_cache();
        let mut delta = EndpointResolvers::default();
        for (ip, host) in net {
            delta.network_map.insert(ip.to_string(), host.to_string());
        }
        for (ip_port, ip_pid) in pids {
            delta
                .ipport_ippid
                .insert(ip_port.to_string(), ip_pid.to_string());
        }
        cache.apply(&delta);
        cache
    }

    fn make_host(name: &str) -> Metadata {
        Metadata {
            node_id: name.to_string(),
            host_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn make_endpoint(host: &str, ip: &str, port: &str, pid: u32) -> Metadata {
        Metadata {
            node_id: format!("{host};{ip};{port}"),
            host_name: Some(host.to_string()),
            pid: Some(pid),
            ..Default::default()
        }
    }

    fn insert_endpoint(rpt: &mut Report, meta: Metadata, adjacency: &[&str]) {
        if !adjacency.is_empty() {
            rpt.endpoint_adjacency.insert(
                meta.node_id.clone(),
                adjacency.iter().map(|s| s.to_string()).collect(),
            );
        }
        rpt.endpoint.insert(meta.node_id.clone(), meta);
    }

    fn connections_from(batch: &IngestionBatch, source: &str) -> Vec<ConnectionEdge> {
        batch
            .connection_edges
            .iter()
            .filter(|set| set.source == source)
            .flat_map(|set| set.edges.clone())
            .collect()
    }

    #[test]
    fn test_empty_adjacency_becomes_inbound_from_internet() {
        // Host "webA" reports (10.0.0.5:80, pid 100) with no observed peer.
        let mut rpt = Report::default();
        rpt.host.insert("webA".to_string(), make_host("webA"));
        insert_endpoint(&mut rpt, make_endpoint("webA", "10.0.0.5", "80", 100), &[]);

        let batch = prepare(&rpt, &empty_cache());
        let inbound = connections_from(&batch, IN_THE_INTERNET);
        assert_eq!(
            inbound,
            vec![ConnectionEdge {
                destination: "webA".to_string(),
                left_pid: 0,
                right_pid: 100,
            }]
        );
    }

    #[test]
    fn test_resolved_remote_yields_attributed_edge() {
        // webB (10.0.0.9:443, pid 55) talks to webA's 10.0.0.5:80 (pid 100).
        let cache = seeded_cache(
            &[("10.0.0.5", "webA")],
            &[("10.0.0.5:80", "10.0.0.5;100")],
        );
        let mut rpt = Report::default();
        rpt.host.insert("webB".to_string(), make_host("webB"));
        insert_endpoint(
            &mut rpt,
            make_endpoint("webB", "10.0.0.9", "443", 55),
            &["webA;10.0.0.5;80"],
        );

        let batch = prepare(&rpt, &cache);
        let edges = connections_from(&batch, "webB");
        assert_eq!(
            edges,
            vec![ConnectionEdge {
                destination: "webA".to_string(),
                left_pid: 55,
                right_pid: 100,
            }]
        );
    }

    #[test]
    fn test_unresolved_remote_falls_back_to_internet_sink() {
        let mut rpt = Report::default();
        insert_endpoint(
            &mut rpt,
            make_endpoint("webB", "10.0.0.9", "443", 55),
            &["scope;203.0.113.7;443"],
        );

        let batch = prepare(&rpt, &empty_cache());
        let edges = connections_from(&batch, "webB");
        assert_eq!(
            edges,
            vec![ConnectionEdge {
                destination: OUT_THE_INTERNET.to_string(),
                left_pid: 55,
                right_pid: 0,
            }]
        );
    }

    #[test]
    fn test_same_host_connections_skipped() {
        let cache = seeded_cache(&[("10.0.0.9", "webB")], &[]);
        let mut rpt = Report::default();
        insert_endpoint(
            &mut rpt,
            make_endpoint("webB", "10.0.0.9", "443", 55),
            &["webB;10.0.0.9;9090"],
        );

        let batch = prepare(&rpt, &cache);
        assert!(batch.connection_edges.is_empty());
    }

    #[test]
    fn test_known_host_without_listener_identity_skipped() {
        // Remote host resolves but no ip:port -> ip;pid entry exists yet.
        let cache = seeded_cache(&[("10.0.0.5", "webA")], &[]);
        let mut rpt = Report::default();
        insert_endpoint(
            &mut rpt,
            make_endpoint("webB", "10.0.0.9", "443", 55),
            &["webA;10.0.0.5;80"],
        );

        let batch = prepare(&rpt, &cache);
        assert!(batch.connection_edges.is_empty());
    }

    #[test]
    fn test_hostless_endpoint_resolved_through_cache() {
        let cache = seeded_cache(&[("10.0.0.9", "webB")], &[]);
        let mut rpt = Report::default();
        let mut ep = make_endpoint("scope", "10.0.0.9", "443", 55);
        ep.host_name = None;
        insert_endpoint(&mut rpt, ep, &[]);

        let batch = prepare(&rpt, &cache);
        let inbound = connections_from(&batch, IN_THE_INTERNET);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].destination, "webB");
    }

    #[test]
    fn test_hostless_unresolvable_endpoint_dropped() {
        let mut rpt = Report::default();
        let mut ep = make_endpoint("scope", "10.0.0.9", "443", 55);
        ep.host_name = None;
        insert_endpoint(&mut rpt, ep, &[]);

        let batch = prepare(&rpt, &empty_cache());
        assert!(batch.connection_edges.is_empty());
    }

    #[test]
    fn test_only_endpoint_owning_processes_kept() {
        let mut rpt = Report::default();
        rpt.host.insert("webA".to_string(), make_host("webA"));
        insert_endpoint(&mut rpt, make_endpoint("webA", "10.0.0.5", "80", 100), &[]);

        let keep = Metadata {
            node_id: "webA;100".to_string(),
            host_name: Some("webA".to_string()),
            pid: Some(100),
            ..Default::default()
        };
        let churn = Metadata {
            node_id: "webA;999".to_string(),
            host_name: Some("webA".to_string()),
            pid: Some(999),
            ..Default::default()
        };
        rpt.process.insert(keep.node_id.clone(), keep);
        rpt.process.insert(churn.node_id.clone(), churn);

        let batch = prepare(&rpt, &empty_cache());
        assert_eq!(batch.process_batch.len(), 1);
        assert_eq!(batch.process_batch[0]["node_id"], "webA;100");
        assert_eq!(batch.process_edges.len(), 1);
        assert_eq!(batch.process_edges[0].source, "webA");
        assert_eq!(batch.process_edges[0].destinations, vec!["webA;100"]);
    }

    #[test]
    fn test_process_parent_container_edge() {
        let mut rpt = Report::default();
        insert_endpoint(&mut rpt, make_endpoint("webA", "10.0.0.5", "80", 100), &[]);
        let proc = Metadata {
            node_id: "webA;100".to_string(),
            host_name: Some("webA".to_string()),
            pid: Some(100),
            ..Default::default()
        };
        rpt.process_parents.insert(
            proc.node_id.clone(),
            crate::report::ProcessParents {
                container: Some("cnt-1".to_string()),
                host: Some("webA".to_string()),
            },
        );
        rpt.process.insert(proc.node_id.clone(), proc);

        let batch = prepare(&rpt, &empty_cache());
        assert_eq!(batch.container_process_edges.len(), 1);
        assert_eq!(batch.container_process_edges[0].source, "cnt-1");
        assert_eq!(batch.container_process_edges[0].destinations, vec!["webA;100"]);
    }

    #[test]
    fn test_untagged_images_skipped() {
        let mut rpt = Report::default();
        let good = Metadata {
            node_id: "img-1".to_string(),
            host_name: Some("webA".to_string()),
            docker_image_name: Some("nginx".to_string()),
            docker_image_tag: Some("1.25".to_string()),
            ..Default::default()
        };
        let dangling = Metadata {
            node_id: "img-2".to_string(),
            host_name: Some("webA".to_string()),
            docker_image_name: Some(UNTAGGED.to_string()),
            docker_image_tag: Some(UNTAGGED.to_string()),
            ..Default::default()
        };
        rpt.container_image.insert(good.node_id.clone(), good);
        rpt.container_image.insert(dangling.node_id.clone(), dangling);

        let batch = prepare(&rpt, &empty_cache());
        assert_eq!(batch.container_image_batch.len(), 1);
        assert_eq!(batch.container_image_batch[0]["node_id"], "img-1");
    }

    #[test]
    fn test_cluster_host_and_pod_edges() {
        let cache = seeded_cache(&[("10.1.0.7", "nodeA")], &[]);
        let mut rpt = Report::default();
        let mut host = make_host("nodeA");
        host.kubernetes_cluster_id = Some("cluster-1".to_string());
        rpt.host.insert(host.node_id.clone(), host);
        rpt.kubernetes_cluster
            .insert("cluster-1".to_string(), make_host("cluster-1"));

        // Cluster-level pod report: no host name, only the pod IP.
        let pod = Metadata {
            node_id: "pod-1".to_string(),
            kubernetes_cluster_id: Some("cluster-1".to_string()),
            kubernetes_ip: Some("10.1.0.7".to_string()),
            ..Default::default()
        };
        rpt.pod.insert(pod.node_id.clone(), pod);

        let batch = prepare(&rpt, &cache);
        assert_eq!(batch.cluster_host_edges.len(), 1);
        assert_eq!(batch.cluster_host_edges[0].source, "cluster-1");
        assert_eq!(batch.cluster_host_edges[0].destinations, vec!["nodeA"]);

        assert_eq!(batch.pod_edges[0].source, "cluster-1");
        assert_eq!(batch.pod_host_edges[0].source, "nodeA");
        assert_eq!(batch.pod_batch[0]["host_name"], "nodeA");
    }

    #[test]
    fn test_pod_without_cluster_skipped() {
        let mut rpt = Report::default();
        let pod = Metadata {
            node_id: "pod-1".to_string(),
            ..Default::default()
        };
        rpt.pod.insert(pod.node_id.clone(), pod);

        let batch = prepare(&rpt, &empty_cache());
        assert!(batch.pod_batch.is_empty());
        assert!(batch.pod_edges.is_empty());
    }

    proptest! {
        /// A loopback endpoint never produces a connection edge, whatever
        /// its adjacency says.
        #[test]
        fn prop_loopback_excluded(
            port in 1u16..65535,
            pid in 1u32..99999,
            peers in proptest::collection::vec("[a-z]{1,6};10\\.0\\.0\\.[0-9]{1,2};[0-9]{2,4}", 0..6),
        ) {
            let mut rpt = Report::default();
            let meta = make_endpoint("webA", LOOPBACK_IP, &port.to_string(), pid);
            let peers: Vec<&str> = peers.iter().map(String::as_str).collect();
            insert_endpoint(&mut rpt, meta, &peers);

            let batch = prepare(&rpt, &empty_cache());
            prop_assert!(batch.connection_edges.is_empty());
        }
    }
}
