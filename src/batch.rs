//! Graph-shaped ingestion batches
//!
//! An [`IngestionBatch`] is the graph-shaped representation of one report
//! (or, after accumulation, many reports): per-type node upsert rows plus
//! per-type edge lists, and the `hosts` scope list used downstream to
//! delete previously-recorded connection edges before re-adding fresh
//! ones.
//!
//! Batches merge by plain list concatenation. Duplicate rows across
//! reports inside one accumulation window are harmless because every
//! writer statement is MERGE-based; deduplicating here would cost more
//! than the transaction bandwidth it saves at these volumes.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::report::NodeId;

/// One node upsert row: attribute map keyed by `node_id`.
pub type Row = Map<String, Value>;

/// Fan-out edges from one source node to many destinations of one type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EdgeSet {
    pub source: NodeId,
    pub destinations: Vec<NodeId>,
}

/// One directed connection edge with its pid attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEdge {
    pub destination: NodeId,
    pub left_pid: u32,
    pub right_pid: u32,
}

/// Connection edges grouped by source host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSet {
    pub source: NodeId,
    pub edges: Vec<ConnectionEdge>,
}

/// Graph-shaped bundle of one or more reports, ready for one transaction.
#[derive(Debug, Clone, Default)]
pub struct IngestionBatch {
    pub host_batch: Vec<Row>,
    pub process_batch: Vec<Row>,
    pub container_batch: Vec<Row>,
    pub container_image_batch: Vec<Row>,
    pub pod_batch: Vec<Row>,
    pub kubernetes_cluster_batch: Vec<Row>,

    /// host -> process
    pub process_edges: Vec<EdgeSet>,
    /// host -> container
    pub container_edges: Vec<EdgeSet>,
    /// container -> process
    pub container_process_edges: Vec<EdgeSet>,
    /// host -> container image
    pub container_image_edges: Vec<EdgeSet>,
    /// cluster -> pod
    pub pod_edges: Vec<EdgeSet>,
    /// host -> pod
    pub pod_host_edges: Vec<EdgeSet>,
    /// cluster -> host
    pub cluster_host_edges: Vec<EdgeSet>,
    /// host -> host connection edges (including the internet sentinels)
    pub connection_edges: Vec<ConnectionSet>,

    /// `{node_id}` rows scoping stale-connection cleanup to the hosts
    /// present in this batch.
    pub hosts: Vec<Row>,

    /// How many reports this batch represents.
    pub num_merged: usize,
}

impl IngestionBatch {
    /// Empty batch representing a single report.
    pub fn new() -> Self {
        Self {
            num_merged: 1,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host_batch.is_empty()
            && self.process_batch.is_empty()
            && self.container_batch.is_empty()
            && self.container_image_batch.is_empty()
            && self.pod_batch.is_empty()
            && self.kubernetes_cluster_batch.is_empty()
            && self.connection_edges.is_empty()
    }

    /// Concatenate `other` into `self`. Associative; commutative for
    /// disjoint report sets.
    pub fn merge(&mut self, other: IngestionBatch) {
        self.host_batch.extend(other.host_batch);
        self.process_batch.extend(other.process_batch);
        self.container_batch.extend(other.container_batch);
        self.container_image_batch.extend(other.container_image_batch);
        self.pod_batch.extend(other.pod_batch);
        self.kubernetes_cluster_batch
            .extend(other.kubernetes_cluster_batch);
        self.process_edges.extend(other.process_edges);
        self.container_edges.extend(other.container_edges);
        self.container_process_edges
            .extend(other.container_process_edges);
        self.container_image_edges.extend(other.container_image_edges);
        self.pod_edges.extend(other.pod_edges);
        self.pod_host_edges.extend(other.pod_host_edges);
        self.cluster_host_edges.extend(other.cluster_host_edges);
        self.connection_edges.extend(other.connection_edges);
        self.hosts.extend(other.hosts);
        self.num_merged += other.num_merged;
    }

    /// Merge an accumulation window's batches into one.
    pub fn merge_all(batches: Vec<IngestionBatch>) -> IngestionBatch {
        let mut merged = IngestionBatch::default();
        for batch in batches {
            merged.merge(batch);
        }
        merged
    }
}

/// Collapse a source -> destinations map into edge-set rows.
pub fn edge_sets(map: BTreeMap<NodeId, Vec<NodeId>>) -> Vec<EdgeSet> {
    map.into_iter()
        .map(|(source, destinations)| EdgeSet {
            source,
            destinations,
        })
        .collect()
}
