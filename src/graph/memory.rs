//! In-memory property graph backing [`GraphStore`].
//!
//! Interprets the typed [`StatementKind`] of each statement instead of
//! parsing Cypher. Transactions stage statements and apply them under a
//! single lock on commit, so a batch lands atomically and concurrent
//! writers serialize the same way a remote store would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::{GraphStore, GraphTransaction, NodeKind, Statement, StatementKind};
use crate::batch::Row;
use crate::error::{IngestError, Result};
use crate::report::IN_THE_INTERNET;

/// (label, node_id) -> properties.
type NodeMap = BTreeMap<(String, String), Row>;

/// (src label, src id, rel, dst label, dst id).
type EdgeSet = BTreeSet<(String, String, String, String, String)>;

/// (src id, dst id, left_pid, right_pid). CONNECTS edges always join
/// host nodes, so labels are implicit.
type ConnectionSet = BTreeSet<(String, String, u64, u64)>;

#[derive(Default)]
struct GraphData {
    nodes: NodeMap,
    edges: EdgeSet,
    connections: ConnectionSet,
}

/// Process-local graph store. Cheap to construct per test; shared via
/// `Arc` with the pipeline's writer.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Mutex<GraphData>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, GraphData>> {
        self.inner
            .lock()
            .map_err(|_| IngestError::Store("graph lock poisoned".to_string()))
    }

    /// Properties of one node, or None if absent.
    pub fn node(&self, label: &str, node_id: &str) -> Option<Row> {
        self.inner
            .lock()
            .ok()?
            .nodes
            .get(&(label.to_string(), node_id.to_string()))
            .cloned()
    }

    pub fn node_count(&self, label: &str) -> usize {
        match self.inner.lock() {
            Ok(data) => data.nodes.keys().filter(|(l, _)| l == label).count(),
            Err(_) => 0,
        }
    }

    pub fn has_edge(&self, src: &str, rel: &str, dst: &str) -> bool {
        match self.inner.lock() {
            Ok(data) => data
                .edges
                .iter()
                .any(|(_, s, r, _, d)| s == src && r == rel && d == dst),
            Err(_) => false,
        }
    }

    /// All CONNECTS edges as (source, destination, left_pid, right_pid).
    pub fn connections(&self) -> Vec<(String, String, u64, u64)> {
        match self.inner.lock() {
            Ok(data) => data.connections.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Full normalized content for equality checks. Two stores that went
    /// through equivalent batches compare equal regardless of ordering.
    pub fn snapshot(&self) -> GraphSnapshot {
        match self.inner.lock() {
            Ok(data) => GraphSnapshot {
                nodes: data.nodes.clone(),
                edges: data.edges.clone(),
                connections: data.connections.clone(),
            },
            Err(_) => GraphSnapshot::default(),
        }
    }
}

/// Normalized store content, ordering-independent by construction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: NodeMap,
    pub edges: EdgeSet,
    pub connections: ConnectionSet,
}

impl GraphStore for MemoryGraphStore {
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged: Vec::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryGraphStore,
    staged: Vec<Statement>,
}

impl GraphTransaction for MemoryTransaction<'_> {
    fn run(&mut self, statement: Statement) -> Result<()> {
        self.staged.push(statement);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut data = self.store.lock()?;
        for statement in &self.staged {
            apply(&mut data, statement)?;
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn batch_rows(statement: &Statement) -> &[Value] {
    match statement.params.get("batch") {
        Some(Value::Array(rows)) => rows,
        _ => &[],
    }
}

fn row_str<'v>(row: &'v Value, key: &str) -> Option<&'v str> {
    row.get(key)?.as_str()
}

fn apply(data: &mut GraphData, statement: &Statement) -> Result<()> {
    match statement.kind {
        StatementKind::Constraint(_) => Ok(()),
        StatementKind::MergeSentinel => {
            for row in batch_rows(statement) {
                if let Value::Object(props) = row {
                    upsert_node(data, "Node", props);
                }
            }
            Ok(())
        }
        StatementKind::UpsertNodes(kind) => {
            for row in batch_rows(statement) {
                let Value::Object(props) = row else { continue };
                upsert_node(data, kind.label(), props);
                match kind {
                    NodeKind::Container => {
                        let active = row_str(row, "docker_container_state")
                            .map(|state| state != "deleted")
                            .unwrap_or(true);
                        set_node_prop(data, kind.label(), props, "active", Value::Bool(active));
                    }
                    NodeKind::ContainerImage => upsert_image_stub(data, row),
                    NodeKind::Process => {}
                    _ => {
                        set_node_prop(data, kind.label(), props, "active", Value::Bool(true));
                    }
                }
            }
            Ok(())
        }
        StatementKind::UpsertCloudTopology => {
            for row in batch_rows(statement) {
                apply_cloud_topology(data, row);
            }
            Ok(())
        }
        StatementKind::UpsertEdges { src, dst, rel } => {
            for row in batch_rows(statement) {
                let Some(source) = row_str(row, "source") else { continue };
                if !has_node(data, src.label(), source) {
                    continue;
                }
                let Some(Value::Array(destinations)) = row.get("destinations") else {
                    continue;
                };
                for dest in destinations {
                    let Some(dest) = dest.as_str() else { continue };
                    if !has_node(data, dst.label(), dest) {
                        continue;
                    }
                    data.edges.insert((
                        src.label().to_string(),
                        source.to_string(),
                        rel.name().to_string(),
                        dst.label().to_string(),
                        dest.to_string(),
                    ));
                }
            }
            Ok(())
        }
        StatementKind::DeleteHostConnections => {
            for row in batch_rows(statement) {
                let Some(host) = row_str(row, "node_id") else { continue };
                data.connections.retain(|(src, _, _, _)| src != host);
            }
            Ok(())
        }
        StatementKind::DeleteInboundConnections => {
            for row in batch_rows(statement) {
                let Some(host) = row_str(row, "node_id") else { continue };
                data.connections
                    .retain(|(src, dst, _, _)| !(src == IN_THE_INTERNET && dst == host));
            }
            Ok(())
        }
        StatementKind::InsertConnections => {
            for row in batch_rows(statement) {
                let Some(source) = row_str(row, "source") else { continue };
                if !has_node(data, "Node", source) {
                    continue;
                }
                let Some(Value::Array(edges)) = row.get("edges") else {
                    continue;
                };
                for edge in edges {
                    let Some(destination) = row_str(edge, "destination") else { continue };
                    if !has_node(data, "Node", destination) {
                        continue;
                    }
                    let left_pid = edge.get("left_pid").and_then(Value::as_u64).unwrap_or(0);
                    let right_pid = edge.get("right_pid").and_then(Value::as_u64).unwrap_or(0);
                    data.connections.insert((
                        source.to_string(),
                        destination.to_string(),
                        left_pid,
                        right_pid,
                    ));
                }
            }
            Ok(())
        }
    }
}

fn has_node(data: &GraphData, label: &str, node_id: &str) -> bool {
    data.nodes
        .contains_key(&(label.to_string(), node_id.to_string()))
}

/// MERGE-then-SET: create the node if absent, overlay the row's
/// properties either way.
fn upsert_node(data: &mut GraphData, label: &str, props: &Map<String, Value>) {
    let Some(node_id) = props.get("node_id").and_then(Value::as_str) else {
        return;
    };
    let entry = data
        .nodes
        .entry((label.to_string(), node_id.to_string()))
        .or_default();
    for (key, value) in props {
        entry.insert(key.clone(), value.clone());
    }
}

fn set_node_prop(data: &mut GraphData, label: &str, props: &Map<String, Value>, key: &str, value: Value) {
    let Some(node_id) = props.get("node_id").and_then(Value::as_str) else {
        return;
    };
    if let Some(entry) = data
        .nodes
        .get_mut(&(label.to_string(), node_id.to_string()))
    {
        entry.insert(key.to_string(), value);
    }
}

/// ImageStub keyed by the bare image name, accumulating distinct tags
/// across every image row that referenced it.
fn upsert_image_stub(data: &mut GraphData, row: &Value) {
    let Some(image_id) = row_str(row, "node_id") else { return };
    let Some(name) = row_str(row, "docker_image_name") else { return };
    let tag = row_str(row, "docker_image_tag").map(str::to_string);

    let stub = data
        .nodes
        .entry(("ImageStub".to_string(), name.to_string()))
        .or_default();
    stub.insert("node_id".to_string(), Value::String(name.to_string()));
    stub.insert(
        "docker_image_name".to_string(),
        Value::String(name.to_string()),
    );
    if let Some(tag) = tag {
        let tags = stub
            .entry("tags".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(tags) = tags {
            if !tags.iter().any(|t| t.as_str() == Some(tag.as_str())) {
                tags.push(Value::String(tag));
            }
        }
    }

    data.edges.insert((
        "ContainerImage".to_string(),
        image_id.to_string(),
        "IS".to_string(),
        "ImageStub".to_string(),
        name.to_string(),
    ));
}

fn apply_cloud_topology(data: &mut GraphData, row: &Value) {
    let Some(host) = row_str(row, "node_id") else { return };
    let Some(provider) = row_str(row, "cloud_provider") else { return };
    let Some(region) = row_str(row, "cloud_region") else { return };
    if !has_node(data, "Node", host) {
        return;
    }

    for (label, id) in [("CloudProvider", provider), ("CloudRegion", region)] {
        let node = data
            .nodes
            .entry((label.to_string(), id.to_string()))
            .or_default();
        node.insert("node_id".to_string(), Value::String(id.to_string()));
        node.insert("active".to_string(), Value::Bool(true));
    }
    data.edges.insert((
        "CloudProvider".to_string(),
        provider.to_string(),
        "HOSTS".to_string(),
        "CloudRegion".to_string(),
        region.to_string(),
    ));
    data.edges.insert((
        "CloudRegion".to_string(),
        region.to_string(),
        "HOSTS".to_string(),
        "Node".to_string(),
        host.to_string(),
    ));
}
