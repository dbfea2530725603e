//! Graph store seam and the Graph Writer
//!
//! The graph database is an external transactional, parameterized-query
//! service; this module owns the seam ([`GraphStore`] /
//! [`GraphTransaction`]) and the writer that turns an accumulated
//! [`IngestionBatch`] into one multi-statement transaction.
//!
//! Every statement is MERGE-based, so re-executing a batch is a no-op
//! beyond timestamp refresh. Statements carry their Cypher text plus a
//! typed [`StatementKind`]; network-backed stores execute the text,
//! the in-memory store interprets the kind.
//!
//! Persisted schema (stable, external consumers depend on it):
//! node labels `Node` (host), `Container`, `ContainerImage`, `ImageStub`,
//! `Pod`, `Process`, `KubernetesCluster`, `CloudProvider`, `CloudRegion`;
//! relationships `HOSTS`, `CONNECTS` (with `left_pid`/`right_pid`),
//! `INSTANCIATE`, `IS`.

pub mod memory;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::batch::{IngestionBatch, Row};
use crate::error::Result;
use crate::report::{IN_THE_INTERNET, OUT_THE_INTERNET};

/// The closed set of entity types the pipeline upserts.
///
/// Adding an entity type means adding a variant here plus its writer
/// statement; everything downstream dispatches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Host,
    Container,
    ContainerImage,
    Pod,
    Process,
    KubernetesCluster,
}

impl NodeKind {
    /// Persisted node label. Hosts keep the historical `Node` label.
    pub fn label(self) -> &'static str {
        match self {
            NodeKind::Host => "Node",
            NodeKind::Container => "Container",
            NodeKind::ContainerImage => "ContainerImage",
            NodeKind::Pod => "Pod",
            NodeKind::Process => "Process",
            NodeKind::KubernetesCluster => "KubernetesCluster",
        }
    }
}

/// Relationship types used by the per-entity edge statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelKind {
    Hosts,
    Instanciate,
}

impl RelKind {
    pub fn name(self) -> &'static str {
        match self {
            RelKind::Hosts => "HOSTS",
            RelKind::Instanciate => "INSTANCIATE",
        }
    }
}

/// Typed identity of one writer statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Uniqueness constraint for one label; no parameters.
    Constraint(&'static str),
    /// Upsert one internet sentinel node.
    MergeSentinel,
    /// Batch node upsert for one entity type.
    UpsertNodes(NodeKind),
    /// Link hosts to their CloudProvider/CloudRegion nodes.
    UpsertCloudTopology,
    /// Batch `{source, destinations}` edge upsert.
    UpsertEdges {
        src: NodeKind,
        dst: NodeKind,
        rel: RelKind,
    },
    /// Delete previously-recorded CONNECTS edges for the batch's hosts.
    DeleteHostConnections,
    /// Delete inbound internet placeholder edges for the batch's hosts.
    DeleteInboundConnections,
    /// Insert the batch's pid-attributed CONNECTS edges.
    InsertConnections,
}

/// One parameterized statement of a transaction.
#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    /// Short name for logs and error context.
    pub name: &'static str,
    pub cypher: &'static str,
    pub params: Map<String, Value>,
}

impl Statement {
    fn new(kind: StatementKind, name: &'static str, cypher: &'static str) -> Self {
        Self {
            kind,
            name,
            cypher,
            params: Map::new(),
        }
    }

    fn with_batch(mut self, batch: Vec<Value>) -> Self {
        self.params.insert("batch".to_string(), Value::Array(batch));
        self
    }

    /// Number of rows in this statement's batch parameter.
    pub fn rows(&self) -> usize {
        match self.params.get("batch") {
            Some(Value::Array(rows)) => rows.len(),
            _ => 0,
        }
    }
}

/// Transactional graph database client.
///
/// Anything speaking "begin / run statement with parameters / commit /
/// rollback" conforms; the shipped implementation is
/// [`memory::MemoryGraphStore`].
pub trait GraphStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>>;
}

/// One open transaction. Dropped without `commit` means rolled back.
pub trait GraphTransaction {
    fn run(&mut self, statement: Statement) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Executes accumulated batches against the graph store, one transaction
/// per batch. Does not retry: a failed batch is discarded and logged by
/// the caller (reconciliation is a maintenance-job concern).
pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Create uniqueness constraints and the two internet sentinel nodes.
    /// Run once at pipeline startup; every statement is idempotent.
    pub fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.store.begin()?;
        for statement in schema_statements() {
            let (name, rows) = (statement.name, statement.rows());
            if let Err(e) = tx.run(statement) {
                if let Err(rb) = tx.rollback() {
                    warn!(error = %rb, statement = name, "rollback failed");
                }
                return Err(e.in_statement(name, rows));
            }
        }
        tx.commit()
    }

    /// Commit one accumulated batch as a single transaction, in the fixed
    /// statement order: node upserts, entity edges, stale-connection
    /// cleanup scoped to the batch's hosts, fresh connection insert.
    pub fn commit(&self, batch: &IngestionBatch) -> Result<()> {
        let mut tx = self.store.begin()?;
        for statement in batch_statements(batch)? {
            let (name, rows) = (statement.name, statement.rows());
            if let Err(e) = tx.run(statement) {
                // The statement error is the diagnosis; a failed rollback
                // only gets logged so it cannot mask it.
                if let Err(rb) = tx.rollback() {
                    warn!(error = %rb, statement = name, "rollback failed");
                }
                return Err(e.in_statement(name, rows));
            }
        }
        tx.commit()
    }
}

fn rows_to_values(rows: &[Row]) -> Vec<Value> {
    rows.iter().cloned().map(Value::Object).collect()
}

fn to_values<T: serde::Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(Into::into))
        .collect()
}

/// Hosts carrying both cloud attributes, reshaped for the cloud-topology
/// statement. MERGE on a missing property is an error, so the filtering
/// happens here rather than in Cypher.
fn cloud_rows(hosts: &[Row]) -> Vec<Value> {
    hosts
        .iter()
        .filter_map(|row| {
            let provider = row.get("cloud_provider")?.as_str()?;
            let region = row.get("cloud_region")?.as_str()?;
            let node_id = row.get("node_id")?.as_str()?;
            let mut out = Map::new();
            out.insert("node_id".to_string(), Value::String(node_id.to_string()));
            out.insert(
                "cloud_provider".to_string(),
                Value::String(provider.to_string()),
            );
            out.insert("cloud_region".to_string(), Value::String(region.to_string()));
            Some(Value::Object(out))
        })
        .collect()
}

fn schema_statements() -> Vec<Statement> {
    let mut statements = Vec::new();
    for (label, cypher) in [
        ("Node", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:Node) REQUIRE n.node_id IS UNIQUE"),
        ("Container", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:Container) REQUIRE n.node_id IS UNIQUE"),
        ("ContainerImage", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:ContainerImage) REQUIRE n.node_id IS UNIQUE"),
        ("ImageStub", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:ImageStub) REQUIRE n.node_id IS UNIQUE"),
        ("Pod", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:Pod) REQUIRE n.node_id IS UNIQUE"),
        ("Process", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:Process) REQUIRE n.node_id IS UNIQUE"),
        ("KubernetesCluster", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:KubernetesCluster) REQUIRE n.node_id IS UNIQUE"),
        ("CloudProvider", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:CloudProvider) REQUIRE n.node_id IS UNIQUE"),
        ("CloudRegion", "CREATE CONSTRAINT IF NOT EXISTS FOR (n:CloudRegion) REQUIRE n.node_id IS UNIQUE"),
    ] {
        statements.push(Statement::new(
            StatementKind::Constraint(label),
            "constraint",
            cypher,
        ));
    }

    for (sentinel, cypher) in [
        (
            IN_THE_INTERNET,
            "MERGE (n:Node{node_id:'in-the-internet', cloud_provider:'internet', cloud_region:'internet', depth: 0})",
        ),
        (
            OUT_THE_INTERNET,
            "MERGE (n:Node{node_id:'out-the-internet', cloud_provider:'internet', cloud_region:'internet', depth: 0})",
        ),
    ] {
        let mut row = Map::new();
        row.insert("node_id".to_string(), Value::String(sentinel.to_string()));
        row.insert(
            "cloud_provider".to_string(),
            Value::String("internet".to_string()),
        );
        row.insert(
            "cloud_region".to_string(),
            Value::String("internet".to_string()),
        );
        statements.push(
            Statement::new(StatementKind::MergeSentinel, "sentinel", cypher)
                .with_batch(vec![Value::Object(row)]),
        );
    }
    statements
}

fn batch_statements(batch: &IngestionBatch) -> Result<Vec<Statement>> {
    use NodeKind::*;
    use RelKind::*;

    let mut statements = vec![
        // 1. Idempotent node upserts per entity type.
        Statement::new(
            StatementKind::UpsertNodes(Host),
            "host_batch",
            "UNWIND $batch as row \
             MERGE (n:Node{node_id:row.node_id}) \
             ON CREATE SET n.created_at = TIMESTAMP(), n += row, n.updated_at = TIMESTAMP(), n.active = true \
             ON MATCH SET n += row, n.updated_at = TIMESTAMP(), n.active = true",
        )
        .with_batch(rows_to_values(&batch.host_batch)),
        Statement::new(
            StatementKind::UpsertCloudTopology,
            "cloud_topology",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.node_id}) \
             MERGE (cp:CloudProvider{node_id: row.cloud_provider}) \
             MERGE (cr:CloudRegion{node_id: row.cloud_region}) \
             MERGE (cp) -[:HOSTS]-> (cr) \
             MERGE (cr) -[:HOSTS]-> (n) \
             SET cp.updated_at = TIMESTAMP(), cp.active = true, \
                 cr.updated_at = TIMESTAMP(), cr.active = true",
        )
        .with_batch(cloud_rows(&batch.host_batch)),
        Statement::new(
            StatementKind::UpsertNodes(Container),
            "container_batch",
            "UNWIND $batch as row \
             MERGE (n:Container{node_id:row.node_id}) \
             ON CREATE SET n.created_at = TIMESTAMP(), n += row, n.updated_at = TIMESTAMP(), \
             n.active = row.docker_container_state <> 'deleted' \
             ON MATCH SET n += row, n.updated_at = TIMESTAMP(), \
             n.active = row.docker_container_state <> 'deleted'",
        )
        .with_batch(rows_to_values(&batch.container_batch)),
        Statement::new(
            StatementKind::UpsertNodes(Process),
            "process_batch",
            "UNWIND $batch as row \
             MERGE (n:Process{node_id:row.node_id}) \
             SET n += row, n.updated_at = TIMESTAMP()",
        )
        .with_batch(rows_to_values(&batch.process_batch)),
        Statement::new(
            StatementKind::UpsertNodes(ContainerImage),
            "container_image_batch",
            "UNWIND $batch as row \
             MERGE (n:ContainerImage{node_id:row.node_id}) \
             MERGE (s:ImageStub{node_id: row.docker_image_name, docker_image_name: row.docker_image_name}) \
             MERGE (n) -[:IS]-> (s) \
             SET n += row, n.updated_at = TIMESTAMP(), n.active = true, \
                 s.updated_at = TIMESTAMP(), \
                 s.tags = REDUCE(acc = [], t IN COALESCE(s.tags, []) + row.docker_image_tag | \
                     CASE WHEN NOT t IN acc THEN acc + t ELSE acc END)",
        )
        .with_batch(rows_to_values(&batch.container_image_batch)),
        Statement::new(
            StatementKind::UpsertNodes(KubernetesCluster),
            "kubernetes_cluster_batch",
            "UNWIND $batch as row \
             MERGE (n:KubernetesCluster{node_id:row.node_id}) \
             ON CREATE SET n.created_at = TIMESTAMP(), n += row, n.updated_at = TIMESTAMP(), \
             n.active = true, n.node_type = 'cluster' \
             ON MATCH SET n += row, n.updated_at = TIMESTAMP(), n.active = true, \
             n.node_type = 'cluster'",
        )
        .with_batch(rows_to_values(&batch.kubernetes_cluster_batch)),
        Statement::new(
            StatementKind::UpsertNodes(Pod),
            "pod_batch",
            "UNWIND $batch as row \
             MERGE (n:Pod{node_id:row.node_id}) \
             ON CREATE SET n.created_at = TIMESTAMP(), n += row, n.updated_at = TIMESTAMP(), n.active = true \
             ON MATCH SET n += row, n.updated_at = TIMESTAMP(), n.active = true",
        )
        .with_batch(rows_to_values(&batch.pod_batch)),
    ];

    // 2. Edge upserts joining the freshly-upserted nodes.
    let edge_statements: [(StatementKind, &'static str, &'static str, Vec<Value>); 7] = [
        (
            StatementKind::UpsertEdges { src: KubernetesCluster, dst: Host, rel: Instanciate },
            "cluster_host_edges",
            "UNWIND $batch as row \
             MATCH (n:KubernetesCluster{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:Node{node_id: dest}) \
             MERGE (n)-[:INSTANCIATE]->(m)",
            to_values(&batch.cluster_host_edges)?,
        ),
        (
            StatementKind::UpsertEdges { src: Host, dst: Container, rel: Hosts },
            "container_edges",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:Container{node_id: dest}) \
             MERGE (n)-[:HOSTS]->(m)",
            to_values(&batch.container_edges)?,
        ),
        (
            StatementKind::UpsertEdges { src: Host, dst: Process, rel: Hosts },
            "process_edges",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:Process{node_id: dest}) \
             MERGE (n)-[:HOSTS]->(m)",
            to_values(&batch.process_edges)?,
        ),
        (
            StatementKind::UpsertEdges { src: Container, dst: Process, rel: Hosts },
            "container_process_edges",
            "UNWIND $batch as row \
             MATCH (n:Container{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:Process{node_id: dest}) \
             MERGE (n)-[:HOSTS]->(m)",
            to_values(&batch.container_process_edges)?,
        ),
        (
            StatementKind::UpsertEdges { src: Host, dst: ContainerImage, rel: Hosts },
            "container_image_edges",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:ContainerImage{node_id: dest}) \
             MERGE (n)-[:HOSTS]->(m)",
            to_values(&batch.container_image_edges)?,
        ),
        (
            StatementKind::UpsertEdges { src: KubernetesCluster, dst: Pod, rel: Hosts },
            "pod_edges",
            "UNWIND $batch as row \
             MATCH (n:KubernetesCluster{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:Pod{node_id: dest}) \
             MERGE (n)-[:HOSTS]->(m)",
            to_values(&batch.pod_edges)?,
        ),
        (
            StatementKind::UpsertEdges { src: Host, dst: Pod, rel: Hosts },
            "pod_host_edges",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.source}) \
             WITH n, row \
             UNWIND row.destinations as dest \
             MATCH (m:Pod{node_id: dest}) \
             MERGE (n)-[:HOSTS]->(m)",
            to_values(&batch.pod_host_edges)?,
        ),
    ];
    for (kind, name, cypher, values) in edge_statements {
        statements.push(Statement::new(kind, name, cypher).with_batch(values));
    }

    // 3-5. Reports reflect only currently-observed connections: clear the
    // batch's hosts, then re-insert fresh edges.
    statements.push(
        Statement::new(
            StatementKind::DeleteHostConnections,
            "delete_host_connections",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.node_id}) -[r:CONNECTS]-> (:Node) \
             DELETE r",
        )
        .with_batch(rows_to_values(&batch.hosts)),
    );
    statements.push(
        Statement::new(
            StatementKind::DeleteInboundConnections,
            "delete_inbound_connections",
            "UNWIND $batch as row \
             MATCH (:Node{node_id: 'in-the-internet'}) -[r:CONNECTS]-> (n:Node{node_id: row.node_id}) \
             DELETE r",
        )
        .with_batch(rows_to_values(&batch.hosts)),
    );
    statements.push(
        Statement::new(
            StatementKind::InsertConnections,
            "connection_edges",
            "UNWIND $batch as row \
             MATCH (n:Node{node_id: row.source}) \
             WITH n, row \
             UNWIND row.edges as edge \
             MATCH (m:Node{node_id: edge.destination}) \
             MERGE (n)-[:CONNECTS {left_pid: edge.left_pid, right_pid: edge.right_pid}]->(m)",
        )
        .with_batch(to_values(&batch.connection_edges)?),
    );

    Ok(statements)
}
