//! Agent report model
//!
//! A `Report` is one agent's point-in-time snapshot of observed topology
//! entities: per-type topologies keyed by NodeID, plus the endpoint
//! adjacency map and process parent linkage. Reports are immutable once
//! submitted; the pipeline only reads them.
//!
//! NodeID conventions (opaque strings, but with parseable shapes where the
//! preparer needs them):
//! - process:  `<host>;<pid>`
//! - endpoint: `<scope>;<ip>;<port>` (the scope is the observing agent's
//!   host scope and may not name the owning host)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable opaque string identity for one graph entity.
pub type NodeId = String;

/// One entity type's observations, keyed by NodeID.
pub type Topology = BTreeMap<NodeId, Metadata>;

/// The loopback address is never a useful resolution target.
pub const LOOPBACK_IP: &str = "127.0.0.1";

/// Reserved NodeID of the sentinel representing unattributed inbound
/// traffic.
pub const IN_THE_INTERNET: &str = "in-the-internet";

/// Reserved NodeID of the sentinel representing unattributed outbound
/// traffic.
pub const OUT_THE_INTERNET: &str = "out-the-internet";

/// Attributes of one observed entity.
///
/// Absent fields are omitted on the wire and omitted from the upsert row,
/// so `SET n += row` never clobbers existing attributes with blanks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interface_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_container_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_region: Option<String>,
}

impl Metadata {
    /// Host name, treating the empty string the same as absent.
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref().filter(|h| !h.is_empty())
    }

    /// Convert to an attribute row for a batch upsert.
    ///
    /// Serialization of a plain struct into a JSON object cannot fail, but
    /// the conversion is kept total anyway: a non-object result yields an
    /// empty row.
    pub fn to_row(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Parent linkage for one process observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessParents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<NodeId>,
}

/// One agent's snapshot of observed topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub host: Topology,
    #[serde(default)]
    pub process: Topology,
    #[serde(default)]
    pub container: Topology,
    #[serde(default)]
    pub container_image: Topology,
    #[serde(default)]
    pub pod: Topology,
    #[serde(default)]
    pub kubernetes_cluster: Topology,
    #[serde(default)]
    pub endpoint: Topology,

    /// Endpoint NodeID -> adjacent endpoint NodeIDs (observed peers).
    #[serde(default)]
    pub endpoint_adjacency: BTreeMap<NodeId, Vec<NodeId>>,

    /// Process NodeID -> parent linkage.
    #[serde(default)]
    pub process_parents: BTreeMap<NodeId, ProcessParents>,
}

impl Report {
    /// Dedup key for the dispatcher window: the origin host's identifier.
    ///
    /// Pod-only reports from cluster-level agents carry no Host topology;
    /// those are scoped by cluster instead so that two clusters' reports
    /// never collapse onto each other.
    pub fn dedup_key(&self) -> &str {
        if let Some(id) = self.host.keys().next() {
            return id;
        }
        if let Some(id) = self.kubernetes_cluster.keys().next() {
            return id;
        }
        "<anonymous>"
    }

    /// Adjacency list for one endpoint, empty slice when unobserved.
    pub fn adjacency(&self, endpoint_id: &str) -> &[NodeId] {
        self.endpoint_adjacency
            .get(endpoint_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Split an endpoint NodeID `<scope>;<ip>;<port>` into (ip, port).
///
/// Returns `None` for anything without two separators; malformed entries
/// are skipped at the point of use rather than failing the report.
pub fn split_endpoint_node_id(node_id: &str) -> Option<(&str, &str)> {
    let first = node_id.find(';')?;
    let rest = &node_id[first + 1..];
    let second = rest.find(';')?;
    let (ip, port) = (&rest[..second], &rest[second + 1..]);
    if ip.is_empty() || port.is_empty() {
        return None;
    }
    Some((ip, port))
}

/// Extract the pid from an `<ip>;<pid>` resolver value.
pub fn pid_from_ip_pid(value: &str) -> Option<u32> {
    let middle = value.find(';')?;
    value[middle + 1..].parse().ok()
}

/// Build the `<ip>;<pid>` resolver value for an endpoint.
pub fn ip_pid_value(ip: &str, pid: u32) -> String {
    format!("{ip};{pid}")
}

/// Build the `<host>;<pid>` process NodeID.
pub fn process_node_id(host: &str, pid: u32) -> String {
    format!("{host};{pid}")
}
