//! Endpoint resolution: computer, deltas, and the shared resolver cache
//!
//! Agents observe the two ends of a connection independently, using only
//! ephemeral (ip, port) identifiers. Each report yields an
//! [`EndpointResolvers`] delta (ip -> hostname, "ip:port" -> "ip;pid");
//! deltas are merged periodically and published into the shared
//! [`ResolverCache`], which the preparer reads to attribute remote
//! endpoints to hosts and processes.
//!
//! Entries are hints, not ground truth: a stale or missing entry only
//! degrades edge-resolution quality. The cache enforces a hard byte
//! ceiling per mapping and clears the whole mapping on breach; repopulation
//! from subsequent reports is cheap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{IngestError, Result};
use crate::report::{ip_pid_value, split_endpoint_node_id, Report, LOOPBACK_IP};

/// Name of the ip -> hostname mapping in the backing store.
pub const NETWORK_MAP: &str = "network_map";
/// Name of the "ip:port" -> "ip;pid" mapping in the backing store.
pub const IPPORTPID_MAP: &str = "ipportpid_map";

/// Backing key/value service for the resolver cache.
///
/// Any conforming store satisfies this contract: an in-memory map, a
/// networked cache, etc. Writes are last-write-wins per key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, mapping: &str, key: &str) -> Result<Option<String>>;
    fn bulk_set(&self, mapping: &str, entries: &HashMap<String, String>) -> Result<()>;
    /// Tracked size of one mapping, in bytes.
    fn memory_usage(&self, mapping: &str) -> Result<u64>;
    fn clear(&self, mapping: &str) -> Result<()>;
}

/// In-memory [`KeyValueStore`].
///
/// The shipped backing store; also what the tests inject. Size accounting
/// is the summed byte length of keys and values, which is exact enough for
/// the coarse whole-map eviction policy.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    mappings: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, HashMap<String, String>>>> {
        self.mappings
            .read()
            .map_err(|_| IngestError::KeyValue("store lock poisoned".to_string()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<String, String>>>> {
        self.mappings
            .write()
            .map_err(|_| IngestError::KeyValue("store lock poisoned".to_string()))
    }

    /// Number of entries in one mapping (test observability).
    pub fn len(&self, mapping: &str) -> usize {
        self.read_lock()
            .map(|m| m.get(mapping).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, mapping: &str) -> bool {
        self.len(mapping) == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, mapping: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_lock()?
            .get(mapping)
            .and_then(|m| m.get(key))
            .cloned())
    }

    fn bulk_set(&self, mapping: &str, entries: &HashMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut mappings = self.write_lock()?;
        let map = mappings.entry(mapping.to_string()).or_default();
        for (k, v) in entries {
            map.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn memory_usage(&self, mapping: &str) -> Result<u64> {
        Ok(self
            .read_lock()?
            .get(mapping)
            .map(|m| m.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum())
            .unwrap_or(0))
    }

    fn clear(&self, mapping: &str) -> Result<()> {
        self.write_lock()?.remove(mapping);
        Ok(())
    }
}

/// Per-report resolver delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointResolvers {
    /// ip -> hostname
    pub network_map: HashMap<String, String>,
    /// "ip:port" -> "ip;pid"
    pub ipport_ippid: HashMap<String, String>,
}

impl EndpointResolvers {
    /// Key-wise union; `other`'s entries overwrite on collision.
    pub fn merge(&mut self, other: EndpointResolvers) {
        self.network_map.extend(other.network_map);
        self.ipport_ippid.extend(other.ipport_ippid);
    }

    pub fn is_empty(&self) -> bool {
        self.network_map.is_empty() && self.ipport_ippid.is_empty()
    }
}

/// Lookup key for the "ip:port" mapping.
pub fn ip_port_key(ip: &str, port: &str) -> String {
    format!("{ip}:{port}")
}

/// Derive one report's resolver delta. Pure: never reads the shared cache,
/// so it runs fully in parallel across reports.
pub fn compute_resolvers(rpt: &Report) -> EndpointResolvers {
    let mut resolvers = EndpointResolvers::default();

    for meta in rpt.host.values() {
        let Some(host_name) = meta.host_name() else {
            continue;
        };
        for ip in &meta.interface_ips {
            resolvers
                .network_map
                .insert(ip.clone(), host_name.to_string());
        }
    }

    for meta in rpt.endpoint.values() {
        let Some(host_name) = meta.host_name() else {
            continue;
        };
        let Some((ip, port)) = split_endpoint_node_id(&meta.node_id) else {
            continue;
        };
        if ip == LOOPBACK_IP {
            continue;
        }
        resolvers
            .network_map
            .insert(ip.to_string(), host_name.to_string());
        if let Some(pid) = meta.pid {
            resolvers
                .ipport_ippid
                .insert(ip_port_key(ip, port), ip_pid_value(ip, pid));
        }
    }

    resolvers
}

/// Merge a batch of deltas into one; later deltas win on collision.
pub fn merge_resolvers(deltas: Vec<EndpointResolvers>) -> EndpointResolvers {
    let mut merged = EndpointResolvers::default();
    for delta in deltas {
        merged.merge(delta);
    }
    merged
}

/// Shared, multi-writer view of the resolver mappings.
///
/// All writes are serialized through the pipeline's periodic
/// merge-and-publish task; reads may race the next write (best-effort
/// staleness is acceptable). Store errors are logged and treated as
/// misses: resolution misses are a defined fallback path, not a failure.
pub struct ResolverCache {
    store: Arc<dyn KeyValueStore>,
    ceiling_bytes: u64,
}

impl ResolverCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ceiling_bytes: u64) -> Self {
        Self {
            store,
            ceiling_bytes,
        }
    }

    /// Hostname owning `ip`, if the fleet has reported it.
    pub fn get_host(&self, ip: &str) -> Option<String> {
        match self.store.get(NETWORK_MAP, ip) {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("resolver store get({ip}): {e}");
                None
            }
        }
    }

    /// The "ip;pid" identity listening on `ip:port`, if known.
    pub fn get_ip_pid(&self, ip: &str, port: &str) -> Option<String> {
        match self.store.get(IPPORTPID_MAP, &ip_port_key(ip, port)) {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("resolver store get({ip}:{port}): {e}");
                None
            }
        }
    }

    /// Evict oversized mappings, then publish a merged delta.
    ///
    /// Eviction runs first so a breached mapping is cleared before the new
    /// entries land.
    pub fn apply(&self, delta: &EndpointResolvers) {
        self.evict_if_oversized();
        self.publish(delta);
    }

    /// Clear any mapping whose tracked size breached the ceiling.
    pub fn evict_if_oversized(&self) {
        for mapping in [NETWORK_MAP, IPPORTPID_MAP] {
            match self.store.memory_usage(mapping) {
                Ok(bytes) if bytes >= self.ceiling_bytes => {
                    tracing::warn!("resolver mapping {mapping} reached {bytes} bytes, clearing");
                    if let Err(e) = self.store.clear(mapping) {
                        tracing::error!("resolver store clear({mapping}): {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!("resolver store memory_usage({mapping}): {e}"),
            }
        }
    }

    fn publish(&self, delta: &EndpointResolvers) {
        if let Err(e) = self.store.bulk_set(NETWORK_MAP, &delta.network_map) {
            tracing::error!("resolver store bulk_set({NETWORK_MAP}): {e}");
        }
        if let Err(e) = self.store.bulk_set(IPPORTPID_MAP, &delta.ipport_ippid) {
            tracing::error!("resolver store bulk_set({IPPORTPID_MAP}): {e}");
        }
    }
}
