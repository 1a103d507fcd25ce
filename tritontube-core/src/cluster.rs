//! Ring manager: cluster-state custodian.
//!
//! Persists node membership and token assignments as JSON in the
//! coordination store under `<prefix>/ring`, publishes change events to
//! watchers, and answers replica lookups. Cross-process consistency comes
//! from the coordination store's ordering: concurrent writers each persist a
//! full state and watchers converge every process to the last write.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::coord::{CoordStore, EventKind};
use crate::error::{Result, TritonError};
use crate::ring::Ring;

pub const DEFAULT_CLUSTER_PREFIX: &str = "/storage/cluster";
pub const DEFAULT_VIRTUAL_NODES: u32 = 128;

/// State each storage node reports via heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub address: String,
    pub capacity_bytes: i64,
    pub available_bytes: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Ownership of one token on the consistent-hash ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNodeAssignment {
    pub id: String,
    pub token: u64,
    pub node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RingState {
    version: i64,
    #[serde(default)]
    nodes: BTreeMap<String, NodeDescriptor>,
    #[serde(default)]
    tokens: Vec<VirtualNodeAssignment>,
}

/// A ring change observed through the coordination store.
#[derive(Debug, Clone)]
pub struct RingEvent {
    pub version: i64,
    pub assignments: Vec<VirtualNodeAssignment>,
}

pub struct RingManagerConfig {
    pub coord: Arc<CoordStore>,
    pub prefix: String,
    pub virtual_nodes: u32,
}

impl RingManagerConfig {
    pub fn new(coord: Arc<CoordStore>) -> Self {
        Self {
            coord,
            prefix: DEFAULT_CLUSTER_PREFIX.to_string(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

struct ManagerState {
    state: RingState,
    ring: Ring,
}

/// Persists and watches the consistent-hash ring in the coordination store.
pub struct RingManager {
    coord: Arc<CoordStore>,
    prefix: String,
    vnodes: u32,
    shared: RwLock<ManagerState>,
}

fn build_ring(nodes: &BTreeMap<String, NodeDescriptor>, vnodes: u32) -> Ring {
    let mut ring = Ring::new(vnodes);
    for id in nodes.keys() {
        ring.add_node(id);
    }
    ring
}

fn assignments_of(ring: &Ring) -> Vec<VirtualNodeAssignment> {
    ring.tokens()
        .iter()
        .map(|token| VirtualNodeAssignment {
            id: format!("{}#{}", token.node_id, token.ordinal),
            token: token.hash,
            node_id: token.node_id.clone(),
        })
        .collect()
}

impl RingManager {
    /// Constructs a manager, seeding state from `<prefix>/ring` when present.
    pub async fn new(config: RingManagerConfig) -> Result<Self> {
        let prefix = if config.prefix.is_empty() {
            DEFAULT_CLUSTER_PREFIX.to_string()
        } else {
            config.prefix
        };
        let vnodes = if config.virtual_nodes == 0 {
            DEFAULT_VIRTUAL_NODES
        } else {
            config.virtual_nodes
        };

        let manager = Self {
            coord: config.coord,
            prefix,
            vnodes,
            shared: RwLock::new(ManagerState {
                state: RingState::default(),
                ring: Ring::new(vnodes),
            }),
        };

        let resp = manager.coord.get(&manager.ring_key()).await?;
        if let Some(kv) = resp.kvs.into_iter().next() {
            let state: RingState = serde_json::from_str(&kv.value).map_err(|error| {
                TritonError::Internal(format!("failed to decode ring state: {}", error))
            })?;
            let ring = build_ring(&state.nodes, vnodes);
            let mut shared = manager.shared.write().await;
            shared.state = state;
            shared.ring = ring;
        }

        Ok(manager)
    }

    fn ring_key(&self) -> String {
        format!("{}/ring", self.prefix)
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.vnodes
    }

    /// Registers or refreshes a node, rebuilds the ring and persists the new
    /// state. The local state is replaced only after a successful persist, so
    /// a failed call leaves `nodes()`/`assignments()` matching the store.
    pub async fn upsert_node(&self, mut node: NodeDescriptor) -> Result<i64> {
        if node.id.is_empty() {
            return Err(TritonError::InvalidRequest(
                "node id is required".to_string(),
            ));
        }
        node.updated_at = Some(Utc::now());

        let mut shared = self.shared.write().await;

        let mut next = shared.state.clone();
        next.nodes.insert(node.id.clone(), node);
        let ring = build_ring(&next.nodes, self.vnodes);
        next.tokens = assignments_of(&ring);
        next.version += 1;

        self.persist(&next).await?;
        let version = next.version;
        shared.state = next;
        shared.ring = ring;
        Ok(version)
    }

    /// Removes a node from the ring. A no-op for unknown ids.
    pub async fn remove_node(&self, node_id: &str) -> Result<i64> {
        if node_id.is_empty() {
            return Err(TritonError::InvalidRequest(
                "node id is required".to_string(),
            ));
        }

        let mut shared = self.shared.write().await;
        if !shared.state.nodes.contains_key(node_id) {
            return Ok(shared.state.version);
        }

        let mut next = shared.state.clone();
        next.nodes.remove(node_id);
        let ring = build_ring(&next.nodes, self.vnodes);
        next.tokens = assignments_of(&ring);
        next.version += 1;

        self.persist(&next).await?;
        let version = next.version;
        shared.state = next;
        shared.ring = ring;
        Ok(version)
    }

    async fn persist(&self, state: &RingState) -> Result<()> {
        let encoded = serde_json::to_string(state)?;
        self.coord.put(&self.ring_key(), &encoded).await?;
        Ok(())
    }

    /// Resolves the replica set for a key. Safe for concurrent readers.
    pub async fn lookup(&self, key: &[u8], replicas: usize) -> Vec<String> {
        let shared = self.shared.read().await;
        shared.ring.lookup(key, replicas)
    }

    /// Copy of the current token assignments plus the logical version.
    pub async fn assignments(&self) -> (Vec<VirtualNodeAssignment>, i64) {
        let shared = self.shared.read().await;
        (shared.state.tokens.clone(), shared.state.version)
    }

    /// All currently registered nodes, sorted by id.
    pub async fn nodes(&self) -> Vec<NodeDescriptor> {
        let shared = self.shared.read().await;
        shared.state.nodes.values().cloned().collect()
    }

    /// Emits a [`RingEvent`] for every ring-state write observed in the
    /// coordination store. The state is applied locally before the event is
    /// delivered, so `lookup` reflects it by the time the receiver sees it.
    /// Dropping the receiver ends the subscription.
    pub fn watch(self: &Arc<Self>) -> mpsc::Receiver<RingEvent> {
        let (tx, rx) = mpsc::channel(8);
        let mut source = self.coord.watch(&self.prefix);
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let ring_key = manager.ring_key();
            while let Some(resp) = source.recv().await {
                for event in resp.events {
                    if event.key != ring_key || event.kind != EventKind::Put {
                        continue;
                    }
                    let state: RingState = match serde_json::from_str(&event.value) {
                        Ok(state) => state,
                        Err(error) => {
                            tracing::warn!("ignoring undecodable ring state: {}", error);
                            continue;
                        }
                    };
                    let ring_event = RingEvent {
                        version: state.version,
                        assignments: state.tokens.clone(),
                    };
                    manager.apply_state(state).await;
                    if tx.send(ring_event).await.is_err() {
                        return;
                    }
                }
            }
        });

        rx
    }

    async fn apply_state(&self, state: RingState) {
        let ring = build_ring(&state.nodes, self.vnodes);
        let mut shared = self.shared.write().await;
        shared.state = state;
        shared.ring = ring;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: id.to_string(),
            address: format!("http://{}:8081", id),
            capacity_bytes: 1 << 30,
            available_bytes: 1 << 29,
            updated_at: None,
        }
    }

    async fn new_manager(coord: Arc<CoordStore>, vnodes: u32) -> RingManager {
        let mut config = RingManagerConfig::new(coord);
        config.virtual_nodes = vnodes;
        RingManager::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_increments_version_and_persists() {
        let coord = Arc::new(CoordStore::new());
        let manager = new_manager(coord.clone(), 4).await;

        let v1 = manager.upsert_node(descriptor("a")).await.unwrap();
        let v2 = manager.upsert_node(descriptor("b")).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let (assignments, version) = manager.assignments().await;
        assert_eq!(version, 2);
        assert_eq!(assignments.len(), 8);

        // A fresh manager bootstraps the same state from the store.
        let rebooted = new_manager(coord, 4).await;
        let (reloaded, reloaded_version) = rebooted.assignments().await;
        assert_eq!(reloaded_version, 2);
        assert_eq!(reloaded, assignments);
    }

    #[tokio::test]
    async fn test_remove_absent_node_is_idempotent() {
        let coord = Arc::new(CoordStore::new());
        let manager = new_manager(coord, 4).await;
        manager.upsert_node(descriptor("a")).await.unwrap();

        let version = manager.remove_node("ghost").await.unwrap();
        assert_eq!(version, 1);

        let version = manager.remove_node("a").await.unwrap();
        assert_eq!(version, 2);
        assert!(manager.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_uses_registered_nodes() {
        let coord = Arc::new(CoordStore::new());
        let manager = new_manager(coord, 8).await;
        manager.upsert_node(descriptor("a")).await.unwrap();
        manager.upsert_node(descriptor("b")).await.unwrap();

        let replicas = manager.lookup(b"v1|720p|0", 2).await;
        assert_eq!(replicas.len(), 2);
    }

    #[tokio::test]
    async fn test_watch_applies_and_emits_events() {
        let coord = Arc::new(CoordStore::new());
        let writer = Arc::new(new_manager(coord.clone(), 4).await);
        let observer = Arc::new(new_manager(coord, 4).await);

        let mut events = observer.watch();
        let version = writer.upsert_node(descriptor("x")).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .expect("watch timed out")
            .expect("watch closed");
        assert_eq!(event.version, version);
        assert!(event.assignments.iter().any(|a| a.node_id == "x"));

        // The observer applied the state before emitting the event.
        let (_, observed_version) = observer.assignments().await;
        assert_eq!(observed_version, version);
        assert_eq!(observer.lookup(b"any", 1).await, vec!["x".to_string()]);
    }
}
