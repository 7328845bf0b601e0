//! Storage node membership registry with heartbeat-based liveness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::{Duration, Instant};

/// Storage node ID type, chosen by the node itself.
pub type NodeId = String;

/// Registry record of a live storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Address at which the node's chunk server listens.
    pub addr: SocketAddr,

    /// Time of the last REGISTER or HEARTBEAT heard from it.
    pub last_heartbeat: Instant,

    /// Insertion sequence number; determines ring order.
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    nodes: HashMap<NodeId, NodeRecord>,
    next_seq: u64,
}

/// Node membership registry. All operations take the inner lock only for
/// the duration of the map operation.
#[derive(Debug)]
pub struct NodeRegistry {
    /// Nodes whose last heartbeat is older than this get swept.
    heartbeat_timeout: Duration,

    inner: Mutex<RegistryInner>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        NodeRegistry {
            heartbeat_timeout,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Gets the configured heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // no invariant spans multiple statements under this lock, so a
        // poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or refreshes) a node as of now.
    pub fn register(&self, node: &str, addr: SocketAddr) {
        self.register_at(node, addr, Instant::now());
    }

    /// Registers (or refreshes) a node as of `now`. A node that is already
    /// registered keeps its ring position.
    pub fn register_at(&self, node: &str, addr: SocketAddr, now: Instant) {
        let mut inner = self.lock();
        if let Some(record) = inner.nodes.get_mut(node) {
            record.addr = addr;
            record.last_heartbeat = now;
            return;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.nodes.insert(
            node.into(),
            NodeRecord {
                addr,
                last_heartbeat: now,
                seq,
            },
        );
        drop(inner);
        pf_info!("node registered: {} @ {}", node, addr);
    }

    /// Refreshes a node's liveness as of now. See `heartbeat_at()`.
    pub fn heartbeat(&self, node: &str) -> bool {
        self.heartbeat_at(node, Instant::now())
    }

    /// Refreshes a node's liveness as of `now`. Returns false (and does
    /// nothing) if the node is unknown; an evicted node must re-register.
    pub fn heartbeat_at(&self, node: &str, now: Instant) -> bool {
        match self.lock().nodes.get_mut(node) {
            Some(record) => {
                record.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Snapshot of active node IDs in ring order.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.active_members()
            .into_iter()
            .map(|(node, _)| node)
            .collect()
    }

    /// Snapshot of active `(node ID, address)` pairs in ring order.
    pub fn active_members(&self) -> Vec<(NodeId, SocketAddr)> {
        let inner = self.lock();
        let mut members: Vec<(u64, NodeId, SocketAddr)> = inner
            .nodes
            .iter()
            .map(|(node, record)| (record.seq, node.clone(), record.addr))
            .collect();
        drop(inner);

        members.sort_unstable_by_key(|&(seq, _, _)| seq);
        members
            .into_iter()
            .map(|(_, node, addr)| (node, addr))
            .collect()
    }

    /// Current chunk address of a node, if it is registered.
    pub fn address_of(&self, node: &str) -> Option<SocketAddr> {
        self.lock().nodes.get(node).map(|record| record.addr)
    }

    /// Copy of a node's record, if it is registered.
    pub fn record_of(&self, node: &str) -> Option<NodeRecord> {
        self.lock().nodes.get(node).cloned()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    /// True if no node is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts every node whose last heartbeat is more than the timeout
    /// before `now`. Returns the evicted node IDs in ring order.
    pub fn sweep(&self, now: Instant) -> Vec<NodeId> {
        let mut inner = self.lock();
        let mut evicted: Vec<(u64, NodeId)> = inner
            .nodes
            .iter()
            .filter(|(_, record)| {
                now.saturating_duration_since(record.last_heartbeat)
                    > self.heartbeat_timeout
            })
            .map(|(node, record)| (record.seq, node.clone()))
            .collect();
        for (_, node) in &evicted {
            inner.nodes.remove(node);
        }
        drop(inner);

        evicted.sort_unstable_by_key(|&(seq, _)| seq);
        evicted.into_iter().map(|(_, node)| node).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::DfsError;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn register_keeps_insertion_order() {
        let registry = NodeRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register_at("node2", addr(6002), t0);
        registry.register_at("node1", addr(6001), t0);
        registry.register_at("node3", addr(6003), t0);
        assert_eq!(registry.active_nodes(), vec!["node2", "node1", "node3"]);
        assert_eq!(
            registry.active_members(),
            vec![
                ("node2".into(), addr(6002)),
                ("node1".into(), addr(6001)),
                ("node3".into(), addr(6003)),
            ]
        );
    }

    #[test]
    fn register_idempotent() {
        let registry = NodeRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register_at("node1", addr(6001), t0);
        registry.register_at("node2", addr(6002), t0);
        let before = (registry.active_members(), registry.record_of("node1"));
        registry.register_at("node1", addr(6001), t0);
        let after = (registry.active_members(), registry.record_of("node1"));
        assert_eq!(before, after);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reregister_updates_address_in_place() {
        let registry = NodeRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register_at("node1", addr(6001), t0);
        registry.register_at("node2", addr(6002), t0);
        registry.register_at("node1", addr(7001), t0);
        assert_eq!(registry.active_nodes(), vec!["node1", "node2"]);
        assert_eq!(registry.address_of("node1"), Some(addr(7001)));
    }

    #[test]
    fn heartbeat_unknown_is_noop() {
        let registry = NodeRegistry::new(TIMEOUT);
        assert!(!registry.heartbeat_at("ghost", Instant::now()));
        assert!(registry.is_empty());
        assert_eq!(registry.address_of("ghost"), None);
    }

    #[test]
    fn sweep_evicts_exactly_stale() -> Result<(), DfsError> {
        let registry = NodeRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register_at("node1", addr(6001), t0);
        registry.register_at("node2", addr(6002), t0);
        registry.register_at("node3", addr(6003), t0);
        registry.heartbeat_at("node2", t0 + Duration::from_secs(6));
        registry.heartbeat_at("node3", t0 + Duration::from_secs(9));

        // exactly at the timeout boundary nobody is stale yet
        assert!(registry.sweep(t0 + TIMEOUT).is_empty());

        let t1 = t0 + Duration::from_secs(17);
        assert_eq!(registry.sweep(t1), vec!["node1", "node2"]);
        assert_eq!(registry.active_nodes(), vec!["node3"]);

        // a second sweep at the same instant evicts nothing more
        assert!(registry.sweep(t1).is_empty());
        Ok(())
    }

    #[test]
    fn evicted_node_must_reregister() {
        let registry = NodeRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register_at("node1", addr(6001), t0);
        registry.register_at("node2", addr(6002), t0);
        let t1 = t0 + Duration::from_secs(11);
        registry.heartbeat_at("node2", t1);
        assert_eq!(registry.sweep(t1), vec!["node1"]);

        // heartbeat does not resurrect the evicted identity
        assert!(!registry.heartbeat_at("node1", t1));
        assert_eq!(registry.active_nodes(), vec!["node2"]);

        // re-registration creates a fresh record at the end of the ring
        registry.register_at("node1", addr(6001), t1);
        assert_eq!(registry.active_nodes(), vec!["node2", "node1"]);
        assert_eq!(
            registry.record_of("node1").map(|r| r.last_heartbeat),
            Some(t1)
        );
    }
}
