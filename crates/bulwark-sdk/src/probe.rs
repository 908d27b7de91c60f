//! Reachability probing.

use async_trait::async_trait;
use bulwark_merkle::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers whether a node can currently be reached.
///
/// Production code backs this with the real transport; the monitor wraps
/// every call in its own timeout, so implementations may block as long as
/// the network does.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, node_id: &NodeId) -> bool;
}

/// In-memory probe for testing and simulation.
///
/// Every node is reachable unless marked otherwise. Clones share state, so
/// a test can keep one handle and give another to the monitor.
#[derive(Clone, Default)]
pub struct MemoryProbe {
    unreachable: Arc<RwLock<HashSet<NodeId>>>,
    delays: Arc<RwLock<HashMap<NodeId, Duration>>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, node_id: &NodeId, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(node_id);
        } else {
            unreachable.insert(node_id.clone());
        }
    }

    /// Cut the given nodes off.
    pub fn partition<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) {
        self.unreachable.write().extend(nodes.into_iter().cloned());
    }

    /// Make every node reachable again.
    pub fn heal(&self) {
        self.unreachable.write().clear();
    }

    /// Delay answers for one node, e.g. to exceed the probe timeout.
    pub fn set_delay(&self, node_id: &NodeId, delay: Duration) {
        self.delays.write().insert(node_id.clone(), delay);
    }

    pub fn clear_delay(&self, node_id: &NodeId) {
        self.delays.write().remove(node_id);
    }

    /// Number of probes answered or started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for MemoryProbe {
    async fn probe(&self, node_id: &NodeId) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.read().get(node_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        !self.unreachable.read().contains(node_id)
    }
}
