//! Partition detection by periodic probing.
//!
//! The monitor keeps the set of known nodes and which of them answered the
//! last probe round. When fewer than half of them are reachable it suspects
//! a partition; the partition is confirmed only if the minority persists
//! until the suspicion deadline, and heals as soon as a majority answers.

use crate::config::MonitorConfig;
use crate::probe::Probe;
use bulwark_merkle::NodeId;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Lifecycle of a detected partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Suspected,
    Confirmed,
    Healed,
}

/// A detected partition as seen from this node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub partition_id: String,
    pub status: PartitionStatus,
    pub detected_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub healed_at: Option<DateTime<Utc>>,
    pub reachable: BTreeSet<NodeId>,
    pub unreachable: BTreeSet<NodeId>,
    /// Set once confirmed; this side should treat itself as cut off.
    pub isolation_mode: bool,
}

impl PartitionRecord {
    pub fn reachable_fraction(&self) -> f64 {
        let total = self.reachable.len() + self.unreachable.len();
        if total == 0 {
            0.0
        } else {
            self.reachable.len() as f64 / total as f64
        }
    }
}

/// Events emitted by the partition monitor.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionEvent {
    Suspected(PartitionRecord),
    Confirmed(PartitionRecord),
    Healed(PartitionRecord),
}

impl PartitionEvent {
    pub fn record(&self) -> &PartitionRecord {
        match self {
            PartitionEvent::Suspected(record)
            | PartitionEvent::Confirmed(record)
            | PartitionEvent::Healed(record) => record,
        }
    }
}

/// Known and reachable nodes captured under one lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub known: BTreeSet<NodeId>,
    pub reachable: BTreeSet<NodeId>,
}

impl NodeSnapshot {
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.len()
    }

    pub fn unreachable(&self) -> BTreeSet<NodeId> {
        self.known.difference(&self.reachable).cloned().collect()
    }

    pub fn reachable_fraction(&self) -> f64 {
        if self.known.is_empty() {
            0.0
        } else {
            self.reachable.len() as f64 / self.known.len() as f64
        }
    }
}

struct ActivePartition {
    record: PartitionRecord,
    deadline: Instant,
}

#[derive(Default)]
struct MonitorState {
    known: BTreeSet<NodeId>,
    /// Nodes that failed their last probe. Nodes never probed are absent.
    unreachable: BTreeSet<NodeId>,
    active: Option<ActivePartition>,
}

impl MonitorState {
    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            known: self.known.clone(),
            reachable: self.known.difference(&self.unreachable).cloned().collect(),
        }
    }
}

/// Periodically probes known nodes and tracks partition state.
pub struct PartitionMonitor {
    config: MonitorConfig,
    probe: Arc<dyn Probe>,
    state: RwLock<MonitorState>,
    event_tx: broadcast::Sender<PartitionEvent>,
}

impl PartitionMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn Probe>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            probe,
            state: RwLock::new(MonitorState::default()),
            event_tx,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start tracking a node. It counts as reachable until probed.
    pub fn add_node(&self, node_id: NodeId) -> bool {
        let added = self.state.write().known.insert(node_id.clone());
        if added {
            debug!(node_id = %node_id, "node added");
        }
        added
    }

    pub fn remove_node(&self, node_id: &NodeId) -> bool {
        let mut state = self.state.write();
        state.unreachable.remove(node_id);
        state.known.remove(node_id)
    }

    pub fn known_nodes(&self) -> Vec<NodeId> {
        self.state.read().known.iter().cloned().collect()
    }

    /// Known and reachable nodes as one consistent view.
    pub fn snapshot(&self) -> NodeSnapshot {
        self.state.read().snapshot()
    }

    /// The partition currently suspected or confirmed, if any.
    pub fn active_partition(&self) -> Option<PartitionRecord> {
        self.state
            .read()
            .active
            .as_ref()
            .map(|active| active.record.clone())
    }

    pub fn is_isolated(&self) -> bool {
        self.active_partition()
            .map(|record| record.isolation_mode)
            .unwrap_or(false)
    }

    /// Subscribe to partition events.
    pub fn subscribe(&self) -> broadcast::Receiver<PartitionEvent> {
        self.event_tx.subscribe()
    }

    /// Probe every known node concurrently. Returns the nodes that did not
    /// answer within the probe timeout.
    async fn probe_all(&self) -> BTreeSet<NodeId> {
        let nodes = self.known_nodes();
        let timeout = self.config.probe_timeout();

        let results = join_all(nodes.into_iter().map(|node_id| async move {
            let reachable = match tokio::time::timeout(timeout, self.probe.probe(&node_id)).await {
                Ok(reachable) => reachable,
                Err(_) => {
                    debug!(node_id = %node_id, "probe timed out");
                    false
                }
            };
            (node_id, reachable)
        }))
        .await;

        results
            .into_iter()
            .filter(|(_, reachable)| !reachable)
            .map(|(node_id, _)| node_id)
            .collect()
    }

    /// Run one probe round and advance the partition state machine.
    pub async fn tick(&self) -> Option<PartitionEvent> {
        let unreachable = self.probe_all().await;

        let event = {
            let mut state = self.state.write();
            // Nodes removed while probing no longer count.
            let still_known: BTreeSet<NodeId> = unreachable
                .into_iter()
                .filter(|node_id| state.known.contains(node_id))
                .collect();
            state.unreachable = still_known;
            self.step(&mut state, Instant::now())
        };

        if let Some(event) = &event {
            let record = event.record();
            match event {
                PartitionEvent::Suspected(_) => warn!(
                    partition_id = %record.partition_id,
                    reachable = record.reachable.len(),
                    unreachable = record.unreachable.len(),
                    "partition suspected"
                ),
                PartitionEvent::Confirmed(_) => warn!(
                    partition_id = %record.partition_id,
                    reachable = record.reachable.len(),
                    unreachable = record.unreachable.len(),
                    "partition confirmed, entering isolation mode"
                ),
                PartitionEvent::Healed(_) => info!(
                    partition_id = %record.partition_id,
                    reachable = record.reachable.len(),
                    "partition healed"
                ),
            }
            let _ = self.event_tx.send(event.clone());
        }

        event
    }

    fn step(&self, state: &mut MonitorState, now: Instant) -> Option<PartitionEvent> {
        let snapshot = state.snapshot();
        let minority =
            !snapshot.known.is_empty() && snapshot.reachable_fraction() < self.config.minority_threshold;

        let Some(mut active) = state.active.take() else {
            if !minority {
                return None;
            }
            let record = PartitionRecord {
                partition_id: Ulid::new().to_string(),
                status: PartitionStatus::Suspected,
                detected_at: Utc::now(),
                confirmed_at: None,
                healed_at: None,
                unreachable: snapshot.unreachable(),
                reachable: snapshot.reachable,
                isolation_mode: false,
            };
            state.active = Some(ActivePartition {
                record: record.clone(),
                deadline: now + self.config.partition_timeout(),
            });
            return Some(PartitionEvent::Suspected(record));
        };

        active.record.unreachable = snapshot.unreachable();
        active.record.reachable = snapshot.reachable;

        if !minority {
            active.record.status = PartitionStatus::Healed;
            active.record.healed_at = Some(Utc::now());
            return Some(PartitionEvent::Healed(active.record));
        }

        let event = if active.record.status == PartitionStatus::Suspected && now >= active.deadline {
            active.record.status = PartitionStatus::Confirmed;
            active.record.confirmed_at = Some(Utc::now());
            active.record.isolation_mode = true;
            Some(PartitionEvent::Confirmed(active.record.clone()))
        } else {
            None
        };

        state.active = Some(active);
        event
    }

    /// Time until the next probe round: the probe interval, or sooner if a
    /// suspicion deadline falls due first.
    fn next_wait(&self, now: Instant) -> Duration {
        let interval = self.config.probe_interval();
        let state = self.state.read();
        match &state.active {
            Some(active) if active.record.status == PartitionStatus::Suspected => {
                interval.min(active.deadline.saturating_duration_since(now))
            }
            _ => interval,
        }
    }

    /// Probe until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_with(shutdown, |_| {}).await
    }

    /// Like [`run`](Self::run), handing every event to `on_event` as well
    /// as broadcasting it. Partition state survives the loop stopping.
    pub async fn run_with<F>(&self, mut shutdown: watch::Receiver<bool>, mut on_event: F)
    where
        F: FnMut(PartitionEvent),
    {
        info!(
            interval_ms = self.config.probe_interval_ms,
            timeout_ms = self.config.partition_timeout_ms,
            "partition monitor started"
        );

        loop {
            let event = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                event = self.tick() => event,
            };
            if let Some(event) = event {
                on_event(event);
            }

            let wait = self.next_wait(Instant::now());
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("partition monitor stopped");
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
