//! Partition handling for collective entities.
//!
//! A collective that loses contact with most of its members goes dormant
//! and stops admitting quorum-gated changes. Once the partition heals,
//! every member that was cut off has to be reconciled before the
//! collective becomes active again.

use bulwark_merkle::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Operating mode of a collective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveMode {
    Active,
    Dormant,
    Reconciling,
}

/// Members of a collective and which of them are reachable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub members: BTreeSet<NodeId>,
    pub reachable: BTreeSet<NodeId>,
}

impl MembershipSnapshot {
    /// Reachable members over all members. No members counts as zero.
    pub fn reachable_fraction(&self) -> f64 {
        if self.members.is_empty() {
            return 0.0;
        }
        let reachable = self.members.intersection(&self.reachable).count();
        reachable as f64 / self.members.len() as f64
    }

    pub fn unreachable(&self) -> BTreeSet<NodeId> {
        self.members.difference(&self.reachable).cloned().collect()
    }
}

/// Supplies the member nodes of a collective.
pub trait MembershipProvider: Send + Sync + 'static {
    /// `None` when the provider knows nothing about the collective.
    fn members(&self, collective_id: &str) -> Option<BTreeSet<NodeId>>;
}

/// In-memory membership table.
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: RwLock<HashMap<String, BTreeSet<NodeId>>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members(&self, collective_id: impl Into<String>, members: impl IntoIterator<Item = NodeId>) {
        self.members
            .write()
            .insert(collective_id.into(), members.into_iter().collect());
    }

    pub fn add_member(&self, collective_id: &str, member: NodeId) {
        self.members
            .write()
            .entry(collective_id.to_string())
            .or_default()
            .insert(member);
    }

    pub fn remove_member(&self, collective_id: &str, member: &NodeId) -> bool {
        self.members
            .write()
            .get_mut(collective_id)
            .map(|members| members.remove(member))
            .unwrap_or(false)
    }
}

impl MembershipProvider for StaticMembership {
    fn members(&self, collective_id: &str) -> Option<BTreeSet<NodeId>> {
        self.members.read().get(collective_id).cloned()
    }
}

/// Partition-related state of one collective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectiveStatus {
    pub collective_id: String,
    pub mode: CollectiveMode,
    /// Fraction of members in contact, 1.0 outside partitions.
    pub cohesion: f64,
    pub partition_id: Option<String>,
    /// Set by a partition; cleared once every cut-off member is reconciled.
    pub potentially_divergent: bool,
    /// Members cut off by the last partition.
    pub unreachable: BTreeSet<NodeId>,
    /// Members still to be run through the reconciler after a heal.
    pub pending_reconciliation: BTreeSet<NodeId>,
    pub updated_at: DateTime<Utc>,
}

impl CollectiveStatus {
    fn new(collective_id: &str) -> Self {
        Self {
            collective_id: collective_id.to_string(),
            mode: CollectiveMode::Active,
            cohesion: 1.0,
            partition_id: None,
            potentially_divergent: false,
            unreachable: BTreeSet::new(),
            pending_reconciliation: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Tracks dormancy and reconciliation of collectives across partitions.
pub struct CollectivePartitionCoordinator {
    dormancy_threshold: f64,
    collectives: RwLock<HashMap<String, CollectiveStatus>>,
}

impl CollectivePartitionCoordinator {
    pub fn new(dormancy_threshold: f64) -> Self {
        Self {
            dormancy_threshold,
            collectives: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a collective in active mode. No-op if already tracked.
    pub fn track(&self, collective_id: &str) {
        self.collectives
            .write()
            .entry(collective_id.to_string())
            .or_insert_with(|| CollectiveStatus::new(collective_id));
    }

    /// Apply a partition to one collective.
    pub fn handle_partition(
        &self,
        collective_id: &str,
        partition_id: &str,
        membership: &MembershipSnapshot,
    ) -> CollectiveMode {
        let fraction = membership.reachable_fraction();
        let mut collectives = self.collectives.write();
        let status = collectives
            .entry(collective_id.to_string())
            .or_insert_with(|| CollectiveStatus::new(collective_id));

        status.mode = if fraction < self.dormancy_threshold {
            CollectiveMode::Dormant
        } else {
            CollectiveMode::Active
        };
        status.cohesion = fraction;
        status.partition_id = Some(partition_id.to_string());
        status.potentially_divergent = true;
        status.unreachable = membership.unreachable();
        status.pending_reconciliation.clear();
        status.updated_at = Utc::now();

        match status.mode {
            CollectiveMode::Dormant => warn!(
                collective_id = %collective_id,
                partition_id = %partition_id,
                reachable_fraction = fraction,
                "collective dormant"
            ),
            _ => info!(
                collective_id = %collective_id,
                partition_id = %partition_id,
                cohesion = fraction,
                "collective partitioned, remaining active"
            ),
        }

        status.mode
    }

    /// The partition is over: dormant collectives start reconciling the
    /// members they lost, active ones get their cohesion back.
    pub fn begin_heal(&self, collective_id: &str) -> Option<CollectiveMode> {
        let mut collectives = self.collectives.write();
        let status = collectives.get_mut(collective_id)?;

        status.cohesion = 1.0;
        status.partition_id = None;
        status.pending_reconciliation = std::mem::take(&mut status.unreachable);
        status.updated_at = Utc::now();

        if status.mode == CollectiveMode::Dormant {
            status.mode = if status.pending_reconciliation.is_empty() {
                CollectiveMode::Active
            } else {
                CollectiveMode::Reconciling
            };
        }
        if status.pending_reconciliation.is_empty() {
            status.potentially_divergent = false;
        }

        info!(
            collective_id = %collective_id,
            mode = ?status.mode,
            pending = status.pending_reconciliation.len(),
            "collective healing"
        );
        Some(status.mode)
    }

    /// A reconnecting member has been run through the reconciler.
    pub fn record_reconciled(&self, collective_id: &str, member: &NodeId) -> Option<CollectiveMode> {
        let mut collectives = self.collectives.write();
        let status = collectives.get_mut(collective_id)?;

        if status.pending_reconciliation.remove(member) {
            debug!(collective_id = %collective_id, member = %member, "member reconciled");
        }

        if status.pending_reconciliation.is_empty() && status.partition_id.is_none() {
            status.potentially_divergent = false;
            if status.mode == CollectiveMode::Reconciling {
                status.mode = CollectiveMode::Active;
                info!(collective_id = %collective_id, "collective reactivated");
            }
        }
        status.updated_at = Utc::now();

        Some(status.mode)
    }

    /// Whether quorum-gated changes may be proposed. Untracked collectives
    /// are admitting.
    pub fn is_admitting(&self, collective_id: &str) -> bool {
        self.collectives
            .read()
            .get(collective_id)
            .map(|status| status.mode == CollectiveMode::Active)
            .unwrap_or(true)
    }

    pub fn cohesion(&self, collective_id: &str) -> Option<f64> {
        self.collectives
            .read()
            .get(collective_id)
            .map(|status| status.cohesion)
    }

    pub fn mode(&self, collective_id: &str) -> Option<CollectiveMode> {
        self.collectives
            .read()
            .get(collective_id)
            .map(|status| status.mode)
    }

    pub fn status(&self, collective_id: &str) -> Option<CollectiveStatus> {
        self.collectives.read().get(collective_id).cloned()
    }

    pub fn dormant_collectives(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .collectives
            .read()
            .values()
            .filter(|status| status.mode == CollectiveMode::Dormant)
            .map(|status| status.collective_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
