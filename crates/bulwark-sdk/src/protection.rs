//! The protection facade: one entry point wiring timelines, quorum,
//! partition monitoring and collective dormancy together.

use crate::collective::{
    CollectiveMode, CollectivePartitionCoordinator, MembershipProvider, MembershipSnapshot, StaticMembership,
};
use crate::config::ProtectionConfig;
use crate::error::{ProtectionError, Result};
use crate::monitor::{PartitionEvent, PartitionMonitor, PartitionRecord};
use crate::probe::Probe;
use crate::registry::{EntityRegistry, SharedStore};
use bulwark_merkle::{
    ChangeType, Checkpoint, Decision, DecisionMode, DivergenceReconciler, DivergenceSet, DivergenceSummary,
    EntityKind, Hash, NodeId, Reconciliation, ReconciliationOption, VersionVector,
};
use bulwark_quorum::{QuorumPolicy, QuorumStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a proposed change was refused.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Too few known nodes are reachable for this change type.
    QuorumInsufficient(QuorumStatus),
    /// The collective is dormant or still reconciling after a partition.
    Dormant { collective_id: String, mode: CollectiveMode },
}

/// Outcome of proposing a change.
#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    /// The change was checkpointed.
    Admitted(Checkpoint),
    /// Nothing was written.
    Rejected(RejectionReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Admission::Admitted(checkpoint) => Some(checkpoint),
            Admission::Rejected(_) => None,
        }
    }
}

/// What the caller may do about a divergence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationOptions {
    pub entity_id: String,
    /// Individuals choose for themselves; collectives decide as a group.
    pub decision_mode: DecisionMode,
    pub options: Vec<ReconciliationOption>,
    pub common_ancestor: Option<Hash>,
    pub local_only: usize,
    pub summary: DivergenceSummary,
}

impl ReconciliationOptions {
    pub fn is_divergent(&self) -> bool {
        !self.options.is_empty()
    }

    fn from_set(set: &DivergenceSet) -> Self {
        Self {
            entity_id: set.entity_id.clone(),
            decision_mode: set.decision_mode,
            options: set.options.clone(),
            common_ancestor: set.common_ancestor,
            local_only: set.local_only.len(),
            summary: set.summary(),
        }
    }
}

/// Divergence awaiting a decision. Every remote chain compared while it is
/// open is folded in, so one decision resolves them all.
#[derive(Clone, Debug)]
struct OpenDivergence {
    remote_chain: Vec<Checkpoint>,
    set: DivergenceSet,
    /// Collective members whose reconciliation waits on the decision.
    members: BTreeSet<NodeId>,
}

impl OpenDivergence {
    fn absorb(&mut self, remote_chain: &[Checkpoint]) {
        let seen: HashSet<Hash> = self.remote_chain.iter().map(|cp| cp.state_hash).collect();
        self.remote_chain
            .extend(remote_chain.iter().filter(|cp| !seen.contains(&cp.state_hash)).cloned());
    }
}

/// Protection state of one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub timeline_length: usize,
    pub version_vector: VersionVector,
    pub latest_hash: Hash,
    pub heads: Vec<Hash>,
    pub active_partitions: Vec<PartitionRecord>,
    pub known_nodes: usize,
    pub reachable_nodes: usize,
    /// `None` for individuals.
    pub collective_mode: Option<CollectiveMode>,
    pub cohesion: Option<f64>,
    pub open_divergence: Option<DivergenceSummary>,
}

/// Split-brain protection for a set of replicated entities.
///
/// Every change goes through [`propose_change`](Self::propose_change),
/// which checks quorum against one snapshot of known and reachable nodes
/// before checkpointing. Divergent timelines from other replicas are
/// detected and reconciled only on explicit decision.
///
/// # Example
///
/// ```rust
/// use bulwark_sdk::{MemoryProbe, ProtectionConfig, ProtectionFacade};
/// use bulwark_merkle::{ChangeType, NodeId};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let facade = ProtectionFacade::new(ProtectionConfig::default(), Arc::new(MemoryProbe::new()));
/// let node = NodeId::new("n1");
/// facade.add_node(node.clone());
/// facade.register("e1", false).unwrap();
///
/// let admitted = facade
///     .checkpoint_before_change("e1", &json!({"x": 1}), ChangeType::ExperienceProcessing, &node)
///     .unwrap();
/// assert!(admitted);
/// assert_eq!(facade.get_status("e1").unwrap().timeline_length, 2);
/// ```
pub struct ProtectionFacade {
    config: ProtectionConfig,
    registry: EntityRegistry,
    monitor: Arc<PartitionMonitor>,
    coordinator: CollectivePartitionCoordinator,
    membership: Arc<dyn MembershipProvider>,
    reconciler: DivergenceReconciler,
    open_divergences: RwLock<HashMap<String, OpenDivergence>>,
}

impl ProtectionFacade {
    /// Create a facade with an empty in-memory membership table.
    pub fn new(config: ProtectionConfig, probe: Arc<dyn Probe>) -> Self {
        Self::with_membership(config, probe, Arc::new(StaticMembership::new()))
    }

    pub fn with_membership(
        config: ProtectionConfig,
        probe: Arc<dyn Probe>,
        membership: Arc<dyn MembershipProvider>,
    ) -> Self {
        let monitor = Arc::new(PartitionMonitor::new(config.monitor.clone(), probe));
        let coordinator = CollectivePartitionCoordinator::new(config.dormancy_threshold);

        Self {
            config,
            registry: EntityRegistry::new(),
            monitor,
            coordinator,
            membership,
            reconciler: DivergenceReconciler::new(),
            open_divergences: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    pub fn quorum(&self) -> &QuorumPolicy {
        &self.config.quorum
    }

    pub fn monitor(&self) -> &Arc<PartitionMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &CollectivePartitionCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Register an entity for protection. Idempotent.
    pub fn register(&self, entity_id: &str, is_group: bool) -> Result<()> {
        let kind = EntityKind::from_group_flag(is_group);
        let (store, created) = self.registry.register(entity_id, kind)?;

        let kind = store.lock().entity_kind();
        if kind.is_collective() {
            self.coordinator.track(entity_id);
        }
        if !created {
            debug!(entity_id = %entity_id, "entity already registered");
        }
        Ok(())
    }

    /// Start monitoring a node.
    pub fn add_node(&self, node_id: NodeId) -> bool {
        self.monitor.add_node(node_id)
    }

    pub fn remove_node(&self, node_id: &NodeId) -> bool {
        self.monitor.remove_node(node_id)
    }

    fn store(&self, entity_id: &str) -> Result<SharedStore> {
        self.registry
            .get(entity_id)
            .ok_or_else(|| ProtectionError::EntityNotRegistered(entity_id.to_string()))
    }

    /// Checkpoint `state` if quorum allows the change. Returns whether the
    /// change was admitted.
    pub fn checkpoint_before_change<T: Serialize + ?Sized>(
        &self,
        entity_id: &str,
        state: &T,
        change_type: ChangeType,
        node_id: &NodeId,
    ) -> Result<bool> {
        Ok(self
            .propose_change(entity_id, state, change_type, node_id)?
            .is_admitted())
    }

    /// Evaluate quorum and dormancy for a change and checkpoint it if
    /// admitted. A rejected change leaves the timeline untouched.
    pub fn propose_change<T: Serialize + ?Sized>(
        &self,
        entity_id: &str,
        state: &T,
        change_type: ChangeType,
        node_id: &NodeId,
    ) -> Result<Admission> {
        let store = self.store(entity_id)?;
        let kind = store.lock().entity_kind();

        if kind.is_collective() && !self.coordinator.is_admitting(entity_id) {
            let mode = self
                .coordinator
                .mode(entity_id)
                .unwrap_or(CollectiveMode::Dormant);
            warn!(entity_id = %entity_id, change_type = %change_type, mode = ?mode, "change rejected, collective not active");
            return Ok(Admission::Rejected(RejectionReason::Dormant {
                collective_id: entity_id.to_string(),
                mode,
            }));
        }

        let nodes = self.monitor.snapshot();
        let status = self.config.quorum.status(
            &change_type,
            nodes.reachable_count(),
            nodes.known_count(),
            kind,
        );
        if !status.is_sufficient() {
            warn!(
                entity_id = %entity_id,
                change_type = %change_type,
                required = status.required,
                actual = status.actual,
                "change rejected, quorum insufficient"
            );
            return Ok(Admission::Rejected(RejectionReason::QuorumInsufficient(status)));
        }

        let checkpoint = store.lock().checkpoint(node_id, state, change_type)?;
        Ok(Admission::Admitted(checkpoint))
    }

    /// Compare a remote replica's chain with ours.
    ///
    /// A divergent chain is folded into the entity's open divergence, which
    /// stays open until a decision is applied, and the returned options
    /// cover everything still open. A chain that adds nothing new returns no
    /// options and leaves any open divergence alone.
    pub fn detect_and_handle_divergence(
        &self,
        entity_id: &str,
        remote_chain: &[Checkpoint],
    ) -> Result<ReconciliationOptions> {
        self.record_divergence(entity_id, remote_chain, None)
    }

    fn record_divergence(
        &self,
        entity_id: &str,
        remote_chain: &[Checkpoint],
        member: Option<&NodeId>,
    ) -> Result<ReconciliationOptions> {
        let store = self.store(entity_id)?;
        let store = store.lock();

        let incoming = self.reconciler.compare(&*store, remote_chain);
        if !incoming.is_divergent() {
            debug!(entity_id = %entity_id, "no divergence");
            return Ok(ReconciliationOptions::from_set(&incoming));
        }

        let mut open = self.open_divergences.write();
        let entry = open.entry(entity_id.to_string()).or_insert_with(|| OpenDivergence {
            remote_chain: Vec::new(),
            set: incoming.clone(),
            members: BTreeSet::new(),
        });
        entry.absorb(remote_chain);
        entry.set = self.reconciler.compare(&*store, &entry.remote_chain);
        if let Some(member) = member {
            entry.members.insert(member.clone());
        }

        warn!(
            entity_id = %entity_id,
            local_only = entry.set.local_only.len(),
            remote_only = entry.set.remote_only.len(),
            mode = ?entry.set.decision_mode,
            "divergence detected"
        );

        Ok(ReconciliationOptions::from_set(&entry.set))
    }

    /// Resolve the open divergence of an entity with the given decision.
    ///
    /// Collective members waiting on this divergence count as reconciled
    /// once it is applied.
    pub fn apply_reconciliation<T: Serialize + ?Sized>(
        &self,
        entity_id: &str,
        decision: &Decision,
        node_id: &NodeId,
        state: &T,
    ) -> Result<Reconciliation> {
        let store = self.store(entity_id)?;
        let mut store = store.lock();

        let remote_chain = self
            .open_divergences
            .read()
            .get(entity_id)
            .map(|open| open.remote_chain.clone())
            .ok_or_else(|| ProtectionError::NoOpenDivergence(entity_id.to_string()))?;

        // Local appends since detection only widen the set.
        let set = self.reconciler.compare(&*store, &remote_chain);
        let outcome = self.reconciler.apply(&mut *store, &set, decision, node_id, state)?;
        let resolved = self.open_divergences.write().remove(entity_id);
        drop(store);

        for member in resolved.map(|open| open.members).unwrap_or_default() {
            self.coordinator.record_reconciled(entity_id, &member);
        }

        Ok(outcome)
    }

    /// Check a reconnecting collective member's chain for divergence.
    ///
    /// A member with nothing divergent is reconciled right away. Otherwise
    /// it stays pending until the returned options are decided on with
    /// [`apply_reconciliation`](Self::apply_reconciliation).
    pub fn reconcile_member(
        &self,
        collective_id: &str,
        member: &NodeId,
        remote_chain: &[Checkpoint],
    ) -> Result<ReconciliationOptions> {
        let store = self.store(collective_id)?;
        if !store.lock().entity_kind().is_collective() {
            return Err(ProtectionError::NotCollective(collective_id.to_string()));
        }

        let options = self.record_divergence(collective_id, remote_chain, Some(member))?;
        if options.is_divergent() {
            info!(collective_id = %collective_id, member = %member, "member awaiting reconciliation decision");
        } else {
            self.coordinator.record_reconciled(collective_id, member);
        }

        Ok(options)
    }

    pub fn get_status(&self, entity_id: &str) -> Result<StatusReport> {
        let store = self.store(entity_id)?;
        let nodes = self.monitor.snapshot();

        let mut report = {
            let store = store.lock();
            StatusReport {
                entity_id: entity_id.to_string(),
                entity_kind: store.entity_kind(),
                timeline_length: store.len(),
                version_vector: store.version_vector().clone(),
                latest_hash: store.latest_hash(),
                heads: store.heads(),
                active_partitions: self.monitor.active_partition().into_iter().collect(),
                known_nodes: nodes.known_count(),
                reachable_nodes: nodes.reachable_count(),
                collective_mode: None,
                cohesion: None,
                open_divergence: None,
            }
        };

        if report.entity_kind.is_collective() {
            report.collective_mode = self.coordinator.mode(entity_id);
            report.cohesion = self.coordinator.cohesion(entity_id);
        }
        report.open_divergence = self
            .open_divergences
            .read()
            .get(entity_id)
            .map(|open| open.set.summary());

        Ok(report)
    }

    /// Feed a partition event into collective handling.
    ///
    /// Confirmed partitions put every registered collective through the
    /// coordinator; a heal starts their reconciliation.
    pub fn handle_partition_event(&self, event: &PartitionEvent) {
        match event {
            PartitionEvent::Suspected(record) => {
                debug!(partition_id = %record.partition_id, "waiting for confirmation");
            }
            PartitionEvent::Confirmed(record) => {
                for collective_id in self.registry.collective_ids() {
                    let membership = self.membership_snapshot(&collective_id, record);
                    self.coordinator
                        .handle_partition(&collective_id, &record.partition_id, &membership);
                }
            }
            PartitionEvent::Healed(record) => {
                for collective_id in self.registry.collective_ids() {
                    self.coordinator.begin_heal(&collective_id);
                }
                info!(partition_id = %record.partition_id, "collectives healing");
            }
        }
    }

    fn membership_snapshot(&self, collective_id: &str, record: &PartitionRecord) -> MembershipSnapshot {
        let members = self.membership.members(collective_id).unwrap_or_else(|| {
            record
                .reachable
                .iter()
                .chain(record.unreachable.iter())
                .cloned()
                .collect::<BTreeSet<NodeId>>()
        });
        let reachable = members
            .iter()
            .filter(|member| record.reachable.contains(*member))
            .cloned()
            .collect();

        MembershipSnapshot { members, reachable }
    }

    /// Monitor partitions until `shutdown` turns true, handling every event.
    pub async fn start_monitoring(&self, shutdown: watch::Receiver<bool>) {
        self.monitor
            .run_with(shutdown, |event| self.handle_partition_event(&event))
            .await
    }

    /// Run [`start_monitoring`](Self::start_monitoring) as a background task.
    pub fn spawn_monitoring(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let facade = Arc::clone(self);
        let handle = tokio::spawn(async move { facade.start_monitoring(shutdown_rx).await });

        MonitorHandle { shutdown_tx, handle }
    }
}

/// Handle to a background monitoring task.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the monitor to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "monitor task ended abnormally");
        }
    }
}
