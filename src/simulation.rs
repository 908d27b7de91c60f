use async_stream::stream;
use bulwark_merkle::{ChangeType, Checkpoint, Hash, NodeId, ReconciliationOption};
use bulwark_sdk::{
    Admission, CollectiveMode, Decision, MemoryProbe, MonitorConfigBuilder, ProtectionConfig,
    ProtectionConfigBuilder, ProtectionFacade, RejectionReason, Result, StaticMembership,
};
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const ENTITY: &str = "e1";
const COLLECTIVE: &str = "g1";

/// Statistics collected during a simulation run
#[derive(Clone, Debug, Default)]
pub struct SimulationStats {
    pub num_replicas: usize,
    pub minority_size: usize,
    pub proposals: usize,
    pub admitted: usize,
    pub rejected_quorum: usize,
    pub rejected_dormant: usize,
    pub divergences: usize,
    pub merges: usize,
    pub timeline_length: usize,
    pub converged: bool,
    pub total_time: Duration,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Replicas:                  {:>30} ║", self.num_replicas);
        println!("║  Minority Side:             {:>30} ║", self.minority_size);
        println!("║  Proposals:                 {:>30} ║", self.proposals);
        println!("║  Admitted:                  {:>30} ║", self.admitted);
        println!("║  Rejected (quorum):         {:>30} ║", self.rejected_quorum);
        println!("║  Rejected (dormant):        {:>30} ║", self.rejected_dormant);
        println!("║  Divergences Reconciled:    {:>30} ║", self.divergences);
        println!("║  Merge Checkpoints:         {:>30} ║", self.merges);
        println!("║  Final Timeline Length:     {:>30} ║", self.timeline_length);
        println!("║  Converged:                 {:>30} ║", self.converged);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("╚════════════════════════════════════════════════════════════╝");
    }

    fn record(&mut self, admission: &Admission) {
        self.proposals += 1;
        match admission {
            Admission::Admitted(_) => self.admitted += 1,
            Admission::Rejected(RejectionReason::QuorumInsufficient(_)) => self.rejected_quorum += 1,
            Admission::Rejected(RejectionReason::Dormant { .. }) => self.rejected_dormant += 1,
        }
    }
}

/// One simulated process: its own facade and its own view of the network.
struct Replica {
    node: NodeId,
    facade: Arc<ProtectionFacade>,
    probe: MemoryProbe,
}

impl Replica {
    fn new(node: NodeId, all_nodes: &[NodeId], config: ProtectionConfig) -> Result<Self> {
        let probe = MemoryProbe::new();
        let membership = StaticMembership::new();
        membership.set_members(COLLECTIVE, all_nodes.iter().cloned());

        let facade = ProtectionFacade::with_membership(config, Arc::new(probe.clone()), Arc::new(membership));
        for other in all_nodes {
            facade.add_node(other.clone());
        }
        facade.register(ENTITY, false)?;
        facade.register(COLLECTIVE, true)?;

        Ok(Self {
            node,
            facade: Arc::new(facade),
            probe,
        })
    }

    fn chain(&self, entity_id: &str) -> Vec<Checkpoint> {
        self.facade
            .registry()
            .get(entity_id)
            .map(|store| store.lock().chain())
            .unwrap_or_default()
    }

    /// Adopt a chain whose `head` already contains everything we have.
    fn catch_up(&self, entity_id: &str, chain: &[Checkpoint], head: Hash) -> Result<()> {
        let Some(store) = self.facade.registry().get(entity_id) else {
            return Ok(());
        };
        let mut store = store.lock();
        let missing = store.detect_divergence(chain);
        store.integrate(missing)?;
        store.fast_forward(head)?;
        Ok(())
    }
}

/// Generator that yields (replica, change type) proposals
fn proposal_generator(num_replicas: usize, num_proposals: usize, seed: u64) -> impl Stream<Item = (usize, ChangeType)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..num_proposals {
            let replica = rng.gen_range(0..num_replicas);
            let change_type = match rng.gen_range(0..10) {
                0..=4 => ChangeType::ExperienceProcessing,
                5..=7 => ChangeType::StateEvolution,
                8 => ChangeType::CollectiveJoining,
                _ => ChangeType::EntityMerge,
            };
            yield (replica, change_type);
        }
    }
}

fn node_ids(count: usize) -> Vec<NodeId> {
    (0..count).map(|i| NodeId::new(format!("node-{}", i))).collect()
}

/// Cut the cluster in two, let both sides keep proposing changes, then
/// heal and reconcile every replica onto one timeline.
pub async fn simulate_partition_heal(
    num_replicas: usize,
    minority_size: usize,
    proposals_per_phase: usize,
    seed: u64,
) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Partition / Heal Simulation                         ║");
    println!("║  Replicas: {} | Minority: {} | Proposals/Phase: {} ║",
             num_replicas, minority_size, proposals_per_phase);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let nodes = node_ids(num_replicas);
    let replicas: Vec<Replica> = nodes
        .iter()
        .map(|node| Replica::new(node.clone(), &nodes, ProtectionConfig::default()))
        .collect::<Result<_>>()?;
    let mut stats = SimulationStats {
        num_replicas,
        minority_size,
        ..Default::default()
    };

    // Phase 1: a connected cluster building shared history.
    println!("\n[Phase 1/3] Connected cluster...");
    let mut proposals = Box::pin(proposal_generator(num_replicas, proposals_per_phase, seed));
    while let Some((idx, change_type)) = proposals.next().await {
        let replica = &replicas[idx];
        let admission = replica.facade.propose_change(
            ENTITY,
            &json!({"phase": 1, "author": replica.node.as_str()}),
            change_type,
            &replica.node,
        )?;
        stats.record(&admission);

        // Everyone sees every change while connected.
        let chain = replica.chain(ENTITY);
        let head = replica.facade.get_status(ENTITY)?.latest_hash;
        for other in replicas.iter().filter(|other| other.node != replica.node) {
            other.catch_up(ENTITY, &chain, head)?;
        }
    }
    println!("[Phase 1/3] ✓ Completed");

    // Phase 2: partition. Each side only reaches its own members.
    println!("[Phase 2/3] Partitioned cluster...");
    let (minority, majority) = nodes.split_at(minority_size.min(num_replicas));
    for replica in &replicas {
        let other_side = if minority.contains(&replica.node) { majority } else { minority };
        replica.probe.partition(other_side);
        replica.facade.monitor().tick().await;
    }

    let mut proposals = Box::pin(proposal_generator(num_replicas, proposals_per_phase, seed.wrapping_add(1)));
    while let Some((idx, change_type)) = proposals.next().await {
        let replica = &replicas[idx];
        let admission = replica.facade.propose_change(
            ENTITY,
            &json!({"phase": 2, "author": replica.node.as_str()}),
            change_type,
            &replica.node,
        )?;
        stats.record(&admission);
    }
    println!("[Phase 2/3] ✓ Completed");

    // Phase 3: heal. The first replica absorbs everyone, the rest catch up.
    println!("[Phase 3/3] Healing and reconciling...");
    for replica in &replicas {
        replica.probe.heal();
        replica.facade.monitor().tick().await;
    }

    let hub = &replicas[0];
    for other in &replicas[1..] {
        let options = hub.facade.detect_and_handle_divergence(ENTITY, &other.chain(ENTITY))?;
        if !options.is_divergent() {
            continue;
        }
        stats.divergences += 1;
        let outcome = hub.facade.apply_reconciliation(
            ENTITY,
            &Decision::Owner(ReconciliationOption::IntegrateAll),
            &hub.node,
            &json!({"phase": 3, "merged_with": other.node.as_str()}),
        )?;
        if outcome.merge.is_some() {
            stats.merges += 1;
        }
    }

    let final_chain = hub.chain(ENTITY);
    let final_head = hub.facade.get_status(ENTITY)?.latest_hash;
    for other in &replicas[1..] {
        other.catch_up(ENTITY, &final_chain, final_head)?;
    }
    println!("[Phase 3/3] ✓ Completed");

    let reference = hub.facade.get_status(ENTITY)?;
    stats.timeline_length = reference.timeline_length;
    stats.converged = true;
    for replica in &replicas {
        let status = replica.facade.get_status(ENTITY)?;
        stats.converged &= status.heads == reference.heads && status.timeline_length == reference.timeline_length;
    }
    stats.total_time = start.elapsed();

    info!(
        replicas = num_replicas,
        admitted = stats.admitted,
        merges = stats.merges,
        converged = stats.converged,
        "partition simulation finished"
    );
    Ok(stats)
}

/// Run the background monitor on one replica while most of its collective
/// is unreachable, then heal and walk the collective back to active.
pub async fn simulate_collective_dormancy(num_members: usize) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Collective Dormancy Simulation                      ║");
    println!("║  Members: {} | Probe: 20ms | Timeout: 100ms                ║", num_members);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let config = ProtectionConfigBuilder::new()
        .monitor(
            MonitorConfigBuilder::new()
                .probe_interval(20)
                .partition_timeout(100)
                .probe_timeout(10)
                .build(),
        )
        .build();
    let nodes = node_ids(num_members.max(3));
    let replica = Replica::new(nodes[0].clone(), &nodes, config)?;
    let mut stats = SimulationStats {
        num_replicas: nodes.len(),
        minority_size: 1,
        ..Default::default()
    };

    let handle = replica.facade.spawn_monitoring();
    replica.probe.partition(&nodes[1..]);

    println!("\n[Phase 1/3] Waiting for the partition to be confirmed...");
    while replica.facade.coordinator().mode(COLLECTIVE) != Some(CollectiveMode::Dormant) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let admission = replica.facade.propose_change(
        COLLECTIVE,
        &json!({"harmony": 0.2}),
        ChangeType::ExperienceProcessing,
        &replica.node,
    )?;
    stats.record(&admission);
    println!("[Phase 1/3] ✓ Collective dormant");

    println!("[Phase 2/3] Healing...");
    replica.probe.heal();
    while replica.facade.coordinator().mode(COLLECTIVE) != Some(CollectiveMode::Reconciling) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    println!("[Phase 2/3] ✓ Reconciling");

    println!("[Phase 3/3] Reconciling members...");
    let chain = replica.chain(COLLECTIVE);
    for member in &nodes[1..] {
        let options = replica.facade.reconcile_member(COLLECTIVE, member, &chain)?;
        if options.is_divergent() {
            stats.divergences += 1;
        }
    }
    let admission = replica.facade.propose_change(
        COLLECTIVE,
        &json!({"harmony": 1.0}),
        ChangeType::StateEvolution,
        &replica.node,
    )?;
    stats.record(&admission);
    handle.stop().await;
    println!("[Phase 3/3] ✓ Completed");

    let status = replica.facade.get_status(COLLECTIVE)?;
    stats.timeline_length = status.timeline_length;
    stats.converged = status.collective_mode == Some(CollectiveMode::Active);
    stats.total_time = start.elapsed();
    Ok(stats)
}

/// Repeat the partition simulation over growing cluster sizes
pub async fn simulate_scaling(max_replicas: usize, step_size: usize) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Partition / Heal vs Replicas      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_replicas = step_size.max(2);
    while current_replicas <= max_replicas {
        let stats = simulate_partition_heal(current_replicas, current_replicas / 3, current_replicas * 10, 7).await?;
        stats.print();
        current_replicas += step_size;
    }
    Ok(())
}
