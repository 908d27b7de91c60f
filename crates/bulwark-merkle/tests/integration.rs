//! Integration tests for entity timelines.
//!
//! Tests cover:
//! - Concurrent appends from two replicas producing a fork
//! - Partition/heal with reconciliation into a merge checkpoint
//! - Reopening a timeline without creating a second genesis
//! - Repeated partitions and reconciliations converging

use bulwark_merkle::{
    ChangeType, CheckpointStore, Decision, DivergenceReconciler, EntityKind, Lineage, NodeId,
    ReconciliationOption, VersionedStateStore,
};
use serde_json::json;
use std::collections::BTreeSet;

fn n(id: &str) -> NodeId {
    NodeId::new(id)
}

/// Two nodes append to `e1` concurrently, both on top of the genesis.
#[test]
fn test_concurrent_appends_fork_from_genesis() {
    let mut replica_1 = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
    let mut replica_2 = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
    let h0 = replica_1.genesis_hash();

    let a = replica_1
        .checkpoint(&n("n1"), &json!({"mood": "calm"}), ChangeType::StateEvolution)
        .unwrap();
    let b = replica_2
        .checkpoint(&n("n2"), &json!({"mood": "curious"}), ChangeType::StateEvolution)
        .unwrap();

    assert_eq!(a.lineage, Lineage::Single(h0));
    assert_eq!(b.lineage, Lineage::Single(h0));
    assert!(a.version_vector.is_concurrent_with(&b.version_vector));

    let set = DivergenceReconciler::new().compare(&replica_1, &replica_2.chain());
    assert!(set.is_fork());
    assert_eq!(set.common_ancestor, Some(h0));

    // Integrating the other side records the fork instead of rejecting it.
    replica_1.integrate(set.remote_only.clone()).unwrap();
    assert_eq!(replica_1.forks(), vec![h0]);
    assert_eq!(replica_1.store().children(&h0).len(), 2);
}

/// Partition, independent progress, heal, and reconcile on both sides.
#[test]
fn test_partition_heal_and_converge() {
    let reconciler = DivergenceReconciler::new();
    let mut left = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
    let mut right = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();

    // Shared history before the partition.
    left.checkpoint(&n("n1"), &json!({"step": 0}), ChangeType::StateEvolution)
        .unwrap();
    right.integrate(left.chain()).unwrap();
    let pre_partition = left.latest_hash();

    // Partition: each side keeps working.
    for i in 1..=3 {
        left.checkpoint(&n("n1"), &json!({"left": i}), ChangeType::ExperienceProcessing)
            .unwrap();
    }
    right
        .checkpoint(&n("n2"), &json!({"right": 1}), ChangeType::StateEvolution)
        .unwrap();

    // Heal: left decides to synthesize.
    let set = reconciler.compare(&left, &right.chain());
    assert_eq!(set.common_ancestor, Some(pre_partition));
    assert_eq!(set.local_only.len(), 3);
    assert_eq!(set.remote_only.len(), 1);

    let outcome = reconciler
        .apply(
            &mut left,
            &set,
            &Decision::Owner(ReconciliationOption::Synthesize),
            &n("n1"),
            &json!({"left": 3, "right": 1}),
        )
        .unwrap();
    let merge = outcome.merge.unwrap();
    assert_eq!(merge.parents().len(), 2);
    for parent in merge.parents() {
        assert!(left.get(&parent).is_some());
    }

    // Right fast-forwards onto left's merged timeline.
    let catch_up = reconciler.compare(&right, &left.chain());
    assert!(catch_up.is_fast_forward());
    right.integrate(catch_up.remote_only).unwrap();
    right.fast_forward(merge.state_hash).unwrap();

    assert_eq!(left.len(), right.len());
    assert_eq!(left.heads(), right.heads());
    assert_eq!(right.heads(), vec![merge.state_hash]);
    assert_eq!(right.latest_hash(), merge.state_hash);
    assert_eq!(right.version_vector(), left.version_vector());
}

/// Choosing a primary on a collective needs approvals.
#[test]
fn test_collective_choose_primary() {
    let reconciler = DivergenceReconciler::new();
    let mut local = VersionedStateStore::register("g1", EntityKind::Collective).unwrap();
    let mut remote = VersionedStateStore::register("g1", EntityKind::Collective).unwrap();
    local
        .checkpoint(&n("n1"), &json!({"harmony": 0.4}), ChangeType::StateEvolution)
        .unwrap();
    remote
        .checkpoint(&n("n2"), &json!({"harmony": 0.9}), ChangeType::CollectiveJoining)
        .unwrap();

    let set = reconciler.compare(&local, &remote.chain());
    let decision = Decision::Group {
        option: ReconciliationOption::ChoosePrimary(n("n2")),
        approvals: BTreeSet::from([n("n1"), n("n2"), n("n3")]),
    };
    let remote_state = json!({"harmony": 0.9});
    let outcome = reconciler
        .apply(&mut local, &set, &decision, &n("n1"), &remote_state)
        .unwrap();

    let merge = outcome.merge.unwrap();
    assert_eq!(merge.entity_kind, EntityKind::Collective);
    assert_eq!(local.snapshot(&merge.state_hash), Some(&remote_state));
}

/// Reopening over the same storage never adds a second genesis.
#[test]
fn test_register_over_existing_storage_is_idempotent() {
    let store = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
    let genesis = store.genesis_hash();

    let again = VersionedStateStore::with_store("e1", EntityKind::Individual, store.store().clone()).unwrap();
    let again = VersionedStateStore::with_store("e1", EntityKind::Individual, again.store().clone()).unwrap();

    assert_eq!(again.len(), 1);
    assert_eq!(again.genesis_hash(), genesis);
    assert_eq!(again.chain().iter().filter(|cp| cp.is_genesis()).count(), 1);
}

/// Several rounds of partition and heal between three replicas.
#[test]
fn test_repeated_partitions_converge() {
    let reconciler = DivergenceReconciler::new();
    let mut replicas: Vec<VersionedStateStore> = (0..3)
        .map(|_| VersionedStateStore::register("e1", EntityKind::Individual).unwrap())
        .collect();

    for round in 0..3 {
        for (i, replica) in replicas.iter_mut().enumerate() {
            replica
                .checkpoint(&n(&format!("n{}", i)), &json!({"round": round, "replica": i}), ChangeType::StateEvolution)
                .unwrap();
        }

        // Heal: replica 0 absorbs everyone, then everyone fast-forwards.
        for i in 1..3 {
            let remote_chain = replicas[i].chain();
            let set = reconciler.compare(&replicas[0], &remote_chain);
            reconciler
                .apply(
                    &mut replicas[0],
                    &set,
                    &Decision::Owner(ReconciliationOption::IntegrateAll),
                    &n("n0"),
                    &json!({"round": round, "merged": i}),
                )
                .unwrap();
        }
        let hub_chain = replicas[0].chain();
        let hub_head = replicas[0].latest_hash();
        for replica in replicas.iter_mut().skip(1) {
            let set = reconciler.compare(replica, &hub_chain);
            replica.integrate(set.remote_only).unwrap();
            replica.fast_forward(hub_head).unwrap();
        }
    }

    let heads = replicas[0].heads();
    assert_eq!(heads.len(), 1);
    for replica in &replicas {
        assert_eq!(replica.heads(), heads);
        assert_eq!(replica.len(), replicas[0].len());
    }
}
