//! Property-based tests for quorum gating.

use bulwark_merkle::{ChangeType, EntityKind};
use bulwark_quorum::QuorumPolicy;
use proptest::prelude::*;

fn change_type_strategy() -> impl Strategy<Value = ChangeType> {
    prop_oneof![
        Just(ChangeType::Genesis),
        Just(ChangeType::ExperienceProcessing),
        Just(ChangeType::StateEvolution),
        Just(ChangeType::CollectiveJoining),
        Just(ChangeType::EntityMerge),
        Just(ChangeType::Termination),
        Just(ChangeType::Reconciliation),
        "[a-z]{3,10}".prop_map(|name| name.parse::<ChangeType>().unwrap()),
    ]
}

fn kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop_oneof![Just(EntityKind::Individual), Just(EntityKind::Collective)]
}

proptest! {
    #[test]
    fn can_proceed_is_monotonic_in_active_nodes(
        change_type in change_type_strategy(),
        kind in kind_strategy(),
        total in 0usize..50,
    ) {
        let policy = QuorumPolicy::default();
        let mut previous = false;
        for active in 0..=total {
            let allowed = policy.can_proceed(&change_type, active, total, kind);
            prop_assert!(allowed || !previous, "admission revoked at {}/{}", active, total);
            previous = allowed;
        }
    }

    #[test]
    fn collective_never_needs_less(
        change_type in change_type_strategy(),
    ) {
        let policy = QuorumPolicy::default();
        let individual = policy.required_fraction(&change_type, EntityKind::Individual);
        let collective = policy.required_fraction(&change_type, EntityKind::Collective);

        prop_assert!(collective >= individual);
        prop_assert!(collective <= 1.0);
    }

    #[test]
    fn termination_needs_everyone(
        kind in kind_strategy(),
        total in 1usize..50,
    ) {
        let policy = QuorumPolicy::default();
        prop_assert!(!policy.can_proceed(&ChangeType::Termination, total - 1, total, kind));
        prop_assert!(policy.can_proceed(&ChangeType::Termination, total, total, kind));
    }

    #[test]
    fn empty_cluster_is_always_refused(
        change_type in change_type_strategy(),
        kind in kind_strategy(),
    ) {
        let policy = QuorumPolicy::default();
        prop_assert!(!policy.can_proceed(&change_type, 0, 0, kind));
    }
}

/// Three known collective members, one reachable.
#[test]
fn test_collective_joining_with_one_of_three() {
    let policy = QuorumPolicy::default();
    let status = policy.status(&ChangeType::CollectiveJoining, 1, 3, EntityKind::Collective);

    assert!((status.required - 0.804).abs() < 1e-9);
    assert!((status.actual - 1.0 / 3.0).abs() < 1e-9);
    assert!(!status.is_sufficient());
}

#[test]
fn test_termination_with_three_of_four() {
    let policy = QuorumPolicy::default();
    for kind in [EntityKind::Individual, EntityKind::Collective] {
        assert!(!policy.can_proceed(&ChangeType::Termination, 3, 4, kind));
    }
}

#[test]
fn test_experience_processing_alone() {
    let policy = QuorumPolicy::default();
    assert!(policy.can_proceed(&ChangeType::ExperienceProcessing, 1, 1, EntityKind::Individual));
    assert!(policy.can_proceed(&ChangeType::ExperienceProcessing, 0, 1, EntityKind::Individual));
}
