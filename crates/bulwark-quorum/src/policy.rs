//! Quorum thresholds per change type.

use bulwark_merkle::{ChangeType, EntityKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Fraction required for change types missing from the table.
pub const DEFAULT_REQUIRED_FRACTION: f64 = 0.51;

/// Multiplier applied to every requirement of a collective entity.
pub const DEFAULT_COLLECTIVE_MULTIPLIER: f64 = 1.2;

/// Decides whether enough of the known nodes are reachable to admit a change.
///
/// Requirements are keyed by the change type's name so caller-defined
/// change types can be configured alongside the built-in ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    requirements: BTreeMap<String, f64>,
    default_fraction: f64,
    collective_multiplier: f64,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        let requirements = [
            (ChangeType::ExperienceProcessing, 0.0),
            (ChangeType::StateEvolution, 0.51),
            (ChangeType::CollectiveJoining, 0.67),
            (ChangeType::EntityMerge, 0.90),
            (ChangeType::Termination, 1.0),
        ]
        .into_iter()
        .map(|(change_type, fraction)| (change_type.as_str().to_string(), fraction))
        .collect();

        QuorumPolicy {
            requirements,
            default_fraction: DEFAULT_REQUIRED_FRACTION,
            collective_multiplier: DEFAULT_COLLECTIVE_MULTIPLIER,
        }
    }
}

impl QuorumPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the base requirement for one change type.
    pub fn with_requirement(mut self, change_type: ChangeType, fraction: f64) -> Self {
        self.requirements
            .insert(change_type.as_str().to_string(), clamp_fraction(fraction));
        self
    }

    /// Requirement for change types without an explicit entry.
    pub fn with_default_fraction(mut self, fraction: f64) -> Self {
        self.default_fraction = clamp_fraction(fraction);
        self
    }

    pub fn with_collective_multiplier(mut self, multiplier: f64) -> Self {
        self.collective_multiplier = multiplier.max(0.0);
        self
    }

    pub fn collective_multiplier(&self) -> f64 {
        self.collective_multiplier
    }

    /// Fraction of known nodes that must be reachable.
    pub fn required_fraction(&self, change_type: &ChangeType, entity_kind: EntityKind) -> f64 {
        if change_type.is_quorum_exempt() {
            return 0.0;
        }

        let base = self
            .requirements
            .get(change_type.as_str())
            .copied()
            .unwrap_or(self.default_fraction);

        if entity_kind.is_collective() {
            (base * self.collective_multiplier).min(1.0)
        } else {
            base
        }
    }

    /// Whether `active_nodes` out of `total_nodes` is enough for the change.
    ///
    /// An empty cluster never has quorum.
    pub fn can_proceed(
        &self,
        change_type: &ChangeType,
        active_nodes: usize,
        total_nodes: usize,
        entity_kind: EntityKind,
    ) -> bool {
        self.status(change_type, active_nodes, total_nodes, entity_kind)
            .can_proceed
    }

    /// Full quorum evaluation, suitable for reporting a rejection.
    pub fn status(
        &self,
        change_type: &ChangeType,
        active_nodes: usize,
        total_nodes: usize,
        entity_kind: EntityKind,
    ) -> QuorumStatus {
        let required = self.required_fraction(change_type, entity_kind);
        let actual = if total_nodes == 0 {
            0.0
        } else {
            active_nodes as f64 / total_nodes as f64
        };
        let can_proceed = total_nodes > 0 && actual >= required;

        debug!(
            change_type = %change_type,
            required,
            actual,
            active_nodes,
            total_nodes,
            can_proceed,
            "quorum evaluated"
        );

        QuorumStatus {
            change_type: change_type.clone(),
            entity_kind,
            required,
            actual,
            active_nodes,
            total_nodes,
            can_proceed,
        }
    }
}

fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        return 1.0;
    }
    fraction.clamp(0.0, 1.0)
}

/// Result of one quorum evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuorumStatus {
    pub change_type: ChangeType,
    pub entity_kind: EntityKind,
    pub required: f64,
    pub actual: f64,
    pub active_nodes: usize,
    pub total_nodes: usize,
    pub can_proceed: bool,
}

impl QuorumStatus {
    pub fn is_sufficient(&self) -> bool {
        self.can_proceed
    }

    /// How many more reachable nodes would satisfy the requirement.
    pub fn shortfall(&self) -> usize {
        if self.can_proceed || self.total_nodes == 0 {
            return 0;
        }
        let needed = (self.required * self.total_nodes as f64).ceil() as usize;
        needed.saturating_sub(self.active_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_default_table() {
        let policy = QuorumPolicy::default();
        let kind = EntityKind::Individual;

        assert_eq!(policy.required_fraction(&ChangeType::ExperienceProcessing, kind), 0.0);
        assert_eq!(policy.required_fraction(&ChangeType::StateEvolution, kind), 0.51);
        assert_eq!(policy.required_fraction(&ChangeType::CollectiveJoining, kind), 0.67);
        assert_eq!(policy.required_fraction(&ChangeType::EntityMerge, kind), 0.90);
        assert_eq!(policy.required_fraction(&ChangeType::Termination, kind), 1.0);
    }

    #[test]
    fn test_unknown_change_type_uses_default() {
        let policy = QuorumPolicy::default();
        let custom = ChangeType::Other("memory_rewrite".into());

        assert_eq!(
            policy.required_fraction(&custom, EntityKind::Individual),
            DEFAULT_REQUIRED_FRACTION
        );
    }

    #[test]
    fn test_exempt_types_need_nothing() {
        let policy = QuorumPolicy::default();
        for change_type in [ChangeType::Genesis, ChangeType::Reconciliation] {
            assert_eq!(policy.required_fraction(&change_type, EntityKind::Collective), 0.0);
            assert!(policy.can_proceed(&change_type, 0, 5, EntityKind::Collective));
        }
    }

    #[test]
    fn test_collective_multiplier_capped() {
        let policy = QuorumPolicy::default();
        let kind = EntityKind::Collective;

        let joining = policy.required_fraction(&ChangeType::CollectiveJoining, kind);
        assert!((joining - 0.804).abs() < EPSILON);
        let evolution = policy.required_fraction(&ChangeType::StateEvolution, kind);
        assert!((evolution - 0.612).abs() < EPSILON);
        assert_eq!(policy.required_fraction(&ChangeType::EntityMerge, kind), 1.0);
        assert_eq!(policy.required_fraction(&ChangeType::Termination, kind), 1.0);
    }

    #[test]
    fn test_empty_cluster_never_proceeds() {
        let policy = QuorumPolicy::default();
        let status = policy.status(&ChangeType::ExperienceProcessing, 0, 0, EntityKind::Individual);

        assert!(!status.is_sufficient());
        assert_eq!(status.actual, 0.0);
        assert_eq!(status.shortfall(), 0);
    }

    #[test]
    fn test_overrides() {
        let policy = QuorumPolicy::new()
            .with_requirement(ChangeType::ExperienceProcessing, 0.25)
            .with_requirement(ChangeType::Other("audit".into()), 2.0)
            .with_collective_multiplier(1.0);

        assert_eq!(
            policy.required_fraction(&ChangeType::ExperienceProcessing, EntityKind::Collective),
            0.25
        );
        assert_eq!(
            policy.required_fraction(&ChangeType::Other("audit".into()), EntityKind::Individual),
            1.0
        );
        assert!(!policy.can_proceed(&ChangeType::ExperienceProcessing, 0, 4, EntityKind::Individual));
        assert!(policy.can_proceed(&ChangeType::ExperienceProcessing, 1, 4, EntityKind::Individual));
    }

    #[test]
    fn test_shortfall() {
        let policy = QuorumPolicy::default();
        let status = policy.status(&ChangeType::StateEvolution, 1, 4, EntityKind::Individual);

        assert!(!status.can_proceed);
        assert_eq!(status.shortfall(), 2);
    }

    #[test]
    fn test_policy_serialization() {
        let policy = QuorumPolicy::default().with_requirement(ChangeType::Other("audit".into()), 0.75);
        let json = serde_json::to_string(&policy).unwrap();
        let back: QuorumPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(back, policy);
        assert!(json.contains("\"collective_joining\":0.67"));
    }
}
