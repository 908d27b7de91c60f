//! Divergence detection and reconciliation between replicas of one entity.
//!
//! The reconciler compares two checkpoint chains by state hash, finds the
//! deepest checkpoint both sides share, and offers ways to bring the
//! branches back together. It never merges on its own: a caller picks an
//! option and applies it, which produces the only kind of merge checkpoint
//! a timeline can contain.

use crate::checkpoint::{ChangeType, Checkpoint, EntityKind, NodeId};
use crate::error::{Result, TimelineError};
use crate::hash::{Hash, Hasher};
use crate::store::{CheckpointStore, VersionedStateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{info, warn};

/// A way of resolving a divergence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationOption {
    /// Keep every divergent change from both sides. A remote chain that
    /// simply extends ours is fast-forwarded without a merge checkpoint.
    IntegrateAll,
    /// Carry forward the state of the newest divergent checkpoint authored
    /// by one node.
    ChoosePrimary(NodeId),
    /// Record a new state forged out of both branches, always as a merge.
    Synthesize,
    /// Keep both branches as parallel heads.
    MaintainParallel,
}

impl fmt::Display for ReconciliationOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationOption::IntegrateAll => write!(f, "integrate_all"),
            ReconciliationOption::ChoosePrimary(node) => write!(f, "choose_primary({})", node),
            ReconciliationOption::Synthesize => write!(f, "synthesize"),
            ReconciliationOption::MaintainParallel => write!(f, "maintain_parallel"),
        }
    }
}

/// Who has to decide on a reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// The owning process may apply an option directly.
    OwnerChoice,
    /// Members of the collective must agree first.
    GroupDecision,
}

impl From<EntityKind> for DecisionMode {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Individual => DecisionMode::OwnerChoice,
            EntityKind::Collective => DecisionMode::GroupDecision,
        }
    }
}

/// A chosen reconciliation option and who chose it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Owner(ReconciliationOption),
    Group {
        option: ReconciliationOption,
        approvals: BTreeSet<NodeId>,
    },
}

impl Decision {
    pub fn option(&self) -> &ReconciliationOption {
        match self {
            Decision::Owner(option) => option,
            Decision::Group { option, .. } => option,
        }
    }
}

/// The symmetric difference between a local and a remote chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DivergenceSet {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    /// Local checkpoints the remote chain does not contain.
    pub local_only: Vec<Checkpoint>,
    /// Remote checkpoints the local chain does not contain.
    pub remote_only: Vec<Checkpoint>,
    /// Hashes present on both sides, in local order.
    pub shared: Vec<Hash>,
    /// Deepest checkpoint both sides share.
    pub common_ancestor: Option<Hash>,
    pub options: Vec<ReconciliationOption>,
    pub decision_mode: DecisionMode,
}

impl DivergenceSet {
    /// The remote chain carries checkpoints we have not seen.
    pub fn is_divergent(&self) -> bool {
        !self.remote_only.is_empty()
    }

    /// Both sides extended the shared history independently.
    pub fn is_fork(&self) -> bool {
        !self.local_only.is_empty() && !self.remote_only.is_empty()
    }

    /// The remote chain is strictly ahead of ours.
    pub fn is_fast_forward(&self) -> bool {
        self.local_only.is_empty() && !self.remote_only.is_empty()
    }

    /// Remote-only checkpoints that no other remote-only checkpoint builds
    /// on, in remote order. More than one means the remote side forked too.
    pub fn remote_heads(&self) -> Vec<Hash> {
        let referenced: HashSet<Hash> = self
            .remote_only
            .iter()
            .flat_map(|cp| cp.parents())
            .collect();

        self.remote_only
            .iter()
            .map(|cp| cp.state_hash)
            .filter(|hash| !referenced.contains(hash))
            .collect()
    }

    /// Newest divergent checkpoint, on either side, authored by `node_id`.
    pub fn primary_head(&self, node_id: &NodeId) -> Option<&Checkpoint> {
        self.local_only
            .iter()
            .chain(self.remote_only.iter())
            .filter(|cp| cp.origin.as_ref() == Some(node_id))
            .max_by_key(|cp| cp.timestamp)
    }

    /// Overview of the remote-only checkpoints.
    pub fn summary(&self) -> DivergenceSummary {
        let timestamps: Vec<DateTime<Utc>> = self.remote_only.iter().map(|cp| cp.timestamp).collect();
        let earliest = timestamps.iter().min().copied();
        let latest = timestamps.iter().max().copied();

        DivergenceSummary {
            divergent_count: self.remote_only.len(),
            change_types: self.remote_only.iter().map(|cp| cp.change_type.clone()).collect(),
            nodes_involved: self.remote_only.iter().filter_map(|cp| cp.origin.clone()).collect(),
            earliest,
            latest,
            span_seconds: earliest
                .zip(latest)
                .map(|(first, last)| (last - first).num_milliseconds() as f64 / 1000.0),
        }
    }
}

/// What a divergence looks like, for presenting to whoever decides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DivergenceSummary {
    pub divergent_count: usize,
    pub change_types: Vec<ChangeType>,
    pub nodes_involved: BTreeSet<NodeId>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub span_seconds: Option<f64>,
}

/// Result of applying a decision.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciliation {
    pub option: ReconciliationOption,
    /// Remote checkpoints newly stored in the local timeline.
    pub integrated: Vec<Hash>,
    /// The last merge checkpoint written; `None` when branches are kept in
    /// parallel or the local tip was fast-forwarded.
    pub merge: Option<Checkpoint>,
    /// Merge checkpoints written, one per remote head.
    pub merge_count: usize,
    /// Local tip after the decision.
    pub tip: Hash,
}

/// Computes divergences and applies reconciliation decisions.
#[derive(Clone, Debug, Default)]
pub struct DivergenceReconciler;

impl DivergenceReconciler {
    pub fn new() -> Self {
        DivergenceReconciler
    }

    /// Compare a local timeline against a remote chain.
    pub fn compare<S: CheckpointStore>(
        &self,
        local: &VersionedStateStore<S>,
        remote_chain: &[Checkpoint],
    ) -> DivergenceSet {
        self.compare_chains(local.entity_id(), local.entity_kind(), &local.chain(), remote_chain)
    }

    /// Compare two chains of the same entity.
    pub fn compare_chains(
        &self,
        entity_id: &str,
        entity_kind: EntityKind,
        local: &[Checkpoint],
        remote: &[Checkpoint],
    ) -> DivergenceSet {
        let local_hashes: HashSet<Hash> = local.iter().map(|cp| cp.state_hash).collect();
        let remote_hashes: HashSet<Hash> = remote.iter().map(|cp| cp.state_hash).collect();

        let local_only: Vec<Checkpoint> = local
            .iter()
            .filter(|cp| !remote_hashes.contains(&cp.state_hash))
            .cloned()
            .collect();
        let remote_only: Vec<Checkpoint> = remote
            .iter()
            .filter(|cp| !local_hashes.contains(&cp.state_hash))
            .cloned()
            .collect();
        let shared: Vec<Hash> = local
            .iter()
            .map(|cp| cp.state_hash)
            .filter(|hash| remote_hashes.contains(hash))
            .collect();

        let index: HashMap<Hash, &Checkpoint> = local
            .iter()
            .chain(remote.iter())
            .map(|cp| (cp.state_hash, cp))
            .collect();
        let depths = depth_map(&index);

        // Deepest shared checkpoint; ties go to the one appended last locally.
        let common_ancestor = shared
            .iter()
            .enumerate()
            .max_by_key(|(position, hash)| (depths.get(*hash).copied().unwrap_or(0), *position))
            .map(|(_, hash)| *hash);

        let options = if remote_only.is_empty() {
            Vec::new()
        } else {
            let authors: BTreeSet<NodeId> = local_only
                .iter()
                .chain(remote_only.iter())
                .filter_map(|cp| cp.origin.clone())
                .collect();

            let mut options = vec![ReconciliationOption::IntegrateAll];
            options.extend(authors.into_iter().map(ReconciliationOption::ChoosePrimary));
            options.push(ReconciliationOption::Synthesize);
            options.push(ReconciliationOption::MaintainParallel);
            options
        };

        DivergenceSet {
            entity_id: entity_id.to_string(),
            entity_kind,
            local_only,
            remote_only,
            shared,
            common_ancestor,
            options,
            decision_mode: DecisionMode::from(entity_kind),
        }
    }

    /// Apply a decision to the local timeline.
    ///
    /// The remote branches are always integrated. What follows depends on
    /// the option:
    ///
    /// - `IntegrateAll` fast-forwards when the remote chain descends from
    ///   the local tip, and otherwise merges with `state` as the union.
    /// - `ChoosePrimary(node)` merges with the content of that node's newest
    ///   divergent checkpoint; `state` must hash to the same content.
    /// - `Synthesize` always merges, with `state` as the new content.
    /// - `MaintainParallel` leaves every branch as its own head.
    ///
    /// Merging joins the local tip with each remote head in turn, one
    /// `reconciliation` checkpoint per head. Every check runs before the
    /// timeline is touched.
    pub fn apply<S: CheckpointStore, T: Serialize + ?Sized>(
        &self,
        store: &mut VersionedStateStore<S>,
        set: &DivergenceSet,
        decision: &Decision,
        node_id: &NodeId,
        state: &T,
    ) -> Result<Reconciliation> {
        if set.entity_id != store.entity_id() {
            return Err(TimelineError::EntityMismatch {
                expected: store.entity_id().to_string(),
                found: set.entity_id.clone(),
            });
        }

        if !set.is_divergent() {
            return Err(TimelineError::NothingToReconcile(set.entity_id.clone()));
        }

        let option = decision.option();
        if !set.options.contains(option) {
            return Err(TimelineError::OptionNotOffered(option.to_string()));
        }

        if store.entity_kind().is_collective() {
            let approved = matches!(decision, Decision::Group { approvals, .. } if !approvals.is_empty());
            if !approved {
                warn!(entity_id = %set.entity_id, option = %option, "group decision missing");
                return Err(TimelineError::GroupDecisionRequired(set.entity_id.clone()));
            }
        }

        let remote_heads = set.remote_heads();
        if remote_heads.is_empty() {
            return Err(TimelineError::NothingToReconcile(set.entity_id.clone()));
        }

        let value = serde_json::to_value(state)?;
        if let ReconciliationOption::ChoosePrimary(primary) = option {
            let expected = set
                .primary_head(primary)
                .map(|cp| cp.content_hash)
                .ok_or_else(|| TimelineError::OptionNotOffered(option.to_string()))?;
            if Hasher::hash_state(&value)? != expected {
                return Err(TimelineError::PrimaryStateMismatch(primary.to_string()));
            }
        }

        let integrated = store.integrate(set.remote_only.iter().cloned())?;

        let fast_forward = match (option, remote_heads.as_slice()) {
            (ReconciliationOption::IntegrateAll, [head]) => {
                store.ancestors(head).contains(&store.latest_hash())
            }
            _ => false,
        };

        let mut merges = Vec::new();
        match option {
            ReconciliationOption::MaintainParallel => {}
            ReconciliationOption::IntegrateAll if fast_forward => store.fast_forward(remote_heads[0])?,
            _ => {
                for head in &remote_heads {
                    merges.push(store.append_merge(node_id, &value, *head)?);
                }
            }
        }

        info!(
            entity_id = %set.entity_id,
            option = %option,
            integrated = integrated.len(),
            merges = merges.len(),
            fast_forward,
            "divergence reconciled"
        );

        Ok(Reconciliation {
            option: option.clone(),
            integrated,
            merge_count: merges.len(),
            merge: merges.pop(),
            tip: store.latest_hash(),
        })
    }
}

/// Longest path from a root to each checkpoint, following parent links.
/// Parents outside the index count as depth zero.
fn depth_map(index: &HashMap<Hash, &Checkpoint>) -> HashMap<Hash, usize> {
    let mut depths: HashMap<Hash, usize> = HashMap::new();

    for start in index.keys() {
        let mut stack = vec![*start];
        while let Some(hash) = stack.last().copied() {
            if depths.contains_key(&hash) {
                stack.pop();
                continue;
            }
            let parents: Vec<Hash> = index
                .get(&hash)
                .map(|cp| cp.parents())
                .unwrap_or_default()
                .into_iter()
                .filter(|p| index.contains_key(p))
                .collect();

            let pending: Vec<Hash> = parents
                .iter()
                .filter(|p| !depths.contains_key(*p))
                .copied()
                .collect();

            if pending.is_empty() {
                let depth = parents.iter().filter_map(|p| depths.get(p)).max().copied().unwrap_or(0) + 1;
                depths.insert(hash, depth);
                stack.pop();
            } else {
                stack.extend(pending);
            }
        }
    }

    depths
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn n(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn forked_pair(kind: EntityKind) -> (VersionedStateStore, VersionedStateStore) {
        let mut local = VersionedStateStore::register("e1", kind).unwrap();
        let mut remote = VersionedStateStore::register("e1", kind).unwrap();
        local
            .checkpoint(&n("n1"), &json!({"side": "local"}), ChangeType::StateEvolution)
            .unwrap();
        remote
            .checkpoint(&n("n2"), &json!({"side": "remote"}), ChangeType::StateEvolution)
            .unwrap();
        (local, remote)
    }

    #[test]
    fn test_identical_chains_have_no_options() {
        let (local, _) = forked_pair(EntityKind::Individual);
        let set = DivergenceReconciler::new().compare(&local, &local.chain());

        assert!(!set.is_divergent());
        assert!(set.options.is_empty());
        assert_eq!(set.common_ancestor, Some(local.latest_hash()));
    }

    #[test]
    fn test_fork_options() {
        let (local, remote) = forked_pair(EntityKind::Individual);
        let set = DivergenceReconciler::new().compare(&local, &remote.chain());

        assert!(set.is_fork());
        assert_eq!(set.common_ancestor, Some(local.genesis_hash()));
        assert_eq!(set.decision_mode, DecisionMode::OwnerChoice);
        assert_eq!(
            set.options,
            vec![
                ReconciliationOption::IntegrateAll,
                ReconciliationOption::ChoosePrimary(n("n1")),
                ReconciliationOption::ChoosePrimary(n("n2")),
                ReconciliationOption::Synthesize,
                ReconciliationOption::MaintainParallel,
            ]
        );
    }

    #[test]
    fn test_fast_forward() {
        let local = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
        let mut remote = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
        remote.checkpoint(&n("n2"), &json!({"x": 1}), ChangeType::StateEvolution).unwrap();
        let head = remote.checkpoint(&n("n2"), &json!({"x": 2}), ChangeType::StateEvolution).unwrap();

        let set = DivergenceReconciler::new().compare(&local, &remote.chain());
        assert!(set.is_fast_forward());
        assert_eq!(set.remote_heads(), vec![head.state_hash]);
        assert_eq!(set.common_ancestor, Some(local.genesis_hash()));
    }

    #[test]
    fn test_apply_creates_merge_node() {
        let (mut local, remote) = forked_pair(EntityKind::Individual);
        let local_tip = local.latest_hash();
        let reconciler = DivergenceReconciler::new();
        let set = reconciler.compare(&local, &remote.chain());
        let remote_head = set.remote_heads()[0];

        let outcome = reconciler
            .apply(
                &mut local,
                &set,
                &Decision::Owner(ReconciliationOption::Synthesize),
                &n("n1"),
                &json!({"side": "both"}),
            )
            .unwrap();

        let merge = outcome.merge.unwrap();
        assert_eq!(merge.change_type, ChangeType::Reconciliation);
        assert_eq!(merge.parents(), vec![local_tip, remote_head]);
        assert_eq!(merge.version_vector.get("n1"), 2);
        assert_eq!(merge.version_vector.get("n2"), 1);
        assert_eq!(local.heads(), vec![merge.state_hash]);
        assert_eq!(local.stats().merge_count, 1);
        assert_eq!(outcome.tip, merge.state_hash);
    }

    #[test]
    fn test_options_resolve_differently() {
        let reconciler = DivergenceReconciler::new();
        let apply = |option: ReconciliationOption, state: serde_json::Value| {
            let (mut local, remote) = forked_pair(EntityKind::Individual);
            let set = reconciler.compare(&local, &remote.chain());
            let outcome =
                reconciler.apply(&mut local, &set, &Decision::Owner(option), &n("n1"), &state);
            (outcome, local)
        };

        let remote_content = Hasher::hash_state(&json!({"side": "remote"})).unwrap();
        let blended = json!({"side": "both"});

        let (primary, _) = apply(ReconciliationOption::ChoosePrimary(n("n2")), json!({"side": "remote"}));
        let primary = primary.unwrap().merge.unwrap();
        assert_eq!(primary.content_hash, remote_content);

        // Picking a primary and then handing over some other state is refused.
        let (mismatch, untouched) = apply(ReconciliationOption::ChoosePrimary(n("n2")), blended.clone());
        assert_eq!(mismatch, Err(TimelineError::PrimaryStateMismatch("n2".into())));
        assert_eq!(untouched.len(), 2);

        let (synthesized, _) = apply(ReconciliationOption::Synthesize, blended.clone());
        let synthesized = synthesized.unwrap().merge.unwrap();
        assert_eq!(synthesized.content_hash, Hasher::hash_state(&blended).unwrap());
        assert_ne!(synthesized.content_hash, primary.content_hash);

        let (parallel, local) = apply(ReconciliationOption::MaintainParallel, blended);
        assert_eq!(parallel.unwrap().merge_count, 0);
        assert_eq!(local.heads().len(), 2);
    }

    #[test]
    fn test_integrate_all_fast_forwards_but_synthesize_merges() {
        let reconciler = DivergenceReconciler::new();
        let local = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
        let mut remote = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
        let head = remote.checkpoint(&n("n2"), &json!({"x": 1}), ChangeType::StateEvolution).unwrap();
        let set = reconciler.compare(&local, &remote.chain());

        let mut integrated = local.clone();
        let outcome = reconciler
            .apply(
                &mut integrated,
                &set,
                &Decision::Owner(ReconciliationOption::IntegrateAll),
                &n("n1"),
                &json!({"x": 1}),
            )
            .unwrap();
        assert!(outcome.merge.is_none());
        assert_eq!(outcome.tip, head.state_hash);
        assert_eq!(integrated.len(), 2);

        let mut synthesized = local.clone();
        let outcome = reconciler
            .apply(
                &mut synthesized,
                &set,
                &Decision::Owner(ReconciliationOption::Synthesize),
                &n("n1"),
                &json!({"x": 2}),
            )
            .unwrap();
        let merge = outcome.merge.unwrap();
        assert_eq!(merge.parents(), vec![local.genesis_hash(), head.state_hash]);
        assert_eq!(synthesized.len(), 3);
    }

    #[test]
    fn test_merge_covers_every_remote_head() {
        let reconciler = DivergenceReconciler::new();
        let (mut local, mut remote) = forked_pair(EntityKind::Individual);

        // The remote side forked on its own before sending its chain.
        let mut sibling = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
        sibling.checkpoint(&n("n3"), &json!({"side": "third"}), ChangeType::StateEvolution).unwrap();
        remote.integrate(sibling.chain()).unwrap();

        let set = reconciler.compare(&local, &remote.chain());
        assert_eq!(set.remote_heads().len(), 2);

        let outcome = reconciler
            .apply(
                &mut local,
                &set,
                &Decision::Owner(ReconciliationOption::IntegrateAll),
                &n("n1"),
                &json!({"side": "all"}),
            )
            .unwrap();

        assert_eq!(outcome.merge_count, 2);
        assert_eq!(local.heads(), vec![outcome.tip]);
        let merged = local.ancestors(&outcome.tip);
        for head in set.remote_heads() {
            assert!(merged.contains(&head));
        }
        assert_eq!(local.version_vector().get("n1"), 3);
    }

    #[test]
    fn test_maintain_parallel_keeps_both_heads() {
        let (mut local, remote) = forked_pair(EntityKind::Individual);
        let reconciler = DivergenceReconciler::new();
        let set = reconciler.compare(&local, &remote.chain());

        let outcome = reconciler
            .apply(
                &mut local,
                &set,
                &Decision::Owner(ReconciliationOption::MaintainParallel),
                &n("n1"),
                &json!({}),
            )
            .unwrap();

        assert!(outcome.merge.is_none());
        assert_eq!(outcome.integrated.len(), 1);
        assert_eq!(local.heads().len(), 2);
    }

    #[test]
    fn test_collective_requires_group_decision() {
        let (mut local, remote) = forked_pair(EntityKind::Collective);
        let reconciler = DivergenceReconciler::new();
        let set = reconciler.compare(&local, &remote.chain());
        assert_eq!(set.decision_mode, DecisionMode::GroupDecision);

        let owner = reconciler.apply(
            &mut local,
            &set,
            &Decision::Owner(ReconciliationOption::IntegrateAll),
            &n("n1"),
            &json!({}),
        );
        assert!(matches!(owner, Err(TimelineError::GroupDecisionRequired(_))));
        assert_eq!(local.len(), 2);

        let group = Decision::Group {
            option: ReconciliationOption::IntegrateAll,
            approvals: BTreeSet::from([n("n1"), n("n2")]),
        };
        assert!(reconciler.apply(&mut local, &set, &group, &n("n1"), &json!({})).is_ok());
    }

    #[test]
    fn test_option_must_be_offered() {
        let (mut local, remote) = forked_pair(EntityKind::Individual);
        let reconciler = DivergenceReconciler::new();
        let set = reconciler.compare(&local, &remote.chain());

        let result = reconciler.apply(
            &mut local,
            &set,
            &Decision::Owner(ReconciliationOption::ChoosePrimary(n("n7"))),
            &n("n1"),
            &json!({}),
        );
        assert!(matches!(result, Err(TimelineError::OptionNotOffered(_))));
    }

    #[test]
    fn test_summary() {
        let (local, remote) = forked_pair(EntityKind::Individual);
        let set = DivergenceReconciler::new().compare(&local, &remote.chain());
        let summary = set.summary();

        assert_eq!(summary.divergent_count, 1);
        assert_eq!(summary.change_types, vec![ChangeType::StateEvolution]);
        assert_eq!(summary.nodes_involved, BTreeSet::from([n("n2")]));
        assert_eq!(summary.span_seconds, Some(0.0));
    }
}
