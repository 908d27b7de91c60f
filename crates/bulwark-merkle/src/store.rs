//! Checkpoint storage and per-entity versioned timelines.
//!
//! [`CheckpointStore`] provides content-addressed storage for checkpoints,
//! tracking heads (checkpoints without children) automatically.
//! [`VersionedStateStore`] layers one entity's version vector, chain tip and
//! state snapshots on top of a store.

use crate::checkpoint::{genesis_state, ChangeType, Checkpoint, CheckpointBuilder, EntityKind, NodeId};
use crate::error::{Result, TimelineError};
use crate::hash::{Hash, Hasher};
use crate::version_vector::VersionVector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Trait for content-addressed checkpoint storage.
pub trait CheckpointStore {
    /// Get a checkpoint by its state hash.
    fn get(&self, hash: &Hash) -> Option<&Checkpoint>;

    /// Store a checkpoint, returning its state hash.
    ///
    /// The checkpoint is verified before storage. Every parent must already
    /// be present. Storing an existing checkpoint is a no-op.
    fn put(&mut self, checkpoint: Checkpoint) -> Result<Hash>;

    /// Get the current heads (checkpoints without children).
    fn heads(&self) -> Vec<Hash>;

    /// Check if a checkpoint exists in the store.
    fn contains(&self, hash: &Hash) -> bool;

    /// Get all ancestors of a checkpoint (transitive closure).
    fn ancestors(&self, hash: &Hash) -> HashSet<Hash>;

    /// Get immediate children of a checkpoint.
    fn children(&self, hash: &Hash) -> Vec<Hash>;

    /// All checkpoints in append order. Parents always precede children.
    fn append_order(&self) -> Vec<Hash>;

    /// Get the total number of checkpoints.
    fn len(&self) -> usize;

    /// The recorded local tip, if the store persists one.
    fn tip(&self) -> Option<Hash> {
        None
    }

    /// Record the local tip. Stores that cannot persist it ignore the call.
    fn set_tip(&mut self, _hash: Hash) {}

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation of CheckpointStore.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryCheckpointStore {
    checkpoints: HashMap<Hash, Checkpoint>,

    /// Append order.
    order: Vec<Hash>,

    heads: HashSet<Hash>,

    /// Reverse index: parent -> children.
    children_index: HashMap<Hash, HashSet<Hash>>,

    #[serde(default)]
    tip: Option<Hash>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        MemoryCheckpointStore {
            checkpoints: HashMap::new(),
            order: Vec::new(),
            heads: HashSet::new(),
            children_index: HashMap::new(),
            tip: None,
        }
    }

    fn update_heads(&mut self, checkpoint: &Checkpoint) {
        self.heads.insert(checkpoint.state_hash);
        for parent in checkpoint.parents() {
            self.heads.remove(&parent);
        }
    }

    fn update_children_index(&mut self, checkpoint: &Checkpoint) {
        for parent in checkpoint.parents() {
            self.children_index
                .entry(parent)
                .or_default()
                .insert(checkpoint.state_hash);
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, hash: &Hash) -> Option<&Checkpoint> {
        self.checkpoints.get(hash)
    }

    fn put(&mut self, checkpoint: Checkpoint) -> Result<Hash> {
        if !checkpoint.verify() {
            return Err(TimelineError::VerificationFailed(checkpoint.state_hash));
        }

        if self.checkpoints.contains_key(&checkpoint.state_hash) {
            return Ok(checkpoint.state_hash);
        }

        let missing: Vec<Hash> = checkpoint
            .parents()
            .into_iter()
            .filter(|p| !self.checkpoints.contains_key(p))
            .collect();
        if !missing.is_empty() {
            return Err(TimelineError::MissingParents(missing));
        }

        let hash = checkpoint.state_hash;
        self.update_heads(&checkpoint);
        self.update_children_index(&checkpoint);
        self.order.push(hash);
        self.checkpoints.insert(hash, checkpoint);

        Ok(hash)
    }

    fn heads(&self) -> Vec<Hash> {
        let mut heads: Vec<_> = self.heads.iter().copied().collect();
        heads.sort();
        heads
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.checkpoints.contains_key(hash)
    }

    fn ancestors(&self, hash: &Hash) -> HashSet<Hash> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(checkpoint) = self.checkpoints.get(hash) {
            queue.extend(checkpoint.parents());
        }

        while let Some(current) = queue.pop_front() {
            if result.insert(current) {
                if let Some(checkpoint) = self.checkpoints.get(&current) {
                    queue.extend(checkpoint.parents());
                }
            }
        }

        result
    }

    fn children(&self, hash: &Hash) -> Vec<Hash> {
        let mut children: Vec<_> = self
            .children_index
            .get(hash)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        children.sort();
        children
    }

    fn append_order(&self) -> Vec<Hash> {
        self.order.clone()
    }

    fn len(&self) -> usize {
        self.checkpoints.len()
    }

    fn tip(&self) -> Option<Hash> {
        self.tip
    }

    fn set_tip(&mut self, hash: Hash) {
        self.tip = Some(hash);
    }
}

/// Statistics about an entity timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineStats {
    pub total_checkpoints: usize,
    pub head_count: usize,
    pub fork_count: usize,
    pub merge_count: usize,
    pub max_depth: usize,
}

/// Hash-chained checkpoint log for one entity plus its version vector.
///
/// Local appends always extend the current tip. Checkpoints integrated from
/// other replicas may branch off an earlier checkpoint; such forks are kept
/// as DAG siblings until a reconciliation merges them.
#[derive(Clone, Debug)]
pub struct VersionedStateStore<S: CheckpointStore = MemoryCheckpointStore> {
    entity_id: String,
    entity_kind: EntityKind,
    version_vector: VersionVector,
    store: S,
    genesis: Hash,
    tip: Hash,
    snapshots: HashMap<Hash, Value>,
}

impl VersionedStateStore<MemoryCheckpointStore> {
    /// Register an entity with a fresh in-memory timeline.
    pub fn register(entity_id: impl Into<String>, entity_kind: EntityKind) -> Result<Self> {
        Self::with_store(entity_id, entity_kind, MemoryCheckpointStore::new())
    }
}

impl<S: CheckpointStore> VersionedStateStore<S> {
    /// Open a timeline over an existing store.
    ///
    /// A genesis checkpoint is created only when the store is empty. A
    /// non-empty store resumes from its recorded tip. Without one, the last
    /// appended checkpoint becomes the tip and the version vector covers
    /// every stored checkpoint, so no node's slot is ever handed out twice.
    pub fn with_store(entity_id: impl Into<String>, entity_kind: EntityKind, mut store: S) -> Result<Self> {
        let entity_id = entity_id.into();
        let order = store.append_order();

        if let (Some(first), Some(last)) = (order.first(), order.last()) {
            let (tip_hash, version_vector) = match store.tip() {
                Some(tip) => {
                    let checkpoint = store.get(&tip).ok_or(TimelineError::MissingParents(vec![tip]))?;
                    (tip, checkpoint.version_vector.clone())
                }
                None => {
                    let mut version_vector = VersionVector::new();
                    for checkpoint in order.iter().filter_map(|hash| store.get(hash)) {
                        version_vector.merge(&checkpoint.version_vector);
                    }
                    (*last, version_vector)
                }
            };

            let tip = store
                .get(&tip_hash)
                .ok_or(TimelineError::MissingParents(vec![tip_hash]))?;
            if tip.entity_id != entity_id {
                return Err(TimelineError::EntityMismatch {
                    expected: entity_id,
                    found: tip.entity_id.clone(),
                });
            }
            debug!(entity_id = %entity_id, tip = %tip_hash.short(), "timeline reopened");

            return Ok(VersionedStateStore {
                version_vector,
                entity_id,
                entity_kind,
                genesis: *first,
                tip: tip_hash,
                store,
                snapshots: HashMap::new(),
            });
        }

        let state = genesis_state(&entity_id, entity_kind);
        let genesis = CheckpointBuilder::new(entity_id.clone(), entity_kind)
            .with_content_hash(Hasher::hash_state(&state)?)
            .build();
        let hash = store.put(genesis)?;
        store.set_tip(hash);
        debug!(entity_id = %entity_id, genesis = %hash.short(), "created genesis checkpoint");

        let mut snapshots = HashMap::new();
        snapshots.insert(hash, state);

        Ok(VersionedStateStore {
            entity_id,
            entity_kind,
            version_vector: VersionVector::new(),
            store,
            genesis: hash,
            tip: hash,
            snapshots,
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn entity_kind(&self) -> EntityKind {
        self.entity_kind
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.version_vector
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    /// Hash of the checkpoint the next local append will extend.
    pub fn latest_hash(&self) -> Hash {
        self.tip
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.store.get(&self.tip)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Checkpoint> {
        self.store.get(hash)
    }

    /// State snapshot recorded with a checkpoint, if it was appended locally.
    pub fn snapshot(&self, hash: &Hash) -> Option<&Value> {
        self.snapshots.get(hash)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn heads(&self) -> Vec<Hash> {
        self.store.heads()
    }

    pub fn ancestors(&self, hash: &Hash) -> HashSet<Hash> {
        self.store.ancestors(hash)
    }

    pub fn children(&self, hash: &Hash) -> Vec<Hash> {
        self.store.children(hash)
    }

    /// Checkpoints with more than one child.
    pub fn forks(&self) -> Vec<Hash> {
        self.store
            .append_order()
            .into_iter()
            .filter(|hash| self.store.children(hash).len() > 1)
            .collect()
    }

    /// Hashes with every parent before its children.
    pub fn topological_order(&self) -> Vec<Hash> {
        self.store.append_order()
    }

    /// Every checkpoint in append order, ready to ship to another replica.
    pub fn chain(&self) -> Vec<Checkpoint> {
        self.store
            .append_order()
            .iter()
            .filter_map(|hash| self.store.get(hash).cloned())
            .collect()
    }

    /// Checkpoint before a change: bump `node_id`'s slot and extend the tip.
    pub fn checkpoint<T: Serialize + ?Sized>(
        &mut self,
        node_id: &NodeId,
        state: &T,
        change_type: ChangeType,
    ) -> Result<Checkpoint> {
        if change_type.is_quorum_exempt() {
            return Err(TimelineError::ReservedChangeType(change_type.to_string()));
        }

        let value = serde_json::to_value(state)?;
        let content_hash = Hasher::hash_state(&value)?;

        let mut version_vector = self.version_vector.clone();
        version_vector.increment(node_id.as_str());

        let checkpoint = CheckpointBuilder::new(self.entity_id.clone(), self.entity_kind)
            .with_parent(self.tip)
            .with_content_hash(content_hash)
            .with_version_vector(version_vector)
            .with_origin(node_id.clone())
            .with_change_type(change_type)
            .build();

        self.commit(checkpoint, value)
    }

    /// Append the reconciliation merge of the local tip and `remote_head`.
    pub(crate) fn append_merge<T: Serialize + ?Sized>(
        &mut self,
        node_id: &NodeId,
        state: &T,
        remote_head: Hash,
    ) -> Result<Checkpoint> {
        let remote = self
            .store
            .get(&remote_head)
            .ok_or(TimelineError::MissingParents(vec![remote_head]))?;

        let mut version_vector = self.version_vector.merged_with(&remote.version_vector);
        version_vector.increment(node_id.as_str());

        let value = serde_json::to_value(state)?;
        let checkpoint = CheckpointBuilder::new(self.entity_id.clone(), self.entity_kind)
            .with_merge_parents(self.tip, remote_head)
            .with_content_hash(Hasher::hash_state(&value)?)
            .with_version_vector(version_vector)
            .with_origin(node_id.clone())
            .with_change_type(ChangeType::Reconciliation)
            .build();

        self.commit(checkpoint, value)
    }

    fn commit(&mut self, checkpoint: Checkpoint, state: Value) -> Result<Checkpoint> {
        let hash = self.store.put(checkpoint.clone())?;
        self.store.set_tip(hash);
        self.version_vector = checkpoint.version_vector.clone();
        self.tip = hash;
        self.snapshots.insert(hash, state);

        debug!(
            entity_id = %self.entity_id,
            change_type = %checkpoint.change_type,
            state_hash = %hash.short(),
            "checkpoint appended"
        );

        Ok(checkpoint)
    }

    /// Move the tip onto an integrated checkpoint that already contains the
    /// local tip in its history.
    pub fn fast_forward(&mut self, head: Hash) -> Result<()> {
        if head == self.tip {
            return Ok(());
        }
        let target = self
            .store
            .get(&head)
            .ok_or(TimelineError::MissingParents(vec![head]))?;
        if !self.store.ancestors(&head).contains(&self.tip) {
            return Err(TimelineError::NotFastForward(head));
        }

        self.version_vector.merge(&target.version_vector);
        self.store.set_tip(head);
        self.tip = head;
        debug!(entity_id = %self.entity_id, tip = %head.short(), "fast-forwarded");
        Ok(())
    }

    /// Find a checkpoint by version vector.
    ///
    /// An exact match wins; otherwise the most recently appended checkpoint
    /// whose vector is causally at or before `version_vector`.
    pub fn state_at(&self, version_vector: &VersionVector) -> Option<&Checkpoint> {
        let newest_first: Vec<&Checkpoint> = self
            .store
            .append_order()
            .iter()
            .rev()
            .filter_map(|h| self.store.get(h))
            .collect();

        newest_first
            .iter()
            .find(|cp| &cp.version_vector == version_vector)
            .or_else(|| {
                newest_first
                    .iter()
                    .find(|cp| version_vector.dominates(&cp.version_vector))
            })
            .copied()
    }

    /// Checkpoints in `remote_chain` whose state hash is absent locally.
    pub fn detect_divergence(&self, remote_chain: &[Checkpoint]) -> Vec<Checkpoint> {
        remote_chain
            .iter()
            .filter(|cp| !self.store.contains(&cp.state_hash))
            .cloned()
            .collect()
    }

    /// Store checkpoints received from another replica.
    ///
    /// Checkpoints may arrive in any order; each is retried until its parents
    /// are present. Concurrent branches become DAG siblings. The local tip
    /// and version vector are left alone. Returns the newly stored hashes.
    ///
    /// Nothing is stored unless every checkpoint resolves.
    pub fn integrate(&mut self, checkpoints: impl IntoIterator<Item = Checkpoint>) -> Result<Vec<Hash>> {
        let mut pending: VecDeque<Checkpoint> = VecDeque::new();
        for checkpoint in checkpoints {
            if checkpoint.entity_id != self.entity_id {
                return Err(TimelineError::EntityMismatch {
                    expected: self.entity_id.clone(),
                    found: checkpoint.entity_id,
                });
            }
            if !checkpoint.verify() {
                return Err(TimelineError::VerificationFailed(checkpoint.state_hash));
            }
            if !self.store.contains(&checkpoint.state_hash) {
                pending.push_back(checkpoint);
            }
        }

        // Resolve a parent-first order before touching the store.
        let mut scheduled: HashSet<Hash> = HashSet::new();
        let mut ordered: Vec<Checkpoint> = Vec::new();
        let mut stalled = 0;

        while let Some(checkpoint) = pending.pop_front() {
            if scheduled.contains(&checkpoint.state_hash) {
                continue;
            }
            if stalled > pending.len() {
                pending.push_front(checkpoint);
                break;
            }

            let resolved = checkpoint
                .parents()
                .iter()
                .all(|p| self.store.contains(p) || scheduled.contains(p));
            if !resolved {
                pending.push_back(checkpoint);
                stalled += 1;
                continue;
            }

            scheduled.insert(checkpoint.state_hash);
            ordered.push(checkpoint);
            stalled = 0;
        }

        if !pending.is_empty() {
            let mut missing: Vec<Hash> = pending
                .iter()
                .flat_map(|cp| cp.parents())
                .filter(|p| {
                    !self.store.contains(p)
                        && !scheduled.contains(p)
                        && !pending.iter().any(|cp| cp.state_hash == *p)
                })
                .collect();
            missing.sort();
            missing.dedup();
            return Err(TimelineError::MissingParents(missing));
        }

        let mut stored = Vec::with_capacity(ordered.len());
        for checkpoint in ordered {
            for parent in checkpoint.parents() {
                if !self.store.children(&parent).is_empty() {
                    warn!(
                        entity_id = %self.entity_id,
                        parent = %parent.short(),
                        branch = %checkpoint.state_hash.short(),
                        "fork recorded"
                    );
                }
            }
            stored.push(self.store.put(checkpoint)?);
        }

        Ok(stored)
    }

    pub fn stats(&self) -> TimelineStats {
        let order = self.store.append_order();
        let mut depths: HashMap<Hash, usize> = HashMap::new();
        let mut merge_count = 0;

        for hash in &order {
            if let Some(checkpoint) = self.store.get(hash) {
                if checkpoint.is_merge() {
                    merge_count += 1;
                }
                let parent_depth = checkpoint
                    .parents()
                    .iter()
                    .filter_map(|p| depths.get(p))
                    .max()
                    .copied()
                    .unwrap_or(0);
                depths.insert(*hash, parent_depth + 1);
            }
        }

        TimelineStats {
            total_checkpoints: order.len(),
            head_count: self.store.heads().len(),
            fork_count: self.forks().len(),
            merge_count,
            max_depth: depths.values().max().copied().unwrap_or(0),
        }
    }
}
