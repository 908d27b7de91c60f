//! Checkpoint definition and builder.
//!
//! Each checkpoint in an entity timeline contains:
//! - A content hash of the caller's state snapshot
//! - An identity hash (`state_hash`) covering content and causal envelope
//! - Its lineage: genesis, a single parent, or a two-parent merge
//! - A version vector snapshot and the originating node

use crate::hash::{Hash, Hasher};
use crate::version_vector::VersionVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a replica node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Whether an entity has a single owner or many members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Individual,
    Collective,
}

impl EntityKind {
    pub fn from_group_flag(is_group: bool) -> Self {
        if is_group {
            EntityKind::Collective
        } else {
            EntityKind::Individual
        }
    }

    pub fn is_collective(&self) -> bool {
        matches!(self, EntityKind::Collective)
    }

    fn tag(&self) -> &'static str {
        match self {
            EntityKind::Individual => "individual",
            EntityKind::Collective => "collective",
        }
    }
}

/// Class of state change; decides how much quorum a change needs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Timeline root. Never proposed by callers.
    Genesis,
    /// Low-risk processing that may happen in isolation.
    ExperienceProcessing,
    StateEvolution,
    CollectiveJoining,
    EntityMerge,
    Termination,
    /// Merge of divergent branches, produced by the reconciler.
    Reconciliation,
    /// Caller-defined change class.
    Other(String),
}

impl ChangeType {
    /// Change types appended without consulting quorum.
    pub fn is_quorum_exempt(&self) -> bool {
        matches!(self, ChangeType::Genesis | ChangeType::Reconciliation)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChangeType::Genesis => "genesis",
            ChangeType::ExperienceProcessing => "experience_processing",
            ChangeType::StateEvolution => "state_evolution",
            ChangeType::CollectiveJoining => "collective_joining",
            ChangeType::EntityMerge => "entity_merge",
            ChangeType::Termination => "termination",
            ChangeType::Reconciliation => "reconciliation",
            ChangeType::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "genesis" => ChangeType::Genesis,
            "experience_processing" => ChangeType::ExperienceProcessing,
            "state_evolution" => ChangeType::StateEvolution,
            "collective_joining" => ChangeType::CollectiveJoining,
            "entity_merge" => ChangeType::EntityMerge,
            "termination" => ChangeType::Termination,
            "reconciliation" => ChangeType::Reconciliation,
            other => ChangeType::Other(other.to_string()),
        })
    }
}

/// How a checkpoint links into the timeline DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lineage {
    Genesis,
    Single(Hash),
    /// Join of the local tip and a remote head.
    Merge { local: Hash, remote: Hash },
}

impl Lineage {
    /// Parent hashes, local first.
    pub fn parents(&self) -> Vec<Hash> {
        match self {
            Lineage::Genesis => Vec::new(),
            Lineage::Single(parent) => vec![*parent],
            Lineage::Merge { local, remote } => vec![*local, *remote],
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Lineage::Merge { .. })
    }

    fn tag(&self) -> u8 {
        match self {
            Lineage::Genesis => 0,
            Lineage::Single(_) => 1,
            Lineage::Merge { .. } => 2,
        }
    }
}

/// An immutable snapshot marker in an entity's causal history.
///
/// `state_hash` is the checkpoint's identity: any change to the entity,
/// content, lineage, version vector, origin or change type changes it.
/// The wall-clock timestamp is informational and excluded, so every replica
/// derives the same genesis for the same entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub version_vector: VersionVector,
    /// Digest of the canonical state snapshot.
    pub content_hash: Hash,
    pub state_hash: Hash,
    pub lineage: Lineage,
    pub timestamp: DateTime<Utc>,
    /// Appending node; `None` for genesis.
    pub origin: Option<NodeId>,
    pub change_type: ChangeType,
}

impl Checkpoint {
    pub fn is_genesis(&self) -> bool {
        matches!(self.lineage, Lineage::Genesis)
    }

    pub fn is_merge(&self) -> bool {
        self.lineage.is_merge()
    }

    pub fn parents(&self) -> Vec<Hash> {
        self.lineage.parents()
    }

    pub fn has_parent(&self, hash: &Hash) -> bool {
        self.parents().contains(hash)
    }

    fn compute_state_hash(
        entity_id: &str,
        entity_kind: EntityKind,
        content_hash: &Hash,
        lineage: &Lineage,
        version_vector: &VersionVector,
        origin: Option<&NodeId>,
        change_type: &ChangeType,
    ) -> Hash {
        let mut hasher = Hasher::new();

        hasher.update_str(entity_id);
        hasher.update_str(entity_kind.tag());
        hasher.update(content_hash.as_bytes());

        // Merge parents are sorted so identity does not depend on which side
        // of the merge was local.
        hasher.update(&[lineage.tag()]);
        let mut parents = lineage.parents();
        parents.sort();
        for parent in &parents {
            hasher.update(parent.as_bytes());
        }

        hasher.update(&(version_vector.len() as u64).to_le_bytes());
        for (node, seq) in version_vector.iter() {
            hasher.update_str(node);
            hasher.update(&seq.to_le_bytes());
        }

        hasher.update_str(origin.map(NodeId::as_str).unwrap_or(""));
        hasher.update_str(change_type.as_str());

        hasher.finalize()
    }

    /// Verify that `state_hash` matches the checkpoint's contents.
    pub fn verify(&self) -> bool {
        let computed = Self::compute_state_hash(
            &self.entity_id,
            self.entity_kind,
            &self.content_hash,
            &self.lineage,
            &self.version_vector,
            self.origin.as_ref(),
            &self.change_type,
        );
        computed == self.state_hash
    }
}

/// Builder for creating checkpoints.
#[derive(Clone, Debug)]
pub struct CheckpointBuilder {
    entity_id: String,
    entity_kind: EntityKind,
    version_vector: VersionVector,
    content_hash: Option<Hash>,
    lineage: Lineage,
    timestamp: Option<DateTime<Utc>>,
    origin: Option<NodeId>,
    change_type: ChangeType,
}

impl CheckpointBuilder {
    pub fn new(entity_id: impl Into<String>, entity_kind: EntityKind) -> Self {
        CheckpointBuilder {
            entity_id: entity_id.into(),
            entity_kind,
            version_vector: VersionVector::new(),
            content_hash: None,
            lineage: Lineage::Genesis,
            timestamp: None,
            origin: None,
            change_type: ChangeType::Genesis,
        }
    }

    pub fn with_version_vector(mut self, version_vector: VersionVector) -> Self {
        self.version_vector = version_vector;
        self
    }

    pub fn with_content_hash(mut self, content_hash: Hash) -> Self {
        self.content_hash = Some(content_hash);
        self
    }

    pub fn with_parent(mut self, parent: Hash) -> Self {
        self.lineage = Lineage::Single(parent);
        self
    }

    /// Only the reconciler builds merge checkpoints.
    pub(crate) fn with_merge_parents(mut self, local: Hash, remote: Hash) -> Self {
        self.lineage = Lineage::Merge { local, remote };
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_origin(mut self, origin: NodeId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_change_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = change_type;
        self
    }

    /// Build the checkpoint, computing its identity hash.
    pub fn build(self) -> Checkpoint {
        let content_hash = self.content_hash.unwrap_or_else(|| Hasher::hash(&[]));
        let state_hash = Checkpoint::compute_state_hash(
            &self.entity_id,
            self.entity_kind,
            &content_hash,
            &self.lineage,
            &self.version_vector,
            self.origin.as_ref(),
            &self.change_type,
        );

        Checkpoint {
            entity_id: self.entity_id,
            entity_kind: self.entity_kind,
            version_vector: self.version_vector,
            content_hash,
            state_hash,
            lineage: self.lineage,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            origin: self.origin,
            change_type: self.change_type,
        }
    }
}

/// The state recorded by every genesis checkpoint.
pub fn genesis_state(entity_id: &str, entity_kind: EntityKind) -> serde_json::Value {
    serde_json::json!({
        "genesis": true,
        "entity_id": entity_id,
        "type": entity_kind.tag(),
    })
}
