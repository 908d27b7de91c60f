//! Version vectors for partial ordering of checkpoints across nodes.
//!
//! Each node owns exactly one slot and only ever increments it. Vectors from
//! different nodes are compared by dominance; neither dominating means the
//! two checkpoints were produced concurrently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relation between two version vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Map from node ID to the number of checkpoints that node has produced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<String, u64>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> Self {
        VersionVector {
            entries: BTreeMap::new(),
        }
    }

    /// Create a version vector from entries. Zero counters are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        VersionVector {
            entries: entries.into_iter().filter(|(_, seq)| *seq > 0).collect(),
        }
    }

    /// Get the counter for a node.
    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Increment the counter for a node, returning the new value.
    pub fn increment(&mut self, node_id: &str) -> u64 {
        let entry = self.entries.entry(node_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Returns true if for all nodes, self[n] >= other[n].
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(node_id, &seq)| self.get(node_id) >= seq)
    }

    /// Returns true if dominates(other) AND self != other.
    pub fn strictly_dominates(&self, other: &VersionVector) -> bool {
        self.dominates(other) && self != other
    }

    /// Check if two vectors are concurrent (neither dominates the other).
    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Classify how `self` relates to `other`.
    pub fn causal_order(&self, other: &VersionVector) -> CausalOrder {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Merge with another version vector (component-wise max).
    pub fn merge(&mut self, other: &VersionVector) {
        for (node_id, &seq) in &other.entries {
            let current = self.entries.entry(node_id.clone()).or_insert(0);
            *current = (*current).max(seq);
        }
    }

    /// Create a merged version vector without modifying self.
    pub fn merged_with(&self, other: &VersionVector) -> VersionVector {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Iterate over all entries in node order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.entries.iter()
    }

    /// Get the number of nodes tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the version vector is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all counters (total checkpoints observed).
    pub fn total_operations(&self) -> u64 {
        self.entries.values().sum()
    }
}
