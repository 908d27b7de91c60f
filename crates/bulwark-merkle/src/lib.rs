//! # bulwark-merkle
//!
//! Hash-linked, version-vector ordered checkpoint timelines for Bulwark.
//!
//! This crate provides:
//! - Content hashing of opaque state snapshots over canonical JSON
//! - Version vectors for partial ordering across nodes
//! - Per-entity checkpoint logs that tolerate forks as DAG branches
//! - Divergence detection and caller-driven reconciliation
//!
//! ## Architecture
//!
//! Every checkpoint links to its parent by the parent's `state_hash`, a
//! SHA-256 identity covering the content digest and the causal envelope.
//! Replicas of the same entity start from an identical genesis, so
//! divergent timelines always share at least that ancestor. Only the
//! [`DivergenceReconciler`] can append a two-parent merge checkpoint.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_merkle::{ChangeType, EntityKind, NodeId, VersionedStateStore};
//! use serde_json::json;
//!
//! let mut store = VersionedStateStore::register("e1", EntityKind::Individual).unwrap();
//! let genesis = store.genesis_hash();
//!
//! let node = NodeId::new("n1");
//! let cp = store
//!     .checkpoint(&node, &json!({"x": 1}), ChangeType::ExperienceProcessing)
//!     .unwrap();
//!
//! assert_eq!(cp.parents(), vec![genesis]);
//! assert_eq!(store.version_vector().get("n1"), 1);
//! assert_eq!(store.len(), 2);
//! ```

mod checkpoint;
mod divergence;
mod error;
mod hash;
mod store;
mod version_vector;

pub use checkpoint::{genesis_state, ChangeType, Checkpoint, CheckpointBuilder, EntityKind, Lineage, NodeId};
pub use divergence::{
    Decision, DecisionMode, DivergenceReconciler, DivergenceSet, DivergenceSummary, Reconciliation,
    ReconciliationOption,
};
pub use error::{Result, TimelineError};
pub use hash::{canonical_bytes, Hash, Hasher};
pub use store::{CheckpointStore, MemoryCheckpointStore, TimelineStats, VersionedStateStore};
pub use version_vector::{CausalOrder, VersionVector};
