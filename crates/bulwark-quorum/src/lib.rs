//! # bulwark-quorum
//!
//! Quorum gating for Bulwark: how many of the known nodes must be reachable
//! before a given class of change may be checkpointed.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_merkle::{ChangeType, EntityKind};
//! use bulwark_quorum::QuorumPolicy;
//!
//! let policy = QuorumPolicy::default();
//!
//! // Low-risk processing works even in isolation.
//! assert!(policy.can_proceed(&ChangeType::ExperienceProcessing, 1, 5, EntityKind::Individual));
//!
//! // Termination needs every known node.
//! assert!(!policy.can_proceed(&ChangeType::Termination, 3, 4, EntityKind::Individual));
//! ```

mod policy;

pub use policy::{QuorumPolicy, QuorumStatus, DEFAULT_COLLECTIVE_MULTIPLIER, DEFAULT_REQUIRED_FRACTION};
