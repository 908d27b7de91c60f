//! Bulwark SDK - split-brain protection for replicated entity state
//!
//! This SDK gates state changes on entities behind quorum, watches the
//! cluster for partitions, puts collectives to sleep while they are cut
//! off, and brings divergent timelines back together on request.
//!
//! # Quick Start
//!
//! ```rust
//! use bulwark_sdk::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let probe = MemoryProbe::new();
//! let facade = ProtectionFacade::new(ProtectionConfig::default(), Arc::new(probe.clone()));
//!
//! for id in ["n1", "n2", "n3"] {
//!     facade.add_node(NodeId::new(id));
//! }
//! facade.register("g1", true).unwrap();
//!
//! // All three nodes count as reachable until probed.
//! let admission = facade
//!     .propose_change("g1", &json!({"members": 3}), ChangeType::CollectiveJoining, &NodeId::new("n1"))
//!     .unwrap();
//! assert!(admission.is_admitted());
//! ```
//!
//! # Architecture
//!
//! - [`protection`] - The facade tying everything together
//! - [`monitor`] - Periodic probing and the partition state machine
//! - [`collective`] - Dormancy and reconciliation of collectives
//! - [`registry`] - Per-entity timelines
//! - [`probe`] - Reachability probing abstraction
//! - [`config`] - Configuration and builders
//! - [`error`] - Error types

pub mod collective;
pub mod config;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod protection;
pub mod registry;

// Re-exports for convenience
pub use collective::{
    CollectiveMode, CollectivePartitionCoordinator, CollectiveStatus, MembershipProvider, MembershipSnapshot,
    StaticMembership,
};
pub use config::{MonitorConfig, MonitorConfigBuilder, ProtectionConfig, ProtectionConfigBuilder};
pub use error::{ProtectionError, Result};
pub use monitor::{NodeSnapshot, PartitionEvent, PartitionMonitor, PartitionRecord, PartitionStatus};
pub use probe::{MemoryProbe, Probe};
pub use protection::{
    Admission, MonitorHandle, ProtectionFacade, ReconciliationOptions, RejectionReason, StatusReport,
};
pub use registry::{EntityRegistry, SharedStore};

// Re-export commonly used types from the timeline and quorum crates
pub use bulwark_merkle::{
    ChangeType, Checkpoint, Decision, DecisionMode, EntityKind, Hash, NodeId, ReconciliationOption,
    VersionVector,
};
pub use bulwark_quorum::{QuorumPolicy, QuorumStatus};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::collective::{CollectiveMode, MembershipProvider, StaticMembership};
    pub use crate::config::{MonitorConfig, ProtectionConfig};
    pub use crate::error::ProtectionError;
    pub use crate::monitor::PartitionEvent;
    pub use crate::probe::{MemoryProbe, Probe};
    pub use crate::protection::{Admission, ProtectionFacade};
    pub use bulwark_merkle::{ChangeType, Decision, NodeId, ReconciliationOption};
}
