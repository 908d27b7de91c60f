//! Error types for the Bulwark SDK.

use bulwark_merkle::TimelineError;
use thiserror::Error;

/// Error type for protection operations.
///
/// A change refused for lack of quorum is not an error; it comes back as a
/// rejected [`Admission`](crate::protection::Admission).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtectionError {
    #[error("Entity not registered: {0}")]
    EntityNotRegistered(String),

    #[error("No open divergence for entity {0}")]
    NoOpenDivergence(String),

    #[error("Entity {0} is not a collective")]
    NotCollective(String),

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),
}

/// Result type for protection operations.
pub type Result<T> = std::result::Result<T, ProtectionError>;
