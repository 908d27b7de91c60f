//! Error types for timeline operations.

use crate::hash::Hash;
use thiserror::Error;

fn short_list(hashes: &[Hash]) -> String {
    hashes
        .iter()
        .map(|h| h.short())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur while building or reconciling a timeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimelineError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing parents: [{}]", short_list(.0))]
    MissingParents(Vec<Hash>),

    #[error("Verification failed for checkpoint {}", .0.short())]
    VerificationFailed(Hash),

    #[error("Checkpoint belongs to entity {found}, expected {expected}")]
    EntityMismatch { expected: String, found: String },

    #[error("Change type {0} cannot be appended directly")]
    ReservedChangeType(String),

    #[error("Checkpoint {} does not descend from the local tip", .0.short())]
    NotFastForward(Hash),

    #[error("Nothing to reconcile for entity {0}")]
    NothingToReconcile(String),

    #[error("Reconciliation option not offered: {0}")]
    OptionNotOffered(String),

    #[error("State does not match the latest checkpoint authored by {0}")]
    PrimaryStateMismatch(String),

    #[error("Collective {0} requires a group decision before reconciling")]
    GroupDecisionRequired(String),
}

impl From<serde_json::Error> for TimelineError {
    fn from(err: serde_json::Error) -> Self {
        TimelineError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TimelineError>;
