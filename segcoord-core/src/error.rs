//! Error types for segcoord
//!
//! Errors shared by every crate in the workspace. Module-specific failures
//! (broker calls, target refresh, configuration) have their own enums.

use crate::{CollectionId, ReplicaId};
use thiserror::Error;

/// Result type alias for segcoord operations
pub type Result<T> = std::result::Result<T, SegcoordError>;

#[derive(Error, Debug)]
pub enum SegcoordError {
    // ===== Topology Errors =====
    #[error("Collection not found: {0}")]
    CollectionNotFound(CollectionId),

    #[error("Replica not found: {0}")]
    ReplicaNotFound(ReplicaId),

    #[error("Replica {replica} belongs to collection {actual}, not {expected}")]
    ReplicaCollectionMismatch {
        replica: ReplicaId,
        expected: CollectionId,
        actual: CollectionId,
    },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SegcoordError {
    fn from(err: serde_json::Error) -> Self {
        SegcoordError::Serialization(err.to_string())
    }
}
