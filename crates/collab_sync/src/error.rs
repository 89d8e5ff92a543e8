//! Error types for the synchronization core.

use crate::ids::{DocId, OpId};
use thiserror::Error;

/// Result type alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing a document.
///
/// Network failures are recovered locally by retry and reconnect; content
/// ambiguity never surfaces as an error but as a pending conflict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The connection to the channel is gone or refused a message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A batch referenced a base version the channel no longer recognizes.
    #[error("Stale base version {base_version} (channel is at {current_version})")]
    StaleVersion { base_version: u64, current_version: u64 },

    /// A three-way merge produced conflict markers and needs a human.
    #[error("Conflict {0} cannot be merged automatically")]
    ConflictUnresolvable(String),

    /// An operation was never acknowledged after every retry.
    #[error("Operation {op_id} was not acknowledged after {attempts} attempts")]
    OperationRetryExhausted { op_id: OpId, attempts: u32 },

    /// The operation does not fit the document it is applied to.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The session has not completed its initial sync.
    #[error("Session is not synchronized")]
    NotSynced,

    /// The edit touches a region held by an unresolved conflict.
    #[error("Region is locked by unresolved conflict {0}")]
    RegionLocked(String),

    /// No conflict with the given id is known.
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    /// The resolution request cannot be honored.
    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),

    /// The client is not subscribed to the document.
    #[error("Not subscribed to document {0}")]
    NotSubscribed(DocId),

    /// Persistence store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The session actor has shut down.
    #[error("Session closed")]
    SessionClosed,
}

impl SyncError {
    /// Whether reconnecting may clear this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::StaleVersion { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
