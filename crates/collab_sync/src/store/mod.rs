//! Document persistence abstraction.
//!
//! The channel registry loads a document from a [`DocumentStore`] when the
//! first session subscribes and saves it back on autosave and teardown. The
//! store only ever sees canonical content at a canonical version.

use crate::error::SyncError;
use crate::ids::DocId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod file;
mod memory;

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;

/// A persisted document snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub content: String,
    pub version: u64,
    pub saved_at: DateTime<Utc>,
}

impl StoredDocument {
    pub fn new(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
            saved_at: Utc::now(),
        }
    }
}

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The id cannot be used as a storage key
    #[error("Invalid document id: {0}")]
    InvalidDocumentId(String),

    /// A save would move the stored version backwards
    #[error("Stale save for {doc_id}: version {version} is older than stored {stored}")]
    StaleSave {
        doc_id: DocId,
        version: u64,
        stored: u64,
    },
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Persistence collaborator for document channels.
#[trait_variant::make(Send)]
pub trait DocumentStore: Send + Sync {
    /// Load a document; `None` when it was never saved.
    async fn load(&self, doc_id: &DocId) -> StoreResult<Option<StoredDocument>>;

    /// Persist a document snapshot.
    async fn save(&self, doc_id: &DocId, document: &StoredDocument) -> StoreResult<()>;
}

fn check_version(doc_id: &DocId, version: u64, stored: Option<u64>) -> StoreResult<()> {
    match stored {
        Some(stored) if version < stored => Err(StoreError::StaleSave {
            doc_id: doc_id.clone(),
            version,
            stored,
        }),
        _ => Ok(()),
    }
}
