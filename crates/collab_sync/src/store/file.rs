//! File-based document store.
//!
//! # Directory Structure
//!
//! ```text
//! data/
//! └── {doc_id}/
//!     └── snapshot.json    # Latest canonical content and version
//! ```
//!
//! Snapshots are written to a temporary file and renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use super::{check_version, DocumentStore, StoreError, StoreResult, StoredDocument};
use crate::ids::DocId;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Snapshot file name
const SNAPSHOT_FILE: &str = "snapshot.json";

/// File-based implementation of [`DocumentStore`].
pub struct FileDocumentStore {
    /// Base directory for all document data
    base_path: PathBuf,
}

impl FileDocumentStore {
    /// Create a new file-based store at the given path
    ///
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> StoreResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the directory path for a document
    fn doc_path(&self, doc_id: &DocId) -> StoreResult<PathBuf> {
        let id = doc_id.0.as_str();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.contains('\0');
        if !valid {
            return Err(StoreError::InvalidDocumentId(id.to_string()));
        }
        Ok(self.base_path.join(id))
    }

    /// Get the snapshot file path for a document
    fn snapshot_path(&self, doc_id: &DocId) -> StoreResult<PathBuf> {
        Ok(self.doc_path(doc_id)?.join(SNAPSHOT_FILE))
    }

    async fn read_snapshot(&self, path: &Path) -> StoreResult<Option<StoredDocument>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Get a list of all document IDs in the store
    pub async fn list_documents(&self) -> StoreResult<Vec<DocId>> {
        let mut docs = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                docs.push(DocId(entry.file_name().to_string_lossy().to_string()));
            }
        }
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(docs)
    }
}

impl DocumentStore for FileDocumentStore {
    async fn load(&self, doc_id: &DocId) -> StoreResult<Option<StoredDocument>> {
        let path = self.snapshot_path(doc_id)?;
        let document = self.read_snapshot(&path).await?;
        if let Some(doc) = &document {
            tracing::debug!("Loaded {} at version {} from {:?}", doc_id, doc.version, path);
        }
        Ok(document)
    }

    async fn save(&self, doc_id: &DocId, document: &StoredDocument) -> StoreResult<()> {
        let path = self.snapshot_path(doc_id)?;
        let stored = self.read_snapshot(&path).await?;
        check_version(doc_id, document.version, stored.map(|d| d.version))?;

        fs::create_dir_all(self.doc_path(doc_id)?).await?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_vec_pretty(document)?).await?;
        fs::rename(&temp_path, &path).await?;

        tracing::debug!("Saved {} at version {}", doc_id, document.version);
        Ok(())
    }
}
