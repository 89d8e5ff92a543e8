//! In-memory document store.
//!
//! Intended for tests and single-process deployments; nothing survives a
//! restart.

use super::{check_version, DocumentStore, StoreResult, StoredDocument};
use crate::ids::DocId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory implementation of [`DocumentStore`].
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<DocId, StoredDocument>>,
}

impl MemoryDocumentStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with one document at version 0.
    pub async fn with_document(doc_id: DocId, content: impl Into<String>) -> Self {
        let store = Self::new();
        store
            .documents
            .write()
            .await
            .insert(doc_id, StoredDocument::new(content, 0));
        store
    }

    /// Get the number of documents in the store
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Clear all documents from the store
    pub async fn clear(&self) {
        self.documents.write().await.clear();
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, doc_id: &DocId) -> StoreResult<Option<StoredDocument>> {
        Ok(self.documents.read().await.get(doc_id).cloned())
    }

    async fn save(&self, doc_id: &DocId, document: &StoredDocument) -> StoreResult<()> {
        let mut docs = self.documents.write().await;
        check_version(doc_id, document.version, docs.get(doc_id).map(|d| d.version))?;
        docs.insert(doc_id.clone(), document.clone());
        Ok(())
    }
}
