use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::error::{MetadataError, Result};
use super::types::FileMetadata;
use super::MetadataStore;

/// In-memory metadata collection for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryMetadataStore {
    documents: RwLock<HashMap<String, FileMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create(&self, metadata: FileMetadata) -> Result<()> {
        let mut documents = self.documents.write();
        if documents.contains_key(&metadata.id) {
            return Err(MetadataError::AlreadyExists(metadata.id));
        }
        documents.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FileMetadata>> {
        Ok(self.documents.read().get(id).cloned())
    }

    async fn update_with_id(&self, id: &str, mut metadata: FileMetadata) -> Result<()> {
        let mut documents = self.documents.write();
        if !documents.contains_key(id) {
            return Err(MetadataError::NotFound(id.to_string()));
        }
        metadata.updated_at = chrono::Utc::now().timestamp_millis();
        documents.insert(id.to_string(), metadata);
        Ok(())
    }

    async fn remove_with_id(&self, id: &str) -> Result<()> {
        self.documents
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    async fn find(
        &self,
        predicate: Box<dyn for<'a> Fn(&'a FileMetadata) -> bool + Send + Sync>,
    ) -> Result<Vec<FileMetadata>> {
        let all: Vec<FileMetadata> = {
            let documents = self.documents.read();
            documents.values().cloned().collect()
        };
        let results = all.into_iter().filter(|m| predicate(m)).collect();
        Ok(results)
    }
}
