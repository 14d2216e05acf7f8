pub mod error;
pub mod memory;
pub mod types;

pub use error::{MetadataError, Result};
pub use memory::MemoryMetadataStore;
pub use types::{AccessLevel, FileMetadata, ReplicationState};

use async_trait::async_trait;

/// Contract for the external metadata collection.
///
/// The engine treats this as a key-value store with predicate scans and
/// assumes no particular query language.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create(&self, metadata: FileMetadata) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<FileMetadata>>;

    async fn update_with_id(&self, id: &str, metadata: FileMetadata) -> Result<()>;

    async fn remove_with_id(&self, id: &str) -> Result<()>;

    /// Scan the collection, returning every document matching `predicate`.
    async fn find(
        &self,
        predicate: Box<dyn for<'a> Fn(&'a FileMetadata) -> bool + Send + Sync>,
    ) -> Result<Vec<FileMetadata>>;
}
