use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Private,
    Internal,
    Public,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// Per-file bookkeeping owned by the orchestrator.
///
/// Created at upload acceptance, mutated on metadata update, deleted on file
/// deletion. The replication engine reads it but does not own it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub backend: String,
    pub storage_path: String,
    pub size: u64,
    pub checksum: String,
    pub mime_type: String,
    pub access_level: AccessLevel,
    pub owner: String,
    pub replication: ReplicationState,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
}

impl FileMetadata {
    pub fn new(
        id: impl Into<String>,
        backend: impl Into<String>,
        size: u64,
        checksum: impl Into<String>,
        mime_type: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            storage_path: id.clone(),
            id,
            backend: backend.into(),
            size,
            checksum: checksum.into(),
            mime_type: mime_type.into(),
            access_level: AccessLevel::default(),
            owner: owner.into(),
            replication: ReplicationState::default(),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now_ms)
    }

    pub fn is_media(&self) -> bool {
        self.mime_type.starts_with("audio/") || self.mime_type.starts_with("video/")
    }
}
