//! Durable storage for finished archives.
//!
//! Implementations decide where objects live (local disk, object store);
//! the engine only relies on whole-object upload semantics: an upload either
//! stores the complete stream or fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::ByteStream;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backup object not found: {0}")]
    NotFound(String),

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Where an uploaded archive ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub storage_path: String,
    /// Backend identifier, e.g. `local` or `s3`
    pub backend: String,
    pub size_bytes: u64,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileInfo {
    pub file_name: String,
    pub full_path: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub backup_id: Option<Uuid>,
}

#[async_trait]
pub trait BackupStorage: Send + Sync {
    async fn upload(
        &self,
        tenant_id: Uuid,
        backup_id: Uuid,
        file_name: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    async fn download(&self, tenant_id: Uuid, backup_id: Uuid, file_name: &str) -> Result<ByteStream, StorageError>;

    /// Files of one backup, or of every backup of the tenant when
    /// `backup_id` is `None`.
    async fn list_files(&self, tenant_id: Uuid, backup_id: Option<Uuid>) -> Result<Vec<BackupFileInfo>, StorageError>;

    /// Delete one file, or every object of the backup when `file_name` is
    /// `None`.
    async fn delete(&self, tenant_id: Uuid, backup_id: Uuid, file_name: Option<&str>) -> Result<(), StorageError>;
}
