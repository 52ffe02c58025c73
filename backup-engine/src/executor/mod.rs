//! Backup executor - orchestrates backup, restore and validation runs.
//!
//! One executor serves every tenant. Each call is an independent sequential
//! pipeline over the collaborators the executor was built with:
//! - backup: section builders -> archive writer -> durable storage
//! - restore: durable storage -> archive reader -> section restorers
//! - validate: durable storage -> archive reader -> presence checks

pub mod backup;
pub mod manifest;
pub mod restore;
pub mod validate;

pub use backup::{BackupExecutionResult, BackupRequest};
pub use manifest::{ConfigurationManifest, DatabaseManifest, FilesManifest, Manifest, Section};
pub use restore::{PreparedRestore, RestoreConfirmation, RestoreReport, RestoreRequest, SectionOutcome, SectionReport};
pub use validate::BackupValidationResult;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{layout, ArchiveError, ArchiveReader};
use crate::config::EngineConfig;
use crate::sources::{TenantDatabase, TenantObjectStore, TenantSettings};
use crate::storage::{BackupFileInfo, BackupStorage, StorageError};
use crate::utils::BackupError;

/// Main backup executor
pub struct BackupExecutor {
    storage: Arc<dyn BackupStorage>,
    database: Arc<dyn TenantDatabase>,
    objects: Arc<dyn TenantObjectStore>,
    settings: Arc<dyn TenantSettings>,
    config: EngineConfig,
}

/// Outcome of looking up the archive file of a backup.
enum ArchiveLookup {
    /// Listing failed or returned nothing
    NoFiles,
    /// Files exist but none has an archive extension
    NoArchive,
    Found(BackupFileInfo),
}

impl BackupExecutor {
    pub fn new(
        storage: Arc<dyn BackupStorage>,
        database: Arc<dyn TenantDatabase>,
        objects: Arc<dyn TenantObjectStore>,
        settings: Arc<dyn TenantSettings>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            database,
            objects,
            settings,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn find_archive(&self, tenant_id: Uuid, backup_id: Uuid) -> Result<ArchiveLookup, StorageError> {
        let files = self.storage.list_files(tenant_id, Some(backup_id)).await?;
        if files.is_empty() {
            return Ok(ArchiveLookup::NoFiles);
        }

        // Several archives under one backup id should not happen; take the newest
        let archive = files
            .into_iter()
            .filter(|f| layout::is_archive_file(&f.file_name))
            .max_by_key(|f| f.last_modified);

        Ok(match archive {
            Some(file) => ArchiveLookup::Found(file),
            None => ArchiveLookup::NoArchive,
        })
    }

    async fn open_archive(
        &self,
        tenant_id: Uuid,
        backup_id: Uuid,
        file: &BackupFileInfo,
        cancel: &CancellationToken,
    ) -> Result<ArchiveReader, OpenError> {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OpenError::Archive(ArchiveError::Cancelled)),
            body = self.storage.download(tenant_id, backup_id, &file.file_name) => body.map_err(OpenError::Download)?,
        };

        let archive = &self.config.archive;
        ArchiveReader::from_stream(body, archive.spool_threshold_bytes, archive.copy_buffer_size, cancel)
            .await
            .map_err(OpenError::Archive)
    }
}

/// How a run that ended in `err` after `elapsed` is reported in the logs.
fn describe_failure(err: &BackupError, elapsed: Duration) -> String {
    match err {
        BackupError::Cancelled => format!("cancelled after {:?}", elapsed),
        e => format!("failed after {:?}: [{}] {}", elapsed, e.code(), e),
    }
}

/// Why an archive could not be opened.
#[derive(Debug)]
enum OpenError {
    Download(StorageError),
    Archive(ArchiveError),
}
