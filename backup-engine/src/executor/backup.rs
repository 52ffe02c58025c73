//! Backup run: section builders, archive finalization and upload.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::manifest::{Manifest, Section};
use super::{describe_failure, BackupExecutor};
use crate::archive::{layout, ArchiveWriter};
use crate::sections::{configuration, database, files};
use crate::utils::{BackupError, Result};

/// Backup job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub tenant_id: Uuid,
    pub backup_id: Uuid,
    pub backup_name: String,
    pub backup_type: String,
    pub include_database: bool,
    pub include_files: bool,
    pub include_configuration: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub encrypt: bool,
}

impl BackupRequest {
    pub fn includes(&self, section: Section) -> bool {
        match section {
            Section::Database => self.include_database,
            Section::Files => self.include_files,
            Section::Configuration => self.include_configuration,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.backup_name.trim();
        if name.is_empty() {
            return Err(BackupError::validation("Backup.InvalidRequest", "Backup name is required"));
        }
        if name.contains(['/', '\\', '\0']) {
            return Err(BackupError::validation(
                "Backup.InvalidRequest",
                format!("Backup name {:?} must not contain path separators", name),
            ));
        }
        if !Section::ALL.into_iter().any(|s| self.includes(s)) {
            return Err(BackupError::validation(
                "Backup.InvalidRequest",
                "At least one section must be included",
            ));
        }
        if self.encrypt {
            return Err(BackupError::validation(
                "Backup.EncryptionUnsupported",
                "Encrypted backups are not supported",
            ));
        }
        Ok(())
    }
}

/// Backup execution result
#[derive(Debug, Clone)]
pub struct BackupExecutionResult {
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: u64,
    pub download_url: Option<String>,
    pub duration: Duration,
    pub manifest: Manifest,
}

impl BackupExecutor {
    /// Build an archive of the requested sections and upload it.
    ///
    /// Any section failure, cancellation or upload failure aborts the whole
    /// run; nothing is uploaded unless every requested section succeeded.
    pub async fn execute_backup(
        &self,
        request: &BackupRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupExecutionResult> {
        let start_time = Instant::now();
        info!(
            "Starting backup execution. Tenant: {}, backup: {}, name: {}",
            request.tenant_id, request.backup_id, request.backup_name
        );

        let result = match request.validate() {
            Ok(()) => self.run_backup(request, start_time, cancel).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(done) => info!(
                "Backup execution completed. Tenant: {}, backup: {}, size: {} bytes, duration: {:?}",
                request.tenant_id, request.backup_id, done.size_bytes, done.duration
            ),
            Err(e @ BackupError::Cancelled) => warn!(
                "Backup execution {}. Tenant: {}, backup: {}",
                describe_failure(e, start_time.elapsed()),
                request.tenant_id,
                request.backup_id
            ),
            Err(e) => error!(
                "Backup execution {}. Tenant: {}, backup: {}",
                describe_failure(e, start_time.elapsed()),
                request.tenant_id,
                request.backup_id
            ),
        }
        result
    }

    async fn run_backup(
        &self,
        request: &BackupRequest,
        start_time: Instant,
        cancel: &CancellationToken,
    ) -> Result<BackupExecutionResult> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let created_at = Utc::now();
        let archive_config = &self.config.archive;
        let mut writer = ArchiveWriter::new(archive_config.spool_threshold_bytes, created_at);
        let mut manifest = Manifest::new(
            request.backup_id,
            request.tenant_id,
            created_at,
            request.backup_type.clone(),
            request.compress,
        );

        if request.include_database {
            let section = database::build(
                self.database.as_ref(),
                request.tenant_id,
                created_at,
                &mut writer,
                self.config.database.sort_tables,
                cancel,
            )
            .await
            .map_err(|e| e.into_backup_error("Backup.DatabaseFailed", "Database backup"))?;

            info!(
                "Database backup completed. Tenant: {}, tables: {}, rows: {}",
                request.tenant_id, section.table_count, section.total_rows
            );
            manifest = manifest.with_database(section);
        }

        if request.include_files {
            let section = files::build(
                self.objects.as_ref(),
                request.tenant_id,
                &mut writer,
                &self.config.files.excluded_prefixes,
                archive_config.copy_buffer_size,
                cancel,
            )
            .await
            .map_err(|e| e.into_backup_error("Backup.FilesFailed", "Files backup"))?;

            info!(
                "Files backup completed. Tenant: {}, files: {}, size: {} bytes",
                request.tenant_id, section.file_count, section.total_size_bytes
            );
            manifest = manifest.with_files(section);
        }

        if request.include_configuration {
            let section = configuration::build(self.settings.as_ref(), request.tenant_id, &mut writer, cancel)
                .await
                .map_err(|e| e.into_backup_error("Backup.ConfigFailed", "Configuration backup"))?;

            info!(
                "Configuration backup completed. Tenant: {}, settings: {}",
                request.tenant_id, section.settings_count
            );
            manifest = manifest.with_configuration(section);
        }

        let compression_level = request.compress.then_some(archive_config.compression_level);
        let finished = {
            let manifest = manifest.clone();
            tokio::task::spawn_blocking(move || writer.finish(&manifest, compression_level))
                .await
                .map_err(|e| BackupError::execution("Backup.ExecutionFailed", format!("Archive task failed: {}", e)))?
                .map_err(|e| BackupError::from_archive(e, "Backup.ExecutionFailed", "Failed to finalize archive"))?
        };

        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let file_name = layout::archive_file_name(request.backup_name.trim(), created_at, request.compress);
        let content_type = layout::content_type(request.compress);
        let archive_size = finished.size();

        let stored = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            stored = self.storage.upload(
                request.tenant_id,
                request.backup_id,
                &file_name,
                finished.into_stream(),
                content_type,
            ) => stored,
        };
        let stored = stored.map_err(|e| BackupError::from_storage(e, "Backup.ExecutionFailed", "Failed to upload backup"))?;

        info!(
            "Uploaded backup archive {} ({} bytes) to {} backend at {}",
            file_name, archive_size, stored.backend, stored.storage_path
        );

        Ok(BackupExecutionResult {
            storage_path: stored.storage_path,
            storage_backend: stored.backend,
            size_bytes: stored.size_bytes,
            download_url: stored.download_url,
            duration: start_time.elapsed(),
            manifest,
        })
    }
}
