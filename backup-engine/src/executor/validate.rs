//! Read-only validation of a stored backup.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::manifest::{Manifest, SectionManifest};
use super::{ArchiveLookup, BackupExecutor, OpenError};
use crate::archive::{layout, ArchiveError, ArchiveReader};
use crate::sections::files::FilesIndex;
use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct BackupValidationResult {
    pub is_valid: bool,
    pub is_restorable: bool,
    pub error_message: Option<String>,
    pub manifest: Option<Manifest>,
}

impl BackupValidationResult {
    fn valid(manifest: Manifest) -> Self {
        Self {
            is_valid: true,
            is_restorable: true,
            error_message: None,
            manifest: Some(manifest),
        }
    }

    fn invalid(message: impl Into<String>, manifest: Option<Manifest>) -> Self {
        Self {
            is_valid: false,
            is_restorable: false,
            error_message: Some(message.into()),
            manifest,
        }
    }
}

/// Payload entries each declared section needs, reported by name.
///
/// Reads the files index, so it runs on the blocking pool.
fn missing_payloads(reader: &mut ArchiveReader, manifest: &Manifest) -> Vec<String> {
    let mut missing = Vec::new();

    for section in manifest.sections() {
        match section {
            SectionManifest::Database(db) => {
                if !reader.contains(layout::DATABASE_DUMP) {
                    missing.push("Database dump file missing".to_string());
                }
                if !reader.contains(layout::DATABASE_SCHEMA) {
                    missing.push("Database schema summary missing".to_string());
                }
                for table in &db.tables {
                    if !reader.contains(&layout::table_entry(table)) {
                        missing.push(format!("Table data missing: {}", table));
                    }
                }
            }
            SectionManifest::Files(_) => {
                if !reader.contains(layout::FILES_INDEX) {
                    missing.push("Files index missing".to_string());
                    continue;
                }
                match reader.read_json::<FilesIndex>(layout::FILES_INDEX) {
                    Ok(index) => {
                        for file in &index.files {
                            if !reader.contains(&layout::object_entry(&file.key)) {
                                missing.push(format!("File data missing: {}", file.key));
                            }
                        }
                    }
                    Err(e) => missing.push(format!("Files index unreadable: {}", e)),
                }
            }
            SectionManifest::Configuration(_) => {
                if !reader.contains(layout::CONFIG_SETTINGS) {
                    missing.push("Configuration settings missing".to_string());
                }
            }
        }
    }

    missing
}

impl BackupExecutor {
    /// Check that a stored backup is complete and restorable.
    ///
    /// Problems with the backup itself are reported as an invalid result;
    /// only cancellation is an error. Never writes anything.
    pub async fn validate_backup(
        &self,
        tenant_id: Uuid,
        backup_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<BackupValidationResult> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let file = match self.find_archive(tenant_id, backup_id).await {
            Ok(ArchiveLookup::Found(file)) => file,
            Ok(ArchiveLookup::NoFiles) => {
                return Ok(BackupValidationResult::invalid("Backup files not found", None));
            }
            Ok(ArchiveLookup::NoArchive) => {
                return Ok(BackupValidationResult::invalid("Backup archive not found", None));
            }
            Err(e) => {
                warn!("Listing backup files failed. Tenant: {}, backup: {}: {}", tenant_id, backup_id, e);
                return Ok(BackupValidationResult::invalid("Backup files not found", None));
            }
        };

        let mut reader = match self.open_archive(tenant_id, backup_id, &file, cancel).await {
            Ok(reader) => reader,
            Err(OpenError::Archive(ArchiveError::Cancelled)) => return Err(BackupError::Cancelled),
            Err(OpenError::Download(e)) => {
                warn!("Downloading {} for validation failed: {}", file.file_name, e);
                return Ok(BackupValidationResult::invalid(
                    "Failed to download backup for validation",
                    None,
                ));
            }
            Err(OpenError::Archive(e)) => {
                warn!("Backup archive {} is unreadable: {}", file.file_name, e);
                return Ok(BackupValidationResult::invalid("Invalid backup archive format", None));
            }
        };

        let manifest = match reader.blocking(|r| r.read_manifest()).await.and_then(|manifest| manifest) {
            Ok(manifest) => manifest,
            Err(ArchiveError::Cancelled) => return Err(BackupError::Cancelled),
            Err(ArchiveError::ManifestMissing) => {
                return Ok(BackupValidationResult::invalid("Backup manifest not found", None));
            }
            Err(e) => {
                warn!("Backup manifest of {} is invalid: {}", file.file_name, e);
                return Ok(BackupValidationResult::invalid("Invalid manifest format", None));
            }
        };

        if manifest.tenant_id != tenant_id || manifest.backup_id != backup_id {
            return Ok(BackupValidationResult::invalid(
                format!(
                    "Manifest belongs to tenant {}, backup {}",
                    manifest.tenant_id, manifest.backup_id
                ),
                Some(manifest),
            ));
        }

        let missing = {
            let manifest = manifest.clone();
            match reader.blocking(move |r| missing_payloads(r, &manifest)).await {
                Ok(missing) => missing,
                Err(e) => vec![format!("Archive unreadable: {}", e)],
            }
        };
        if !missing.is_empty() {
            return Ok(BackupValidationResult::invalid(missing.join("; "), Some(manifest)));
        }

        info!(
            "Backup validated. Tenant: {}, backup: {}, archive: {}",
            tenant_id, backup_id, file.file_name
        );
        Ok(BackupValidationResult::valid(manifest))
    }
}
