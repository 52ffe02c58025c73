//! Two-phase restore.
//!
//! `prepare_restore` downloads and stages the archive and computes the
//! plan. `execute_restore` checks every planned section end to end without
//! writing anything. Only `apply_restore`, given a confirmation naming the
//! tenant and backup, writes into the tenant's environment, and only after
//! the same checks passed for every planned section.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::manifest::{Manifest, Section, SectionManifest};
use super::{describe_failure, ArchiveLookup, BackupExecutor, OpenError};
use crate::archive::ArchiveReader;
use crate::sections::{configuration, database, files, RestoreMode};
use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub tenant_id: Uuid,
    pub backup_id: Uuid,
    pub restore_database: bool,
    pub restore_files: bool,
    pub restore_configuration: bool,
}

impl RestoreRequest {
    pub fn wants(&self, section: Section) -> bool {
        match section {
            Section::Database => self.restore_database,
            Section::Files => self.restore_files,
            Section::Configuration => self.restore_configuration,
        }
    }
}

/// Caller's explicit consent to overwrite the named tenant from the named
/// backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfirmation {
    pub tenant_id: Uuid,
    pub backup_id: Uuid,
}

impl RestoreConfirmation {
    pub fn new(tenant_id: Uuid, backup_id: Uuid) -> Self {
        Self { tenant_id, backup_id }
    }
}

/// A downloaded, parsed archive and the sections a restore would touch.
pub struct PreparedRestore {
    request: RestoreRequest,
    file_name: String,
    manifest: Manifest,
    plan: Vec<Section>,
    reader: ArchiveReader,
}

impl PreparedRestore {
    pub fn request(&self) -> &RestoreRequest {
        &self.request
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Sections both requested and present in the archive, in processing
    /// order.
    pub fn plan(&self) -> &[Section] {
        &self.plan
    }

    /// What each planned section will write, as declared by the manifest.
    pub fn planned_sections(&self) -> impl Iterator<Item = SectionManifest<'_>> {
        self.plan.iter().filter_map(|s| self.manifest.section(*s))
    }
}

impl std::fmt::Debug for PreparedRestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRestore")
            .field("tenant_id", &self.request.tenant_id)
            .field("backup_id", &self.request.backup_id)
            .field("file_name", &self.file_name)
            .field("plan", &self.plan)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SectionOutcome {
    /// Not requested, or not in the archive
    Skipped,
    /// Payload read and checked; nothing written
    Verified { items: u64 },
    Restored { items: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionReport {
    pub section: Section,
    pub outcome: SectionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub tenant_id: Uuid,
    pub backup_id: Uuid,
    pub mode: RestoreMode,
    pub sections: Vec<SectionReport>,
    pub duration: Duration,
}

impl RestoreReport {
    pub fn outcome(&self, section: Section) -> Option<SectionOutcome> {
        self.sections.iter().find(|r| r.section == section).map(|r| r.outcome)
    }
}

impl BackupExecutor {
    /// Download and stage the archive of a backup. Writes nothing.
    pub async fn prepare_restore(&self, request: RestoreRequest, cancel: &CancellationToken) -> Result<PreparedRestore> {
        info!(
            "Preparing restore. Tenant: {}, backup: {}",
            request.tenant_id, request.backup_id
        );
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let file = match self.find_archive(request.tenant_id, request.backup_id).await {
            Ok(ArchiveLookup::Found(file)) => file,
            Ok(ArchiveLookup::NoFiles) | Ok(ArchiveLookup::NoArchive) => {
                return Err(BackupError::not_found("Backup.FileNotFound", "Backup file not found"));
            }
            Err(e) => {
                return Err(BackupError::from_storage(e, "Backup.RestoreFailed", "Failed to list backup files"));
            }
        };

        let mut reader = self
            .open_archive(request.tenant_id, request.backup_id, &file, cancel)
            .await
            .map_err(|e| match e {
                OpenError::Download(e) => BackupError::from_storage(e, "Backup.RestoreFailed", "Failed to download backup"),
                OpenError::Archive(e) => BackupError::from_archive(e, "Backup.RestoreFailed", "Failed to read backup"),
            })?;

        let manifest = reader
            .blocking(|r| r.read_manifest())
            .await
            .and_then(|manifest| manifest)
            .map_err(|e| BackupError::from_archive(e, "Backup.RestoreFailed", "Failed to read backup manifest"))?;

        if manifest.tenant_id != request.tenant_id || manifest.backup_id != request.backup_id {
            return Err(BackupError::validation(
                "Backup.InvalidManifest",
                format!(
                    "Backup manifest belongs to tenant {}, backup {}",
                    manifest.tenant_id, manifest.backup_id
                ),
            ));
        }

        let plan: Vec<Section> = Section::ALL
            .into_iter()
            .filter(|s| request.wants(*s) && manifest.includes(*s))
            .collect();

        info!(
            "Restore prepared from {}. Tenant: {}, backup: {}, sections: {:?}",
            file.file_name, request.tenant_id, request.backup_id, plan
        );

        Ok(PreparedRestore {
            request,
            file_name: file.file_name,
            manifest,
            plan,
            reader,
        })
    }

    /// Check every planned section end to end without writing anything.
    pub async fn execute_restore(&self, request: RestoreRequest, cancel: &CancellationToken) -> Result<RestoreReport> {
        let start_time = Instant::now();
        let (tenant_id, backup_id) = (request.tenant_id, request.backup_id);

        let result = match self.prepare_restore(request, cancel).await {
            Ok(mut prepared) => self.run_sections(&mut prepared, RestoreMode::DryRun, cancel).await,
            Err(e) => Err(e),
        };

        let report = self.finish_restore(tenant_id, backup_id, RestoreMode::DryRun, result, start_time)?;
        if matches!(report.outcome(Section::Database), Some(SectionOutcome::Verified { .. })) {
            warn!(
                "Database dump verified but not applied. Tenant: {}, backup: {}",
                tenant_id, backup_id
            );
        }
        Ok(report)
    }

    /// Write the prepared archive into the tenant's environment.
    ///
    /// `confirmation` must name the same tenant and backup as the prepared
    /// restore. Every planned section is checked end to end before the
    /// first write, so a corrupt payload in any section leaves the tenant
    /// untouched. A section failing while writing stops the sequence;
    /// sections already restored stay restored.
    pub async fn apply_restore(
        &self,
        mut prepared: PreparedRestore,
        confirmation: &RestoreConfirmation,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let start_time = Instant::now();
        let (tenant_id, backup_id) = (prepared.request.tenant_id, prepared.request.backup_id);

        if confirmation.tenant_id != tenant_id || confirmation.backup_id != backup_id {
            return Err(BackupError::validation(
                "Backup.ConfirmationMismatch",
                format!(
                    "Restore confirmation does not match tenant {}, backup {}",
                    tenant_id, backup_id
                ),
            ));
        }

        info!("Applying restore. Tenant: {}, backup: {}", tenant_id, backup_id);
        let result = match self.run_sections(&mut prepared, RestoreMode::DryRun, cancel).await {
            Ok(_) => self.run_sections(&mut prepared, RestoreMode::Applied, cancel).await,
            Err(e) => Err(e),
        };
        self.finish_restore(tenant_id, backup_id, RestoreMode::Applied, result, start_time)
    }

    async fn run_sections(
        &self,
        prepared: &mut PreparedRestore,
        mode: RestoreMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<SectionReport>> {
        let tenant_id = prepared.request.tenant_id;
        let spool_threshold = self.config.archive.spool_threshold_bytes;
        let mut reports = Vec::with_capacity(Section::ALL.len());

        for section in Section::ALL {
            let planned = prepared.plan.contains(&section);
            let sub_manifest = prepared.manifest.section(section);
            let (true, Some(sub_manifest)) = (planned, sub_manifest) else {
                reports.push(SectionReport {
                    section,
                    outcome: SectionOutcome::Skipped,
                });
                continue;
            };

            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let reader = &mut prepared.reader;
            let items = match sub_manifest {
                SectionManifest::Database(m) => {
                    database::restore(reader, m, mode, self.database.as_ref(), tenant_id, cancel)
                        .await
                        .map_err(|e| e.into_backup_error("Backup.RestoreDbFailed", "Database restore"))?
                }
                SectionManifest::Files(m) => {
                    files::restore(reader, m, mode, self.objects.as_ref(), tenant_id, spool_threshold, cancel)
                        .await
                        .map_err(|e| e.into_backup_error("Backup.RestoreFilesFailed", "Files restore"))?
                }
                SectionManifest::Configuration(m) => {
                    configuration::restore(reader, m, mode, self.settings.as_ref(), tenant_id, cancel)
                        .await
                        .map_err(|e| e.into_backup_error("Backup.RestoreConfigFailed", "Configuration restore"))?
                }
            };

            info!(
                "Section {} {}: {} items. Tenant: {}",
                section,
                if mode == RestoreMode::Applied { "restored" } else { "verified" },
                items,
                tenant_id
            );
            let outcome = match mode {
                RestoreMode::DryRun => SectionOutcome::Verified { items },
                RestoreMode::Applied => SectionOutcome::Restored { items },
            };
            reports.push(SectionReport { section, outcome });
        }

        Ok(reports)
    }

    fn finish_restore(
        &self,
        tenant_id: Uuid,
        backup_id: Uuid,
        mode: RestoreMode,
        result: Result<Vec<SectionReport>>,
        start_time: Instant,
    ) -> Result<RestoreReport> {
        match result {
            Ok(sections) => {
                let report = RestoreReport {
                    tenant_id,
                    backup_id,
                    mode,
                    sections,
                    duration: start_time.elapsed(),
                };
                info!(
                    "Restore execution completed ({:?}). Tenant: {}, backup: {}, duration: {:?}",
                    mode, tenant_id, backup_id, report.duration
                );
                Ok(report)
            }
            Err(e @ BackupError::Cancelled) => {
                warn!(
                    "Restore execution ({:?}) {}. Tenant: {}, backup: {}",
                    mode,
                    describe_failure(&e, start_time.elapsed()),
                    tenant_id,
                    backup_id
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    "Restore execution ({:?}) {}. Tenant: {}, backup: {}",
                    mode,
                    describe_failure(&e, start_time.elapsed()),
                    tenant_id,
                    backup_id
                );
                Err(e)
            }
        }
    }
}
