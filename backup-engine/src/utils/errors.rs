//! Error types for the backup engine.
//!
//! `BackupError` is the only error that crosses the engine's public
//! boundary. Lower layers (archive codec, storage, section builders) have
//! their own error types which are converted at each entry point.

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Malformed request, missing manifest, missing archive section.
    /// Never retried automatically.
    #[error("{message}")]
    Validation { code: &'static str, message: String },

    /// No archive matches the tenant and backup id.
    #[error("{message}")]
    NotFound { code: &'static str, message: String },

    /// A section builder, restorer or the storage backend failed.
    #[error("{message}")]
    Execution { code: &'static str, message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { code, message: message.into() }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound { code, message: message.into() }
    }

    pub fn execution(code: &'static str, message: impl Into<String>) -> Self {
        Self::Execution { code, message: message.into() }
    }

    /// Stable error code, suitable for API responses and notifications.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } | Self::NotFound { code, .. } | Self::Execution { code, .. } => code,
            Self::Cancelled => "Backup.Cancelled",
        }
    }

    /// Whether the caller may re-trigger the whole run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::Cancelled)
    }

    /// Map an archive-level failure to the public taxonomy.
    pub(crate) fn from_archive(err: ArchiveError, code: &'static str, context: &str) -> Self {
        match err {
            ArchiveError::InvalidContainer(msg) => {
                Self::validation("Backup.InvalidFormat", format!("Invalid backup archive format: {}", msg))
            }
            ArchiveError::ManifestMissing => Self::validation("Backup.InvalidFormat", "Backup manifest not found"),
            ArchiveError::ManifestInvalid(msg) => {
                Self::validation("Backup.InvalidManifest", format!("Failed to parse backup manifest: {}", msg))
            }
            ArchiveError::EntryMissing(name) => {
                Self::validation("Backup.InvalidFormat", format!("Archive entry missing: {}", name))
            }
            ArchiveError::Cancelled => Self::Cancelled,
            other => Self::execution(code, format!("{}: {}", context, other)),
        }
    }

    pub(crate) fn from_storage(err: StorageError, code: &'static str, context: &str) -> Self {
        Self::execution(code, format!("{}: {}", context, err))
    }
}

/// Failure inside one section builder or restorer.
///
/// Keeps cancellation distinguishable so it is not reported as an
/// execution failure of the section.
#[derive(Error, Debug)]
pub enum SectionError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Archive(#[from] ArchiveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Mismatch(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

impl SectionError {
    /// Wrap into the public error, prefixing the message with the section label.
    pub fn into_backup_error(self, code: &'static str, label: &str) -> BackupError {
        match self {
            Self::Cancelled | Self::Archive(ArchiveError::Cancelled) => BackupError::Cancelled,
            other => BackupError::execution(code, format!("{} failed: {}", label, other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_retryability() {
        let err = BackupError::not_found("Backup.FileNotFound", "Backup file not found");
        assert_eq!(err.code(), "Backup.FileNotFound");
        assert_eq!(err.to_string(), "Backup file not found");
        assert!(!err.is_retryable());

        let err = BackupError::execution("Backup.ExecutionFailed", "boom");
        assert!(err.is_retryable());
        assert_eq!(BackupError::Cancelled.code(), "Backup.Cancelled");
    }

    #[test]
    fn test_section_error_keeps_cancellation() {
        let err = SectionError::Cancelled.into_backup_error("Backup.DatabaseFailed", "Database backup");
        assert!(matches!(err, BackupError::Cancelled));

        let err = SectionError::Mismatch("row count differs".into())
            .into_backup_error("Backup.DatabaseFailed", "Database backup");
        assert_eq!(err.code(), "Backup.DatabaseFailed");
        assert_eq!(err.to_string(), "Database backup failed: row count differs");
    }

    #[test]
    fn test_missing_manifest_is_validation() {
        let err = BackupError::from_archive(ArchiveError::ManifestMissing, "Backup.RestoreFailed", "Restore");
        assert!(matches!(err, BackupError::Validation { .. }));
        assert_eq!(err.to_string(), "Backup manifest not found");
    }
}
