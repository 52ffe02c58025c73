//! Tenant Backup Engine
//!
//! Builds self-describing backup archives of a tenant's database, object
//! storage and settings, validates stored archives, and restores them in two
//! phases (verify, then apply on explicit confirmation).

pub mod archive;
pub mod config;
pub mod executor;
pub mod sections;
pub mod sources;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::EngineConfig;
pub use executor::{
    BackupExecutionResult, BackupExecutor, BackupRequest, BackupValidationResult, Manifest, PreparedRestore,
    RestoreConfirmation, RestoreReport, RestoreRequest, Section, SectionOutcome,
};
pub use sections::RestoreMode;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
