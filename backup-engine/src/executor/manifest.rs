//! Manifest types.
//!
//! The manifest records which sections an archive holds and their summary
//! statistics. It is serialized as `manifest.json`, the first entry of
//! every archive.
//!
//! In memory, a section is included exactly when its sub-manifest is
//! present. The JSON document additionally carries explicit `Includes*`
//! flags for readers that only look at those; parsing rejects documents
//! where a flag disagrees with its sub-manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::archive::ArchiveError;

/// An independently included unit of backup/restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Database,
    Files,
    Configuration,
}

impl Section {
    /// Processing order for backup, restore and validation.
    pub const ALL: [Section; 3] = [Section::Database, Section::Files, Section::Configuration];

    pub fn name(&self) -> &'static str {
        match self {
            Section::Database => "database",
            Section::Files => "files",
            Section::Configuration => "configuration",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseManifest {
    pub table_count: usize,
    pub total_rows: u64,
    /// Uncompressed bytes of all table payloads
    pub size_bytes: u64,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilesManifest {
    pub file_count: u64,
    pub folder_count: u64,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigurationManifest {
    pub settings_count: usize,
    pub categories: Vec<String>,
}

/// Borrowed view of one included section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SectionManifest<'a> {
    Database(&'a DatabaseManifest),
    Files(&'a FilesManifest),
    Configuration(&'a ConfigurationManifest),
}

impl SectionManifest<'_> {
    pub fn section(&self) -> Section {
        match self {
            SectionManifest::Database(_) => Section::Database,
            SectionManifest::Files(_) => Section::Files,
            SectionManifest::Configuration(_) => Section::Configuration,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub backup_id: Uuid,
    pub tenant_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub backup_type: String,
    pub is_compressed: bool,
    pub is_encrypted: bool,
    pub database: Option<DatabaseManifest>,
    pub files: Option<FilesManifest>,
    pub configuration: Option<ConfigurationManifest>,
}

impl Manifest {
    pub fn new(
        backup_id: Uuid,
        tenant_id: Uuid,
        created_at: DateTime<Utc>,
        backup_type: String,
        is_compressed: bool,
    ) -> Self {
        Self {
            backup_id,
            tenant_id,
            created_at,
            backup_type,
            is_compressed,
            is_encrypted: false,
            database: None,
            files: None,
            configuration: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseManifest) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_files(mut self, files: FilesManifest) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_configuration(mut self, configuration: ConfigurationManifest) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn includes(&self, section: Section) -> bool {
        self.section(section).is_some()
    }

    pub fn includes_database(&self) -> bool {
        self.database.is_some()
    }

    pub fn includes_files(&self) -> bool {
        self.files.is_some()
    }

    pub fn includes_configuration(&self) -> bool {
        self.configuration.is_some()
    }

    pub fn section(&self, section: Section) -> Option<SectionManifest<'_>> {
        match section {
            Section::Database => self.database.as_ref().map(SectionManifest::Database),
            Section::Files => self.files.as_ref().map(SectionManifest::Files),
            Section::Configuration => self.configuration.as_ref().map(SectionManifest::Configuration),
        }
    }

    /// Included sections in processing order.
    pub fn sections(&self) -> impl Iterator<Item = SectionManifest<'_>> {
        Section::ALL.into_iter().filter_map(move |s| self.section(s))
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(&ManifestDocument::from(self))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let document: ManifestDocument =
            serde_json::from_slice(bytes).map_err(|e| ArchiveError::ManifestInvalid(e.to_string()))?;
        Manifest::try_from(document)
    }
}

/// Wire form of the manifest.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestDocument {
    backup_id: Uuid,
    tenant_id: Uuid,
    created_at: DateTime<Utc>,
    backup_type: String,
    includes_database: bool,
    includes_files: bool,
    includes_configuration: bool,
    is_compressed: bool,
    is_encrypted: bool,
    database: Option<DatabaseManifest>,
    files: Option<FilesManifest>,
    configuration: Option<ConfigurationManifest>,
}

impl From<&Manifest> for ManifestDocument {
    fn from(manifest: &Manifest) -> Self {
        Self {
            backup_id: manifest.backup_id,
            tenant_id: manifest.tenant_id,
            created_at: manifest.created_at,
            backup_type: manifest.backup_type.clone(),
            includes_database: manifest.includes_database(),
            includes_files: manifest.includes_files(),
            includes_configuration: manifest.includes_configuration(),
            is_compressed: manifest.is_compressed,
            is_encrypted: manifest.is_encrypted,
            database: manifest.database.clone(),
            files: manifest.files.clone(),
            configuration: manifest.configuration.clone(),
        }
    }
}

fn check_flag(flag: bool, present: bool, key: &str) -> Result<(), ArchiveError> {
    match (flag, present) {
        (true, false) => Err(ArchiveError::ManifestInvalid(format!(
            "Includes{} is true but {} is missing",
            key, key
        ))),
        (false, true) => Err(ArchiveError::ManifestInvalid(format!(
            "Includes{} is false but {} is present",
            key, key
        ))),
        _ => Ok(()),
    }
}

impl TryFrom<ManifestDocument> for Manifest {
    type Error = ArchiveError;

    fn try_from(doc: ManifestDocument) -> Result<Self, Self::Error> {
        check_flag(doc.includes_database, doc.database.is_some(), "Database")?;
        check_flag(doc.includes_files, doc.files.is_some(), "Files")?;
        check_flag(doc.includes_configuration, doc.configuration.is_some(), "Configuration")?;

        if let Some(db) = &doc.database {
            if db.table_count != db.tables.len() {
                return Err(ArchiveError::ManifestInvalid(format!(
                    "Database.TableCount is {} but {} tables are listed",
                    db.table_count,
                    db.tables.len()
                )));
            }
        }

        Ok(Manifest {
            backup_id: doc.backup_id,
            tenant_id: doc.tenant_id,
            created_at: doc.created_at,
            backup_type: doc.backup_type,
            is_compressed: doc.is_compressed,
            is_encrypted: doc.is_encrypted,
            database: doc.database,
            files: doc.files,
            configuration: doc.configuration,
        })
    }
}
