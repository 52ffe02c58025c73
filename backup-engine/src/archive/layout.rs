//! Fixed entry names and archive file naming.
//!
//! These names are part of the archive format: writers and readers on
//! either side must agree on them byte for byte.

use chrono::{DateTime, Utc};

pub const MANIFEST: &str = "manifest.json";

pub const DATABASE_SCHEMA: &str = "database/schema.json";
pub const DATABASE_DUMP: &str = "database/dump.sql";
pub const DATABASE_TABLES_PREFIX: &str = "database/tables/";

pub const FILES_INDEX: &str = "files/index.json";
pub const FILES_OBJECTS_PREFIX: &str = "files/objects/";

pub const CONFIG_SETTINGS: &str = "config/settings.json";

pub const TAR_EXTENSION: &str = ".tar";
pub const TAR_ZSTD_EXTENSION: &str = ".tar.zst";

pub const TAR_CONTENT_TYPE: &str = "application/x-tar";
pub const ZSTD_CONTENT_TYPE: &str = "application/zstd";

/// Entry holding the rows of one table, one JSON array per line.
pub fn table_entry(table: &str) -> String {
    format!("{}{}.jsonl", DATABASE_TABLES_PREFIX, table)
}

/// Entry holding the bytes of one tenant object.
pub fn object_entry(key: &str) -> String {
    format!("{}{}", FILES_OBJECTS_PREFIX, key)
}

/// `{backup_name}_{yyyyMMdd_HHmmss}.tar[.zst]`
pub fn archive_file_name(backup_name: &str, created_at: DateTime<Utc>, compressed: bool) -> String {
    let extension = if compressed { TAR_ZSTD_EXTENSION } else { TAR_EXTENSION };
    format!("{}_{}{}", backup_name, created_at.format("%Y%m%d_%H%M%S"), extension)
}

pub fn content_type(compressed: bool) -> &'static str {
    if compressed {
        ZSTD_CONTENT_TYPE
    } else {
        TAR_CONTENT_TYPE
    }
}

pub fn is_archive_file(file_name: &str) -> bool {
    file_name.ends_with(TAR_EXTENSION) || file_name.ends_with(TAR_ZSTD_EXTENSION)
}
