//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// zstd level used when a request asks for compression (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Archive bytes kept in memory before spilling to a temp file
    #[serde(default = "default_spool_threshold")]
    pub spool_threshold_bytes: usize,

    /// Buffer size of the byte copy loops
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Sort table names before export. Catalog order is kept otherwise,
    /// which is not guaranteed stable across runs.
    #[serde(default)]
    pub sort_tables: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Object key prefixes left out of the files section
    #[serde(default = "default_excluded_prefixes")]
    pub excluded_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_compression_level() -> i32 {
    3
}

fn default_spool_threshold() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_copy_buffer_size() -> usize {
    64 * 1024
}

fn default_excluded_prefixes() -> Vec<String> {
    vec!["backups/".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            spool_threshold_bytes: default_spool_threshold(),
            copy_buffer_size: default_copy_buffer_size(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { sort_tables: false }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            excluded_prefixes: default_excluded_prefixes(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        if !(1..=22).contains(&config.archive.compression_level) {
            anyhow::bail!(
                "archive.compression_level must be between 1 and 22, got {}",
                config.archive.compression_level
            );
        }
        if config.archive.copy_buffer_size == 0 {
            anyhow::bail!("archive.copy_buffer_size must be greater than zero");
        }
        Ok(config)
    }
}
