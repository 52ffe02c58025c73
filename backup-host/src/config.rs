use backup_engine::EngineConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    /// One SQLite file per tenant: `{tenants_dir}/{tenant_id}.db`
    pub tenants_dir: PathBuf,
    /// Finished archives: `{storage_dir}/{tenant_id}/backups/{backup_id}/`
    pub storage_dir: PathBuf,
    /// Tenant object files: `{objects_dir}/{tenant_id}/`
    pub objects_dir: PathBuf,
    pub log_level: String,
    /// Optional TOML file with engine settings
    pub engine_config_path: Option<PathBuf>,
}

impl HostConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));
        let dir = |key: &str, default: &str| {
            std::env::var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join(default))
        };

        Self {
            tenants_dir: dir("TENANTS_DIR", "tenants"),
            storage_dir: dir("BACKUPS_DIR", "backups"),
            objects_dir: dir("OBJECTS_DIR", "objects"),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            engine_config_path: std::env::var("ENGINE_CONFIG").ok().map(PathBuf::from),
            data_dir,
        }
    }

    /// Default layout under a single data directory.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            tenants_dir: data_dir.join("tenants"),
            storage_dir: data_dir.join("backups"),
            objects_dir: data_dir.join("objects"),
            log_level: "info".into(),
            engine_config_path: None,
        }
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        match &self.engine_config_path {
            Some(path) => EngineConfig::from_file(path),
            None => Ok(EngineConfig::default()),
        }
    }
}
