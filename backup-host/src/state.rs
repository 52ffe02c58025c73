use std::sync::Arc;

use backup_engine::BackupExecutor;

use crate::config::HostConfig;
use crate::db::connection::TenantPools;
use crate::db::tenant_database::SqliteTenantDatabase;
use crate::services::local_storage::LocalBackupStorage;
use crate::services::object_store::LocalObjectStore;
use crate::services::tenant_settings::SqliteTenantSettings;

/// Everything a caller needs to run backups against the local host.
pub struct HostState {
    pub config: HostConfig,
    pub pools: Arc<TenantPools>,
    pub executor: BackupExecutor,
}

impl HostState {
    /// Create the data directories and wire the local collaborators into
    /// an executor.
    pub fn new(config: HostConfig) -> anyhow::Result<Self> {
        for dir in [&config.data_dir, &config.tenants_dir, &config.storage_dir, &config.objects_dir] {
            std::fs::create_dir_all(dir)?;
        }

        let engine_config = config.engine_config()?;
        let pools = Arc::new(TenantPools::new(config.tenants_dir.clone()));

        let executor = BackupExecutor::new(
            Arc::new(LocalBackupStorage::new(config.storage_dir.clone())),
            Arc::new(SqliteTenantDatabase::new(pools.clone())),
            Arc::new(LocalObjectStore::new(config.objects_dir.clone())),
            Arc::new(SqliteTenantSettings::new(pools.clone())),
            engine_config,
        );

        tracing::info!(
            "[Host] Ready. Tenants: {}, backups: {}, objects: {}",
            config.tenants_dir.display(),
            config.storage_dir.display(),
            config.objects_dir.display()
        );

        Ok(Self {
            config,
            pools,
            executor,
        })
    }

    /// Install the global log subscriber at the configured level.
    pub fn init_logging(&self) -> anyhow::Result<()> {
        backup_engine::utils::logger::init(&self.config.log_level)
    }
}
