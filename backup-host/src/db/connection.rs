use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::migrate::migrate;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    // Pragmas are per connection, so apply them to every pooled one
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;
    Ok(pool)
}

/// Lazily opened pools, one per tenant database file.
pub struct TenantPools {
    tenants_dir: PathBuf,
    pools: DashMap<Uuid, DbPool>,
}

impl TenantPools {
    pub fn new(tenants_dir: PathBuf) -> Self {
        Self {
            tenants_dir,
            pools: DashMap::new(),
        }
    }

    pub fn db_path(&self, tenant_id: Uuid) -> PathBuf {
        self.tenants_dir.join(format!("{}.db", tenant_id))
    }

    /// Pool of an existing tenant database. Unknown tenants are an error
    /// rather than silently getting an empty database.
    pub fn get(&self, tenant_id: Uuid) -> anyhow::Result<DbPool> {
        if let Some(pool) = self.pools.get(&tenant_id) {
            return Ok(pool.clone());
        }

        let path = self.db_path(tenant_id);
        if !path.is_file() {
            anyhow::bail!("Tenant database not found: {}", path.display());
        }

        let pool = create_pool(&path)?;
        migrate(&pool)?;
        tracing::debug!("[DB] Opened tenant database {}", path.display());

        Ok(self.pools.entry(tenant_id).or_insert(pool).clone())
    }

    /// Create the database file of a new tenant and open it.
    pub fn create(&self, tenant_id: Uuid) -> anyhow::Result<DbPool> {
        std::fs::create_dir_all(&self.tenants_dir)?;
        let path = self.db_path(tenant_id);
        if !path.exists() {
            rusqlite::Connection::open(&path)?;
        }
        self.get(tenant_id)
    }
}
