//! Tenant settings stored in the tenant's own database.

use std::sync::Arc;

use async_trait::async_trait;
use backup_engine::sources::{SettingEntry, TenantSettings};
use uuid::Uuid;

use crate::db::connection::TenantPools;
use crate::models::settings;

pub struct SqliteTenantSettings {
    pools: Arc<TenantPools>,
}

impl SqliteTenantSettings {
    pub fn new(pools: Arc<TenantPools>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl TenantSettings for SqliteTenantSettings {
    async fn export_settings(&self, tenant_id: Uuid) -> anyhow::Result<Vec<SettingEntry>> {
        let db = self.pools.get(tenant_id)?;
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            settings::get_all(&conn)?
                .into_iter()
                .map(|row| {
                    let value = serde_json::from_str(&row.value)
                        .map_err(|e| anyhow::anyhow!("setting {}.{} is not valid JSON: {}", row.category, row.key, e))?;
                    Ok(SettingEntry {
                        category: row.category,
                        key: row.key,
                        value,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    async fn import_settings(&self, tenant_id: Uuid, entries: Vec<SettingEntry>) -> anyhow::Result<usize> {
        let db = self.pools.get(tenant_id)?;
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            let tx = conn.transaction()?;
            for entry in &entries {
                settings::set(&tx, &entry.category, &entry.key, &entry.value.to_string())?;
            }
            tx.commit()?;
            Ok::<_, anyhow::Error>(entries.len())
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_export_import() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Arc::new(TenantPools::new(dir.path().to_path_buf()));
        let tenant_id = Uuid::new_v4();
        let pool = pools.create(tenant_id).unwrap();
        settings::set(&pool.get().unwrap(), "general", "timezone", "\"UTC\"").unwrap();

        let store = SqliteTenantSettings::new(pools);
        let exported = store.export_settings(tenant_id).await.unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].value, json!("UTC"));

        let imported = store
            .import_settings(
                tenant_id,
                vec![
                    SettingEntry {
                        category: "general".into(),
                        key: "timezone".into(),
                        value: json!("Europe/Istanbul"),
                    },
                    SettingEntry {
                        category: "inventory".into(),
                        key: "low_stock".into(),
                        value: json!(5),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(imported, 2);

        let conn = pool.get().unwrap();
        assert_eq!(
            settings::get(&conn, "general", "timezone").unwrap().as_deref(),
            Some("\"Europe/Istanbul\"")
        );
        assert_eq!(settings::get_all(&conn).unwrap().len(), 2);
    }
}
