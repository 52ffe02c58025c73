use crate::db::connection::DbPool;

/// Host-owned tables inside every tenant database.
pub const SETTINGS_TABLE: &str = "tenant_settings";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_settings (
  category TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL DEFAULT 'null',
  updated_at TEXT NOT NULL DEFAULT (datetime('now')),
  PRIMARY KEY (category, key)
);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for databases created before updated_at existed
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", SETTINGS_TABLE))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    if !columns.iter().any(|c| c == "updated_at") {
        conn.execute_batch("ALTER TABLE tenant_settings ADD COLUMN updated_at TEXT NOT NULL DEFAULT ''")?;
    }

    Ok(())
}
