use rusqlite::{params, Connection};

/// One row of `tenant_settings`; `value` is JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingRow {
    pub category: String,
    pub key: String,
    pub value: String,
}

pub fn get(conn: &Connection, category: &str, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM tenant_settings WHERE category = ?1 AND key = ?2")?;
    let mut rows = stmt.query_map(params![category, key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

pub fn set(conn: &Connection, category: &str, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO tenant_settings (category, key, value, updated_at) VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(category, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

pub fn get_all(conn: &Connection) -> anyhow::Result<Vec<SettingRow>> {
    let mut stmt = conn.prepare("SELECT category, key, value FROM tenant_settings ORDER BY category, key")?;
    let rows = stmt.query_map([], |row| {
        Ok(SettingRow {
            category: row.get(0)?,
            key: row.get(1)?,
            value: row.get(2)?,
        })
    })?;
    let mut settings = Vec::new();
    for r in rows {
        settings.push(r?);
    }
    Ok(settings)
}
