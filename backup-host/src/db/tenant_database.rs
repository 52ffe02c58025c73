//! SQLite implementation of the tenant database collaborator.
//!
//! Rows travel as JSON arrays. SQLite values map to JSON as follows: NULL,
//! INTEGER, REAL and TEXT map to their JSON counterparts; a BLOB becomes
//! `{"$blob": "<hex>"}`. On the way back, booleans become integers and
//! arrays or objects are stored as JSON text.

use std::sync::Arc;

use async_trait::async_trait;
use backup_engine::sources::{ColumnInfo, Row, RowStream, TenantDatabase};
use futures_util::StreamExt;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connection::{DbPool, TenantPools};
use super::migrate::SETTINGS_TABLE;

const ROW_CHANNEL_CAPACITY: usize = 256;
const BLOB_KEY: &str = "$blob";

pub struct SqliteTenantDatabase {
    pools: Arc<TenantPools>,
}

impl SqliteTenantDatabase {
    pub fn new(pools: Arc<TenantPools>) -> Self {
        Self { pools }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            let mut map = serde_json::Map::new();
            map.insert(BLOB_KEY.to_string(), Value::String(to_hex(b)));
            Value::Object(map)
        }
    }
}

fn from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Object(map) if map.len() == 1 => match map.get(BLOB_KEY).and_then(Value::as_str).and_then(from_hex) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        other => SqlValue::Text(other.to_string()),
    }
}

fn row_stream(rx: mpsc::Receiver<anyhow::Result<Row>>) -> RowStream {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn read_rows(pool: &DbPool, table: &str, tx: &mpsc::Sender<anyhow::Result<Row>>) -> anyhow::Result<()> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
    let width = stmt.column_count();
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i)?));
        }
        if tx.blocking_send(Ok(values)).is_err() {
            // Consumer dropped the stream
            break;
        }
    }
    Ok(())
}

enum RowMessage {
    Row(Row),
    End,
}

fn write_rows(
    pool: &DbPool,
    table: &str,
    columns: &[ColumnInfo],
    mut rx: mpsc::Receiver<RowMessage>,
) -> anyhow::Result<u64> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let table_ident = quote_ident(table);

    tx.execute(&format!("DELETE FROM {}", table_ident), [])?;

    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let mut count = 0u64;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table_ident,
            names.join(", "),
            placeholders.join(", ")
        ))?;

        loop {
            match rx.blocking_recv() {
                Some(RowMessage::Row(row)) => {
                    if row.len() != columns.len() {
                        anyhow::bail!("row has {} values, {} has {} columns", row.len(), table, columns.len());
                    }
                    let values: Vec<SqlValue> = row.iter().map(from_json).collect();
                    stmt.execute(rusqlite::params_from_iter(values.iter()))?;
                    count += 1;
                }
                Some(RowMessage::End) => break,
                // Dropping the transaction rolls back
                None => anyhow::bail!("row stream for {} ended early", table),
            }
        }
    }

    tx.commit()?;
    Ok(count)
}

#[async_trait]
impl TenantDatabase for SqliteTenantDatabase {
    async fn database_name(&self, tenant_id: Uuid) -> anyhow::Result<String> {
        let path = self.pools.db_path(tenant_id);
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| tenant_id.to_string()))
    }

    async fn list_tables(&self, tenant_id: Uuid) -> anyhow::Result<Vec<String>> {
        let pool = self.pools.get(tenant_id)?;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1
                 ORDER BY rowid",
            )?;
            let tables = stmt
                .query_map([SETTINGS_TABLE], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, anyhow::Error>(tables)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    async fn table_columns(&self, tenant_id: Uuid, table: &str) -> anyhow::Result<Vec<ColumnInfo>> {
        let pool = self.pools.get(tenant_id)?;
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
            let columns = stmt
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                        nullable: row.get::<_, i64>(3)? == 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            if columns.is_empty() {
                anyhow::bail!("Table not found: {}", table);
            }
            Ok::<_, anyhow::Error>(columns)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    async fn stream_rows(&self, tenant_id: Uuid, table: &str) -> anyhow::Result<RowStream> {
        let pool = self.pools.get(tenant_id)?;
        let table = table.to_string();
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = read_rows(&pool, &table, &tx) {
                let _ = tx.blocking_send(Err(e.context(format!("Failed to read table {}", table))));
            }
        });

        Ok(row_stream(rx))
    }

    async fn replace_table_rows(
        &self,
        tenant_id: Uuid,
        table: &str,
        columns: &[ColumnInfo],
        mut rows: RowStream,
    ) -> anyhow::Result<u64> {
        let pool = self.pools.get(tenant_id)?;
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let writer = {
            let table = table.to_string();
            let columns = columns.to_vec();
            tokio::task::spawn_blocking(move || write_rows(&pool, &table, &columns, rx))
        };

        let mut feed_error = None;
        while let Some(item) = rows.next().await {
            match item {
                Ok(row) => {
                    if tx.send(RowMessage::Row(row)).await.is_err() {
                        // Writer failed; its error is returned below
                        break;
                    }
                }
                Err(e) => {
                    feed_error = Some(e);
                    break;
                }
            }
        }
        if feed_error.is_none() {
            let _ = tx.send(RowMessage::End).await;
        }
        drop(tx);

        let written = writer.await.map_err(|e| anyhow::anyhow!(e))?;
        if let Some(e) = feed_error {
            return Err(e.context(format!("Restore of table {} rolled back", table)));
        }
        let written = written?;
        tracing::debug!("[DB] Replaced {} rows in {} for tenant {}", written, table, tenant_id);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn setup() -> (tempfile::TempDir, Arc<TenantPools>, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let pools = Arc::new(TenantPools::new(dir.path().to_path_buf()));
        let tenant_id = Uuid::new_v4();
        let pool = pools.create(tenant_id).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL, note TEXT, scan BLOB);
                 CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO orders VALUES (1, 10.5, 'first', x'00ff'), (2, 20.0, NULL, NULL);
                 INSERT INTO customers VALUES (1, 'Ada');",
            )
            .unwrap();
        (dir, pools, tenant_id)
    }

    async fn collect(stream: RowStream) -> Vec<Row> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[test]
    fn test_value_mapping() {
        assert_eq!(from_hex(&to_hex(&[0, 1, 254, 255])), Some(vec![0, 1, 254, 255]));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_json(&json!(true)), SqlValue::Integer(1));
        assert_eq!(from_json(&json!({"$blob": "00ff"})), SqlValue::Blob(vec![0, 255]));
        assert_eq!(from_json(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".to_string()));
        assert_eq!(to_json(ValueRef::Integer(7)), json!(7));
    }

    #[tokio::test]
    async fn test_catalog_and_rows() {
        let (_dir, pools, tenant_id) = setup();
        let db = SqliteTenantDatabase::new(pools);

        assert_eq!(db.list_tables(tenant_id).await.unwrap(), vec!["orders", "customers"]);

        let columns = db.table_columns(tenant_id, "customers").await.unwrap();
        assert_eq!(columns[1].name, "name");
        assert!(!columns[1].nullable);
        assert!(db.table_columns(tenant_id, "missing").await.is_err());

        let rows = collect(db.stream_rows(tenant_id, "orders").await.unwrap()).await;
        assert_eq!(rows[0], vec![json!(1), json!(10.5), json!("first"), json!({"$blob": "00ff"})]);
        assert_eq!(rows[1][2], Value::Null);
    }

    #[tokio::test]
    async fn test_replace_round_trip() {
        let (_dir, pools, tenant_id) = setup();
        let db = SqliteTenantDatabase::new(pools);
        let columns = db.table_columns(tenant_id, "orders").await.unwrap();
        let original = collect(db.stream_rows(tenant_id, "orders").await.unwrap()).await;

        let rows: RowStream = stream::iter(original.clone().into_iter().map(Ok)).boxed();
        let written = db.replace_table_rows(tenant_id, "orders", &columns, rows).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(collect(db.stream_rows(tenant_id, "orders").await.unwrap()).await, original);
    }

    #[tokio::test]
    async fn test_failed_stream_rolls_back() {
        let (_dir, pools, tenant_id) = setup();
        let db = SqliteTenantDatabase::new(pools);
        let columns = db.table_columns(tenant_id, "customers").await.unwrap();

        let rows: RowStream = stream::iter(vec![
            Ok(vec![json!(5), json!("Grace")]),
            Err(anyhow::anyhow!("archive truncated")),
        ])
        .boxed();
        assert!(db.replace_table_rows(tenant_id, "customers", &columns, rows).await.is_err());

        let rows = collect(db.stream_rows(tenant_id, "customers").await.unwrap()).await;
        assert_eq!(rows, vec![vec![json!(1), json!("Ada")]]);
    }
}
