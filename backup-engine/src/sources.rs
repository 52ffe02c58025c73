//! Tenant-side collaborators: the relational database, the object store and
//! the settings store a backup reads from and a restore writes back to.
//!
//! Every call is scoped to one tenant and made per run; the engine keeps no
//! cache of anything these return.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::archive::ByteStream;

/// One table row, column values in declaration order.
pub type Row = Vec<serde_json::Value>;

pub type RowStream = BoxStream<'static, anyhow::Result<Row>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[async_trait]
pub trait TenantDatabase: Send + Sync {
    /// Name of the tenant's database, for the dump header.
    async fn database_name(&self, tenant_id: Uuid) -> anyhow::Result<String>;

    /// Base tables of the tenant schema, in catalog order.
    async fn list_tables(&self, tenant_id: Uuid) -> anyhow::Result<Vec<String>>;

    async fn table_columns(&self, tenant_id: Uuid, table: &str) -> anyhow::Result<Vec<ColumnInfo>>;

    async fn stream_rows(&self, tenant_id: Uuid, table: &str) -> anyhow::Result<RowStream>;

    /// Replace the contents of `table` with `rows`, atomically per table.
    /// Returns the number of rows written.
    async fn replace_table_rows(
        &self,
        tenant_id: Uuid,
        table: &str,
        columns: &[ColumnInfo],
        rows: RowStream,
    ) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectInfo {
    /// Key relative to the tenant root, `/`-separated
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait TenantObjectStore: Send + Sync {
    async fn list_objects(&self, tenant_id: Uuid) -> anyhow::Result<Vec<ObjectInfo>>;

    async fn open_object(&self, tenant_id: Uuid, key: &str) -> anyhow::Result<ByteStream>;

    async fn put_object(&self, tenant_id: Uuid, key: &str, body: ByteStream) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SettingEntry {
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait TenantSettings: Send + Sync {
    async fn export_settings(&self, tenant_id: Uuid) -> anyhow::Result<Vec<SettingEntry>>;

    /// Upsert every setting; returns how many were written.
    async fn import_settings(&self, tenant_id: Uuid, settings: Vec<SettingEntry>) -> anyhow::Result<usize>;
}
