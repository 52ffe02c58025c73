//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{layout, ArchiveWriter, ByteStream};
use crate::config::EngineConfig;
use crate::executor::{BackupExecutor, BackupRequest, FilesManifest, Manifest};
use crate::sections::database;
use crate::sections::files::{FilesIndex, IndexedObject};
use crate::sources::{ColumnInfo, ObjectInfo, Row, RowStream, SettingEntry, TenantDatabase, TenantObjectStore, TenantSettings};
use crate::storage::{BackupFileInfo, BackupStorage, StorageError, StoredObject};

async fn drain(mut body: ByteStream) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

type ObjectKey = (Uuid, Uuid, String);

#[derive(Default)]
pub struct MemoryStorage {
    pub objects: Mutex<BTreeMap<ObjectKey, Vec<u8>>>,
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub fail_uploads: bool,
}

impl MemoryStorage {
    pub fn put(&self, tenant_id: Uuid, backup_id: Uuid, file_name: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert((tenant_id, backup_id, file_name.to_string()), bytes);
    }

    pub fn only_archive(&self) -> (String, Vec<u8>) {
        let objects = self.objects.lock().unwrap();
        assert_eq!(objects.len(), 1, "expected exactly one stored archive");
        let ((_, _, name), bytes) = objects.iter().next().unwrap();
        (name.clone(), bytes.clone())
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupStorage for MemoryStorage {
    async fn upload(
        &self,
        tenant_id: Uuid,
        backup_id: Uuid,
        file_name: &str,
        body: ByteStream,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads {
            return Err(StorageError::Backend("bucket unavailable".into()));
        }
        let bytes = drain(body).await?;
        let size_bytes = bytes.len() as u64;
        self.put(tenant_id, backup_id, file_name, bytes);
        Ok(StoredObject {
            storage_path: format!("{}/backups/{}/{}", tenant_id, backup_id, file_name),
            backend: "memory".to_string(),
            size_bytes,
            download_url: None,
        })
    }

    async fn download(&self, tenant_id: Uuid, backup_id: Uuid, file_name: &str) -> Result<ByteStream, StorageError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let bytes = objects
            .get(&(tenant_id, backup_id, file_name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(file_name.to_string()))?;
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn list_files(&self, tenant_id: Uuid, backup_id: Option<Uuid>) -> Result<Vec<BackupFileInfo>, StorageError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((t, b, _), _)| *t == tenant_id && backup_id.map_or(true, |id| id == *b))
            .map(|((_, b, name), bytes)| BackupFileInfo {
                file_name: name.clone(),
                full_path: format!("{}/backups/{}/{}", tenant_id, b, name),
                size_bytes: bytes.len() as u64,
                last_modified: Utc::now(),
                backup_id: Some(*b),
            })
            .collect())
    }

    async fn delete(&self, tenant_id: Uuid, backup_id: Uuid, file_name: Option<&str>) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().unwrap();
        objects.retain(|(t, b, name), _| {
            !(*t == tenant_id && *b == backup_id && file_name.map_or(true, |f| f == name))
        });
        Ok(())
    }
}

pub struct MemoryTable {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    pub tables: Mutex<Vec<MemoryTable>>,
    /// Table whose row stream fails halfway
    pub failing_table: Option<String>,
}

impl MemoryDatabase {
    /// `orders` with 3 rows and `customers` with 5, in that catalog order.
    pub fn orders_and_customers() -> Self {
        let db = Self::default();
        db.add_table(
            "orders",
            &["id", "customer_id", "total"],
            (1..=3).map(|i| vec![json!(i), json!(i % 2 + 1), json!(format!("{}.50", i * 10))]).collect(),
        );
        db.add_table(
            "customers",
            &["id", "name"],
            (1..=5).map(|i| vec![json!(i), json!(format!("customer-{}", i))]).collect(),
        );
        db
    }

    pub fn add_table(&self, name: &str, columns: &[&str], rows: Vec<Row>) {
        let columns = columns
            .iter()
            .map(|c| ColumnInfo {
                name: c.to_string(),
                data_type: "TEXT".to_string(),
                nullable: true,
            })
            .collect();
        self.tables.lock().unwrap().push(MemoryTable {
            name: name.to_string(),
            columns,
            rows,
        });
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self, table: &str) {
        if let Some(t) = self.tables.lock().unwrap().iter_mut().find(|t| t.name == table) {
            t.rows.clear();
        }
    }
}

#[async_trait]
impl TenantDatabase for MemoryDatabase {
    async fn database_name(&self, tenant_id: Uuid) -> anyhow::Result<String> {
        Ok(format!("tenant_{}", tenant_id.simple()))
    }

    async fn list_tables(&self, _tenant_id: Uuid) -> anyhow::Result<Vec<String>> {
        Ok(self.tables.lock().unwrap().iter().map(|t| t.name.clone()).collect())
    }

    async fn table_columns(&self, _tenant_id: Uuid, table: &str) -> anyhow::Result<Vec<ColumnInfo>> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| anyhow::anyhow!("no such table: {}", table))
    }

    async fn stream_rows(&self, _tenant_id: Uuid, table: &str) -> anyhow::Result<RowStream> {
        let rows = self.rows(table);
        if self.failing_table.as_deref() == Some(table) {
            let half = rows.len() / 2;
            let items: Vec<anyhow::Result<Row>> = rows
                .into_iter()
                .take(half)
                .map(Ok)
                .chain(std::iter::once(Err(anyhow::anyhow!("connection reset while reading {}", table))))
                .collect();
            return Ok(stream::iter(items).boxed());
        }
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn replace_table_rows(
        &self,
        _tenant_id: Uuid,
        table: &str,
        _columns: &[ColumnInfo],
        mut rows: RowStream,
    ) -> anyhow::Result<u64> {
        let mut collected = Vec::new();
        while let Some(row) = rows.next().await {
            collected.push(row?);
        }
        let mut tables = self.tables.lock().unwrap();
        let target = tables
            .iter_mut()
            .find(|t| t.name == table)
            .ok_or_else(|| anyhow::anyhow!("no such table: {}", table))?;
        target.rows = collected;
        Ok(target.rows.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fail_open: Option<String>,
}

impl MemoryObjectStore {
    pub fn with_objects(objects: &[(&str, &[u8])]) -> Self {
        let store = Self::default();
        for (key, bytes) in objects {
            store.objects.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl TenantObjectStore for MemoryObjectStore {
    async fn list_objects(&self, _tenant_id: Uuid) -> anyhow::Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, bytes)| ObjectInfo {
                key: key.clone(),
                size_bytes: bytes.len() as u64,
                last_modified: Utc::now(),
            })
            .collect())
    }

    async fn open_object(&self, _tenant_id: Uuid, key: &str) -> anyhow::Result<ByteStream> {
        if self.fail_open.as_deref() == Some(key) {
            anyhow::bail!("access denied: {}", key);
        }
        let bytes = self.get(key).ok_or_else(|| anyhow::anyhow!("no such object: {}", key))?;
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn put_object(&self, _tenant_id: Uuid, key: &str, body: ByteStream) -> anyhow::Result<u64> {
        let bytes = drain(body).await?;
        let size = bytes.len() as u64;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(size)
    }
}

#[derive(Default)]
pub struct MemorySettings {
    pub entries: Mutex<Vec<SettingEntry>>,
}

impl MemorySettings {
    pub fn with_entries(entries: &[(&str, &str, Value)]) -> Self {
        let settings = Self::default();
        *settings.entries.lock().unwrap() = entries
            .iter()
            .map(|(category, key, value)| SettingEntry {
                category: category.to_string(),
                key: key.to_string(),
                value: value.clone(),
            })
            .collect();
        settings
    }
}

#[async_trait]
impl TenantSettings for MemorySettings {
    async fn export_settings(&self, _tenant_id: Uuid) -> anyhow::Result<Vec<SettingEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn import_settings(&self, _tenant_id: Uuid, settings: Vec<SettingEntry>) -> anyhow::Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let count = settings.len();
        for setting in settings {
            entries.retain(|e| !(e.category == setting.category && e.key == setting.key));
            entries.push(setting);
        }
        Ok(count)
    }
}

/// Executor wired to in-memory collaborators, with handles kept for
/// assertions.
pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub database: Arc<MemoryDatabase>,
    pub objects: Arc<MemoryObjectStore>,
    pub settings: Arc<MemorySettings>,
    pub executor: BackupExecutor,
}

impl Harness {
    pub fn new(storage: MemoryStorage, database: MemoryDatabase, objects: MemoryObjectStore, settings: MemorySettings) -> Self {
        let storage = Arc::new(storage);
        let database = Arc::new(database);
        let objects = Arc::new(objects);
        let settings = Arc::new(settings);
        let executor = BackupExecutor::new(
            storage.clone(),
            database.clone(),
            objects.clone(),
            settings.clone(),
            EngineConfig::default(),
        );
        Self {
            storage,
            database,
            objects,
            settings,
            executor,
        }
    }

    pub fn standard() -> Self {
        Self::new(
            MemoryStorage::default(),
            MemoryDatabase::orders_and_customers(),
            MemoryObjectStore::with_objects(&[
                ("invoices/2025/01.pdf", b"%PDF-1.7 jan"),
                ("invoices/2025/02.pdf", b"%PDF-1.7 feb"),
                ("logo.png", b"\x89PNG"),
                ("backups/old.tar", b"previous archive"),
            ]),
            MemorySettings::with_entries(&[
                ("general", "company_name", json!("Acme")),
                ("general", "timezone", json!("Europe/Istanbul")),
                ("inventory", "low_stock_threshold", json!(5)),
            ]),
        )
    }
}

/// Map of table name to the row count a fake database holds.
pub fn row_counts(db: &MemoryDatabase) -> HashMap<String, usize> {
    db.tables
        .lock()
        .unwrap()
        .iter()
        .map(|t| (t.name.clone(), t.rows.len()))
        .collect()
}

/// Full, uncompressed backup of every section.
pub fn backup_request(tenant_id: Uuid) -> BackupRequest {
    BackupRequest {
        tenant_id,
        backup_id: Uuid::new_v4(),
        backup_name: "nightly".to_string(),
        backup_type: "full".to_string(),
        include_database: true,
        include_files: true,
        include_configuration: true,
        compress: false,
        encrypt: false,
    }
}

/// Store a backup of `harness.database` whose files index lists `logo.png`
/// without carrying the object's data.
pub async fn put_archive_missing_object(harness: &Harness, tenant_id: Uuid, backup_id: Uuid) -> Manifest {
    let created_at = Utc::now();
    let mut writer = ArchiveWriter::new(1024, created_at);
    let database = database::build(
        harness.database.as_ref(),
        tenant_id,
        created_at,
        &mut writer,
        false,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let index = FilesIndex {
        files: vec![IndexedObject {
            key: "logo.png".to_string(),
            size_bytes: 4,
            last_modified: created_at,
        }],
    };
    writer.write_json_entry(layout::FILES_INDEX, &index).unwrap();

    let manifest = Manifest::new(backup_id, tenant_id, created_at, "full".into(), false)
        .with_database(database)
        .with_files(FilesManifest {
            file_count: 1,
            folder_count: 0,
            total_size_bytes: 4,
        });
    let bytes = writer.finish(&manifest, None).unwrap().into_bytes().unwrap();
    harness.storage.put(tenant_id, backup_id, "nightly_20250101_000000.tar", bytes);
    manifest
}
