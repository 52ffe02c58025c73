//! Filesystem tenant object store.
//!
//! Objects of a tenant live under `{root}/{tenant_id}/`; an object's key is
//! its path relative to that directory with `/` separators.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use backup_engine::archive::ByteStream;
use backup_engine::sources::{ObjectInfo, TenantObjectStore};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn tenant_root(&self, tenant_id: Uuid) -> PathBuf {
        self.root.join(tenant_id.to_string())
    }

    /// Resolve a key below the tenant root, refusing anything that could
    /// leave it.
    fn resolve(&self, tenant_id: Uuid, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = key.is_empty()
            || key.contains('\\')
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            anyhow::bail!("Invalid object key: {:?}", key);
        }
        Ok(self.tenant_root(tenant_id).join(relative))
    }
}

/// Walk a tenant directory and collect every regular file.
///
/// Symbolic links are not followed; a link is neither listed nor
/// traversed.
fn walk_objects(root: &Path) -> anyhow::Result<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    if !root.is_dir() {
        return Ok(objects);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata()?;
        let relative = entry.path().strip_prefix(root)?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let last_modified: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());

        objects.push(ObjectInfo {
            key,
            size_bytes: metadata.len(),
            last_modified,
        });
    }

    Ok(objects)
}

#[async_trait]
impl TenantObjectStore for LocalObjectStore {
    async fn list_objects(&self, tenant_id: Uuid) -> anyhow::Result<Vec<ObjectInfo>> {
        let root = self.tenant_root(tenant_id);
        tokio::task::spawn_blocking(move || walk_objects(&root))
            .await
            .map_err(|e| anyhow::anyhow!(e))?
    }

    async fn open_object(&self, tenant_id: Uuid, key: &str) -> anyhow::Result<ByteStream> {
        let path = self.resolve(tenant_id, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open object {}: {}", key, e))?;
        Ok(Box::pin(file))
    }

    async fn put_object(&self, tenant_id: Uuid, key: &str, mut body: ByteStream) -> anyhow::Result<u64> {
        let path = self.resolve(tenant_id, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }
}
