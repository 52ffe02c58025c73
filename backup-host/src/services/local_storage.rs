//! Filesystem backup storage.
//!
//! Layout: `{root}/{tenant_id}/backups/{backup_id}/{file_name}`. Uploads are
//! written to a `.partial` file and renamed into place, so a listed archive
//! is always complete.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use backup_engine::archive::ByteStream;
use backup_engine::storage::{BackupFileInfo, BackupStorage, StorageError, StoredObject};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const PARTIAL_SUFFIX: &str = ".partial";

pub struct LocalBackupStorage {
    root: PathBuf,
}

impl LocalBackupStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn backup_dir(&self, tenant_id: Uuid, backup_id: Uuid) -> PathBuf {
        self.tenant_dir(tenant_id).join(backup_id.to_string())
    }

    fn tenant_dir(&self, tenant_id: Uuid) -> PathBuf {
        self.root.join(tenant_id.to_string()).join("backups")
    }

    fn relative_path(tenant_id: Uuid, backup_id: Uuid, file_name: &str) -> String {
        format!("{}/backups/{}/{}", tenant_id, backup_id, file_name)
    }
}

fn check_file_name(file_name: &str) -> Result<(), StorageError> {
    let invalid = file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\', '\0'])
        || file_name.ends_with(PARTIAL_SUFFIX);
    if invalid {
        return Err(StorageError::InvalidName(file_name.to_string()));
    }
    Ok(())
}

fn not_found(err: std::io::Error, what: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(what.to_string())
    } else {
        StorageError::Io(err)
    }
}

async fn list_backup_dir(
    dir: &Path,
    tenant_id: Uuid,
    backup_id: Uuid,
    files: &mut Vec<BackupFileInfo>,
) -> Result<(), StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !metadata.is_file() || file_name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let last_modified: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        files.push(BackupFileInfo {
            full_path: LocalBackupStorage::relative_path(tenant_id, backup_id, &file_name),
            file_name,
            size_bytes: metadata.len(),
            last_modified,
            backup_id: Some(backup_id),
        });
    }
    Ok(())
}

#[async_trait]
impl BackupStorage for LocalBackupStorage {
    async fn upload(
        &self,
        tenant_id: Uuid,
        backup_id: Uuid,
        file_name: &str,
        mut body: ByteStream,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        check_file_name(file_name)?;
        let dir = self.backup_dir(tenant_id, backup_id);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = dir.join(file_name);
        let partial_path = dir.join(format!("{}{}", file_name, PARTIAL_SUFFIX));

        let result = async {
            let mut file = tokio::fs::File::create(&partial_path).await?;
            let size = tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(size)
        }
        .await;

        let size_bytes = match result {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                return Err(e.into());
            }
        };
        tokio::fs::rename(&partial_path, &final_path).await?;

        tracing::info!(
            "[Storage] Stored {} ({} bytes, {}) at {}",
            file_name,
            size_bytes,
            content_type,
            final_path.display()
        );

        Ok(StoredObject {
            storage_path: Self::relative_path(tenant_id, backup_id, file_name),
            backend: "local".to_string(),
            size_bytes,
            download_url: None,
        })
    }

    async fn download(&self, tenant_id: Uuid, backup_id: Uuid, file_name: &str) -> Result<ByteStream, StorageError> {
        check_file_name(file_name)?;
        let path = self.backup_dir(tenant_id, backup_id).join(file_name);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(e, file_name))?;
        Ok(Box::pin(file))
    }

    async fn list_files(&self, tenant_id: Uuid, backup_id: Option<Uuid>) -> Result<Vec<BackupFileInfo>, StorageError> {
        let mut files = Vec::new();

        match backup_id {
            Some(backup_id) => {
                list_backup_dir(&self.backup_dir(tenant_id, backup_id), tenant_id, backup_id, &mut files).await?;
            }
            None => {
                let mut backups = match tokio::fs::read_dir(self.tenant_dir(tenant_id)).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = backups.next_entry().await? {
                    // Directories not named by a backup id are not ours
                    let Ok(backup_id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                        continue;
                    };
                    list_backup_dir(&entry.path(), tenant_id, backup_id, &mut files).await?;
                }
            }
        }

        files.sort_by(|a, b| a.full_path.cmp(&b.full_path));
        Ok(files)
    }

    async fn delete(&self, tenant_id: Uuid, backup_id: Uuid, file_name: Option<&str>) -> Result<(), StorageError> {
        let dir = self.backup_dir(tenant_id, backup_id);
        let result = match file_name {
            Some(name) => {
                check_file_name(name)?;
                tokio::fs::remove_file(dir.join(name)).await
            }
            None => tokio::fs::remove_dir_all(&dir).await,
        };

        match result {
            Ok(()) => Ok(()),
            // Already gone
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn body(bytes: &[u8]) -> ByteStream {
        Box::pin(std::io::Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn test_upload_list_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalBackupStorage::new(dir.path().to_path_buf());
        let (tenant_id, backup_id) = (Uuid::new_v4(), Uuid::new_v4());

        let stored = storage
            .upload(tenant_id, backup_id, "nightly.tar", body(b"archive"), "application/x-tar")
            .await
            .unwrap();
        assert_eq!(stored.backend, "local");
        assert_eq!(stored.size_bytes, 7);
        assert_eq!(stored.storage_path, format!("{}/backups/{}/nightly.tar", tenant_id, backup_id));

        let files = storage.list_files(tenant_id, Some(backup_id)).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "nightly.tar");
        assert_eq!(files[0].backup_id, Some(backup_id));
        assert_eq!(storage.list_files(tenant_id, None).await.unwrap(), files);

        let mut downloaded = Vec::new();
        storage
            .download(tenant_id, backup_id, "nightly.tar")
            .await
            .unwrap()
            .read_to_end(&mut downloaded)
            .await
            .unwrap();
        assert_eq!(downloaded, b"archive");

        storage.delete(tenant_id, backup_id, None).await.unwrap();
        assert!(storage.list_files(tenant_id, Some(backup_id)).await.unwrap().is_empty());
        assert!(matches!(
            storage.download(tenant_id, backup_id, "nightly.tar").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalBackupStorage::new(dir.path().to_path_buf());
        let result = storage
            .upload(Uuid::new_v4(), Uuid::new_v4(), "../escape.tar", body(b""), "application/x-tar")
            .await;
        assert!(matches!(result, Err(StorageError::InvalidName(_))));
    }
}
