//! Files section: every tenant object outside the excluded prefixes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{check_cancelled, copy_stream, RestoreMode};
use crate::archive::{layout, ArchiveError, ArchiveReader, ArchiveWriter};
use crate::executor::manifest::FilesManifest;
use crate::sources::TenantObjectStore;
use crate::utils::SectionError;

/// Content of `files/index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilesIndex {
    pub files: Vec<IndexedObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexedObject {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// Directory prefixes above a key: `a/b/c.txt` yields `a` and `a/b`.
fn ancestor_folders(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/').map(move |(i, _)| &key[..i])
}

pub async fn build(
    store: &dyn TenantObjectStore,
    tenant_id: Uuid,
    archive: &mut ArchiveWriter,
    excluded_prefixes: &[String],
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<FilesManifest, SectionError> {
    let mut objects = store.list_objects(tenant_id).await?;
    objects.retain(|o| !excluded_prefixes.iter().any(|p| o.key.starts_with(p.as_str())));
    objects.sort_by(|a, b| a.key.cmp(&b.key));

    let mut folders = BTreeSet::new();
    let mut index = Vec::with_capacity(objects.len());
    let mut total_size_bytes = 0u64;

    for object in objects {
        check_cancelled(cancel)?;

        let mut entry = archive.start_entry(&layout::object_entry(&object.key))?;
        let mut body = store.open_object(tenant_id, &object.key).await?;
        let size_bytes = copy_stream(&mut body, &mut entry, buffer_size, cancel).await?;
        archive.commit_entry(entry).await?;

        folders.extend(ancestor_folders(&object.key).map(str::to_string));
        total_size_bytes += size_bytes;
        index.push(IndexedObject {
            key: object.key,
            size_bytes,
            last_modified: object.last_modified,
        });
    }

    debug!(
        "Exported {} objects in {} folders, {} bytes",
        index.len(),
        folders.len(),
        total_size_bytes
    );

    let file_count = index.len() as u64;
    archive
        .blocking(move |a| a.write_json_entry(layout::FILES_INDEX, &FilesIndex { files: index }))
        .await??;

    Ok(FilesManifest {
        file_count,
        folder_count: folders.len() as u64,
        total_size_bytes,
    })
}

/// Parse `files/index.json` off the async workers.
pub(crate) async fn read_index(reader: &mut ArchiveReader) -> Result<FilesIndex, ArchiveError> {
    reader.blocking(|r| r.read_json::<FilesIndex>(layout::FILES_INDEX)).await?
}

/// Check every indexed object against the archive and, in applied mode,
/// write them back to the object store. Returns the number of objects.
pub async fn restore(
    reader: &mut ArchiveReader,
    manifest: &FilesManifest,
    mode: RestoreMode,
    store: &dyn TenantObjectStore,
    tenant_id: Uuid,
    spool_threshold: usize,
    cancel: &CancellationToken,
) -> Result<u64, SectionError> {
    let index: FilesIndex = read_index(reader).await?;

    if index.files.len() as u64 != manifest.file_count {
        return Err(SectionError::Mismatch(format!(
            "files index lists {} objects, manifest has {}",
            index.files.len(),
            manifest.file_count
        )));
    }

    let mut total = 0u64;
    for file in &index.files {
        check_cancelled(cancel)?;
        let entry = layout::object_entry(&file.key);
        let size = reader
            .entry_size(&entry)
            .ok_or_else(|| ArchiveError::EntryMissing(entry.clone()))?;
        if size != file.size_bytes {
            return Err(SectionError::Mismatch(format!(
                "{} is {} bytes, index has {}",
                entry, size, file.size_bytes
            )));
        }
        total += size;
    }
    if total != manifest.total_size_bytes {
        return Err(SectionError::Mismatch(format!(
            "objects total {} bytes, manifest has {}",
            total, manifest.total_size_bytes
        )));
    }

    if mode == RestoreMode::DryRun {
        return Ok(manifest.file_count);
    }

    for file in &index.files {
        check_cancelled(cancel)?;
        let entry = layout::object_entry(&file.key);
        let body = reader
            .blocking(move |r| r.extract_entry(&entry, spool_threshold))
            .await??;
        let written = store.put_object(tenant_id, &file.key, body).await?;
        if written != file.size_bytes {
            return Err(SectionError::Mismatch(format!(
                "object {}: wrote {} of {} bytes",
                file.key, written, file.size_bytes
            )));
        }
    }

    Ok(manifest.file_count)
}
