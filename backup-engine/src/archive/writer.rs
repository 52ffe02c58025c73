//! Archive writer.
//!
//! Section builders add entries while the run is in progress; the manifest
//! is only known at the end. Entries are therefore staged into a spooled
//! tar, and `finish` writes the final container with the manifest first.

use std::collections::HashSet;
use std::io::{self, Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::SpooledTempFile;
use tracing::debug;

use super::{layout, on_blocking_pool, spooled_into_stream, validate_entry_name, ArchiveError, ByteStream};
use crate::executor::manifest::Manifest;

/// Archive under construction.
///
/// Dropping the writer discards everything staged so far, including any
/// spilled temp file.
pub struct ArchiveWriter {
    staged: tar::Builder<SpooledTempFile>,
    names: HashSet<String>,
    spool_threshold: usize,
    mtime: u64,
}

impl ArchiveWriter {
    pub fn new(spool_threshold: usize, created_at: DateTime<Utc>) -> Self {
        Self {
            staged: tar::Builder::new(SpooledTempFile::new(spool_threshold)),
            names: HashSet::new(),
            spool_threshold,
            mtime: created_at.timestamp().max(0) as u64,
        }
    }

    /// Open a streamed entry. Nothing is added until it is passed to
    /// [`ArchiveWriter::commit`].
    pub fn start_entry(&self, name: &str) -> Result<EntryWriter, ArchiveError> {
        self.check_new_name(name)?;
        Ok(EntryWriter {
            name: name.to_string(),
            buffer: SpooledTempFile::new(self.spool_threshold),
            spool_threshold: self.spool_threshold,
            size: 0,
        })
    }

    fn check_new_name(&self, name: &str) -> Result<(), ArchiveError> {
        validate_entry_name(name)?;
        if name == layout::MANIFEST || self.names.contains(name) {
            return Err(ArchiveError::DuplicateEntry(name.to_string()));
        }
        Ok(())
    }

    /// Append a finished entry and return its size. Blocking.
    pub fn commit(&mut self, mut entry: EntryWriter) -> Result<u64, ArchiveError> {
        self.check_new_name(&entry.name)?;
        entry.buffer.flush()?;
        entry.buffer.seek(SeekFrom::Start(0))?;
        self.append(&entry.name, entry.size, &mut entry.buffer)?;
        Ok(entry.size)
    }

    /// [`ArchiveWriter::commit`] on the blocking pool.
    pub async fn commit_entry(&mut self, entry: EntryWriter) -> Result<u64, ArchiveError> {
        self.blocking(move |archive| archive.commit(entry)).await?
    }

    /// Run blocking writes against the staged archive on the blocking pool.
    pub async fn blocking<T, F>(&mut self, f: F) -> Result<T, ArchiveError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ArchiveWriter) -> T + Send + 'static,
    {
        let placeholder = ArchiveWriter {
            staged: tar::Builder::new(SpooledTempFile::new(self.spool_threshold)),
            names: HashSet::new(),
            spool_threshold: self.spool_threshold,
            mtime: self.mtime,
        };
        on_blocking_pool(self, placeholder, f).await
    }

    /// Add a small entry whose content is already in memory.
    pub fn write_entry(&mut self, name: &str, data: &[u8]) -> Result<u64, ArchiveError> {
        let mut entry = self.start_entry(name)?;
        entry.write_all(data)?;
        self.commit(entry)
    }

    /// Add an entry holding pretty-printed JSON.
    pub fn write_json_entry<T: Serialize>(&mut self, name: &str, value: &T) -> Result<u64, ArchiveError> {
        let mut entry = self.start_entry(name)?;
        serde_json::to_writer_pretty(&mut entry, value)?;
        self.commit(entry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn entry_count(&self) -> usize {
        self.names.len()
    }

    fn append<R: Read>(&mut self, name: &str, size: u64, data: R) -> Result<(), ArchiveError> {
        let mut header = entry_header(size, self.mtime);
        self.staged.append_data(&mut header, name, data)?;
        self.names.insert(name.to_string());
        Ok(())
    }

    /// Write the final container: manifest first, then every staged entry in
    /// the order it was committed. `compression_level` wraps the container in
    /// zstd.
    ///
    /// Blocking; call from `spawn_blocking` for large archives.
    pub fn finish(self, manifest: &Manifest, compression_level: Option<i32>) -> Result<FinishedArchive, ArchiveError> {
        let manifest_json = manifest.to_json_bytes()?;
        let entry_count = self.names.len();

        let mut staged = self.staged.into_inner()?;
        staged.seek(SeekFrom::Start(0))?;

        let output = SpooledTempFile::new(self.spool_threshold);
        let output = match compression_level {
            Some(level) => {
                let encoder = zstd::stream::write::Encoder::new(output, level)?;
                write_container(encoder, &manifest_json, &mut staged, self.mtime)?.finish()?
            }
            None => write_container(output, &manifest_json, &mut staged, self.mtime)?,
        };

        let finished = FinishedArchive::new(output)?;
        debug!(
            "Archive finalized: {} entries + manifest, {} bytes, compressed: {}, spilled: {}",
            entry_count,
            finished.size(),
            compression_level.is_some(),
            finished.is_spilled()
        );
        Ok(finished)
    }
}

fn entry_header(size: u64, mtime: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header
}

fn write_container<W: Write>(
    out: W,
    manifest_json: &[u8],
    staged: &mut SpooledTempFile,
    mtime: u64,
) -> io::Result<W> {
    let mut builder = tar::Builder::new(out);

    let mut header = entry_header(manifest_json.len() as u64, mtime);
    builder.append_data(&mut header, layout::MANIFEST, manifest_json)?;

    let mut staged_archive = tar::Archive::new(staged);
    for entry in staged_archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut header = entry_header(entry.size(), mtime);
        builder.append_data(&mut header, &path, &mut entry)?;
    }

    builder.into_inner()
}

/// Streamed content of one entry.
///
/// Tar headers carry the entry size, so content is spooled until commit.
pub struct EntryWriter {
    name: String,
    buffer: SpooledTempFile,
    spool_threshold: usize,
    size: u64,
}

impl EntryWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_written(&self) -> u64 {
        self.size
    }

    /// Append `chunk` on the blocking pool; the spool may live on disk.
    pub async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<(), ArchiveError> {
        let placeholder = EntryWriter {
            name: self.name.clone(),
            buffer: SpooledTempFile::new(self.spool_threshold),
            spool_threshold: self.spool_threshold,
            size: 0,
        };
        on_blocking_pool(self, placeholder, move |entry| entry.write_all(&chunk)).await??;
        Ok(())
    }
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.buffer.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer.flush()
    }
}

/// A complete archive, rewound and ready to upload.
pub struct FinishedArchive {
    data: SpooledTempFile,
    size: u64,
}

impl FinishedArchive {
    fn new(mut data: SpooledTempFile) -> io::Result<Self> {
        let size = data.seek(SeekFrom::End(0))?;
        data.seek(SeekFrom::Start(0))?;
        Ok(Self { data, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the archive outgrew the in-memory threshold.
    pub fn is_spilled(&self) -> bool {
        self.data.is_rolled()
    }

    pub fn into_stream(self) -> ByteStream {
        spooled_into_stream(self.data)
    }

    /// Read the whole archive into memory.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.size as usize);
        self.data.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::DatabaseManifest;
    use uuid::Uuid;

    fn manifest() -> Manifest {
        Manifest::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now(), "full".to_string(), false)
            .with_database(DatabaseManifest {
                table_count: 0,
                total_rows: 0,
                size_bytes: 0,
                tables: vec![],
            })
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_manifest_is_first_entry() {
        let mut writer = ArchiveWriter::new(1024, Utc::now());
        writer.write_entry(layout::DATABASE_DUMP, b"-- dump\n").unwrap();
        writer.write_entry(&layout::table_entry("orders"), b"[1]\n").unwrap();

        let bytes = writer.finish(&manifest(), None).unwrap().into_bytes().unwrap();
        assert_eq!(
            entry_names(&bytes),
            vec![
                "manifest.json".to_string(),
                "database/dump.sql".to_string(),
                "database/tables/orders.jsonl".to_string(),
            ]
        );
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let mut writer = ArchiveWriter::new(1024, Utc::now());
        writer.write_entry("config/settings.json", b"{}").unwrap();
        assert!(matches!(
            writer.write_entry("config/settings.json", b"{}"),
            Err(ArchiveError::DuplicateEntry(_))
        ));
        assert!(matches!(
            writer.write_entry(layout::MANIFEST, b"{}"),
            Err(ArchiveError::DuplicateEntry(_))
        ));
        assert!(matches!(writer.write_entry("../x", b""), Err(ArchiveError::InvalidEntryName(_))));
    }

    #[test]
    fn test_uncommitted_entry_is_discarded() {
        let mut writer = ArchiveWriter::new(1024, Utc::now());
        {
            let mut entry = writer.start_entry("files/objects/partial.bin").unwrap();
            entry.write_all(b"half").unwrap();
        }
        assert_eq!(writer.entry_count(), 0);
        assert!(!writer.contains("files/objects/partial.bin"));
    }

    #[tokio::test]
    async fn test_chunks_and_commit_on_blocking_pool() {
        let mut writer = ArchiveWriter::new(8, Utc::now());
        let mut entry = writer.start_entry("files/objects/report.csv").unwrap();
        entry.write_chunk(b"a,b\n".to_vec()).await.unwrap();
        entry.write_chunk(vec![b'x'; 64]).await.unwrap();
        assert_eq!(entry.bytes_written(), 68);

        // A second entry under the same name loses at commit
        let twin = writer.start_entry("files/objects/report.csv").unwrap();
        assert_eq!(writer.commit_entry(entry).await.unwrap(), 68);
        assert!(matches!(writer.commit_entry(twin).await, Err(ArchiveError::DuplicateEntry(_))));

        let bytes = writer.finish(&manifest(), None).unwrap().into_bytes().unwrap();
        assert_eq!(entry_names(&bytes)[1], "files/objects/report.csv");
    }

    #[test]
    fn test_large_entry_spills_to_disk() {
        let mut writer = ArchiveWriter::new(16, Utc::now());
        let payload = vec![b'x'; 4096];
        let size = writer.write_entry("files/objects/big.bin", &payload).unwrap();
        assert_eq!(size, 4096);

        let finished = writer.finish(&manifest(), None).unwrap();
        assert!(finished.is_spilled());
        assert!(finished.size() > 4096);
    }

    #[test]
    fn test_compressed_container_starts_with_zstd_magic() {
        let mut writer = ArchiveWriter::new(1024, Utc::now());
        writer.write_entry(layout::DATABASE_DUMP, b"-- dump\n").unwrap();
        let bytes = writer.finish(&manifest(), Some(3)).unwrap().into_bytes().unwrap();
        assert_eq!(&bytes[..4], &super::super::ZSTD_MAGIC);

        let decoded = zstd::decode_all(bytes.as_slice()).unwrap();
        assert_eq!(entry_names(&decoded)[0], "manifest.json");
    }
}
