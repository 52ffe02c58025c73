//! Archive reader with random access by entry name.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

use serde::de::DeserializeOwned;
use tempfile::SpooledTempFile;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::{layout, on_blocking_pool, spooled_into_stream, ArchiveError, ByteStream, ZSTD_MAGIC};
use crate::executor::manifest::Manifest;

/// Reader over one entry's bytes.
pub type EntryReader<'a> = io::Take<&'a mut SpooledTempFile>;

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    offset: u64,
    size: u64,
}

/// An opened archive. Entries are indexed once on open and can then be
/// read in any order.
pub struct ArchiveReader {
    data: SpooledTempFile,
    index: HashMap<String, EntryLocation>,
    order: Vec<String>,
    compressed: bool,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("entries", &self.order.len())
            .field("compressed", &self.compressed)
            .finish()
    }
}

impl ArchiveReader {
    /// Drain `stream` into a spooled buffer and open it.
    ///
    /// Cancellation is checked between chunks.
    pub async fn from_stream(
        mut stream: ByteStream,
        spool_threshold: usize,
        buffer_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Self, ArchiveError> {
        let mut raw = SpooledTempFile::new(spool_threshold);
        let mut buf = vec![0u8; buffer_size.max(1)];

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                n = stream.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            let chunk = buf[..n].to_vec();
            on_blocking_pool(&mut raw, SpooledTempFile::new(spool_threshold), move |raw| raw.write_all(&chunk))
                .await??;
        }

        tokio::task::spawn_blocking(move || Self::from_buffer(raw, spool_threshold))
            .await
            .map_err(|e| ArchiveError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Open an archive held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let mut raw = SpooledTempFile::new(bytes.len().max(1));
        raw.write_all(bytes)?;
        Self::from_buffer(raw, bytes.len().max(1))
    }

    fn from_buffer(mut raw: SpooledTempFile, spool_threshold: usize) -> Result<Self, ArchiveError> {
        raw.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        let prefix_len = read_prefix(&mut raw, &mut magic)?;
        raw.seek(SeekFrom::Start(0))?;

        let compressed = prefix_len == magic.len() && magic == ZSTD_MAGIC;
        let mut data = if compressed {
            let mut decoded = SpooledTempFile::new(spool_threshold);
            let mut decoder = zstd::stream::read::Decoder::new(raw)?;
            io::copy(&mut decoder, &mut decoded)
                .map_err(|e| ArchiveError::InvalidContainer(format!("corrupt zstd stream: {}", e)))?;
            decoded
        } else {
            raw
        };

        let total_len = data.seek(SeekFrom::End(0))?;
        data.seek(SeekFrom::Start(0))?;
        let (index, order) = index_entries(&mut data, total_len)?;

        Ok(Self {
            data,
            index,
            order,
            compressed,
        })
    }

    /// Run blocking reads on the blocking pool. Entries may be spooled to
    /// disk, so section code reads through this from async contexts.
    pub async fn blocking<T, F>(&mut self, f: F) -> Result<T, ArchiveError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ArchiveReader) -> T + Send + 'static,
    {
        let placeholder = ArchiveReader {
            data: SpooledTempFile::new(0),
            index: HashMap::new(),
            order: Vec::new(),
            compressed: self.compressed,
        };
        on_blocking_pool(self, placeholder, f).await
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn entry_size(&self, name: &str) -> Option<u64> {
        self.index.get(name).map(|loc| loc.size)
    }

    /// Entry names in archive order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn entries_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.entry_names().filter(move |name| name.starts_with(prefix))
    }

    /// Whether the manifest sits at the head of the archive.
    pub fn manifest_is_first(&self) -> bool {
        self.order.first().map(String::as_str) == Some(layout::MANIFEST)
    }

    pub fn open_entry(&mut self, name: &str) -> Result<Option<EntryReader<'_>>, ArchiveError> {
        let Some(location) = self.index.get(name).copied() else {
            return Ok(None);
        };
        self.data.seek(SeekFrom::Start(location.offset))?;
        Ok(Some((&mut self.data).take(location.size)))
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut entry = self
            .open_entry(name)?
            .ok_or_else(|| ArchiveError::EntryMissing(name.to_string()))?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_entry_to_string(&mut self, name: &str) -> Result<String, ArchiveError> {
        let bytes = self.read_entry(name)?;
        String::from_utf8(bytes).map_err(|e| {
            ArchiveError::Io(io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", name, e)))
        })
    }

    pub fn read_json<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, ArchiveError> {
        let entry = self
            .open_entry(name)?
            .ok_or_else(|| ArchiveError::EntryMissing(name.to_string()))?;
        Ok(serde_json::from_reader(BufReader::new(entry))?)
    }

    /// Line-by-line reader over a text entry.
    pub fn entry_lines(&mut self, name: &str) -> Result<io::Lines<BufReader<EntryReader<'_>>>, ArchiveError> {
        let entry = self
            .open_entry(name)?
            .ok_or_else(|| ArchiveError::EntryMissing(name.to_string()))?;
        Ok(BufReader::new(entry).lines())
    }

    /// Copy one entry out into an owned async stream, e.g. to hand it to an
    /// object store.
    pub fn extract_entry(&mut self, name: &str, spool_threshold: usize) -> Result<ByteStream, ArchiveError> {
        let mut entry = self
            .open_entry(name)?
            .ok_or_else(|| ArchiveError::EntryMissing(name.to_string()))?;
        let mut copy = SpooledTempFile::new(spool_threshold);
        io::copy(&mut entry, &mut copy)?;
        copy.seek(SeekFrom::Start(0))?;
        Ok(spooled_into_stream(copy))
    }

    pub fn read_manifest(&mut self) -> Result<Manifest, ArchiveError> {
        let bytes = match self.open_entry(layout::MANIFEST)? {
            Some(mut entry) => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                bytes
            }
            None => return Err(ArchiveError::ManifestMissing),
        };
        Manifest::from_json_bytes(&bytes)
    }
}

fn read_prefix<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

type Index = (HashMap<String, EntryLocation>, Vec<String>);

fn index_entries(data: &mut SpooledTempFile, total_len: u64) -> Result<Index, ArchiveError> {
    let invalid = |e: io::Error| ArchiveError::InvalidContainer(format!("not a tar archive: {}", e));

    let mut index = HashMap::new();
    let mut order = Vec::new();
    let mut archive = tar::Archive::new(&mut *data);

    for entry in archive.entries_with_seek().map_err(invalid)? {
        let entry = entry.map_err(invalid)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path().map_err(invalid)?.to_string_lossy().into_owned();
        let location = EntryLocation {
            offset: entry.raw_file_position(),
            size: entry.size(),
        };
        if location.offset.saturating_add(location.size) > total_len {
            return Err(ArchiveError::InvalidContainer(format!("entry {} is truncated", name)));
        }
        if index.insert(name.clone(), location).is_none() {
            order.push(name);
        }
    }

    Ok((index, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::executor::manifest::{ConfigurationManifest, Manifest};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_manifest() -> Manifest {
        Manifest::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now(), "manual".to_string(), false)
            .with_configuration(ConfigurationManifest {
                settings_count: 1,
                categories: vec!["general".to_string()],
            })
    }

    fn build(compression: Option<i32>) -> (Manifest, Vec<u8>) {
        let manifest = sample_manifest();
        let mut writer = ArchiveWriter::new(64, Utc::now());
        writer.write_entry(layout::CONFIG_SETTINGS, br#"{"settings":{}}"#).unwrap();
        writer.write_entry("database/tables/orders.jsonl", b"[1,\"a\"]\n[2,\"b\"]\n").unwrap();
        let bytes = writer.finish(&manifest, compression).unwrap().into_bytes().unwrap();
        (manifest, bytes)
    }

    #[test]
    fn test_random_access_by_name() {
        let (manifest, bytes) = build(None);
        let mut reader = ArchiveReader::from_bytes(&bytes).unwrap();

        assert!(!reader.is_compressed());
        assert!(reader.manifest_is_first());
        assert_eq!(reader.read_manifest().unwrap(), manifest);

        // Read out of archive order
        let lines: Vec<String> = reader
            .entry_lines("database/tables/orders.jsonl")
            .unwrap()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines, vec!["[1,\"a\"]", "[2,\"b\"]"]);
        assert_eq!(
            reader.read_entry_to_string(layout::CONFIG_SETTINGS).unwrap(),
            r#"{"settings":{}}"#
        );
        assert_eq!(reader.entries_with_prefix("database/").count(), 1);
    }

    #[test]
    fn test_compressed_archive_is_detected() {
        let (manifest, bytes) = build(Some(5));
        let mut reader = ArchiveReader::from_bytes(&bytes).unwrap();
        assert!(reader.is_compressed());
        assert_eq!(reader.read_manifest().unwrap().backup_id, manifest.backup_id);
    }

    #[test]
    fn test_garbage_is_invalid_container() {
        let garbage = vec![0x5Au8; 2048];
        assert!(matches!(
            ArchiveReader::from_bytes(&garbage),
            Err(ArchiveError::InvalidContainer(_))
        ));
    }

    #[test]
    fn test_corrupt_zstd_is_invalid_container() {
        let mut bytes = ZSTD_MAGIC.to_vec();
        bytes.extend_from_slice(&[0xFF; 64]);
        assert!(matches!(
            ArchiveReader::from_bytes(&bytes),
            Err(ArchiveError::InvalidContainer(_))
        ));
    }

    #[test]
    fn test_missing_manifest() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        builder.append_data(&mut header, "notes/readme.txt", &b"hello"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let mut reader = ArchiveReader::from_bytes(&bytes).unwrap();
        assert!(reader.contains("notes/readme.txt"));
        assert!(matches!(reader.read_manifest(), Err(ArchiveError::ManifestMissing)));
        assert!(matches!(
            reader.read_entry(layout::DATABASE_DUMP),
            Err(ArchiveError::EntryMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_from_stream_honours_cancellation() {
        let (_, bytes) = build(None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream: ByteStream = Box::pin(std::io::Cursor::new(bytes));
        let result = ArchiveReader::from_stream(stream, 1024, 512, &cancel).await;
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
    }

    #[tokio::test]
    async fn test_from_stream() {
        let (manifest, bytes) = build(Some(3));
        let stream: ByteStream = Box::pin(std::io::Cursor::new(bytes));
        let mut reader = ArchiveReader::from_stream(stream, 16, 7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reader.read_manifest().unwrap(), manifest);

        let settings = reader
            .blocking(|r| r.read_entry_to_string(layout::CONFIG_SETTINGS))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings, r#"{"settings":{}}"#);
        assert!(reader.contains("database/tables/orders.jsonl"));
    }
}
