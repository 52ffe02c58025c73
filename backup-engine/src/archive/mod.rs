//! Archive codec.
//!
//! A backup archive is a tar container, optionally wrapped in a zstd frame.
//! The manifest is always the first entry and always lives at
//! [`layout::MANIFEST`], so readers never need a separate index.

pub mod layout;
pub mod reader;
pub mod writer;

use std::pin::Pin;
use tempfile::{SpooledData, SpooledTempFile};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use reader::ArchiveReader;
pub use writer::{ArchiveWriter, EntryWriter, FinishedArchive};

/// Async byte stream used for archive upload/download and object bodies.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// First four bytes of every zstd frame.
pub(crate) const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream is not a tar container (or not a valid zstd frame).
    #[error("{0}")]
    InvalidContainer(String),

    #[error("Backup manifest not found")]
    ManifestMissing,

    #[error("{0}")]
    ManifestInvalid(String),

    #[error("Archive entry missing: {0}")]
    EntryMissing(String),

    #[error("Duplicate archive entry: {0}")]
    DuplicateEntry(String),

    #[error("Invalid archive entry name: {0:?}")]
    InvalidEntryName(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Run `f` on the blocking pool with exclusive use of `value`.
///
/// `value` is swapped for `placeholder` while the task runs and restored
/// afterwards. If the task panics, `placeholder` stays in place.
pub(crate) async fn on_blocking_pool<V, T, F>(value: &mut V, placeholder: V, f: F) -> Result<T, ArchiveError>
where
    V: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut V) -> T + Send + 'static,
{
    let mut owned = std::mem::replace(value, placeholder);
    let (owned, output) = tokio::task::spawn_blocking(move || {
        let output = f(&mut owned);
        (owned, output)
    })
    .await
    .map_err(|e| ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    *value = owned;
    Ok(output)
}

/// Turn a rewound spooled buffer into an async stream without copying.
pub(crate) fn spooled_into_stream(data: SpooledTempFile) -> ByteStream {
    match data.into_inner() {
        SpooledData::InMemory(cursor) => Box::pin(cursor),
        SpooledData::OnDisk(file) => Box::pin(tokio::fs::File::from_std(file)),
    }
}

/// Rejects names that could escape an extraction root or collide with
/// tar's own path handling.
pub(crate) fn validate_entry_name(name: &str) -> Result<(), ArchiveError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");

    if invalid {
        return Err(ArchiveError::InvalidEntryName(name.to_string()));
    }
    Ok(())
}
