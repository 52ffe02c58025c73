//! Section builders and restorers.
//!
//! Each section module exposes `build`, which writes the section's entries
//! into an [`ArchiveWriter`] and returns its sub-manifest, and `restore`,
//! which reads every payload entry back, checks it against the sub-manifest
//! and, in [`RestoreMode::Applied`], writes it into the tenant's environment.
//! Nothing is written until the whole payload has been checked.
//!
//! [`ArchiveWriter`]: crate::archive::ArchiveWriter

pub mod configuration;
pub mod database;
pub mod files;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::archive::{ByteStream, EntryWriter};
use crate::utils::SectionError;

/// Whether a restore only checks the payload or also writes it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestoreMode {
    DryRun,
    Applied,
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), SectionError> {
    if cancel.is_cancelled() {
        return Err(SectionError::Cancelled);
    }
    Ok(())
}

/// Next stream item, or `Cancelled` if the token fires first.
pub(crate) async fn next_or_cancel<S>(stream: &mut S, cancel: &CancellationToken) -> Result<Option<S::Item>, SectionError>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SectionError::Cancelled),
        item = stream.next() => Ok(item),
    }
}

/// Copy an async byte stream into an archive entry, checking for
/// cancellation between chunks. Returns the number of bytes copied.
pub(crate) async fn copy_stream(
    stream: &mut ByteStream,
    entry: &mut EntryWriter,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, SectionError> {
    let buffer_size = buffer_size.max(1);
    let mut total = 0u64;

    loop {
        let mut chunk = vec![0u8; buffer_size];
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SectionError::Cancelled),
            n = stream.read(&mut chunk) => n?,
        };
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        entry.write_chunk(chunk).await?;
        total += n as u64;
    }

    Ok(total)
}
