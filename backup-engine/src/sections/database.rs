//! Database section: table rows, schema summary and narrative dump.

use std::io::Write;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{check_cancelled, next_or_cancel, RestoreMode};
use crate::archive::{layout, ArchiveError, ArchiveReader, ArchiveWriter};
use crate::executor::manifest::DatabaseManifest;
use crate::sources::{ColumnInfo, Row, RowStream, TenantDatabase};
use crate::utils::SectionError;

/// Rows buffered between the archive reader and the database writer.
const ROW_CHANNEL_CAPACITY: usize = 256;

/// Exported rows are handed to the archive in batches of about this size.
const ROW_BATCH_BYTES: usize = 64 * 1024;

/// Content of `database/schema.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaSummary {
    pub tables: Vec<String>,
    pub total_rows: u64,
    pub table_details: Vec<TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
    pub size_bytes: u64,
}

impl SchemaSummary {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.table_details.iter().find(|t| t.name == name)
    }
}

fn validate_table_name(name: &str) -> Result<(), SectionError> {
    let invalid = name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SectionError::Invalid(format!("invalid table name: {:?}", name)));
    }
    Ok(())
}

/// Export every table of the tenant database into `archive`.
pub async fn build(
    db: &dyn TenantDatabase,
    tenant_id: Uuid,
    created_at: DateTime<Utc>,
    archive: &mut ArchiveWriter,
    sort_tables: bool,
    cancel: &CancellationToken,
) -> Result<DatabaseManifest, SectionError> {
    let database_name = db.database_name(tenant_id).await?;
    let mut tables = db.list_tables(tenant_id).await?;
    if sort_tables {
        tables.sort();
    }
    for table in &tables {
        validate_table_name(table)?;
    }

    let mut details = Vec::with_capacity(tables.len());
    for table in &tables {
        check_cancelled(cancel)?;

        let columns = db.table_columns(tenant_id, table).await?;
        let mut rows = db.stream_rows(tenant_id, table).await?;
        let mut entry = archive.start_entry(&layout::table_entry(table))?;
        let mut batch = Vec::with_capacity(ROW_BATCH_BYTES);
        let mut row_count = 0u64;

        while let Some(row) = next_or_cancel(&mut rows, cancel).await? {
            let row = row?;
            if row.len() != columns.len() {
                return Err(SectionError::Mismatch(format!(
                    "table {} row {} has {} values, expected {}",
                    table,
                    row_count + 1,
                    row.len(),
                    columns.len()
                )));
            }
            serde_json::to_writer(&mut batch, &row)?;
            batch.push(b'\n');
            row_count += 1;
            if batch.len() >= ROW_BATCH_BYTES {
                entry.write_chunk(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            entry.write_chunk(batch).await?;
        }

        let size_bytes = archive.commit_entry(entry).await?;
        debug!("Exported table {}: {} rows, {} bytes", table, row_count, size_bytes);

        details.push(TableSchema {
            name: table.clone(),
            columns,
            row_count,
            size_bytes,
        });
    }

    let total_rows = details.iter().map(|t| t.row_count).sum();
    let size_bytes = details.iter().map(|t| t.size_bytes).sum();

    let mut dump = Vec::new();
    write_dump(&mut dump, tenant_id, &database_name, created_at, &details)?;

    let summary = SchemaSummary {
        tables: tables.clone(),
        total_rows,
        table_details: details,
    };
    archive
        .blocking(move |a| -> Result<(), ArchiveError> {
            a.write_entry(layout::DATABASE_DUMP, &dump)?;
            a.write_json_entry(layout::DATABASE_SCHEMA, &summary)?;
            Ok(())
        })
        .await??;

    Ok(DatabaseManifest {
        table_count: tables.len(),
        total_rows,
        size_bytes,
        tables,
    })
}

/// Narrative dump pointing at the per-table payload entries.
fn write_dump<W: Write>(
    out: &mut W,
    tenant_id: Uuid,
    database_name: &str,
    created_at: DateTime<Utc>,
    tables: &[TableSchema],
) -> std::io::Result<()> {
    writeln!(out, "-- Tenant Backup")?;
    writeln!(out, "-- Created: {}", created_at.to_rfc3339())?;
    writeln!(out, "-- Tenant: {}", tenant_id)?;
    writeln!(out, "-- Database: {}", database_name)?;
    writeln!(out)?;

    for table in tables {
        let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        writeln!(out, "-- Table: {}", table.name)?;
        writeln!(out, "-- Columns: {}", columns.join(", "))?;
        writeln!(out, "-- Rows: {}", table.row_count)?;
        writeln!(out, "-- BEGIN DATA: {}", table.name)?;
        writeln!(out, "-- Source: {}", layout::table_entry(&table.name))?;
        writeln!(out, "-- END DATA: {}", table.name)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Check the database payload against `manifest` and, in applied mode,
/// replace every table's rows. Returns the number of rows checked or
/// written.
pub async fn restore(
    reader: &mut ArchiveReader,
    manifest: &DatabaseManifest,
    mode: RestoreMode,
    db: &dyn TenantDatabase,
    tenant_id: Uuid,
    cancel: &CancellationToken,
) -> Result<u64, SectionError> {
    let schema = reader
        .blocking({
            let manifest = manifest.clone();
            let cancel = cancel.clone();
            move |r| verify(r, &manifest, &cancel)
        })
        .await??;

    if mode == RestoreMode::DryRun {
        return Ok(schema.total_rows);
    }

    let mut restored = 0u64;
    for table in &manifest.tables {
        check_cancelled(cancel)?;
        let Some(details) = schema.table(table) else {
            return Err(SectionError::Mismatch(format!("table {} missing from schema summary", table)));
        };
        let written = apply_table(reader, db, tenant_id, details, cancel).await?;
        debug!("Restored table {}: {} rows", table, written);
        restored += written;
    }

    Ok(restored)
}

fn verify(
    reader: &mut ArchiveReader,
    manifest: &DatabaseManifest,
    cancel: &CancellationToken,
) -> Result<SchemaSummary, SectionError> {
    if !reader.contains(layout::DATABASE_DUMP) {
        return Err(ArchiveError::EntryMissing(layout::DATABASE_DUMP.to_string()).into());
    }

    let schema: SchemaSummary = reader.read_json(layout::DATABASE_SCHEMA)?;
    if schema.tables != manifest.tables {
        return Err(SectionError::Mismatch(
            "schema summary lists different tables than the manifest".to_string(),
        ));
    }
    if schema.total_rows != manifest.total_rows {
        return Err(SectionError::Mismatch(format!(
            "schema summary has {} rows, manifest has {}",
            schema.total_rows, manifest.total_rows
        )));
    }

    let mut total_rows = 0u64;
    for table in &manifest.tables {
        check_cancelled(cancel)?;
        let details = schema
            .table(table)
            .ok_or_else(|| SectionError::Mismatch(format!("table {} missing from schema summary", table)))?;

        let entry = layout::table_entry(table);
        let width = details.columns.len();
        let mut count = 0u64;
        for line in reader.entry_lines(&entry)? {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            parse_row(&line, width, &entry, count)?;
            count += 1;
        }

        if count != details.row_count {
            return Err(SectionError::Mismatch(format!(
                "table {} holds {} rows, schema summary has {}",
                table, count, details.row_count
            )));
        }
        total_rows += count;
    }

    if total_rows != manifest.total_rows {
        return Err(SectionError::Mismatch(format!(
            "archive holds {} rows, manifest has {}",
            total_rows, manifest.total_rows
        )));
    }
    Ok(schema)
}

fn parse_row(line: &str, width: usize, entry: &str, index: u64) -> Result<Row, SectionError> {
    let row: Row = serde_json::from_str(line)
        .map_err(|e| SectionError::Mismatch(format!("{} row {} is not a JSON array: {}", entry, index + 1, e)))?;
    if row.len() != width {
        return Err(SectionError::Mismatch(format!(
            "{} row {} has {} values, expected {}",
            entry,
            index + 1,
            row.len(),
            width
        )));
    }
    Ok(row)
}

/// Stream one table entry into the database writer.
///
/// Rows pass through a bounded channel so the archive reader and the
/// writer run concurrently. A feed failure is forwarded into the row
/// stream, which makes the writer discard the table's partial contents.
async fn apply_table(
    reader: &mut ArchiveReader,
    db: &dyn TenantDatabase,
    tenant_id: Uuid,
    table: &TableSchema,
    cancel: &CancellationToken,
) -> Result<u64, SectionError> {
    let (tx, rx) = mpsc::channel::<anyhow::Result<Row>>(ROW_CHANNEL_CAPACITY);
    let rows: RowStream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    let entry = layout::table_entry(&table.name);
    let width = table.columns.len();
    let feed_cancel = cancel.clone();

    let feed = reader.blocking(move |r| {
        let result = feed_rows(r, &entry, width, &tx, &feed_cancel);
        if let Err(e) = &result {
            // Receiver may already be gone if the writer failed first
            let _ = tx.blocking_send(Err(anyhow::anyhow!("reading {} failed: {}", entry, e)));
        }
        result
    });
    let write = db.replace_table_rows(tenant_id, &table.name, &table.columns, rows);

    let (fed, written) = tokio::join!(feed, write);
    let fed = fed??;
    let written = written?;

    if written != fed || fed != table.row_count {
        warn!(
            "Row count mismatch restoring {}: read {}, written {}, expected {}",
            table.name, fed, written, table.row_count
        );
        return Err(SectionError::Mismatch(format!(
            "table {}: wrote {} of {} rows",
            table.name, written, table.row_count
        )));
    }
    Ok(written)
}

/// Runs on the blocking pool; rows are pushed with `blocking_send`.
fn feed_rows(
    reader: &mut ArchiveReader,
    entry: &str,
    width: usize,
    tx: &mpsc::Sender<anyhow::Result<Row>>,
    cancel: &CancellationToken,
) -> Result<u64, SectionError> {
    let mut count = 0u64;
    for line in reader.entry_lines(entry)? {
        check_cancelled(cancel)?;
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let row = parse_row(&line, width, entry, count)?;
        if tx.blocking_send(Ok(row)).is_err() {
            // Writer stopped consuming; its own error is reported
            break;
        }
        count += 1;
    }
    Ok(count)
}
