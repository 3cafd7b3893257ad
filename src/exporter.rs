// =============================================================================
// CSV Mirror Exporter — incremental CSV copies of every store table
// =============================================================================
//
// Runs once, after the persister has finished. A missing CSV is written in
// full (header + rows). An existing CSV is never rewritten: the timestamp on
// its last line is the watermark, and only newer table rows are appended.
//
// A CSV whose tail cannot be read as a watermark fails that market only; the
// pass continues with the next table.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{HistoryStore, StoredRow, COLUMNS};
use crate::types::parse_timestamp;

/// Bytes read from the end of a CSV to find its last line.
const TAIL_CHUNK: u64 = 4096;

/// What the exporter did for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportAction {
    Created { rows: usize },
    Appended { rows: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableExport {
    pub table: String,
    pub action: ExportAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportFailure {
    pub table: String,
    pub error: String,
}

/// Summary of one export pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub exported: Vec<TableExport>,
    pub failed: Vec<ExportFailure>,
}

/// Path of the CSV mirroring `table` inside `dir`.
pub fn csv_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.csv"))
}

/// Mirror every table of `store` into `dir`, in table-name order.
///
/// Errors are returned only for failures that affect the whole pass
/// (creating `dir`, listing tables); per-table failures land in the report.
pub fn export_all(store: &HistoryStore, dir: &Path) -> Result<ExportReport> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create CSV directory {}", dir.display()))?;

    let tables = store.table_names()?;
    info!(tables = tables.len(), dir = %dir.display(), "updating CSV mirrors");

    let mut report = ExportReport::default();
    for table in tables {
        match export_table(store, &table, dir) {
            Ok(action) => {
                debug!(table = %table, ?action, "CSV mirror updated");
                report.exported.push(TableExport { table, action });
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(table = %table, error = %error, "CSV export failed for table");
                report.failed.push(ExportFailure { table, error });
            }
        }
    }

    info!(
        exported = report.exported.len(),
        failed = report.failed.len(),
        "CSV export pass complete"
    );
    Ok(report)
}

/// Create or extend the CSV for one table.
pub fn export_table(store: &HistoryStore, table: &str, dir: &Path) -> Result<ExportAction> {
    let rows = store.load_rows(table)?;
    let path = csv_path(dir, table);

    if !path.exists() {
        write_new_csv(&path, &rows)?;
        return Ok(ExportAction::Created { rows: rows.len() });
    }

    let watermark = read_watermark(&path)?;
    let fresh: Vec<&StoredRow> = rows
        .iter()
        .filter(|r| watermark.map_or(true, |mark| r.timestamp > mark))
        .collect();
    append_rows(&path, &fresh)?;
    Ok(ExportAction::Appended { rows: fresh.len() })
}

fn write_new_csv(path: &Path, rows: &[StoredRow]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    writer
        .write_record(COLUMNS)
        .with_context(|| format!("failed to write header to {}", path.display()))?;
    for row in rows {
        writer
            .write_record(row.to_record())
            .with_context(|| format!("failed to write row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn append_rows(path: &Path, rows: &[&StoredRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {} for append", path.display()))?;

    // Keep appended rows on their own lines if the last line was unterminated.
    if !ends_with_newline(&mut file)? {
        file.write_all(b"\n")
            .with_context(|| format!("failed to terminate last line of {}", path.display()))?;
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    for row in rows {
        writer
            .write_record(row.to_record())
            .with_context(|| format!("failed to append row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn ends_with_newline(file: &mut File) -> Result<bool> {
    let len = file.metadata().context("failed to stat CSV")?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))
        .context("failed to seek CSV")?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).context("failed to read CSV")?;
    Ok(last[0] == b'\n')
}

/// Timestamp on the last line of an existing CSV.
///
/// Returns `None` when the last line is the header (nothing mirrored yet);
/// an empty file or an unparsable last line is an error.
pub fn read_watermark(path: &Path) -> Result<Option<NaiveDateTime>> {
    let line = last_line(path)?
        .with_context(|| format!("{} is empty, no watermark", path.display()))?;

    let first = line.split(',').next().unwrap_or_default().trim();
    if first == COLUMNS[0] {
        return Ok(None);
    }

    parse_timestamp(first)
        .map(Some)
        .with_context(|| format!("malformed last line in {}: '{line}'", path.display()))
}

/// Last non-empty line of `path`, read from the tail of the file.
fn last_line(path: &Path) -> Result<Option<String>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let start = len.saturating_sub(TAIL_CHUNK);
    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("failed to seek {}", path.display()))?;
    let mut tail = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut tail)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let text = String::from_utf8_lossy(&tail);
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string))
}
