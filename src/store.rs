// =============================================================================
// History Store — one SQLite table per market
// =============================================================================
//
// Every column is TEXT: timestamps in `yyyy-MM-dd HH:mm:ss` (lexically
// sortable) and prices/volume in their exact decimal text. Table names come
// from `Market::table_name` and are validated before being spliced into SQL.
//
// Free functions take a `&Connection` so they run unchanged inside a
// `Transaction` (which derefs to `Connection`).
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::types::{format_timestamp, parse_timestamp, HistoryPoint};

/// Column names, in table order. Also the CSV header.
pub const COLUMNS: [&str; 6] = ["DateTime", "Open", "Close", "Low", "High", "Volume"];

/// One stored row, exactly as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub timestamp: NaiveDateTime,
    pub open: String,
    pub close: String,
    pub low: String,
    pub high: String,
    pub volume: String,
}

impl StoredRow {
    /// Fields in [`COLUMNS`] order.
    pub fn to_record(&self) -> [String; 6] {
        [
            format_timestamp(&self.timestamp),
            self.open.clone(),
            self.close.clone(),
            self.low.clone(),
            self.high.clone(),
            self.volume.clone(),
        ]
    }
}

/// File-backed store of market tables.
pub struct HistoryStore {
    conn: Connection,
    path: PathBuf,
}

impl HistoryStore {
    /// Open the store at `path`, creating the file if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            info!(path = %path.display(), "local data file not found, creating a new one");
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open history store {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set busy timeout")?;

        debug!(path = %path.display(), "history store opened");
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a transaction. Dropping it without `commit` rolls back.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction()
            .context("failed to begin transaction")
    }

    /// Every table in the store, sorted by name.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .context("failed to prepare table listing")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to list tables")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read table name")?;
        Ok(names)
    }

    /// Every row of `table`, ascending by timestamp.
    pub fn load_rows(&self, table: &str) -> Result<Vec<StoredRow>> {
        let ident = quote_ident(table)?;
        let sql = format!(
            "SELECT DateTime, Open, Close, Low, High, Volume FROM {ident} ORDER BY DateTime"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare load of {table}"))?;

        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .with_context(|| format!("failed to query {table}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read rows of {table}"))?;

        raw.into_iter()
            .map(|(ts, open, close, low, high, volume)| {
                Ok(StoredRow {
                    timestamp: parse_timestamp(&ts)
                        .with_context(|| format!("bad timestamp in {table}"))?,
                    open,
                    close,
                    low,
                    high,
                    volume,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("path", &self.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Table operations
// ---------------------------------------------------------------------------

/// Validate a table name and return it double-quoted for SQL.
fn quote_ident(table: &str) -> Result<String> {
    let valid = !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        anyhow::bail!("invalid table name '{table}'");
    }
    Ok(format!("\"{table}\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up table {table}"))?;
    Ok(found.is_some())
}

pub fn create_table(conn: &Connection, table: &str) -> Result<()> {
    let ident = quote_ident(table)?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {ident} \
             (DateTime TEXT, Open TEXT, Close TEXT, Low TEXT, High TEXT, Volume TEXT)"
        ),
        [],
    )
    .with_context(|| format!("failed to create table {table}"))?;
    debug!(table, "table created");
    Ok(())
}

/// Latest stored timestamp of `table`, or `None` if it holds no rows.
pub fn last_timestamp(conn: &Connection, table: &str) -> Result<Option<NaiveDateTime>> {
    let ident = quote_ident(table)?;
    let last: Option<String> = conn
        .query_row(
            &format!("SELECT DateTime FROM {ident} ORDER BY DateTime DESC LIMIT 1"),
            [],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read last row of {table}"))?;

    last.map(|ts| parse_timestamp(&ts).with_context(|| format!("bad timestamp in {table}")))
        .transpose()
}

/// Append `points` to `table` in the given order. Returns the row count.
pub fn append_points(conn: &Connection, table: &str, points: &[HistoryPoint]) -> Result<usize> {
    let ident = quote_ident(table)?;
    let mut stmt = conn
        .prepare_cached(&format!(
            "INSERT INTO {ident} (DateTime, Open, Close, Low, High, Volume) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ))
        .with_context(|| format!("failed to prepare insert into {table}"))?;

    for p in points {
        stmt.execute(params![
            format_timestamp(&p.timestamp),
            p.open.to_string(),
            p.close.to_string(),
            p.low.to_string(),
            p.high.to_string(),
            p.volume.to_string(),
        ])
        .with_context(|| format!("failed to insert into {table}"))?;
    }
    Ok(points.len())
}
