// =============================================================================
// Persister — single writer draining the ingest queue into the store
// =============================================================================
//
// Runs on its own OS thread for the whole ingestion phase. Each batch is
// merged inside its own transaction: a market is either fully merged or not
// touched, and markets committed earlier survive a later storage failure.
// The first storage error still ends the phase.
//
// Merge rule: a new table receives the whole batch; an existing table only
// receives points strictly newer than its last stored timestamp.
// =============================================================================

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::progress::Progress;
use crate::queue::{FetchOutcome, IngestQueue};
use crate::store::{self, HistoryStore};
use crate::types::{HistoryBatch, HistoryPoint};

const THREAD_NAME: &str = "saving-market-histories";

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// What happened to one market's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    /// Table did not exist; created with `rows` rows.
    Created { rows: usize },
    /// Table existed; `rows` newer points appended (may be zero).
    Appended { rows: usize },
}

impl MergeOutcome {
    pub fn rows(&self) -> usize {
        match self {
            Self::Created { rows } | Self::Appended { rows } => *rows,
        }
    }
}

/// Points of an ascending slice that are strictly newer than `watermark`.
pub fn points_after(points: &[HistoryPoint], watermark: Option<NaiveDateTime>) -> &[HistoryPoint] {
    match watermark {
        Some(mark) => {
            let start = points.partition_point(|p| p.timestamp <= mark);
            &points[start..]
        }
        None => points,
    }
}

/// Merge one batch into the store inside a single transaction.
pub fn merge_batch(db: &mut HistoryStore, batch: &HistoryBatch) -> Result<MergeOutcome> {
    let table = batch.market.table_name();
    let tx = db.transaction()?;

    let outcome = if store::table_exists(&tx, &table)? {
        let watermark = store::last_timestamp(&tx, &table)?;
        let fresh = points_after(&batch.points, watermark);
        let rows = store::append_points(&tx, &table, fresh)?;
        debug!(
            table = %table,
            batch = batch.len(),
            skipped = batch.len() - rows,
            appended = rows,
            "merged into existing table"
        );
        MergeOutcome::Appended { rows }
    } else {
        store::create_table(&tx, &table)?;
        let rows = store::append_points(&tx, &table, &batch.points)?;
        debug!(table = %table, rows, "new table populated");
        MergeOutcome::Created { rows }
    };

    tx.commit()
        .with_context(|| format!("failed to commit merge of {table}"))?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Result of one market reaching the persister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketMerge {
    pub table: String,
    pub outcome: MergeOutcome,
}

/// Summary of the ingestion phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub merged: Vec<MarketMerge>,
    pub dropped: Vec<String>,
    pub cancelled: bool,
}

impl PersistReport {
    pub fn rows_written(&self) -> usize {
        self.merged.iter().map(|m| m.outcome.rows()).sum()
    }
}

/// Handle to the running persister thread.
pub struct PersisterHandle {
    done: oneshot::Receiver<Result<PersistReport>>,
    thread: JoinHandle<()>,
}

impl PersisterHandle {
    /// Wait for the persister to drain the queue, then join its thread.
    pub async fn finish(self) -> Result<PersistReport> {
        let result = self
            .done
            .await
            .context("persister thread exited without reporting");
        if self.thread.join().is_err() {
            anyhow::bail!("persister thread panicked");
        }
        result?
    }
}

/// Spawn the persister on a dedicated thread.
///
/// The thread owns `store` and `queue`; it stops when the queue reports
/// completion, when the queue closes, when `cancel` fires (checked between
/// batches), or on the first storage error. A storage error also cancels
/// `cancel`, so producers sharing the token stop fetching.
pub fn spawn_persister(
    store: HistoryStore,
    queue: IngestQueue,
    progress: Arc<Progress>,
    cancel: CancellationToken,
) -> Result<PersisterHandle> {
    let (done_tx, done) = oneshot::channel();

    let thread = std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let result = run_persister(store, queue, &progress, &cancel);
            if let Err(e) = &result {
                error!(error = %format!("{e:#}"), "persistence phase aborted");
                cancel.cancel();
            }
            // The receiver only disappears if the driver gave up waiting.
            let _ = done_tx.send(result);
        })
        .context("failed to spawn persister thread")?;

    Ok(PersisterHandle { done, thread })
}

fn run_persister(
    mut db: HistoryStore,
    mut queue: IngestQueue,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<PersistReport> {
    info!(expected = queue.expected(), path = %db.path().display(), "persister started");
    let mut report = PersistReport::default();

    while let Some(outcome) = queue.next_blocking() {
        if cancel.is_cancelled() {
            warn!(received = queue.received(), "persister cancelled, stopping between batches");
            report.cancelled = true;
            break;
        }

        match outcome {
            FetchOutcome::Fetched(batch) => {
                if batch.is_empty() {
                    debug!(market = %batch.market, "exchange returned an empty series");
                }
                let outcome = merge_batch(&mut db, &batch)?;
                progress.record_saved(&batch.market.name());
                report.merged.push(MarketMerge {
                    table: batch.market.table_name(),
                    outcome,
                });
            }
            FetchOutcome::Dropped { market, reason } => {
                debug!(market = %market, reason = %reason, "no batch to persist");
                report.dropped.push(market.name());
            }
        }
    }

    if !queue.is_complete() && !report.cancelled {
        warn!(
            received = queue.received(),
            expected = queue.expected(),
            "ingest queue closed before every market reported"
        );
    }

    info!(
        merged = report.merged.len(),
        dropped = report.dropped.len(),
        rows = report.rows_written(),
        "persister finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ingest_queue;
    use crate::types::tests::point;
    use crate::types::{parse_timestamp, Market};

    fn batch(market: &str, stamps: &[&str]) -> HistoryBatch {
        HistoryBatch::new(
            Market::parse(market).unwrap(),
            stamps.iter().map(|ts| point(ts, "0.5")).collect(),
        )
    }

    fn temp_store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("MarketHistory.data")).unwrap();
        (dir, store)
    }

    fn stamps(store: &HistoryStore, table: &str) -> Vec<String> {
        store
            .load_rows(table)
            .unwrap()
            .iter()
            .map(|r| crate::types::format_timestamp(&r.timestamp))
            .collect()
    }

    #[test]
    fn points_after_splits_on_watermark() {
        let b = batch(
            "BTC-ETH",
            &["2020-01-01 00:00:00", "2020-01-01 00:05:00", "2020-01-01 00:10:00"],
        );
        let mark = parse_timestamp("2020-01-01 00:05:00").unwrap();
        assert_eq!(points_after(&b.points, Some(mark)).len(), 1);
        assert_eq!(points_after(&b.points, None).len(), 3);
        let late = parse_timestamp("2021-01-01 00:00:00").unwrap();
        assert!(points_after(&b.points, Some(late)).is_empty());
    }

    #[test]
    fn new_table_receives_whole_batch_in_order() {
        let (_dir, mut store) = temp_store();
        let b = batch(
            "BTC-ETH",
            &["2020-01-01 00:00:00", "2020-01-01 00:05:00", "2020-01-01 00:10:00"],
        );
        assert_eq!(
            merge_batch(&mut store, &b).unwrap(),
            MergeOutcome::Created { rows: 3 }
        );
        assert_eq!(
            stamps(&store, "BTC_ETH"),
            vec!["2020-01-01 00:00:00", "2020-01-01 00:05:00", "2020-01-01 00:10:00"]
        );
    }

    #[test]
    fn existing_table_only_gets_newer_points() {
        let (_dir, mut store) = temp_store();
        merge_batch(
            &mut store,
            &batch("BTC-ETH", &["2020-01-01 00:00:00", "2020-01-01 00:05:00"]),
        )
        .unwrap();

        let overlapping = batch(
            "BTC-ETH",
            &[
                "2020-01-01 00:00:00",
                "2020-01-01 00:05:00",
                "2020-01-01 00:10:00",
                "2020-01-01 00:15:00",
            ],
        );
        assert_eq!(
            merge_batch(&mut store, &overlapping).unwrap(),
            MergeOutcome::Appended { rows: 2 }
        );
        assert_eq!(
            stamps(&store, "BTC_ETH"),
            vec![
                "2020-01-01 00:00:00",
                "2020-01-01 00:05:00",
                "2020-01-01 00:10:00",
                "2020-01-01 00:15:00"
            ]
        );
    }

    #[test]
    fn merging_same_batch_twice_is_idempotent() {
        let (_dir, mut store) = temp_store();
        let b = batch("BTC-LTC", &["2020-01-01 00:00:00", "2020-01-01 00:05:00"]);
        merge_batch(&mut store, &b).unwrap();
        assert_eq!(
            merge_batch(&mut store, &b).unwrap(),
            MergeOutcome::Appended { rows: 0 }
        );
        assert_eq!(store.load_rows("BTC_LTC").unwrap().len(), 2);
    }

    #[test]
    fn worker_drains_queue_and_counts_dropped_markets() {
        let (dir, store) = temp_store();
        let (sender, queue) = ingest_queue(3);
        let progress = Arc::new(Progress::new(3));

        sender.push(FetchOutcome::Fetched(batch("BTC-ETH", &["2020-01-01 00:00:00"])));
        sender.push(FetchOutcome::Dropped {
            market: Market::parse("BTC-LTC").unwrap(),
            reason: "rejected".into(),
        });
        sender.push(FetchOutcome::Fetched(batch(
            "BTC-XRP",
            &["2020-01-01 00:00:00", "2020-01-01 00:05:00"],
        )));

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let handle = spawn_persister(store, queue, progress.clone(), CancellationToken::new())
            .unwrap();
        // The sender is still alive: termination comes from the expected count.
        let report = rt.block_on(handle.finish()).unwrap();
        drop(sender);

        assert_eq!(report.merged.len(), 2);
        assert_eq!(report.dropped, vec!["BTC-LTC"]);
        assert_eq!(report.rows_written(), 3);
        assert!(!report.cancelled);
        assert_eq!(progress.snapshot().saved, 2);

        let store = HistoryStore::open(dir.path().join("MarketHistory.data")).unwrap();
        assert_eq!(store.table_names().unwrap(), vec!["BTC_ETH", "BTC_XRP"]);
    }

    #[test]
    fn storage_error_ends_phase_and_keeps_earlier_markets() {
        let (dir, mut store) = temp_store();
        {
            let tx = store.transaction().unwrap();
            tx.execute("CREATE TABLE BTC_LTC (x TEXT)", []).unwrap();
            tx.commit().unwrap();
        }
        let (sender, queue) = ingest_queue(3);
        for market in ["BTC-ETH", "BTC-LTC", "BTC-XRP"] {
            sender.push(FetchOutcome::Fetched(batch(market, &["2020-01-01 00:00:00"])));
        }
        let cancel = CancellationToken::new();

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let handle = spawn_persister(store, queue, Arc::new(Progress::new(3)), cancel.clone())
            .unwrap();
        let err = rt.block_on(handle.finish()).unwrap_err();

        assert!(format!("{err:#}").contains("BTC_LTC"));
        assert!(cancel.is_cancelled());
        let store = HistoryStore::open(dir.path().join("MarketHistory.data")).unwrap();
        assert_eq!(store.table_names().unwrap(), vec!["BTC_ETH", "BTC_LTC"]);
        assert_eq!(store.load_rows("BTC_ETH").unwrap().len(), 1);
        drop(sender);
    }

    #[test]
    fn cancelled_worker_stops_between_batches() {
        let (dir, store) = temp_store();
        let (sender, queue) = ingest_queue(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        sender.push(FetchOutcome::Fetched(batch("BTC-ETH", &["2020-01-01 00:00:00"])));

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let handle = spawn_persister(store, queue, Arc::new(Progress::new(2)), cancel).unwrap();
        let report = rt.block_on(handle.finish()).unwrap();

        assert!(report.cancelled);
        assert!(report.merged.is_empty());
        let store = HistoryStore::open(dir.path().join("MarketHistory.data")).unwrap();
        assert!(store.table_names().unwrap().is_empty());
        drop(sender);
    }
}
