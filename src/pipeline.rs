// =============================================================================
// Pipeline — list → fetch-all → persist-all → export-all
// =============================================================================
//
// Control flow of one run:
//   1. Catalog lists the anchor's markets (failure aborts the run).
//   2. The persister thread starts, owning the store and the queue.
//   3. One fetch task per market pushes exactly one outcome each.
//   4. The driver waits for every fetch task, then for the persister.
//   5. The CSV exporter mirrors every table (skipped if cancelled).
//
// A storage failure in the persister cancels the fetch tasks through a
// child token; the run then returns the error without exporting.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog;
use crate::exchange::MarketDataSource;
use crate::exporter::{self, ExportReport};
use crate::fetcher::{self, FetchPolicy};
use crate::persister::{self, PersistReport};
use crate::progress::{Progress, ProgressSnapshot};
use crate::queue::ingest_queue;
use crate::runtime_config::RuntimeConfig;
use crate::store::HistoryStore;

/// Everything a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub markets: usize,
    pub progress: ProgressSnapshot,
    pub persist: PersistReport,
    /// `None` when the run was cancelled before the export pass.
    pub export: Option<ExportReport>,
}

/// Execute one full run against `source`.
pub async fn run<S: MarketDataSource>(
    source: Arc<S>,
    config: &RuntimeConfig,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("run", run_id = %run_id);
    run_inner(source, config, cancel, run_id).instrument(span).await
}

async fn run_inner<S: MarketDataSource>(
    source: Arc<S>,
    config: &RuntimeConfig,
    cancel: CancellationToken,
    run_id: String,
) -> Result<RunSummary> {
    // ── 1. Market catalog ────────────────────────────────────────────────
    let markets = catalog::list_markets(source.as_ref(), &config.anchor_currency).await?;
    let progress = Arc::new(Progress::new(markets.len()));
    info!(total = progress.total(), "downloading markets");

    // ── 2. Persister ─────────────────────────────────────────────────────
    // Cancelled by the run token, or by the persister when storage fails.
    let ingest = cancel.child_token();
    let store = HistoryStore::open(&config.db_path)?;
    let (sender, queue) = ingest_queue(markets.len());
    let persister =
        persister::spawn_persister(store, queue, progress.clone(), ingest.clone())?;

    // ── 3. Fan-out fetch ─────────────────────────────────────────────────
    let handles = fetcher::spawn_fetchers(
        source,
        &markets,
        &sender,
        FetchPolicy::from_config(config),
        progress.clone(),
        ingest,
    );
    // Only the fetch tasks may keep the queue open from here on.
    drop(sender);

    // ── 4. Barrier ───────────────────────────────────────────────────────
    for joined in futures_util::future::join_all(handles).await {
        if let Err(e) = joined {
            error!(error = %e, "fetch task failed to complete");
        }
    }
    info!(progress = ?progress, "all fetch tasks finished");

    let persist = persister.finish().await?;

    if persist.cancelled || cancel.is_cancelled() {
        warn!("run cancelled, skipping CSV export");
        return Ok(RunSummary {
            run_id,
            markets: markets.len(),
            progress: progress.snapshot(),
            persist,
            export: None,
        });
    }

    // ── 5. CSV mirrors ───────────────────────────────────────────────────
    info!("updating CSVs");
    let db_path = config.db_path.clone();
    let csv_dir = config.csv_dir.clone();
    let export = tokio::task::spawn_blocking(move || {
        let store = HistoryStore::open(&db_path)?;
        exporter::export_all(&store, &csv_dir)
    })
    .await
    .context("CSV export task failed")??;

    let summary = RunSummary {
        run_id,
        markets: markets.len(),
        progress: progress.snapshot(),
        persist,
        export: Some(export),
    };
    let report = serde_json::to_string(&summary).context("failed to serialize run summary")?;
    info!(
        markets = summary.markets,
        saved = summary.progress.saved,
        dropped = summary.progress.dropped,
        rows = summary.persist.rows_written(),
        summary = %report,
        "DONE"
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
