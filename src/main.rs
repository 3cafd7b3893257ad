// =============================================================================
// Bittrex History — Main Entry Point
// =============================================================================
//
// One fixed workflow per launch: list the anchor currency's markets, download
// every market's five-minute history, merge it into the local SQLite store,
// then bring the CSV mirrors up to date. Ctrl+C cancels the run cleanly.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod catalog;
mod exchange;
mod exporter;
mod fetcher;
mod persister;
mod pipeline;
mod progress;
mod queue;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::exchange::BittrexClient;
use crate::runtime_config::{RuntimeConfig, CONFIG_FILE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RuntimeConfig::load(CONFIG_FILE).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        anchor = %config.anchor_currency,
        interval = %config.tick_interval,
        db = %config.db_path.display(),
        csv_dir = %config.csv_dir.display(),
        "Bittrex history update starting"
    );

    // ── 2. Cancellation on Ctrl+C ────────────────────────────────────────
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let signals = Box::pin(futures_util::stream::unfold((), |()| async {
            tokio::signal::ctrl_c().await.ok().map(|_| ((), ()))
        }));
        if watch_shutdown(signals, token).await {
            std::process::exit(130);
        }
    });

    // ── 3. Run ───────────────────────────────────────────────────────────
    let result = match BittrexClient::new(&config) {
        Ok(client) => pipeline::run(Arc::new(client), &config, cancel).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(summary) => {
            if let Some(export) = &summary.export {
                for failure in &export.failed {
                    warn!(table = %failure.table, error = %failure.error, "CSV not updated");
                }
            }
        }
        Err(e) => {
            error!(error = %e.root_cause(), chain = %format!("{e:#}"), "TOP LEVEL ERROR");
        }
    }

    // ── 4. Wait for acknowledgement ──────────────────────────────────────
    if config.pause_on_exit {
        println!("\n-Press ENTER to exit-");
        let mut line = String::new();
        if let Err(e) = BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            warn!(error = %e, "failed to read from stdin");
        }
    }

    result.map(|_| ())
}

/// Cancel `cancel` on the first signal. Returns `true` if a second signal
/// arrives, meaning the user wants out without waiting for a clean stop.
async fn watch_shutdown<S>(mut signals: S, cancel: CancellationToken) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }
    warn!("Shutdown signal received, cancelling run (press Ctrl+C again to exit now)");
    cancel.cancel();

    if signals.next().await.is_none() {
        return false;
    }
    warn!("Second shutdown signal received, exiting immediately");
    true
}
