// =============================================================================
// Runtime Configuration — fixed workflow settings with JSON + env overrides
// =============================================================================
//
// The downloader exposes no command-line flags. Every tunable lives here with
// a default matching the exchange's public API, so a missing or partial
// `history_config.json` still yields a working run.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TickInterval;

/// File looked up in the working directory at startup.
pub const CONFIG_FILE: &str = "history_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_anchor_currency() -> String {
    "BTC".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("MarketHistory.data")
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("BtrexCSVs")
}

fn default_markets_url() -> String {
    "https://bittrex.com/api/v1.1/public/getmarkets".to_string()
}

fn default_ticks_url() -> String {
    "https://bittrex.com/Api/v2.0/pub/market/GetTicks".to_string()
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_max_unavailable_retries() -> u32 {
    200
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for one download → persist → export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market selection ---------------------------------------------------

    /// Only markets whose base currency equals this are processed.
    #[serde(default = "default_anchor_currency")]
    pub anchor_currency: String,

    /// Bar size requested from the history endpoint.
    #[serde(default)]
    pub tick_interval: TickInterval,

    // --- Local files --------------------------------------------------------

    /// SQLite file holding one table per market.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory receiving one CSV mirror per table.
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,

    // --- Exchange -----------------------------------------------------------

    #[serde(default = "default_markets_url")]
    pub markets_url: String,

    #[serde(default = "default_ticks_url")]
    pub ticks_url: String,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Fixed pause between attempts while the history endpoint answers 503.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound on 503 retries for one market before it is dropped.
    #[serde(default = "default_max_unavailable_retries")]
    pub max_unavailable_retries: u32,

    // --- Console ------------------------------------------------------------

    /// Wait for ENTER before the process exits.
    #[serde(default = "default_true")]
    pub pause_on_exit: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            anchor_currency: default_anchor_currency(),
            tick_interval: TickInterval::default(),
            db_path: default_db_path(),
            csv_dir: default_csv_dir(),
            markets_url: default_markets_url(),
            ticks_url: default_ticks_url(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            max_unavailable_retries: default_max_unavailable_retries(),
            pause_on_exit: true,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            anchor = %config.anchor_currency,
            interval = %config.tick_interval,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `HISTORY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(anchor) = lookup("HISTORY_ANCHOR") {
            let anchor = anchor.trim().to_uppercase();
            if !anchor.is_empty() {
                self.anchor_currency = anchor;
            }
        }
        if let Some(path) = lookup("HISTORY_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("HISTORY_CSV_DIR") {
            self.csv_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("HISTORY_NO_PAUSE") {
            if matches!(flag.trim(), "1" | "true" | "yes") {
                self.pause_on_exit = false;
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
