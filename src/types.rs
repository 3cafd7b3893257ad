// =============================================================================
// Shared types used across the history downloader
// =============================================================================

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Timelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Text form used for timestamps in the store and in CSV mirrors.
/// Lexical order of this format equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats accepted when reading a timestamp back (stored form, ISO form).
const PARSE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Format a timestamp in the store/CSV text form.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in either the stored or the ISO `T` form.
///
/// Fractional seconds are accepted but truncated: points are second precision.
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();
    for fmt in PARSE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
            return ts
                .with_nanosecond(0)
                .with_context(|| format!("failed to truncate timestamp '{text}'"));
        }
    }
    anyhow::bail!("unrecognised timestamp '{text}'")
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// A tradable currency pair, written `BASE-QUOTE` by the exchange.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub base: String,
    pub quote: String,
}

impl Market {
    /// Parse an exchange identifier such as `BTC-ETH`.
    ///
    /// Both segments must be non-empty ASCII alphanumerics, which also makes
    /// [`Market::table_name`] safe to use as a storage identifier.
    pub fn parse(name: &str) -> Result<Self> {
        let (base, quote) = name
            .split_once('-')
            .with_context(|| format!("market '{name}' has no '-' separator"))?;

        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(base) || !valid(quote) {
            anyhow::bail!("market '{name}' is not of the form BASE-QUOTE");
        }

        Ok(Self {
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    /// Identifier as the exchange spells it.
    pub fn name(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    /// Name of the table (and CSV file stem) that holds this market.
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.base, self.quote)
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

// ---------------------------------------------------------------------------
// History samples
// ---------------------------------------------------------------------------

/// One OHLCV sample. Prices and volume are exact decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// The points returned by one history fetch for one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryBatch {
    pub market: Market,
    pub points: Vec<HistoryPoint>,
}

impl HistoryBatch {
    /// Build a batch whose points are strictly ascending by timestamp.
    ///
    /// The exchange already returns ascending data; out-of-order input is
    /// sorted (stably) and repeated timestamps keep their first occurrence.
    pub fn new(market: Market, mut points: Vec<HistoryPoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        points.dedup_by_key(|p| p.timestamp);
        Self { market, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Time bucket requested from the history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TickInterval {
    OneMin,
    #[default]
    FiveMin,
    ThirtyMin,
    Hour,
    Day,
}

impl TickInterval {
    /// Query-string value expected by the exchange.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMin => "oneMin",
            Self::FiveMin => "fiveMin",
            Self::ThirtyMin => "thirtyMin",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

impl std::fmt::Display for TickInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
