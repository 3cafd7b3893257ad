// =============================================================================
// Bittrex REST Client — public market listing and tick history
// =============================================================================
//
// Only public endpoints are used, so no request signing is involved. The
// history endpoint answers HTTP 503 while it is warming up; that status is
// surfaced as `TickOutcome::Unavailable` and retried by the fetcher.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::exchange::source::{MarketDataSource, MarketDescriptor, TickOutcome};
use crate::runtime_config::RuntimeConfig;
use crate::types::{parse_timestamp, HistoryPoint, Market, TickInterval};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// `{ success, message, result }` envelope shared by both endpoints.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<T>,
}

/// One tick as sent by the exchange. Numbers are kept as raw JSON so they
/// can be converted to `Decimal` without a float round-trip.
#[derive(Debug, Deserialize)]
struct RawTick {
    #[serde(rename = "O")]
    open: serde_json::Value,
    #[serde(rename = "H")]
    high: serde_json::Value,
    #[serde(rename = "L")]
    low: serde_json::Value,
    #[serde(rename = "C")]
    close: serde_json::Value,
    #[serde(rename = "V")]
    volume: serde_json::Value,
    #[serde(rename = "T")]
    timestamp: String,
}

impl RawTick {
    fn into_point(self) -> Result<HistoryPoint> {
        Ok(HistoryPoint {
            timestamp: parse_timestamp(&self.timestamp)?,
            open: parse_decimal(&self.open, "O")?,
            high: parse_decimal(&self.high, "H")?,
            low: parse_decimal(&self.low, "L")?,
            close: parse_decimal(&self.close, "C")?,
            volume: parse_decimal(&self.volume, "V")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bittrex public REST client.
#[derive(Clone)]
pub struct BittrexClient {
    markets_url: String,
    ticks_url: String,
    client: reqwest::Client,
}

impl BittrexClient {
    /// Build a client from the configured endpoints and timeout.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build reqwest client")?;

        debug!(
            markets_url = %config.markets_url,
            ticks_url = %config.ticks_url,
            "BittrexClient initialised"
        );

        Ok(Self {
            markets_url: config.markets_url.clone(),
            ticks_url: config.ticks_url.clone(),
            client,
        })
    }

    /// GET public/getmarkets.
    #[instrument(skip(self), name = "bittrex::get_markets")]
    pub async fn fetch_markets(&self) -> Result<Vec<MarketDescriptor>> {
        let resp = self
            .client
            .get(&self.markets_url)
            .send()
            .await
            .context("GET getmarkets request failed")?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("failed to read getmarkets response")?;

        if !status.is_success() {
            anyhow::bail!("Bittrex GET getmarkets returned {}: {}", status, body);
        }

        let markets = parse_markets_body(&body)?;
        debug!(count = markets.len(), "markets listed");
        Ok(markets)
    }

    /// GET pub/market/GetTicks for one market.
    #[instrument(skip(self, market), fields(market = %market), name = "bittrex::get_ticks")]
    pub async fn fetch_ticks(&self, market: &Market, interval: TickInterval) -> TickOutcome {
        let name = market.name();
        let request = self
            .client
            .get(&self.ticks_url)
            .query(&[("marketName", name.as_str()), ("tickInterval", interval.as_str())]);

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return TickOutcome::Failed(format!("GetTicks request failed: {e}")),
        };

        if let Some(outcome) = classify_status(resp.status()) {
            debug!(market = %name, status = %resp.status(), "GetTicks not successful");
            return outcome;
        }

        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => return TickOutcome::Failed(format!("failed to read GetTicks body: {e}")),
        };

        match parse_ticks_body(&body) {
            Ok(outcome) => {
                if let TickOutcome::Points(points) = &outcome {
                    debug!(market = %name, count = points.len(), "ticks fetched");
                }
                outcome
            }
            Err(e) => TickOutcome::Failed(format!("{e:#}")),
        }
    }
}

impl MarketDataSource for BittrexClient {
    async fn get_markets(&self) -> Result<Vec<MarketDescriptor>> {
        self.fetch_markets().await
    }

    async fn get_ticks(&self, market: &Market, interval: TickInterval) -> TickOutcome {
        self.fetch_ticks(market, interval).await
    }
}

impl std::fmt::Debug for BittrexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BittrexClient")
            .field("markets_url", &self.markets_url)
            .field("ticks_url", &self.ticks_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Body parsing
// ---------------------------------------------------------------------------

/// Map a non-2xx GetTicks status to its outcome. `None` means the body
/// should be parsed.
fn classify_status(status: StatusCode) -> Option<TickOutcome> {
    if status == StatusCode::SERVICE_UNAVAILABLE {
        Some(TickOutcome::Unavailable)
    } else if !status.is_success() {
        Some(TickOutcome::Failed(format!("GetTicks returned {status}")))
    } else {
        None
    }
}

/// Decode a getmarkets body. `success == false` is an error carrying the
/// exchange's message.
fn parse_markets_body(body: &str) -> Result<Vec<MarketDescriptor>> {
    let envelope: Envelope<Vec<MarketDescriptor>> =
        serde_json::from_str(body).context("failed to parse getmarkets response")?;

    if !envelope.success {
        anyhow::bail!(
            "getmarkets reported failure: {}",
            envelope.message.unwrap_or_default()
        );
    }
    Ok(envelope.result.unwrap_or_default())
}

/// Decode a GetTicks body into a [`TickOutcome`].
///
/// A `null` result is an empty series. A single malformed tick fails the
/// whole response: persisting a partial series would move the watermark
/// past the missing samples.
fn parse_ticks_body(body: &str) -> Result<TickOutcome> {
    let envelope: Envelope<Vec<RawTick>> =
        serde_json::from_str(body).context("failed to parse GetTicks response")?;

    if !envelope.success {
        let message = envelope.message.unwrap_or_default();
        warn!(message = %message, "GetTicks reported failure");
        return Ok(TickOutcome::Failed(message));
    }

    let points = envelope
        .result
        .unwrap_or_default()
        .into_iter()
        .map(RawTick::into_point)
        .collect::<Result<Vec<_>>>()?;

    Ok(TickOutcome::Points(points))
}

/// Parse a JSON value that may be either a string or a number into a
/// `Decimal`. serde_json is built with `arbitrary_precision`, so a number's
/// text is exactly what the exchange sent.
fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    let text = match val {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => anyhow::bail!("field {name} has unexpected JSON type: {val}"),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .with_context(|| format!("failed to parse {name} as decimal: {text}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
