// =============================================================================
// Market Data Source — what the pipeline needs from an exchange
// =============================================================================
//
// Two calls: the market listing and one market's tick history. A 503 from the
// history endpoint is its own outcome so the fetcher can retry it.
// =============================================================================

use std::future::Future;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{HistoryPoint, Market, TickInterval};

/// One entry of the exchange's market listing. Only `market_name` is used
/// by the pipeline; the rest is carried for logging.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDescriptor {
    #[serde(rename = "MarketName")]
    pub market_name: String,
    #[serde(rename = "IsActive", default)]
    pub is_active: bool,
    #[serde(rename = "MinTradeSize", default)]
    pub min_trade_size: Option<Decimal>,
    #[serde(rename = "Created", default)]
    pub created: Option<String>,
}

/// Result of one history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The exchange returned the sample series (possibly empty).
    Points(Vec<HistoryPoint>),
    /// HTTP 503: transient, the same request may be retried.
    Unavailable,
    /// Any other failure; the market is skipped for this run.
    Failed(String),
}

/// Remote market-data collaborator.
///
/// `get_markets` fails when the listing itself reports failure, which aborts
/// the run. `get_ticks` never fails at the type level: transport and API
/// errors are folded into [`TickOutcome`] so the fetcher can classify them.
pub trait MarketDataSource: Send + Sync + 'static {
    fn get_markets(&self) -> impl Future<Output = Result<Vec<MarketDescriptor>>> + Send;

    fn get_ticks(
        &self,
        market: &Market,
        interval: TickInterval,
    ) -> impl Future<Output = TickOutcome> + Send;
}

// ---------------------------------------------------------------------------
// Scripted source for tests
// ---------------------------------------------------------------------------
