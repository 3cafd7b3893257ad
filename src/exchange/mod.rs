// =============================================================================
// Exchange — market data source seam and the Bittrex REST client
// =============================================================================

pub mod client;
pub mod source;

pub use client::BittrexClient;
pub use source::{MarketDataSource, TickOutcome};
