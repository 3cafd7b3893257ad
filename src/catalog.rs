// =============================================================================
// Market Catalog — list the exchange's markets and keep the anchor's pairs
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::exchange::MarketDataSource;
use crate::types::Market;

/// List every market whose base currency is exactly `anchor`.
///
/// A failed listing is fatal for the run: nothing has been fetched yet, and
/// there is no retry. Identifiers that do not parse as `BASE-QUOTE` are
/// skipped with a warning; duplicates keep their first position.
pub async fn list_markets<S: MarketDataSource>(source: &S, anchor: &str) -> Result<Vec<Market>> {
    let listed = source
        .get_markets()
        .await
        .context("failed to list exchange markets")?;

    let mut markets: Vec<Market> = Vec::new();
    for descriptor in &listed {
        let market = match Market::parse(&descriptor.market_name) {
            Ok(m) => m,
            Err(e) => {
                warn!(market = %descriptor.market_name, error = %e, "skipping unparsable market");
                continue;
            }
        };
        if market.base == anchor && !markets.contains(&market) {
            debug!(
                market = %market,
                active = descriptor.is_active,
                min_trade_size = ?descriptor.min_trade_size,
                created = ?descriptor.created,
                "market selected"
            );
            markets.push(market);
        }
    }

    info!(listed = listed.len(), selected = markets.len(), anchor, "market catalog ready");
    Ok(markets)
}
