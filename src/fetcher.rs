// =============================================================================
// History Fetcher — one task per market, bounded retry on 503
// =============================================================================
//
// Fan-out is uncapped: one tokio task per selected market. Each task reports
// exactly one `FetchOutcome` on the ingest queue, whatever happens, which is
// what lets the persister terminate when a market is dropped.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::exchange::{MarketDataSource, TickOutcome};
use crate::progress::Progress;
use crate::queue::{FetchOutcome, IngestSender};
use crate::runtime_config::RuntimeConfig;
use crate::types::{HistoryBatch, Market, TickInterval};

/// Why a market produced no batch this run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The exchange answered with a non-retryable failure.
    #[error("history request rejected: {0}")]
    Rejected(String),
    /// The endpoint stayed unavailable for every allowed retry.
    #[error("history endpoint still unavailable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("fetch cancelled")]
    Cancelled,
}

/// How history requests are issued and retried.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub interval: TickInterval,
    pub retry_delay: Duration,
    pub max_unavailable_retries: u32,
}

impl FetchPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            interval: config.tick_interval,
            retry_delay: config.retry_delay(),
            max_unavailable_retries: config.max_unavailable_retries,
        }
    }
}

/// Fetch one market's history.
///
/// `Unavailable` answers are retried after `retry_delay` up to
/// `max_unavailable_retries` times; any other failure returns immediately.
/// Cancellation is observed both during the request and during the delay.
pub async fn fetch_history<S: MarketDataSource>(
    source: &S,
    market: &Market,
    policy: &FetchPolicy,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<HistoryBatch, FetchError> {
    let mut retries = 0u32;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            outcome = source.get_ticks(market, policy.interval) => outcome,
        };

        match outcome {
            TickOutcome::Points(points) => {
                debug!(market = %market, count = points.len(), retries, "history received");
                return Ok(HistoryBatch::new(market.clone(), points));
            }
            TickOutcome::Failed(reason) => return Err(FetchError::Rejected(reason)),
            TickOutcome::Unavailable => {
                if retries >= policy.max_unavailable_retries {
                    return Err(FetchError::RetriesExhausted {
                        attempts: retries + 1,
                    });
                }
                retries += 1;
                progress.record_retry();
                debug!(market = %market, retries, "history endpoint unavailable, retrying");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(policy.retry_delay) => {}
                }
            }
        }
    }
}

/// Launch one fetch task per market.
///
/// Every task pushes a single outcome onto `sender`; the caller should drop
/// its own copy of `sender` so the queue closes once all tasks finish.
pub fn spawn_fetchers<S: MarketDataSource>(
    source: Arc<S>,
    markets: &[Market],
    sender: &IngestSender,
    policy: FetchPolicy,
    progress: Arc<Progress>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(count = markets.len(), interval = %policy.interval, "launching history fetches");

    markets
        .iter()
        .cloned()
        .map(|market| {
            let source = source.clone();
            let sender = sender.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let outcome =
                    match fetch_history(source.as_ref(), &market, &policy, &progress, &cancel)
                        .await
                    {
                        Ok(batch) => {
                            progress.record_downloaded(&batch.market.name());
                            FetchOutcome::Fetched(batch)
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            progress.record_dropped(&market.name(), &reason);
                            FetchOutcome::Dropped { market, reason }
                        }
                    };

                let name = outcome.market().name();
                if !sender.push(outcome) {
                    warn!(market = %name, "ingest queue closed before fetch outcome was delivered");
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::source::scripted::ScriptedSource;
    use crate::queue::ingest_queue;
    use crate::types::tests::point;

    fn policy(max_retries: u32) -> FetchPolicy {
        FetchPolicy {
            interval: TickInterval::FiveMin,
            retry_delay: Duration::from_millis(1),
            max_unavailable_retries: max_retries,
        }
    }

    fn market(name: &str) -> Market {
        Market::parse(name).unwrap()
    }

    #[tokio::test]
    async fn success_tags_batch_with_market() {
        let source = ScriptedSource::new(&["BTC-ETH"]).script(
            "BTC-ETH",
            vec![TickOutcome::Points(vec![
                point("2020-01-01 00:00:00", "1"),
                point("2020-01-01 00:05:00", "2"),
            ])],
        );
        let progress = Progress::new(1);
        let batch = fetch_history(
            &source,
            &market("BTC-ETH"),
            &policy(3),
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(batch.market.table_name(), "BTC_ETH");
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_is_retried_until_success() {
        let source = ScriptedSource::new(&["BTC-ETH"]).script(
            "BTC-ETH",
            vec![
                TickOutcome::Unavailable,
                TickOutcome::Unavailable,
                TickOutcome::Points(vec![point("2020-01-01 00:00:00", "1")]),
            ],
        );
        let progress = Progress::new(1);
        let batch = fetch_history(
            &source,
            &market("BTC-ETH"),
            &policy(5),
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(source.tick_calls(), 3);
        assert_eq!(progress.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let source =
            ScriptedSource::new(&["BTC-ETH"]).script("BTC-ETH", vec![TickOutcome::Unavailable]);
        let err = fetch_history(
            &source,
            &market("BTC-ETH"),
            &policy(2),
            &Progress::new(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, FetchError::RetriesExhausted { attempts: 3 });
        assert_eq!(source.tick_calls(), 3);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let source = ScriptedSource::new(&["BTC-LTC"]).script(
            "BTC-LTC",
            vec![
                TickOutcome::Failed("INVALID_MARKET".into()),
                TickOutcome::Points(vec![]),
            ],
        );
        let err = fetch_history(
            &source,
            &market("BTC-LTC"),
            &policy(5),
            &Progress::new(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, FetchError::Rejected("INVALID_MARKET".into()));
        assert_eq!(source.tick_calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let source =
            ScriptedSource::new(&["BTC-ETH"]).script("BTC-ETH", vec![TickOutcome::Unavailable]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetch_history(
            &source,
            &market("BTC-ETH"),
            &policy(u32::MAX),
            &Progress::new(1),
            &cancel,
        )
        .await
        .unwrap_err();

        assert_eq!(err, FetchError::Cancelled);
    }

    #[tokio::test]
    async fn every_task_reports_exactly_one_outcome() {
        let source = Arc::new(
            ScriptedSource::new(&["BTC-ETH", "BTC-LTC", "BTC-XRP"])
                .script(
                    "BTC-ETH",
                    vec![TickOutcome::Points(vec![point("2020-01-01 00:00:00", "1")])],
                )
                .script("BTC-LTC", vec![TickOutcome::Failed("boom".into())])
                .script("BTC-XRP", vec![TickOutcome::Unavailable]),
        );
        let markets = vec![market("BTC-ETH"), market("BTC-LTC"), market("BTC-XRP")];
        let progress = Arc::new(Progress::new(markets.len()));
        let (sender, mut queue) = ingest_queue(markets.len());

        let handles = spawn_fetchers(
            source,
            &markets,
            &sender,
            policy(1),
            progress.clone(),
            CancellationToken::new(),
        );
        drop(sender);
        for h in futures_util::future::join_all(handles).await {
            h.unwrap();
        }

        let outcomes = tokio::task::spawn_blocking(move || {
            let mut all = Vec::new();
            while let Some(o) = queue.next_blocking() {
                all.push(o);
            }
            all
        })
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 3);
        let fetched: Vec<String> = outcomes
            .iter()
            .filter_map(|o| match o {
                FetchOutcome::Fetched(b) => Some(b.market.name()),
                FetchOutcome::Dropped { .. } => None,
            })
            .collect();
        assert_eq!(fetched, vec!["BTC-ETH"]);

        let snap = progress.snapshot();
        assert_eq!(snap.downloaded, 1);
        assert_eq!(snap.dropped, 2);
        assert_eq!(snap.dropped_markets, vec!["BTC-LTC", "BTC-XRP"]);
    }
}
