// =============================================================================
// Ingestion Queue — many fetch tasks in, one persister out
// =============================================================================
//
// Unbounded FIFO over a tokio mpsc channel. Every fetch task sends exactly
// one `FetchOutcome`, including for markets it gives up on, so the consumer
// knows it is done once `expected` outcomes have arrived. A closed channel
// (every sender dropped, e.g. after cancellation) also ends consumption.
// =============================================================================

use tokio::sync::mpsc;

use crate::types::{HistoryBatch, Market};

/// What a fetch task reports for its market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A batch ready to be merged into the store.
    Fetched(HistoryBatch),
    /// No batch this run; the market still counts toward completion.
    Dropped { market: Market, reason: String },
}

impl FetchOutcome {
    pub fn market(&self) -> &Market {
        match self {
            Self::Fetched(batch) => &batch.market,
            Self::Dropped { market, .. } => market,
        }
    }
}

/// Producer half, cloned into every fetch task.
#[derive(Debug, Clone)]
pub struct IngestSender {
    tx: mpsc::UnboundedSender<FetchOutcome>,
}

impl IngestSender {
    /// Enqueue an outcome. Returns `false` if the consumer has gone away.
    pub fn push(&self, outcome: FetchOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

/// Consumer half, owned by the persister.
#[derive(Debug)]
pub struct IngestQueue {
    rx: mpsc::UnboundedReceiver<FetchOutcome>,
    expected: usize,
    received: usize,
}

/// Create a queue that completes after `expected` outcomes.
pub fn ingest_queue(expected: usize) -> (IngestSender, IngestQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        IngestSender { tx },
        IngestQueue {
            rx,
            expected,
            received: 0,
        },
    )
}

impl IngestQueue {
    /// Block the current (non-async) thread until the next outcome arrives.
    ///
    /// Returns `None` once every expected outcome has been received or all
    /// senders are gone.
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context, as
    /// `UnboundedReceiver::blocking_recv` does.
    pub fn next_blocking(&mut self) -> Option<FetchOutcome> {
        if self.is_complete() {
            return None;
        }
        let outcome = self.rx.blocking_recv()?;
        self.received += 1;
        Some(outcome)
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(name: &str) -> FetchOutcome {
        FetchOutcome::Dropped {
            market: Market::parse(name).unwrap(),
            reason: "test".into(),
        }
    }

    #[test]
    fn completes_after_expected_outcomes() {
        let (tx, mut queue) = ingest_queue(2);
        assert!(tx.push(dropped("BTC-A")));
        assert!(tx.push(dropped("BTC-B")));
        assert!(tx.push(dropped("BTC-C")));

        assert_eq!(queue.next_blocking().unwrap().market().name(), "BTC-A");
        assert_eq!(queue.next_blocking().unwrap().market().name(), "BTC-B");
        assert!(queue.is_complete());
        // The sender is still alive: completion must not block on it.
        assert!(queue.next_blocking().is_none());
        assert_eq!(queue.received(), 2);
    }

    #[test]
    fn empty_run_is_immediately_complete() {
        let (_tx, mut queue) = ingest_queue(0);
        assert!(queue.next_blocking().is_none());
    }

    #[test]
    fn closed_channel_ends_consumption_early() {
        let (tx, mut queue) = ingest_queue(5);
        tx.push(dropped("BTC-A"));
        drop(tx);
        assert!(queue.next_blocking().is_some());
        assert!(queue.next_blocking().is_none());
        assert!(!queue.is_complete());
    }

    #[test]
    fn many_producers_single_consumer_preserves_per_producer_order() {
        let producers = 4;
        let per_producer = 50;
        let (tx, mut queue) = ingest_queue(producers * per_producer);

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        tx.push(dropped(&format!("BTC-P{p}N{i}")));
                    }
                })
            })
            .collect();
        drop(tx);

        let mut seen: Vec<Vec<usize>> = vec![Vec::new(); producers];
        while let Some(outcome) = queue.next_blocking() {
            let quote = outcome.market().quote.clone();
            let (p, i) = quote[1..].split_once('N').unwrap();
            seen[p.parse::<usize>().unwrap()].push(i.parse().unwrap());
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(queue.is_complete());
        for order in seen {
            assert_eq!(order, (0..per_producer).collect::<Vec<_>>());
        }
    }

    #[test]
    fn push_after_consumer_dropped_reports_false() {
        let (tx, queue) = ingest_queue(1);
        drop(queue);
        assert!(!tx.push(dropped("BTC-A")));
    }
}
