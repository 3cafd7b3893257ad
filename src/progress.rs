// =============================================================================
// Progress Tracker — run counters shared by fetch tasks and the persister
// =============================================================================
//
// Counters are atomics so any task may bump or read them lock-free. They
// drive console progress only: completion of the persistence phase is
// signalled through the ingest queue, never by polling these values.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Thread-safe progress tracker for one run.
pub struct Progress {
    total: usize,
    downloaded: AtomicUsize,
    saved: AtomicUsize,
    dropped: AtomicUsize,
    retries: AtomicUsize,
    dropped_markets: Mutex<Vec<String>>,
}

/// Immutable snapshot of the counters (suitable for the final summary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub downloaded: usize,
    pub saved: usize,
    pub dropped: usize,
    pub retries: usize,
    pub dropped_markets: Vec<String>,
}

impl Progress {
    /// Create a tracker expecting `total` markets.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            downloaded: AtomicUsize::new(0),
            saved: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            dropped_markets: Mutex::new(Vec::new()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// A fetch task produced a batch.
    pub fn record_downloaded(&self, market: &str) {
        let n = self.downloaded.fetch_add(1, Ordering::Relaxed) + 1;
        info!(market, downloaded = n, total = self.total, "market downloaded");
    }

    /// The persister committed a batch.
    pub fn record_saved(&self, market: &str) {
        let n = self.saved.fetch_add(1, Ordering::Relaxed) + 1;
        info!(market, saved = n, total = self.total, "market saved");
    }

    /// A fetch task gave up on a market for this run.
    pub fn record_dropped(&self, market: &str, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.dropped_markets.lock().push(market.to_string());
        warn!(market, reason, "market dropped for this run");
    }

    /// One 503 retry was scheduled.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut dropped_markets = self.dropped_markets.lock().clone();
        dropped_markets.sort();
        ProgressSnapshot {
            total: self.total,
            downloaded: self.downloaded.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped_markets,
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("total", &self.total)
            .field("downloaded", &self.downloaded.load(Ordering::Relaxed))
            .field("saved", &self.saved.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .field("retries", &self.retries.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate_across_threads() {
        let progress = Arc::new(Progress::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let p = progress.clone();
                std::thread::spawn(move || {
                    let market = format!("BTC-C{i}");
                    if i % 2 == 0 {
                        p.record_downloaded(&market);
                        p.record_saved(&market);
                    } else {
                        p.record_retry();
                        p.record_dropped(&market, "rejected");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = progress.snapshot();
        assert_eq!(snap.total, 8);
        assert_eq!(snap.downloaded, 4);
        assert_eq!(snap.saved, 4);
        assert_eq!(snap.dropped, 4);
        assert_eq!(snap.retries, 4);
        assert_eq!(snap.dropped_markets, vec!["BTC-C1", "BTC-C3", "BTC-C5", "BTC-C7"]);
    }
}
