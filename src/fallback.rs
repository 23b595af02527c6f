//! Per-process sliding-window ledgers used while the shared backend is down.
//!
//! Counts kept here are local to one process, so a deployment with several
//! replicas admits up to `N` per replica until the backend recovers.

use moka::{future::Cache, Expiry};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

/// Timestamps recorded for one client inside its window.
#[derive(Debug)]
pub struct LocalLedger {
    window: Duration,
    stamps: Mutex<VecDeque<f64>>,
}

impl LocalLedger {
    fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Drop stamps at or before `now - window` and return what is left.
    fn prune(&self, now: f64) -> u64 {
        let cutoff = now - self.window.as_secs_f64();
        let mut stamps = self.stamps.lock();
        // Concurrent records may land slightly out of order, so no early exit.
        stamps.retain(|&t| t > cutoff);
        stamps.len() as u64
    }

    fn push(&self, now: f64) {
        self.stamps.lock().push_back(now);
    }
}

/// Evicts a ledger once it has been idle for its whole window.
struct LedgerExpiry;

impl Expiry<String, Arc<LocalLedger>> for LedgerExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<LocalLedger>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.window)
    }

    fn expire_after_read(
        &self,
        _key: &String,
        value: &Arc<LocalLedger>,
        _read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        Some(value.window)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<LocalLedger>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.window)
    }
}

/// Concurrent map from ledger key to [`LocalLedger`].
#[derive(Clone)]
pub struct LocalFallbackStore {
    ledgers: Cache<String, Arc<LocalLedger>>,
}

impl LocalFallbackStore {
    pub fn new(max_ledgers: u64) -> Self {
        let ledgers = Cache::builder()
            .max_capacity(max_ledgers)
            .expire_after(LedgerExpiry)
            .build();
        Self { ledgers }
    }

    /// Prune the ledger to `(now - window, now]` and count it.
    pub async fn count(&self, key: &str, now: f64) -> u64 {
        match self.ledgers.get(key).await {
            Some(ledger) => ledger.prune(now),
            None => 0,
        }
    }

    /// Append `now` to the ledger, creating it with the given window.
    pub async fn record(&self, key: &str, now: f64, window: Duration) {
        let ledger = self
            .ledgers
            .get_with(key.to_string(), async move { Arc::new(LocalLedger::new(window)) })
            .await;
        ledger.push(now);
    }

    /// Number of ledgers currently tracked (approximate).
    pub fn tracked_ledgers(&self) -> u64 {
        self.ledgers.entry_count()
    }

    pub fn clear(&self) {
        self.ledgers.invalidate_all();
    }
}

impl Default for LocalFallbackStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_count_of_unknown_client_is_zero() {
        let store = LocalFallbackStore::default();
        assert_eq!(store.count("rate_limit:ip:1.2.3.4", 0.0).await, 0);
    }

    #[tokio::test]
    async fn test_entries_leave_the_window() {
        let store = LocalFallbackStore::default();
        let key = "rate_limit:ip:1.2.3.4";
        for t in [0.0, 1.0, 2.0] {
            store.record(key, t, WINDOW).await;
        }
        assert_eq!(store.count(key, 2.0).await, 3);
        // (now - W, now] is half-open: t=0 leaves exactly at now=60.
        assert_eq!(store.count(key, 59.9).await, 3);
        assert_eq!(store.count(key, 60.0).await, 2);
        assert_eq!(store.count(key, 62.0).await, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_records_are_pruned() {
        let store = LocalFallbackStore::default();
        let key = "k";
        store.record(key, 10.0, WINDOW).await;
        store.record(key, 5.0, WINDOW).await;
        store.record(key, 30.0, WINDOW).await;
        assert_eq!(store.count(key, 66.0).await, 2);
        assert_eq!(store.count(key, 70.0).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_records_are_all_counted() {
        let store = LocalFallbackStore::default();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store.record("shared", 1.0, WINDOW).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.count("shared", 1.0).await, 200);
    }

    #[tokio::test]
    async fn test_clear_drops_ledgers() {
        let store = LocalFallbackStore::default();
        store.record("a", 1.0, WINDOW).await;
        store.clear();
        assert_eq!(store.count("a", 1.0).await, 0);
    }
}
