//! Per-session quota accounting.
//!
//! The tracker keeps a local shadow of the grant's usage so admission
//! decisions never wait on the store. Every reservation and every flushed
//! byte count is also sent to a background task that reconciles with the
//! [`QuotaStore`]; when the store reports a limit overrun, the next check
//! fails regardless of what the shadow says.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pgrant_core::{Grant, QuotaKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::ErrorFields;
use crate::collaborators::{QuotaStatus, QuotaStore};

/// SQLSTATE `program_limit_exceeded`.
pub const QUOTA_EXCEEDED_SQLSTATE: &str = "53400";

/// A query refused because a grant limit is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub kind: QuotaKind,
    pub limit: u64,
    pub used: u64,
}

impl QuotaExceeded {
    pub fn message(&self) -> String {
        match self.kind {
            QuotaKind::Queries => format!(
                "quota exceeded: access grant allows {} queries",
                self.limit
            ),
            QuotaKind::Bytes => format!(
                "quota exceeded: access grant allows {} bytes of result data",
                self.limit
            ),
        }
    }

    pub fn to_error_fields(&self) -> ErrorFields {
        ErrorFields::error(QUOTA_EXCEEDED_SQLSTATE, self.message())
            .with_detail(format!("{} used: {}", self.kind.as_str(), self.used))
    }
}

impl std::fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for QuotaExceeded {}

#[derive(Debug, Default)]
struct Counter {
    limit: Option<u64>,
    /// Usage recorded in the store when the session started.
    base: u64,
    /// Usage added by this session.
    local: AtomicU64,
    /// Set once the store reports the limit overrun.
    exhausted: AtomicBool,
}

impl Counter {
    fn new(limit: Option<u64>, base: u64) -> Self {
        Self {
            limit,
            base,
            ..Default::default()
        }
    }

    fn used(&self) -> u64 {
        self.base.saturating_add(self.local.load(Ordering::Acquire))
    }

    fn check(&self, kind: QuotaKind) -> Result<(), QuotaExceeded> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        let used = self.used();
        if self.exhausted.load(Ordering::Acquire) || used >= limit {
            return Err(QuotaExceeded { kind, limit, used });
        }
        Ok(())
    }
}

type Increment = (QuotaKind, u64);

/// Query and byte counters for one session.
#[derive(Debug)]
pub struct QuotaTracker {
    grant_id: String,
    queries: Arc<Counter>,
    bytes: Arc<Counter>,
    /// Bytes relayed since the last flush.
    pending_bytes: AtomicU64,
    sender: Mutex<Option<mpsc::UnboundedSender<Increment>>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl QuotaTracker {
    /// Start tracking `grant` and spawn the reconciler.
    ///
    /// The store is asked up front whether anything remains so a session on
    /// an exhausted grant fails its first query without a round trip.
    pub async fn start(grant: &Grant, store: Arc<dyn QuotaStore>) -> Self {
        let queries = Arc::new(Counter::new(
            grant.max_query_counts,
            grant.query_count,
        ));
        let bytes = Arc::new(Counter::new(
            grant.max_bytes_transferred,
            grant.bytes_transferred,
        ));

        for (kind, counter) in [(QuotaKind::Queries, &queries), (QuotaKind::Bytes, &bytes)] {
            if counter.limit.is_none() {
                continue;
            }
            match store.check_quota(&grant.id, kind).await {
                Ok(QuotaStatus::Exceeded) => counter.exhausted.store(true, Ordering::Release),
                Ok(QuotaStatus::Ok) => {}
                Err(e) => tracing::warn!(
                    grant_id = %grant.id,
                    kind = kind.as_str(),
                    error = %e,
                    "Quota pre-check failed, relying on local counters"
                ),
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let reconciler = tokio::spawn(reconcile(
            grant.id.clone(),
            store,
            receiver,
            queries.clone(),
            bytes.clone(),
        ));

        Self {
            grant_id: grant.id.clone(),
            queries,
            bytes,
            pending_bytes: AtomicU64::new(0),
            sender: Mutex::new(Some(sender)),
            reconciler: Mutex::new(Some(reconciler)),
        }
    }

    pub fn grant_id(&self) -> &str {
        &self.grant_id
    }

    /// Admit one query, or say which limit is used up. An admitted query is
    /// counted immediately and reported to the store.
    pub fn check_and_reserve_query(&self) -> Result<(), QuotaExceeded> {
        self.queries.check(QuotaKind::Queries)?;
        self.bytes.check(QuotaKind::Bytes)?;
        self.queries.local.fetch_add(1, Ordering::AcqRel);
        self.send(QuotaKind::Queries, 1);
        Ok(())
    }

    /// Count result bytes relayed to the client.
    pub fn record_bytes(&self, n: u64) {
        self.bytes.local.fetch_add(n, Ordering::AcqRel);
        self.pending_bytes.fetch_add(n, Ordering::AcqRel);
    }

    /// Report bytes counted since the last flush to the store.
    pub fn flush_bytes(&self) {
        let n = self.pending_bytes.swap(0, Ordering::AcqRel);
        if n > 0 {
            self.send(QuotaKind::Bytes, n);
        }
    }

    /// Queries admitted by this session.
    pub fn local_queries(&self) -> u64 {
        self.queries.local.load(Ordering::Acquire)
    }

    /// Result bytes relayed by this session.
    pub fn local_bytes(&self) -> u64 {
        self.bytes.local.load(Ordering::Acquire)
    }

    /// Flush outstanding bytes and wait until the store has seen every
    /// increment.
    pub async fn finish(&self) {
        self.flush_bytes();
        // Dropping the sender ends the reconciler once the queue drains.
        drop(self.sender.lock().ok().and_then(|mut s| s.take()));
        let handle = self.reconciler.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(grant_id = %self.grant_id, error = %e, "Quota reconciler failed");
            }
        }
    }

    fn send(&self, kind: QuotaKind, amount: u64) {
        let sent = self
            .sender
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|tx| tx.send((kind, amount)).is_ok()));
        if sent != Some(true) {
            tracing::warn!(
                grant_id = %self.grant_id,
                kind = kind.as_str(),
                amount,
                "Usage increment dropped after session finished"
            );
        }
    }
}

async fn reconcile(
    grant_id: String,
    store: Arc<dyn QuotaStore>,
    mut receiver: mpsc::UnboundedReceiver<Increment>,
    queries: Arc<Counter>,
    bytes: Arc<Counter>,
) {
    while let Some((kind, amount)) = receiver.recv().await {
        match store.increment_usage(&grant_id, kind, amount).await {
            Ok(QuotaStatus::Ok) => {}
            Ok(QuotaStatus::Exceeded) => {
                tracing::info!(grant_id = %grant_id, kind = kind.as_str(), "Store reports quota exceeded");
                let counter = match kind {
                    QuotaKind::Queries => &queries,
                    QuotaKind::Bytes => &bytes,
                };
                counter.exhausted.store(true, Ordering::Release);
            }
            Err(e) => {
                tracing::error!(
                    grant_id = %grant_id,
                    kind = kind.as_str(),
                    amount,
                    error = %e,
                    "Failed to record usage"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGrantStore;
    use chrono::{Duration, Utc};

    fn grant() -> Grant {
        let now = Utc::now();
        Grant::new("g1", "alice", "sales", now, now + Duration::hours(1))
    }

    #[tokio::test]
    async fn test_query_limit_is_exact() {
        let store = Arc::new(MemoryGrantStore::new(vec![grant().with_max_query_counts(2)]));
        let tracker = QuotaTracker::start(&grant().with_max_query_counts(2), store.clone()).await;

        assert!(tracker.check_and_reserve_query().is_ok());
        assert!(tracker.check_and_reserve_query().is_ok());
        let err = tracker.check_and_reserve_query().unwrap_err();
        assert_eq!(err.kind, QuotaKind::Queries);
        assert_eq!(err.limit, 2);
        assert_eq!(err.used, 2);
        assert!(err.message().contains("quota exceeded"));

        tracker.finish().await;
        assert_eq!(store.grant("g1").unwrap().query_count, 2);
    }

    #[tokio::test]
    async fn test_usage_seed_counts_against_limit() {
        let mut seeded = grant().with_max_query_counts(3);
        seeded.query_count = 3;
        let store = Arc::new(MemoryGrantStore::new(vec![seeded.clone()]));
        let tracker = QuotaTracker::start(&seeded, store).await;
        assert!(tracker.check_and_reserve_query().is_err());
        tracker.finish().await;
    }

    #[tokio::test]
    async fn test_store_exceeded_fails_next_check() {
        // The store already holds more usage than the grant snapshot shows,
        // as when another session of the same grant ran concurrently.
        let mut stored = grant().with_max_query_counts(5);
        stored.query_count = 4;
        let store = Arc::new(MemoryGrantStore::new(vec![stored]));
        let tracker = QuotaTracker::start(&grant().with_max_query_counts(5), store.clone()).await;

        assert!(tracker.check_and_reserve_query().is_ok());
        assert!(tracker.check_and_reserve_query().is_ok());
        // Let the reconciler apply both increments.
        for _ in 0..100 {
            if store.grant("g1").unwrap().query_count == 6 {
                break;
            }
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(tracker.check_and_reserve_query().is_err());
        tracker.finish().await;
    }

    #[tokio::test]
    async fn test_bytes_flush_at_boundaries() {
        let store = Arc::new(MemoryGrantStore::new(vec![grant().with_max_bytes_transferred(100)]));
        let tracker = QuotaTracker::start(&grant().with_max_bytes_transferred(100), store.clone()).await;

        assert!(tracker.check_and_reserve_query().is_ok());
        tracker.record_bytes(60);
        tracker.record_bytes(50);
        assert_eq!(tracker.local_bytes(), 110);
        tracker.flush_bytes();

        let err = tracker.check_and_reserve_query().unwrap_err();
        assert_eq!(err.kind, QuotaKind::Bytes);
        assert_eq!(err.used, 110);

        tracker.finish().await;
        let stored = store.grant("g1").unwrap();
        assert_eq!(stored.bytes_transferred, 110);
        assert_eq!(stored.query_count, 1);
    }

    #[tokio::test]
    async fn test_unlimited_grant_still_reports_usage() {
        let store = Arc::new(MemoryGrantStore::new(vec![grant()]));
        let tracker = QuotaTracker::start(&grant(), store.clone()).await;
        for _ in 0..10 {
            assert!(tracker.check_and_reserve_query().is_ok());
        }
        tracker.record_bytes(7);
        tracker.finish().await;
        let stored = store.grant("g1").unwrap();
        assert_eq!(stored.query_count, 10);
        assert_eq!(stored.bytes_transferred, 7);
    }
}
