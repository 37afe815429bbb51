//! Replay protection for signed gateway requests.
//!
//! A nonce is registered after its request's signature verifies and must
//! never be accepted again while its record lives. Two stores are provided:
//!
//! - [`InMemoryNonceStore`]: process-local with per-entry expiry. A live nonce
//!   is never evicted; when the store is full new nonces are refused.
//! - [`DurableNonceStore`]: the in-memory store backed by the shared store, so
//!   a nonce seen by one service instance is rejected by the others. Records
//!   are persisted through a [`WriteBatcher`]; a store outage falls back to
//!   the local view.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::{future::Cache, notification::RemovalCause};
use perimeter_storage::{BatchEntry, Environment, StorageBackend, WriteBatcher, keys};
use tracing::warn;

/// Default maximum number of nonces tracked in memory.
pub const DEFAULT_NONCE_CAPACITY: u64 = 100_000;

/// Tracks nonces of accepted requests.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Returns `true` if `nonce` was accepted and has not expired.
    async fn contains(&self, nonce: &str) -> bool;

    /// Records `nonce` for `ttl`.
    ///
    /// Returns `false` if it was already recorded or cannot be tracked; the
    /// check and the insert are atomic, so of two concurrent registrations
    /// exactly one wins.
    async fn register(&self, nonce: &str, ttl: Duration) -> bool;

    /// Forgets every recorded nonce.
    async fn clear(&self);
}

/// Per-entry expiry policy that stores the absolute deadline as the value.
struct NonceExpiry;

impl moka::Expiry<String, Instant> for NonceExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Instant,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.saturating_duration_since(created_at))
    }
}

/// In-memory nonce store backed by a [`moka::future::Cache`].
///
/// Entries leave only when their TTL runs out or the store is cleared. Once
/// `max_capacity` nonces are live, [`register`](NonceStore::register) refuses
/// new ones until some expire, so the request is rejected instead of an
/// older nonce being forgotten inside its replay window.
#[derive(Clone)]
pub struct InMemoryNonceStore {
    /// Cache mapping nonce → expiration instant.
    seen: Cache<String, Instant>,
    /// Slots held by inserted entries not yet removed from the cache.
    live: Arc<AtomicU64>,
    capacity: u64,
}

impl std::fmt::Debug for InMemoryNonceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNonceStore")
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY)
    }
}

impl InMemoryNonceStore {
    /// Creates a store tracking at most `max_capacity` live nonces.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        let live = Arc::new(AtomicU64::new(0));
        let released = Arc::clone(&live);
        let seen = Cache::builder()
            .expire_after(NonceExpiry)
            .eviction_listener(move |_nonce, _expires, cause| {
                if cause != RemovalCause::Replaced {
                    released.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .build();
        Self { seen, live, capacity: max_capacity }
    }

    /// Runs pending expiry housekeeping.
    pub async fn run_pending_tasks(&self) {
        self.seen.run_pending_tasks().await;
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    /// Claims a slot, purging expired entries first if the store looks full.
    async fn reserve(&self) -> bool {
        if self.try_reserve() {
            return true;
        }
        self.seen.run_pending_tasks().await;
        self.try_reserve()
    }

    fn try_reserve(&self) -> bool {
        let claim = |n: u64| (n < self.capacity).then_some(n + 1);
        self.live.fetch_update(Ordering::AcqRel, Ordering::Acquire, claim).is_ok()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn contains(&self, nonce: &str) -> bool {
        self.seen.contains_key(nonce)
    }

    async fn register(&self, nonce: &str, ttl: Duration) -> bool {
        if !self.reserve().await {
            warn!(capacity = self.capacity, "nonce store full, refusing new nonce");
            return false;
        }
        let expiration = Instant::now() + ttl;
        let fresh = self.seen.entry(nonce.to_owned()).or_insert(expiration).await.is_fresh();
        if !fresh {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        fresh
    }

    async fn clear(&self) {
        self.seen.invalidate_all();
        self.seen.run_pending_tasks().await;
    }
}

/// Nonce store shared across service instances through the shared store.
#[derive(Clone)]
pub struct DurableNonceStore {
    local: InMemoryNonceStore,
    backend: Arc<dyn StorageBackend>,
    batcher: WriteBatcher,
    env: Environment,
}

impl std::fmt::Debug for DurableNonceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableNonceStore")
            .field("env", &self.env)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl DurableNonceStore {
    /// Creates a store reading from `backend` and persisting via `batcher`.
    #[must_use]
    pub fn new(
        local: InMemoryNonceStore,
        backend: Arc<dyn StorageBackend>,
        batcher: WriteBatcher,
        env: Environment,
    ) -> Self {
        Self { local, backend, batcher, env }
    }

    /// The batcher persisting nonce records.
    #[must_use]
    pub fn batcher(&self) -> &WriteBatcher {
        &self.batcher
    }
}

#[async_trait]
impl NonceStore for DurableNonceStore {
    async fn contains(&self, nonce: &str) -> bool {
        if self.local.contains(nonce).await {
            return true;
        }
        match self.backend.get(&keys::nonce(self.env, nonce)).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(error = %err, "nonce lookup failed, using local view");
                false
            },
        }
    }

    async fn register(&self, nonce: &str, ttl: Duration) -> bool {
        if !self.local.register(nonce, ttl).await {
            return false;
        }
        let first_seen = chrono::Utc::now().timestamp_millis().to_string();
        self.batcher.enqueue(BatchEntry::with_ttl(
            keys::nonce(self.env, nonce),
            first_seen.into_bytes(),
            ttl,
        ));
        true
    }

    async fn clear(&self) {
        self.local.clear().await;
        self.batcher.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use perimeter_storage::{BatchConfig, testutil::FlakyBackend};

    use super::*;

    #[tokio::test]
    async fn test_first_registration_accepted() {
        let store = InMemoryNonceStore::new(100);
        assert!(!store.contains("n-1").await);
        assert!(store.register("n-1", Duration::from_secs(60)).await);
        assert!(store.contains("n-1").await);
    }

    #[tokio::test]
    async fn test_second_registration_rejected() {
        let store = InMemoryNonceStore::new(100);
        assert!(store.register("n-2", Duration::from_secs(60)).await);
        assert!(!store.register("n-2", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_nonce_accepted_again_after_expiration() {
        let store = InMemoryNonceStore::new(100);
        store.register("n-3", Duration::from_millis(50)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        store.run_pending_tasks().await;

        assert!(!store.contains("n-3").await);
        assert!(store.register("n-3", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_clear_forgets_nonces() {
        let store = InMemoryNonceStore::new(100);
        store.register("n-4", Duration::from_secs(60)).await;
        store.clear().await;
        assert!(!store.contains("n-4").await);
    }

    #[tokio::test]
    async fn test_clear_frees_capacity() {
        let store = InMemoryNonceStore::new(1);
        assert!(store.register("first", Duration::from_secs(60)).await);
        store.clear().await;
        assert!(store.register("second", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_full_store_keeps_live_nonces_and_refuses_new_ones() {
        let store = InMemoryNonceStore::new(4);
        assert!(store.register("captured", Duration::from_secs(600)).await);

        let accepted = {
            let mut accepted = 0;
            for i in 0..64 {
                if store.register(&format!("other-{i}"), Duration::from_secs(600)).await {
                    accepted += 1;
                }
            }
            accepted
        };
        store.run_pending_tasks().await;

        assert_eq!(accepted, 3, "only the free slots are handed out");
        assert!(store.contains("captured").await);
        assert!(!store.register("captured", Duration::from_secs(600)).await);
        assert_eq!(store.live_count(), 4);
    }

    #[tokio::test]
    async fn test_expired_nonces_free_capacity() {
        let store = InMemoryNonceStore::new(2);
        assert!(store.register("a", Duration::from_millis(50)).await);
        assert!(store.register("b", Duration::from_millis(50)).await);
        assert!(!store.register("c", Duration::from_secs(60)).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.register("c", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_duplicate_does_not_hold_a_slot() {
        let store = InMemoryNonceStore::new(2);
        assert!(store.register("a", Duration::from_secs(60)).await);
        assert!(!store.register("a", Duration::from_secs(60)).await);
        assert!(store.register("b", Duration::from_secs(60)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_has_one_winner() {
        let store = InMemoryNonceStore::new(100);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.register("race", Duration::from_secs(60)).await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    fn durable(backend: &Arc<FlakyBackend>) -> DurableNonceStore {
        let batcher = WriteBatcher::new("nonces", backend.clone(), BatchConfig::default());
        DurableNonceStore::new(
            InMemoryNonceStore::new(100),
            backend.clone(),
            batcher,
            Environment::Development,
        )
    }

    #[tokio::test]
    async fn test_durable_store_shares_nonces_between_instances() {
        let backend = Arc::new(FlakyBackend::new());
        let gateway_a = durable(&backend);
        let gateway_b = durable(&backend);

        assert!(gateway_a.register("shared", Duration::from_secs(60)).await);
        gateway_a.batcher().flush().await.unwrap();

        assert!(gateway_b.contains("shared").await);
        assert!(backend.inner().get("nonce:development:shared").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_durable_store_falls_back_to_local_view() {
        let backend = Arc::new(FlakyBackend::new());
        let store = durable(&backend);
        store.register("local", Duration::from_secs(60)).await;

        backend.set_failing(true);
        assert!(store.contains("local").await);
        assert!(!store.contains("unknown").await);
    }
}
