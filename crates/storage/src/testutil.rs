//! Shared test utilities for code built on [`StorageBackend`].
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! perimeter-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{BatchEntry, MemoryBackend, StorageBackend, StorageError, StorageResult};

#[derive(Debug, Default)]
struct Counters {
    get: AtomicUsize,
    write: AtomicUsize,
    cas: AtomicUsize,
    increment: AtomicUsize,
    batch: AtomicUsize,
}

/// A [`MemoryBackend`] wrapper whose operations can be made to fail on demand.
///
/// While failing, every operation returns [`StorageError::Connection`] without
/// touching the inner store. Calls are counted whether or not they fail, which
/// lets tests assert that a circuit breaker stopped calling the store at all.
#[derive(Debug, Clone)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failing: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Default for FlakyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyBackend {
    /// Creates a healthy backend. Requires a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            failing: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Turns failure injection on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The wrapped store, for seeding and inspecting data directly.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Number of `get` calls received.
    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.counters.get.load(Ordering::SeqCst)
    }

    /// Number of `set`, `set_with_ttl` and `delete` calls received.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.counters.write.load(Ordering::SeqCst)
    }

    /// Number of `compare_and_set` calls received.
    #[must_use]
    pub fn cas_calls(&self) -> usize {
        self.counters.cas.load(Ordering::SeqCst)
    }

    /// Number of `increment` calls received.
    #[must_use]
    pub fn increment_calls(&self) -> usize {
        self.counters.increment.load(Ordering::SeqCst)
    }

    /// Number of `write_batch` calls received.
    #[must_use]
    pub fn batch_calls(&self) -> usize {
        self.counters.batch.load(Ordering::SeqCst)
    }

    fn check(&self, counter: &AtomicUsize) -> StorageResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.check(&self.counters.get)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.check(&self.counters.write)?;
        self.inner.set(key, value).await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.check(&self.counters.write)?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.check(&self.counters.cas)?;
        self.inner.compare_and_set(key, expected, new_value).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check(&self.counters.write)?;
        self.inner.delete(key).await
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StorageResult<i64> {
        self.check(&self.counters.increment)?;
        self.inner.increment(key, ttl_on_create).await
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        self.check(&self.counters.get)?;
        self.inner.ttl(key).await
    }

    async fn write_batch(&self, entries: Vec<BatchEntry>) -> StorageResult<()> {
        self.check(&self.counters.batch)?;
        self.inner.write_batch(entries).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected store failure"));
        }
        self.inner.health_check().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_backend_counts_and_rejects() {
        let backend = FlakyBackend::new();
        backend.set("k", b"v".to_vec()).await.unwrap();

        backend.set_failing(true);
        assert!(matches!(backend.get("k").await, Err(StorageError::Connection { .. })));
        assert!(backend.health_check().await.is_err());

        backend.set_failing(false);
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(backend.get_calls(), 2);
        assert_eq!(backend.write_calls(), 1);
    }
}
