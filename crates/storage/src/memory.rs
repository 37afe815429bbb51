//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] implements [`StorageBackend`] over a hash map guarded by
//! a [`parking_lot::RwLock`]. It backs tests and single-process deployments.
//!
//! # Features
//!
//! - **Thread-safe**: every compound operation (increment, CAS, batch) runs
//!   under one write lock, so it is linearizable like a real shared store
//! - **TTL support**: expired keys are invisible to reads immediately and are
//!   physically removed by a background sweep
//!
//! # Example
//!
//! ```
//! use perimeter_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set("greeting", b"hello".to_vec()).await.unwrap();
//!     let value = backend.get("greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - The sweep runs every second, so memory is reclaimed lazily

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::{BatchEntry, StorageBackend},
    error::{StorageError, StorageResult},
};

/// Interval between background sweeps of expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the sweep task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self { value: Bytes::from(value), expires_at: ttl.map(expiry_after) }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Computes `now + ttl`, saturating for TTLs too large for [`Instant`].
fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

/// In-memory storage backend.
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same data.
///
/// # Shutdown
///
/// The background sweep stops automatically when all clones are dropped.
/// [`shutdown`](Self::shutdown) stops it explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("keys", &self.data.read().len()).finish()
    }
}

impl MemoryBackend {
    /// Creates a new in-memory backend and spawns its expiry sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The sweep holds only the data map so it does not keep the guard alive.
        let data = Arc::clone(&backend.data);
        tokio::spawn(async move {
            sweep_expired_keys(data, shutdown_rx).await;
        });

        backend
    }

    /// Explicitly signals the background sweep to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of physically stored keys, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are physically stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Removes every key.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Live keys starting with `prefix`, sorted.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .read()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep_expired_keys(
    data: Arc<RwLock<HashMap<String, Entry>>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(SWEEP_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let now = Instant::now();
        let has_expired = data.read().values().any(|entry| !entry.is_live(now));
        if has_expired {
            data.write().retain(|_, entry| entry.is_live(now));
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let data = self.data.read();
        let now = Instant::now();
        Ok(data.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone()))
    }

    #[tracing::instrument(level = "trace", skip(self, value))]
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key.to_owned(), Entry::new(value, None));
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, value))]
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.data.write().insert(key.to_owned(), Entry::new(value, Some(ttl)));
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, expected, new_value))]
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();
        let now = Instant::now();
        let current = data.get(key).filter(|entry| entry.is_live(now));

        let matches = match (expected, current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur.value[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::conflict(key));
        }

        data.insert(key.to_owned(), Entry::new(new_value, None));
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StorageResult<i64> {
        let mut data = self.data.write();
        let now = Instant::now();

        match data.get_mut(key).filter(|entry| entry.is_live(now)) {
            Some(entry) => {
                let current = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        StorageError::serialization(format!("value at {key} is not an integer"))
                    })?;
                let next = current.saturating_add(1);
                entry.value = Bytes::from(next.to_string());
                Ok(next)
            },
            None => {
                data.insert(key.to_owned(), Entry::new(b"1".to_vec(), Some(ttl_on_create)));
                Ok(1)
            },
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let data = self.data.read();
        let now = Instant::now();
        Ok(data.get(key).filter(|entry| entry.is_live(now)).map(|entry| match entry.expires_at {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::MAX,
        }))
    }

    #[tracing::instrument(level = "trace", skip(self, entries), fields(count = entries.len()))]
    async fn write_batch(&self, entries: Vec<BatchEntry>) -> StorageResult<()> {
        let mut data = self.data.write();
        for entry in entries {
            data.insert(entry.key, Entry::new(entry.value, entry.ttl));
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn health_check(&self) -> StorageResult<()> {
        let _unused = self.data.read();
        Ok(())
    }
}
