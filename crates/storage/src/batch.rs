//! Write batching for fire-and-forget log records.
//!
//! [`WriteBatcher`] buffers [`BatchEntry`] writes in memory and hands them to
//! the store as one [`write_batch`](crate::StorageBackend::write_batch) call
//! once a size threshold is reached. Flushes triggered by the threshold run in
//! a background task and their failures are logged and swallowed: queued
//! entries are non-critical audit data and callers must not depend on the
//! durability of any single one.
//!
//! # Examples
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use perimeter_storage::{BatchConfig, BatchEntry, MemoryBackend, WriteBatcher};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = Arc::new(MemoryBackend::new());
//! let batcher = WriteBatcher::new("audit", backend.clone(), BatchConfig::default());
//!
//! batcher.enqueue(BatchEntry::with_ttl("log:1", b"a".to_vec(), Duration::from_secs(60)));
//! batcher.enqueue(BatchEntry::with_ttl("log:2", b"b".to_vec(), Duration::from_secs(60)));
//!
//! let stats = batcher.flush().await.unwrap();
//! assert_eq!(stats.entries_count, 2);
//! # });
//! ```

use std::{
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

use fail::fail_point;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{BatchEntry, ConfigError, StorageBackend, StorageError, StorageResult};

/// Default number of queued entries that triggers a flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Default queued byte size that triggers a flush (1 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Configuration for write batching.
///
/// # Validation
///
/// - `max_batch_size` must be `>= 1`
/// - `max_batch_bytes` must be `>= 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    max_batch_size: usize,
    max_batch_bytes: usize,
    enabled: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            enabled: true,
        }
    }
}

#[bon::bon]
impl BatchConfig {
    /// Creates a new batch configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_batch_size` or `max_batch_bytes` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_BATCH_SIZE)] max_batch_size: usize,
        #[builder(default = DEFAULT_MAX_BATCH_BYTES)] max_batch_bytes: usize,
        #[builder(default = true)] enabled: bool,
    ) -> Result<Self, ConfigError> {
        if max_batch_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_batch_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if max_batch_bytes == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_batch_bytes",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self { max_batch_size, max_batch_bytes, enabled })
    }

    /// Creates a config that flushes on every enqueue.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Returns the entry-count threshold.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Returns the byte-size threshold.
    #[must_use]
    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    /// Returns whether batching is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Statistics from one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchFlushStats {
    /// Number of entries written.
    pub entries_count: usize,
    /// Total key and value bytes written.
    pub total_bytes: usize,
    /// Time taken by the store call.
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Queue {
    entries: Vec<BatchEntry>,
    bytes: usize,
}

impl Queue {
    fn take(&mut self) -> Vec<BatchEntry> {
        self.bytes = 0;
        mem::take(&mut self.entries)
    }
}

/// Buffers writes and flushes them to the store in batches.
///
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct WriteBatcher {
    name: &'static str,
    backend: Arc<dyn StorageBackend>,
    queue: Arc<Mutex<Queue>>,
    config: BatchConfig,
}

impl std::fmt::Debug for WriteBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatcher")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl WriteBatcher {
    /// Creates a batcher writing to `backend`. `name` identifies it in logs.
    #[must_use]
    pub fn new(name: &'static str, backend: Arc<dyn StorageBackend>, config: BatchConfig) -> Self {
        Self { name, backend, queue: Arc::new(Mutex::new(Queue::default())), config }
    }

    /// Queues an entry, flushing in the background once the threshold is hit.
    ///
    /// Returns the handle of the spawned flush task when this call triggered
    /// one. Callers are free to ignore it. Must be called within a Tokio runtime.
    pub fn enqueue(&self, entry: BatchEntry) -> Option<JoinHandle<()>> {
        let batch = {
            let mut queue = self.queue.lock();
            queue.bytes += entry.size();
            queue.entries.push(entry);
            if !self.should_flush(&queue) {
                return None;
            }
            queue.take()
        };

        let backend = Arc::clone(&self.backend);
        let name = self.name;
        Some(tokio::spawn(async move {
            if let Err(err) = write(backend.as_ref(), batch).await {
                warn!(batcher = name, error = %err, "batched write failed, entries dropped");
            }
        }))
    }

    /// Writes every queued entry now.
    ///
    /// Unlike threshold flushes, the store error is returned to the caller;
    /// the drained entries are dropped either way.
    ///
    /// # Errors
    ///
    /// Returns the [`StorageError`] raised by the store.
    pub async fn flush(&self) -> StorageResult<BatchFlushStats> {
        let batch = self.queue.lock().take();
        write(self.backend.as_ref(), batch).await
    }

    /// Drops every queued entry without writing.
    pub fn clear(&self) {
        self.queue.lock().take();
    }

    /// Number of queued entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Estimated size of queued entries in bytes.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.queue.lock().bytes
    }

    fn should_flush(&self, queue: &Queue) -> bool {
        if !self.config.enabled {
            return !queue.entries.is_empty();
        }
        queue.entries.len() >= self.config.max_batch_size
            || queue.bytes >= self.config.max_batch_bytes
    }
}

async fn write(
    backend: &dyn StorageBackend,
    batch: Vec<BatchEntry>,
) -> StorageResult<BatchFlushStats> {
    if batch.is_empty() {
        return Ok(BatchFlushStats::default());
    }

    fail_point!("batch-before-write", |_| {
        Err(StorageError::internal("injected failure before batch write"))
    });

    let entries_count = batch.len();
    let total_bytes = batch.iter().map(BatchEntry::size).sum();
    let start = Instant::now();
    backend.write_batch(batch).await?;
    let stats = BatchFlushStats { entries_count, total_bytes, duration: start.elapsed() };

    debug!(entries = stats.entries_count, bytes = stats.total_bytes, "batch flushed");
    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{MemoryBackend, testutil::FlakyBackend};

    fn entry(i: usize) -> BatchEntry {
        BatchEntry::with_ttl(format!("log:{i:03}"), b"x".to_vec(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn enqueue_below_threshold_does_not_write() {
        let backend = Arc::new(MemoryBackend::new());
        let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::default());

        for i in 0..49 {
            assert!(batcher.enqueue(entry(i)).is_none());
        }
        assert_eq!(batcher.pending_count(), 49);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn threshold_triggers_single_batched_write() {
        let backend = Arc::new(FlakyBackend::new());
        let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::default());

        let mut handle = None;
        for i in 0..DEFAULT_MAX_BATCH_SIZE {
            handle = batcher.enqueue(entry(i));
        }
        handle.expect("50th entry triggers flush").await.unwrap();

        assert_eq!(batcher.pending_count(), 0);
        assert_eq!(backend.batch_calls(), 1);
        assert_eq!(backend.inner().keys_with_prefix("log:").len(), DEFAULT_MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn background_flush_failure_is_swallowed() {
        let backend = Arc::new(FlakyBackend::new());
        backend.set_failing(true);
        let config = BatchConfig::builder().max_batch_size(2).build().unwrap();
        let batcher = WriteBatcher::new("test", backend.clone(), config);

        batcher.enqueue(entry(0));
        let handle = batcher.enqueue(entry(1)).expect("flush spawned");
        handle.await.expect("flush task must not panic");

        assert_eq!(batcher.pending_count(), 0, "failed batch is dropped, not retried");
        assert!(backend.inner().is_empty());
    }

    #[tokio::test]
    async fn explicit_flush_reports_error() {
        let backend = Arc::new(FlakyBackend::new());
        let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::default());
        batcher.enqueue(entry(0));

        backend.set_failing(true);
        assert!(batcher.flush().await.is_err());
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn byte_threshold_triggers_flush() {
        let backend = Arc::new(MemoryBackend::new());
        let config = BatchConfig::builder().max_batch_bytes(16).build().unwrap();
        let batcher = WriteBatcher::new("test", backend.clone(), config);

        let big = BatchEntry::persistent("k", vec![0u8; 32]);
        batcher.enqueue(big).expect("byte threshold reached").await.unwrap();
        assert!(backend.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disabled_batching_flushes_every_entry() {
        let backend = Arc::new(MemoryBackend::new());
        let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::disabled());

        assert!(batcher.enqueue(entry(0)).is_some());
    }

    #[tokio::test]
    async fn clear_drops_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::default());
        batcher.enqueue(entry(0));
        batcher.clear();

        assert_eq!(batcher.pending_count(), 0);
        assert_eq!(batcher.pending_bytes(), 0);
        assert_eq!(batcher.flush().await.unwrap().entries_count, 0);
    }

    #[test]
    fn config_rejects_zero_size() {
        assert!(BatchConfig::builder().max_batch_size(0).build().is_err());
        assert!(BatchConfig::builder().max_batch_bytes(0).build().is_err());
    }
}
