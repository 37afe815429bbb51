//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the shared key/value store the perimeter builds on:
//! the revocation ledger, the shared-counter rate limiter, persisted actor
//! limiter state, the nonce log and the invalid-token audit log all live here.
//!
//! # Design Philosophy
//!
//! - **String keys, byte values**: keys are namespaced strings such as
//!   `user:{env}:{email}:tokenVersion`; values carry no assumed encoding.
//! - **Async by default**: every operation is a suspension point.
//! - **Store-side atomicity**: [`increment`](StorageBackend::increment) and
//!   [`compare_and_set`](StorageBackend::compare_and_set) are linearized by
//!   the store, so callers never need application-side locking.
//! - **TTL everywhere**: expired keys are logically absent for every read.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// A single write inside a [`write_batch`](StorageBackend::write_batch) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Key to write.
    pub key: String,
    /// Value to store.
    pub value: Vec<u8>,
    /// Optional expiry applied to the key.
    pub ttl: Option<Duration>,
}

impl BatchEntry {
    /// Creates an entry that expires after `ttl`.
    #[must_use]
    pub fn with_ttl(key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self { key: key.into(), value: value.into(), ttl: Some(ttl) }
    }

    /// Creates a non-expiring entry.
    #[must_use]
    pub fn persistent(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into(), ttl: None }
    }

    /// Approximate size of the entry in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Abstract key/value store with TTL and atomic counters.
///
/// Implementations must be `Send + Sync` and safe for concurrent use.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Read a live value |
/// | [`set`](StorageBackend::set) | Store a non-expiring value |
/// | [`set_with_ttl`](StorageBackend::set_with_ttl) | Store with expiry |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`increment`](StorageBackend::increment) | Atomic counter with expire-on-create |
/// | [`ttl`](StorageBackend::ttl) | Remaining lifetime of a key |
/// | [`write_batch`](StorageBackend::write_batch) | Apply many writes in one call |
/// | [`health_check`](StorageBackend::health_check) | Verify availability |
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a live (non-expired) value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Stores a value without expiry, clearing any previous TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a value that expires after `ttl`.
    ///
    /// A zero `ttl` produces a key that is already expired on the next read.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically replaces the value of `key` if it currently equals `expected`.
    ///
    /// - `expected: None` succeeds only when the key is absent or expired.
    /// - `expected: Some(v)` succeeds only on an exact byte match.
    ///
    /// On success any existing TTL is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) when the
    /// precondition does not hold.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Removes a key. Deleting an absent key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Atomically increments the decimal counter stored at `key`.
    ///
    /// When the key is absent (or expired) it is created with value `1` and
    /// expiry `ttl_on_create`. Otherwise the counter is incremented and its
    /// existing expiry is preserved. Returns the post-increment value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`](crate::StorageError::Serialization)
    /// if the stored value is not a decimal integer.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StorageResult<i64>;

    /// Returns the remaining lifetime of a live key.
    ///
    /// `None` means the key is absent or expired. Keys stored without an
    /// expiry report [`Duration::MAX`].
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>>;

    /// Applies every entry in a single call.
    ///
    /// Backends should apply the batch atomically where they can; callers
    /// treat a batch as best-effort and must not rely on partial application.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn write_batch(&self, entries: Vec<BatchEntry>) -> StorageResult<()>;

    /// Verifies that the store is reachable.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        (**self).set(key, value).await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        (**self).compare_and_set(key, expected, new_value).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StorageResult<i64> {
        (**self).increment(key, ttl_on_create).await
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        (**self).ttl(key).await
    }

    async fn write_batch(&self, entries: Vec<BatchEntry>) -> StorageResult<()> {
        (**self).write_batch(entries).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
