//! Positive-result cache for verified bearer tokens.
//!
//! Entries are keyed by a SHA-256 digest of the environment and raw token, so
//! raw tokens are never held as map keys. Each entry lives for the configured
//! TTL (default 3 minutes) or until the token's own `exp`, whichever is
//! sooner. The cache is also capacity-bounded so token churn cannot grow it
//! without limit. Failed verifications are never cached.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use moka::{future::Cache, policy::EvictionPolicy};
use perimeter_storage::Environment;
use sha2::{Digest, Sha256};

use crate::identity::TokenRecord;

/// Default lifetime of a cached verification (3 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(180);

/// Default maximum number of cached verifications.
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

#[derive(Clone)]
struct CachedRecord {
    record: Arc<TokenRecord>,
    lifetime: Duration,
}

/// Per-entry expiry that honors the lifetime computed at insertion time.
struct RecordExpiry;

impl moka::Expiry<String, CachedRecord> for RecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedRecord,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

/// In-memory verification cache, injected into the token verifier.
///
/// Cloning shares the same entries.
#[derive(Clone)]
pub struct VerificationCache {
    entries: Cache<String, CachedRecord>,
    ttl: Duration,
    env: Environment,
}

impl std::fmt::Debug for VerificationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationCache")
            .field("env", &self.env)
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl VerificationCache {
    /// Creates a cache for tokens presented in `env`.
    #[must_use]
    pub fn new(env: Environment, ttl: Duration, max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(RecordExpiry)
            .build();
        Self { entries, ttl, env }
    }

    /// Returns the cached record for `token`, if present and unexpired.
    pub async fn get(&self, token: &str) -> Option<Arc<TokenRecord>> {
        self.entries.get(&self.key(token)).await.map(|cached| cached.record)
    }

    /// Caches a successful verification of `token`.
    ///
    /// Tokens that expire within the next second are not cached.
    pub async fn insert(&self, token: &str, record: Arc<TokenRecord>) {
        let remaining = record.expires_at.saturating_sub(Utc::now().timestamp());
        let Ok(remaining) = u64::try_from(remaining) else {
            return;
        };
        let lifetime = self.ttl.min(Duration::from_secs(remaining));
        if lifetime.is_zero() {
            return;
        }
        self.entries.insert(self.key(token), CachedRecord { record, lifetime }).await;
    }

    /// Drops every cached verification.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate number of cached entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Runs pending eviction and expiry housekeeping.
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    fn key(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.env.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
