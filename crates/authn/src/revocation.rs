//! Server-side token revocation.
//!
//! Each subject (keyed by email) has a monotonically increasing version in
//! the shared store. A token is valid only while its embedded version equals
//! the stored one; a missing record counts as version `0`. Bumping the
//! version invalidates every outstanding token for the subject at once.
//!
//! Reads go through a [`CircuitBreaker`] whose fallback trusts the version
//! embedded in the presented token, so an unreachable store degrades
//! revocation rather than availability. Writes share the breaker but have no
//! fallback: a failed revocation is surfaced as
//! [`AuthError::RevocationWriteFailed`].

use std::sync::Arc;

use fail::fail_point;
use perimeter_storage::{
    BreakerError, CircuitBreaker, Environment, StorageBackend, StorageError, StorageResult, keys,
};
use tracing::{debug, info};

use crate::error::AuthError;

/// Maximum compare-and-set attempts for one increment.
pub const MAX_INCREMENT_ATTEMPTS: usize = 8;

/// Per-subject token version store.
#[derive(Clone)]
pub struct RevocationLedger {
    backend: Arc<dyn StorageBackend>,
    breaker: CircuitBreaker,
    env: Environment,
}

impl std::fmt::Debug for RevocationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationLedger")
            .field("env", &self.env)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl RevocationLedger {
    /// Creates a ledger reading and writing through `breaker`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        breaker: CircuitBreaker,
        env: Environment,
    ) -> Self {
        Self { backend, breaker, env }
    }

    /// The breaker protecting the store.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the stored version for `subject`.
    ///
    /// If the store is unreachable, the circuit is open, or the stored value
    /// is unreadable, returns `presented` so the check passes.
    #[tracing::instrument(level = "debug", skip(self), fields(env = %self.env))]
    pub async fn current_version(&self, subject: &str, presented: u64) -> u64 {
        let key = keys::token_version(self.env, subject);
        self.breaker.execute(|| self.read(&key), || presented).await
    }

    /// Bumps the stored version for `subject`, returning the new version.
    ///
    /// Concurrent increments never lose an update.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RevocationWriteFailed`] if the store fails, the
    /// circuit is open, or the compare-and-set loop keeps losing races.
    #[tracing::instrument(skip(self), fields(env = %self.env))]
    pub async fn increment_version(&self, subject: &str) -> Result<u64, AuthError> {
        let key = keys::token_version(self.env, subject);
        match self.breaker.call(|| self.bump(&key)).await {
            Ok(version) => {
                info!(version, "token version incremented");
                Ok(version)
            },
            Err(BreakerError::Open) => Err(AuthError::RevocationWriteFailed(
                StorageError::connection("revocation store circuit is open"),
            )),
            Err(BreakerError::Inner(err)) => Err(AuthError::RevocationWriteFailed(err)),
        }
    }

    async fn read(&self, key: &str) -> StorageResult<u64> {
        fail_point!("revocation-before-read", |_| {
            Err(StorageError::connection("injected failure before revocation read"))
        });

        match self.backend.get(key).await? {
            Some(raw) => parse_version(key, &raw),
            None => Ok(0),
        }
    }

    async fn bump(&self, key: &str) -> StorageResult<u64> {
        for attempt in 1..=MAX_INCREMENT_ATTEMPTS {
            let current = self.backend.get(key).await?;
            let next = match current.as_deref() {
                Some(raw) => parse_version(key, raw)?.saturating_add(1),
                None => 1,
            };

            match self
                .backend
                .compare_and_set(key, current.as_deref(), next.to_string().into_bytes())
                .await
            {
                Ok(()) => return Ok(next),
                Err(StorageError::Conflict { .. }) => {
                    debug!(attempt, "token version changed concurrently, retrying");
                },
                Err(err) => return Err(err),
            }
        }
        Err(StorageError::conflict(key))
    }
}

fn parse_version(key: &str, raw: &[u8]) -> StorageResult<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            StorageError::serialization(format!("value at {key} is not a token version"))
        })
}
