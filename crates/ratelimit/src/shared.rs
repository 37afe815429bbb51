//! Fixed-window rate limiter over the shared store.
//!
//! No process owns a key's state: every check is a sequence of store calls and
//! correctness rests on the store linearizing [`increment`] for a key. This is
//! the fallback for deployments without per-key actors, and an independent
//! second line of defense when both limiters run.
//!
//! [`increment`]: perimeter_storage::StorageBackend::increment

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use perimeter_storage::{ConfigError, Environment, StorageBackend, keys};
use tracing::{debug, warn};

use crate::{decision::RateLimitDecision, error::RateLimitError, policy::RateLimitPolicy};

/// Default requests allowed per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 50;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default lockout added after the window runs out.
pub const DEFAULT_PENALTY: Duration = Duration::from_secs(40);

/// Configuration for [`SharedCounterRateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedCounterConfig {
    max_requests: u32,
    window: Duration,
    penalty: Duration,
    environment: Environment,
}

impl Default for SharedCounterConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            penalty: DEFAULT_PENALTY,
            environment: Environment::default(),
        }
    }
}

#[bon::bon]
impl SharedCounterConfig {
    /// Creates a new shared counter configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_requests` is zero or a duration is
    /// shorter than one millisecond.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_REQUESTS)] max_requests: u32,
        #[builder(default = DEFAULT_WINDOW)] window: Duration,
        #[builder(default = DEFAULT_PENALTY)] penalty: Duration,
        #[builder(default)] environment: Environment,
    ) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_requests",
                min: "1".into(),
                value: "0".into(),
            });
        }
        for (field, value) in [("window", window), ("penalty", penalty)] {
            if value < Duration::from_millis(1) {
                return Err(ConfigError::MustBePositive { field, value: format!("{value:?}") });
            }
        }
        Ok(Self { max_requests, window, penalty, environment })
    }

    /// Requests allowed per window.
    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Lockout added after the window.
    #[must_use]
    pub fn penalty(&self) -> Duration {
        self.penalty
    }
}

/// Fixed-window counter limiter with penalty lockout.
#[derive(Clone)]
pub struct SharedCounterRateLimiter {
    store: Arc<dyn StorageBackend>,
    config: SharedCounterConfig,
}

impl std::fmt::Debug for SharedCounterRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounterRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SharedCounterRateLimiter {
    /// Creates a limiter counting in `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StorageBackend>, config: SharedCounterConfig) -> Self {
        Self { store, config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SharedCounterConfig {
        &self.config
    }

    fn deny(&self, remaining: Duration) -> RateLimitDecision {
        RateLimitDecision::Deny {
            limit: self.config.max_requests,
            retry_after: remaining.as_millis().div_ceil(1000).max(1).try_into().unwrap_or(u64::MAX),
        }
    }
}

#[async_trait]
impl RateLimitPolicy for SharedCounterRateLimiter {
    fn name(&self) -> &'static str {
        "shared-counter"
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn check(&self, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        let env = self.config.environment;
        let blocked_key = keys::ratelimit_blocked(env, key);

        if let Some(remaining) = self.store.ttl(&blocked_key).await? {
            let remaining =
                if remaining == Duration::MAX { self.config.penalty } else { remaining };
            return Ok(self.deny(remaining));
        }

        let count_key = keys::ratelimit_count(env, key);
        let count = self.store.increment(&count_key, self.config.window).await?;
        let max = i64::from(self.config.max_requests);

        if count > max {
            let window_left = match self.store.ttl(&count_key).await? {
                Some(left) => left.min(self.config.window),
                None => Duration::ZERO,
            };
            let lockout = window_left + self.config.penalty;
            self.store.set_with_ttl(&blocked_key, b"1".to_vec(), lockout).await?;
            if let Err(err) = self.store.delete(&count_key).await {
                // The counter expires with its window anyway.
                warn!(key, error = %err, "failed to reset rate limit window");
            }
            debug!(key, count, ?lockout, "shared counter tripped penalty");
            return Ok(self.deny(lockout));
        }

        let remaining = u32::try_from(max - count).unwrap_or(0);
        Ok(RateLimitDecision::Allow {
            limit: self.config.max_requests,
            remaining,
            delay: Duration::ZERO,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use perimeter_storage::{MemoryBackend, testutil::FlakyBackend};
    use rstest::rstest;

    use super::*;

    fn limiter(store: Arc<dyn StorageBackend>, max: u32) -> SharedCounterRateLimiter {
        let config = SharedCounterConfig::builder()
            .max_requests(max)
            .environment(Environment::Development)
            .build()
            .unwrap();
        SharedCounterRateLimiter::new(store, config)
    }

    #[tokio::test]
    async fn counts_down_remaining() {
        let limiter = limiter(Arc::new(MemoryBackend::new()), 3);
        let remaining: Vec<_> = [
            limiter.check("k").await.unwrap(),
            limiter.check("k").await.unwrap(),
            limiter.check("k").await.unwrap(),
        ]
        .iter()
        .map(RateLimitDecision::remaining)
        .collect();
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn exceeding_sets_flag_and_clears_counter() {
        let store = Arc::new(MemoryBackend::new());
        let limiter = limiter(store.clone(), 2);
        limiter.check("k").await.unwrap();
        limiter.check("k").await.unwrap();

        let denied = limiter.check("k").await.unwrap();
        let retry = denied.retry_after().expect("third request denied");
        assert!((41..=100).contains(&retry), "window remainder plus penalty, got {retry}");

        assert!(store.get("ratelimit:development:k:count").await.unwrap().is_none());
        assert!(store.get("ratelimit:development:k:blocked").await.unwrap().is_some());

        let still = limiter.check("k").await.unwrap();
        assert!(!still.is_allowed());
        let count = store.get("ratelimit:development:k:count").await.unwrap();
        assert!(count.is_none(), "blocked checks do not count");
    }

    #[tokio::test]
    async fn persistent_flag_reports_penalty() {
        let store = Arc::new(MemoryBackend::new());
        store.set("ratelimit:development:k:blocked", b"1".to_vec()).await.unwrap();
        let decision = limiter(store, 5).check("k").await.unwrap();
        assert_eq!(decision.retry_after(), Some(40));
    }

    #[tokio::test]
    async fn store_failure_is_an_error_not_a_denial() {
        let store = Arc::new(FlakyBackend::new());
        store.set_failing(true);
        let result = limiter(store, 5).check("k").await;
        assert!(matches!(result, Err(RateLimitError::Store(_))));
    }

    #[rstest]
    #[case::zero_max(SharedCounterConfig::builder().max_requests(0).build())]
    #[case::zero_window(SharedCounterConfig::builder().window(Duration::ZERO).build())]
    #[case::sub_millisecond_penalty(
        SharedCounterConfig::builder().penalty(Duration::from_micros(10)).build()
    )]
    fn config_rejects_out_of_range(#[case] result: Result<SharedCounterConfig, ConfigError>) {
        assert!(result.is_err());
    }
}
