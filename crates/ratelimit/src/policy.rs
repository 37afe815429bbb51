//! The common limiter interface and its layered composition.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{decision::RateLimitDecision, error::RateLimitError};

/// A rate-limit policy keyed by client (typically the client IP).
#[async_trait]
pub trait RateLimitPolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Counts one request for `key` and decides whether it may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the policy cannot reach a decision.
    async fn check(&self, key: &str) -> Result<RateLimitDecision, RateLimitError>;
}

/// Runs independent policies in sequence; the first denial wins.
///
/// A policy that errors is logged and treated as allowing the request. When
/// every policy allows, the most restrictive quota is reported.
#[derive(Clone, Default)]
pub struct LayeredLimiter {
    policies: Vec<Arc<dyn RateLimitPolicy>>,
}

impl std::fmt::Debug for LayeredLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.policies.iter().map(|p| p.name()).collect();
        f.debug_struct("LayeredLimiter").field("policies", &names).finish()
    }
}

impl LayeredLimiter {
    /// Creates an empty limiter, which allows everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a policy, checked after the existing ones.
    #[must_use]
    pub fn with(mut self, policy: Arc<dyn RateLimitPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Number of policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns `true` if no policy is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Checks `key` against every policy. Never fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let mut verdict: Option<RateLimitDecision> = None;

        for policy in &self.policies {
            match policy.check(key).await {
                Ok(deny @ RateLimitDecision::Deny { retry_after, .. }) => {
                    warn!(policy = policy.name(), retry_after, "rate limit exceeded");
                    return deny;
                },
                Ok(allow) => {
                    let tighter =
                        verdict.is_none_or(|current| allow.remaining() < current.remaining());
                    if tighter {
                        verdict = Some(allow);
                    }
                },
                Err(err) => {
                    warn!(
                        policy = policy.name(),
                        error = %err,
                        "rate limiter failed, allowing request"
                    );
                },
            }
        }

        verdict.unwrap_or(RateLimitDecision::Allow {
            limit: u32::MAX,
            remaining: u32::MAX,
            delay: std::time::Duration::ZERO,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use perimeter_storage::StorageError;

    use super::*;

    struct Fixed {
        outcome: fn() -> Result<RateLimitDecision, RateLimitError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(outcome: fn() -> Result<RateLimitDecision, RateLimitError>) -> Arc<Self> {
            Arc::new(Self { outcome, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl RateLimitPolicy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn check(&self, _key: &str) -> Result<RateLimitDecision, RateLimitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn allow(remaining: u32) -> RateLimitDecision {
        RateLimitDecision::Allow { limit: 50, remaining, delay: Duration::ZERO }
    }

    #[tokio::test]
    async fn either_denial_denies() {
        let first = Fixed::new(|| Ok(allow(10)));
        let second = Fixed::new(|| Ok(RateLimitDecision::Deny { limit: 50, retry_after: 40 }));
        let limiter = LayeredLimiter::new().with(first).with(second);

        assert_eq!(limiter.check("k").await.retry_after(), Some(40));
    }

    #[tokio::test]
    async fn first_denial_short_circuits() {
        let first = Fixed::new(|| Ok(RateLimitDecision::Deny { limit: 50, retry_after: 3 }));
        let second = Fixed::new(|| Ok(allow(10)));
        let limiter = LayeredLimiter::new().with(first).with(second.clone());

        assert!(!limiter.check("k").await.is_allowed());
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn errors_are_treated_as_allow() {
        let broken = Fixed::new(|| Err(StorageError::connection("down").into()));
        let limiter = LayeredLimiter::new().with(broken);
        assert!(limiter.check("k").await.is_allowed());
    }

    #[tokio::test]
    async fn reports_tightest_quota() {
        let loose = Fixed::new(|| Ok(allow(40)));
        let tight = Fixed::new(|| Ok(allow(3)));
        let limiter = LayeredLimiter::new().with(loose).with(tight);
        assert_eq!(limiter.check("k").await.remaining(), 3);
    }

    #[tokio::test]
    async fn empty_limiter_allows() {
        assert!(LayeredLimiter::new().check("k").await.is_allowed());
    }
}
