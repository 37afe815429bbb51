//! Limiter verdicts.

use std::time::Duration;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request may proceed.
    Allow {
        /// Configured request budget.
        limit: u32,
        /// Budget left, for observability headers.
        remaining: u32,
        /// How far the caller is ahead of its allowed pace. Zero when on budget.
        delay: Duration,
    },
    /// The request is rejected.
    Deny {
        /// Configured request budget.
        limit: u32,
        /// Whole seconds until the caller may retry.
        retry_after: u64,
    },
}

impl RateLimitDecision {
    /// Returns `true` for [`RateLimitDecision::Allow`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Seconds until retry, for denials.
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Deny { retry_after, .. } => Some(*retry_after),
            Self::Allow { .. } => None,
        }
    }

    /// The configured budget.
    #[must_use]
    pub fn limit(&self) -> u32 {
        match self {
            Self::Allow { limit, .. } | Self::Deny { limit, .. } => *limit,
        }
    }

    /// Budget left; zero for denials.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        match self {
            Self::Allow { remaining, .. } => *remaining,
            Self::Deny { .. } => 0,
        }
    }
}

/// Rounds milliseconds up to whole seconds.
pub(crate) fn ceil_secs(millis: i64) -> u64 {
    u64::try_from(millis).map_or(0, |ms| ms.div_ceil(1000))
}
