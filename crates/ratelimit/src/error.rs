//! Rate limiter error types.

use perimeter_storage::StorageError;
use thiserror::Error;

/// Errors a rate limiter can raise instead of a decision.
///
/// Callers treat any of these as "allow": a broken limiter must not block
/// legitimate traffic.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RateLimitError {
    /// The shared store failed.
    #[error("rate limit store error: {0}")]
    Store(
        /// The underlying store failure.
        #[from]
        StorageError,
    ),

    /// The per-key actor could not be reached.
    #[error("rate limit actor for `{key}` is unavailable")]
    ActorUnavailable {
        /// The limiter key.
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_keeps_source() {
        let err = RateLimitError::from(StorageError::timeout());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("rate limit store error"));
    }
}
