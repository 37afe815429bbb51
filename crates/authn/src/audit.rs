//! Best-effort durable log of failed token verifications.
//!
//! Records are queued on a [`WriteBatcher`] and expire after
//! [`AUDIT_RETENTION`]. Writing a record never fails the caller, who always
//! sees the authentication error itself.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use perimeter_storage::{BatchEntry, Environment, WriteBatcher, keys};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AuthError;

/// How long failed-verification records are kept (7 days).
pub const AUDIT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A stored failed-verification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The presented token.
    pub token: String,
    /// The verification error message.
    pub error: String,
    /// When the failure happened, RFC 3339.
    pub timestamp: String,
}

/// Queues failed verifications for the durable audit log.
#[derive(Debug, Clone)]
pub struct InvalidTokenAudit {
    batcher: WriteBatcher,
    env: Environment,
}

impl InvalidTokenAudit {
    /// Creates an audit log writing through `batcher`.
    #[must_use]
    pub fn new(batcher: WriteBatcher, env: Environment) -> Self {
        Self { batcher, env }
    }

    /// The underlying batcher.
    #[must_use]
    pub fn batcher(&self) -> &WriteBatcher {
        &self.batcher
    }

    /// Queues a record of `token` failing with `error`.
    pub fn record(&self, token: &str, error: &AuthError) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let record = AuditRecord {
            token: token.to_owned(),
            error: error.to_string(),
            timestamp: timestamp.clone(),
        };

        match serde_json::to_vec(&record) {
            Ok(value) => {
                let key = keys::invalid_token(self.env, &timestamp);
                self.batcher.enqueue(BatchEntry::with_ttl(key, value, AUDIT_RETENTION));
            },
            Err(err) => warn!(error = %err, "failed to encode audit record"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use perimeter_storage::{BatchConfig, MemoryBackend, StorageBackend};

    use super::*;

    #[tokio::test]
    async fn record_is_written_with_retention() {
        let backend = Arc::new(MemoryBackend::new());
        let batcher = WriteBatcher::new("audit", backend.clone(), BatchConfig::default());
        let audit = InvalidTokenAudit::new(batcher, Environment::Staging);

        audit.record("bad.token", &AuthError::TokenExpired);
        audit.batcher().flush().await.unwrap();

        let keys = backend.keys_with_prefix("invalid-token:staging:");
        assert_eq!(keys.len(), 1);

        let raw = backend.get(&keys[0]).await.unwrap().unwrap();
        let stored: AuditRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.token, "bad.token");
        assert_eq!(stored.error, "Token expired");
        assert!(keys[0].ends_with(&stored.timestamp));

        let ttl = backend.ttl(&keys[0]).await.unwrap().unwrap();
        assert!(ttl > AUDIT_RETENTION - Duration::from_secs(60));
    }
}
