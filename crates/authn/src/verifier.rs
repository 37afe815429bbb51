//! Bearer-token verification.
//!
//! # Pipeline
//!
//! ```text
//! token → verification cache hit? → return cached record (no store access)
//!       → HS256 signature + structure   (TOKEN_INVALID)
//!       → exp in the past?              (TOKEN_EXPIRED, ledger not consulted)
//!       → revocation ledger version     (TOKEN_REVOKED on mismatch)
//!       → cache and return
//! ```
//!
//! Every failure is queued to the invalid-token audit log, best effort.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use perimeter_storage::ConfigError;
use tracing::{debug, warn};

use crate::{
    audit::InvalidTokenAudit,
    cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, VerificationCache},
    error::{AuthError, Result},
    identity::TokenRecord,
    revocation::RevocationLedger,
};

/// Configuration for the verification cache.
///
/// # Validation
///
/// - `cache_ttl` must be non-zero
/// - `cache_capacity` must be `>= 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierConfig {
    cache_ttl: Duration,
    cache_capacity: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self { cache_ttl: DEFAULT_CACHE_TTL, cache_capacity: DEFAULT_CACHE_CAPACITY }
    }
}

#[bon::bon]
impl VerifierConfig {
    /// Creates a new verifier configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `cache_ttl` or `cache_capacity` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CACHE_TTL)] cache_ttl: Duration,
        #[builder(default = DEFAULT_CACHE_CAPACITY)] cache_capacity: u64,
    ) -> std::result::Result<Self, ConfigError> {
        if cache_ttl.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "cache_ttl",
                value: format!("{cache_ttl:?}"),
            });
        }
        if cache_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "cache_capacity",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self { cache_ttl, cache_capacity })
    }

    /// Lifetime of a cached verification.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Maximum number of cached verifications.
    #[must_use]
    pub fn cache_capacity(&self) -> u64 {
        self.cache_capacity
    }
}

/// Verifies bearer tokens against the signing secret and revocation ledger.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    ledger: RevocationLedger,
    cache: VerificationCache,
    audit: Option<InvalidTokenAudit>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("ledger", &self.ledger)
            .field("cache", &self.cache)
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Creates a verifier for HS256 tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8], ledger: RevocationLedger, cache: VerificationCache) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked after decoding so it can be reported distinctly.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let decoding_key = DecodingKey::from_secret(secret);
        Self { decoding_key, validation, ledger, cache, audit: None }
    }

    /// Queues every failed verification to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: InvalidTokenAudit) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The verification cache.
    #[must_use]
    pub fn cache(&self) -> &VerificationCache {
        &self.cache
    }

    /// The revocation ledger.
    #[must_use]
    pub fn ledger(&self) -> &RevocationLedger {
        &self.ledger
    }

    /// The invalid-token audit log, if one is attached.
    #[must_use]
    pub fn audit(&self) -> Option<&InvalidTokenAudit> {
        self.audit.as_ref()
    }

    /// Verifies `token` and returns its decoded record.
    ///
    /// # Errors
    ///
    /// - [`AuthError::TokenInvalid`] if the token is malformed or its signature is wrong
    /// - [`AuthError::TokenExpired`] if its `exp` is in the past
    /// - [`AuthError::TokenRevoked`] if its version differs from the ledger's
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn verify(&self, token: &str) -> Result<Arc<TokenRecord>> {
        if let Some(record) = self.cache.get(token).await {
            debug!("verification cache hit");
            return Ok(record);
        }

        match self.verify_uncached(token).await {
            Ok(record) => {
                let record = Arc::new(record);
                self.cache.insert(token, Arc::clone(&record)).await;
                Ok(record)
            },
            Err(err) => {
                self.record_failure(token, &err);
                Err(err)
            },
        }
    }

    /// Logs a rejected credential and queues it to the audit log, if any.
    ///
    /// Callers that reject a credential before [`verify`](Self::verify) runs,
    /// such as a malformed `Authorization` header, report it here.
    pub fn record_failure(&self, presented: &str, err: &AuthError) {
        warn!(code = err.code(), error = %err, "token verification failed");
        if let Some(audit) = &self.audit {
            audit.record(presented, err);
        }
    }

    async fn verify_uncached(&self, token: &str) -> Result<TokenRecord> {
        let record = decode::<TokenRecord>(token, &self.decoding_key, &self.validation)?.claims;

        if record.is_expired_at(Utc::now().timestamp()) {
            return Err(AuthError::TokenExpired);
        }

        let stored = self.ledger.current_version(&record.email, record.version).await;
        if stored != record.version {
            debug!(presented = record.version, stored, "token version mismatch");
            return Err(AuthError::TokenRevoked);
        }

        Ok(record)
    }
}
