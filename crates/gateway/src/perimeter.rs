//! Gateway-side request pipeline.
//!
//! For every inbound request the gateway rate limits by client key,
//! authenticates the optional bearer token, and signs the outbound request so
//! internal services can trust the identity headers it carries.
//!
//! ```text
//! inbound ──► LayeredLimiter ──► TokenVerifier ──► RequestSigner ──► outbound
//!                 │ deny              │ error
//!                 ▼                   ▼
//!               429               401 / 500
//! ```

use std::sync::Arc;

use http::{HeaderMap, header::AUTHORIZATION};
use perimeter_authn::{
    AuthError, GatewayKey, Identity, InvalidTokenAudit, RequestSigner, RevocationLedger,
    SignedRequest, TokenVerifier, VerificationCache, bearer_token,
};
use perimeter_ratelimit::{
    ActorRateLimiter, LayeredLimiter, RateLimitDecision, SharedCounterRateLimiter,
    apply_quota_headers,
};
use perimeter_storage::{BatchConfig, CircuitBreaker, StorageBackend, WriteBatcher};
use tracing::{info, warn};

use crate::{
    config::PerimeterConfig,
    error::{GatewayError, Rejection},
};

/// A request the gateway let through.
#[derive(Debug, Clone)]
pub struct Admitted {
    /// The authenticated caller, `None` for public requests.
    pub identity: Option<Identity>,
    /// Headers to forward: the inbound set with signed trust headers applied
    /// and the bearer token removed.
    pub headers: HeaderMap,
    /// The limiter verdict, for quota headers on the response.
    pub decision: RateLimitDecision,
}

impl Admitted {
    /// Writes `x-ratelimit-limit` and `x-ratelimit-remaining` onto the
    /// response headers. Nothing is written when no limiter reported a quota.
    pub fn apply_quota_headers(&self, response: &mut HeaderMap) {
        let limit = self.decision.limit();
        if limit == u32::MAX {
            return;
        }
        apply_quota_headers(response, limit, self.decision.remaining());
    }
}

/// The gateway pipeline.
#[derive(Debug)]
pub struct Perimeter {
    limiter: LayeredLimiter,
    verifier: TokenVerifier,
    signer: RequestSigner,
}

impl Perimeter {
    /// Assembles a pipeline from its parts.
    #[must_use]
    pub fn new(limiter: LayeredLimiter, verifier: TokenVerifier, signer: RequestSigner) -> Self {
        Self { limiter, verifier, signer }
    }

    /// Builds the pipeline described by `config` over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn from_config(
        config: &PerimeterConfig,
        store: Arc<dyn StorageBackend>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let env = config.environment;

        let breaker = CircuitBreaker::new("revocation", config.breaker_config()?);
        let ledger = RevocationLedger::new(Arc::clone(&store), breaker, env);
        let verifier_config = config.verifier_config()?;
        let cache = VerificationCache::new(
            env,
            verifier_config.cache_ttl(),
            verifier_config.cache_capacity(),
        );
        let audit = InvalidTokenAudit::new(
            WriteBatcher::new("invalid-token-audit", Arc::clone(&store), BatchConfig::default()),
            env,
        );
        let verifier = TokenVerifier::new(config.token_secret.expose().as_bytes(), ledger, cache)
            .with_audit(audit);

        let gateway_key = GatewayKey::new(config.gateway_secret.expose().as_bytes())?;
        let signer = RequestSigner::new(gateway_key);

        let mut limiter = LayeredLimiter::new();
        if config.rate_limit.actor {
            limiter = limiter
                .with(Arc::new(ActorRateLimiter::new(Arc::clone(&store), config.actor_config()?)));
        }
        if config.rate_limit.shared_counter {
            limiter = limiter.with(Arc::new(SharedCounterRateLimiter::new(
                Arc::clone(&store),
                config.shared_counter_config()?,
            )));
        }
        if limiter.is_empty() {
            warn!("no rate limiter configured, all traffic is admitted");
        }

        info!(environment = %env, limiters = limiter.len(), "perimeter assembled");
        Ok(Self::new(limiter, verifier, signer))
    }

    /// The token verifier.
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Rate limits `client_key`. Never fails: limiter errors allow the request.
    pub async fn admit(&self, client_key: &str) -> RateLimitDecision {
        self.limiter.check(client_key).await
    }

    /// Authenticates the bearer token in `headers`, if any.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] for a malformed, invalid, expired or revoked
    /// token. Malformed headers are audited like failed tokens.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        let token = match bearer_token(headers) {
            Ok(token) => token,
            Err(err) => {
                let presented = headers
                    .get(AUTHORIZATION)
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                    .unwrap_or_default();
                self.verifier.record_failure(&presented, &err);
                return Err(err);
            },
        };
        match token {
            Some(token) => Ok(Some(self.verifier.verify(token).await?.identity())),
            None => Ok(None),
        }
    }

    /// Signs `identity` and writes the trust headers into `headers`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidRequest`] if an identity field cannot be
    /// carried in a header.
    pub fn sign_outbound(
        &self,
        identity: Option<&Identity>,
        headers: &mut HeaderMap,
    ) -> Result<SignedRequest, AuthError> {
        let signed = self.signer.sign(identity);
        signed.apply(headers)?;
        Ok(signed)
    }

    /// Runs the whole pipeline for one inbound request.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the caller is rate limited or fails
    /// authentication.
    #[tracing::instrument(skip(self, inbound))]
    pub async fn handle(
        &self,
        client_key: &str,
        inbound: &HeaderMap,
    ) -> Result<Admitted, Rejection> {
        let decision = self.admit(client_key).await;
        if let RateLimitDecision::Deny { limit, retry_after } = decision {
            return Err(Rejection::RateLimited { limit, retry_after });
        }

        let identity = self.authenticate(inbound).await?;

        let mut headers = inbound.clone();
        headers.remove(AUTHORIZATION);
        self.sign_outbound(identity.as_ref(), &mut headers)?;

        Ok(Admitted { identity, headers, decision })
    }

    /// Revokes every outstanding token for `email` and drops cached
    /// verifications.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RevocationWriteFailed`] if the new version could
    /// not be stored. Revocation never fails silently.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_sessions(&self, email: &str) -> Result<u64, AuthError> {
        let version = self.verifier.ledger().increment_version(email).await?;
        self.verifier.cache().clear();
        info!(version, "sessions invalidated");
        Ok(version)
    }
}
