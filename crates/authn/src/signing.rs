//! HMAC request signing between the gateway and internal services.
//!
//! The gateway signs every outbound call with a secret shared only with
//! internal services. The signature binds the propagated identity to a
//! timestamp and a fresh nonce:
//!
//! ```text
//! payload   = "{subject_id}:{role}:{timestamp}:{nonce}"   (identity present)
//!           | "public:{timestamp}:{nonce}"                (anonymous)
//! signature = hex(HMAC-SHA256(secret, payload))
//! ```
//!
//! Services re-verify before trusting any `X-User-*` header. Checks run in a
//! fixed order so cheap rejections happen before the HMAC is recomputed:
//! missing headers, dev bypass, timestamp format, replayed nonce, timestamp
//! window, signature. The nonce is registered only once all checks pass.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue};
use perimeter_storage::{ConfigError, Environment};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, Result},
    headers::{
        self, X_GATEWAY_NONCE, X_GATEWAY_SIGNATURE, X_GATEWAY_TIMESTAMP, X_USER_ID, X_USER_ROLE,
    },
    identity::Identity,
    nonce::NonceStore,
};

type HmacSha256 = Hmac<Sha256>;

/// Default accepted clock distance between signer and verifier (5 minutes).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Default lifetime of a registered nonce (10 minutes).
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10 * 60);

/// Random bytes per nonce.
pub const NONCE_BYTES: usize = 16;

/// Builds the signature payload.
#[must_use]
pub fn signature_payload(identity: Option<(&str, &str)>, timestamp: i64, nonce: &str) -> String {
    match identity {
        Some((subject_id, role)) => format!("{subject_id}:{role}:{timestamp}:{nonce}"),
        None => format!("public:{timestamp}:{nonce}"),
    }
}

/// The shared gateway secret, keyed once for HMAC-SHA256.
#[derive(Clone)]
pub struct GatewayKey {
    mac: HmacSha256,
}

impl std::fmt::Debug for GatewayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GatewayKey(<redacted>)")
    }
}

impl GatewayKey {
    /// Keys HMAC-SHA256 with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `secret` is empty.
    pub fn new(secret: &[u8]) -> std::result::Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            field: "gateway_secret",
            reason: reason.to_owned(),
        };
        if secret.is_empty() {
            return Err(invalid("must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|err| invalid(&err.to_string()))?;
        Ok(Self { mac })
    }

    /// Hex signature over `payload`.
    #[must_use]
    pub fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Compares `provided` against the signature of `payload` in constant time.
    #[must_use]
    pub fn verify(&self, payload: &str, provided: &str) -> bool {
        let expected = Zeroizing::new(self.sign(payload));
        bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
    }
}

/// Signature metadata for one outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Hex nonce.
    pub nonce: String,
    /// Hex HMAC-SHA256.
    pub signature: String,
    /// Identity bound into the signature, if any.
    pub identity: Option<Identity>,
}

impl SignedRequest {
    /// Writes the `X-Gateway-*` headers and the `X-User-*` identity headers.
    ///
    /// Identity headers already present on `headers` are always replaced or
    /// removed, so unsigned identity never reaches a service.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidRequest`] if an identity field cannot be
    /// carried in a header.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        headers::write_identity(headers, self.identity.as_ref())?;
        headers.insert(X_GATEWAY_TIMESTAMP, HeaderValue::from(self.timestamp));
        headers.insert(
            X_GATEWAY_NONCE,
            HeaderValue::from_str(&self.nonce)
                .map_err(|_| AuthError::invalid_request("nonce is not a valid header value"))?,
        );
        headers.insert(
            X_GATEWAY_SIGNATURE,
            HeaderValue::from_str(&self.signature)
                .map_err(|_| AuthError::invalid_request("signature is not a valid header value"))?,
        );
        Ok(())
    }
}

/// Gateway-side signer.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    key: GatewayKey,
}

impl RequestSigner {
    /// Creates a signer using `key`.
    #[must_use]
    pub fn new(key: GatewayKey) -> Self {
        Self { key }
    }

    /// Signs a request for `identity` with the current time and a fresh nonce.
    #[must_use]
    pub fn sign(&self, identity: Option<&Identity>) -> SignedRequest {
        let nonce = hex::encode(rand::random::<[u8; NONCE_BYTES]>());
        self.sign_with(identity, Utc::now().timestamp_millis(), nonce)
    }

    /// Signs with an explicit timestamp and nonce.
    #[must_use]
    pub fn sign_with(
        &self,
        identity: Option<&Identity>,
        timestamp: i64,
        nonce: String,
    ) -> SignedRequest {
        let payload = signature_payload(
            identity.map(|id| (id.subject_id.as_str(), id.role.as_str())),
            timestamp,
            &nonce,
        );
        SignedRequest {
            timestamp,
            signature: self.key.sign(&payload),
            nonce,
            identity: identity.cloned(),
        }
    }
}

/// Verification policy.
///
/// # Validation
///
/// - `max_age` must be non-zero
/// - `nonce_ttl` must be at least `max_age`, so a nonce cannot expire while
///   its timestamp is still accepted
/// - `dev_signature`, if set, must be non-empty
#[derive(Clone)]
pub struct SignatureConfig {
    max_age: Duration,
    nonce_ttl: Duration,
    environment: Environment,
    dev_signature: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for SignatureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureConfig")
            .field("max_age", &self.max_age)
            .field("nonce_ttl", &self.nonce_ttl)
            .field("environment", &self.environment)
            .field("dev_signature", &self.dev_signature.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            nonce_ttl: DEFAULT_NONCE_TTL,
            environment: Environment::default(),
            dev_signature: None,
        }
    }
}

#[bon::bon]
impl SignatureConfig {
    /// Creates a new verification policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a field violates the rules above.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_AGE)] max_age: Duration,
        #[builder(default = DEFAULT_NONCE_TTL)] nonce_ttl: Duration,
        #[builder(default)] environment: Environment,
        #[builder(into)] dev_signature: Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        if max_age.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "max_age",
                value: format!("{max_age:?}"),
            });
        }
        if nonce_ttl < max_age {
            return Err(ConfigError::BelowMinimum {
                field: "nonce_ttl",
                min: format!("{max_age:?}"),
                value: format!("{nonce_ttl:?}"),
            });
        }
        if dev_signature.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid {
                field: "dev_signature",
                reason: "must not be empty".into(),
            });
        }
        let dev_signature = dev_signature.map(Zeroizing::new);
        Ok(Self { max_age, nonce_ttl, environment, dev_signature })
    }

    /// Accepted clock distance.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Lifetime of a registered nonce.
    #[must_use]
    pub fn nonce_ttl(&self) -> Duration {
        self.nonce_ttl
    }

    /// Deployment environment.
    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The dev bypass signature, only when it is honored.
    fn active_dev_signature(&self) -> Option<&str> {
        if !self.environment.is_development() {
            return None;
        }
        self.dev_signature.as_deref().map(String::as_str)
    }
}

/// Service-side verifier.
#[derive(Clone)]
pub struct SignatureVerifier {
    key: GatewayKey,
    config: SignatureConfig,
    nonces: Arc<dyn NonceStore>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Creates a verifier registering nonces in `nonces`.
    #[must_use]
    pub fn new(key: GatewayKey, config: SignatureConfig, nonces: Arc<dyn NonceStore>) -> Self {
        if config.dev_signature.is_some() && !config.environment.is_development() {
            warn!(
                environment = %config.environment,
                "dev signature configured outside development, ignoring it"
            );
        }
        Self { key, config, nonces }
    }

    /// The nonce store.
    #[must_use]
    pub fn nonces(&self) -> &Arc<dyn NonceStore> {
        &self.nonces
    }

    /// Verifies the gateway signature on `headers` at the current time.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingHeaders`] if timestamp, nonce or signature is absent
    /// - [`AuthError::InvalidRequest`] if the timestamp is not an integer
    /// - [`AuthError::ReplayAttack`] if the nonce was already accepted
    /// - [`AuthError::RequestTimeout`] if the timestamp is outside `max_age`
    /// - [`AuthError::InvalidSignature`] if the signature does not match
    pub async fn verify(&self, headers: &HeaderMap) -> Result<()> {
        self.verify_at(headers, Utc::now().timestamp_millis()).await
    }

    /// Verifies as of `now` (milliseconds since the Unix epoch).
    ///
    /// # Errors
    ///
    /// See [`verify`](Self::verify).
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn verify_at(&self, headers: &HeaderMap, now: i64) -> Result<()> {
        let result = self.check(headers, now).await;
        if let Err(err) = &result {
            warn!(code = err.code(), "gateway signature rejected");
        }
        result
    }

    async fn check(&self, headers: &HeaderMap, now: i64) -> Result<()> {
        let (Some(timestamp), Some(nonce), Some(signature)) = (
            headers::text(headers, &X_GATEWAY_TIMESTAMP)?,
            headers::text(headers, &X_GATEWAY_NONCE)?,
            headers::text(headers, &X_GATEWAY_SIGNATURE)?,
        ) else {
            return Err(AuthError::MissingHeaders);
        };

        if let Some(dev) = self.config.active_dev_signature() {
            if bool::from(dev.as_bytes().ct_eq(signature.as_bytes())) {
                debug!("dev signature accepted");
                return Ok(());
            }
        }

        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| AuthError::invalid_request("timestamp is not an integer"))?;

        if self.nonces.contains(nonce).await {
            return Err(AuthError::ReplayAttack);
        }

        let max_age = u64::try_from(self.config.max_age.as_millis()).unwrap_or(u64::MAX);
        if now.abs_diff(timestamp) > max_age {
            return Err(AuthError::RequestTimeout);
        }

        let identity = match headers::text(headers, &X_USER_ID)? {
            Some(subject_id) => {
                Some((subject_id, headers::text(headers, &X_USER_ROLE)?.unwrap_or_default()))
            },
            None => None,
        };
        let payload = signature_payload(identity, timestamp, nonce);
        if !self.key.verify(&payload, signature) {
            return Err(AuthError::InvalidSignature);
        }

        if !self.nonces.register(nonce, self.config.nonce_ttl).await {
            return Err(AuthError::ReplayAttack);
        }
        Ok(())
    }
}
