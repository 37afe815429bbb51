//! # Perimeter Authentication
//!
//! Caller authentication and gateway-to-service trust.
//!
//! This crate provides:
//! - **Token verification**: HS256 bearer tokens checked for signature, expiry and revocation
//! - **Revocation ledger**: per-subject token versions in the shared store, read through a circuit
//!   breaker
//! - **Verification cache**: bounded positive-result cache so hot tokens skip the store
//! - **Request signing**: HMAC-SHA256 signatures binding identity, timestamp and nonce on
//!   gateway → service calls
//! - **Replay protection**: nonce stores rejecting any signed request seen twice
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use perimeter_authn::{
//!     GatewayKey, InMemoryNonceStore, RequestSigner, SignatureConfig, SignatureVerifier,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = GatewayKey::new(b"shared-gateway-secret")?;
//!
//! // Gateway side
//! let signed = RequestSigner::new(key.clone()).sign(None);
//! let mut headers = http::HeaderMap::new();
//! signed.apply(&mut headers)?;
//!
//! // Service side
//! let nonces = Arc::new(InMemoryNonceStore::default());
//! let verifier = SignatureVerifier::new(key, SignatureConfig::default(), nonces);
//! verifier.verify(&headers).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`testutil`**: token minting helpers for tests
//! - **`failpoints`**: `fail` crate injection before the revocation-store read

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Invalid-token audit log.
pub mod audit;
/// Verification cache.
pub mod cache;
/// Authentication error types.
pub mod error;
/// Header names, bearer extraction and identity propagation.
pub mod headers;
/// Token payload and identity.
pub mod identity;
/// Replay protection.
pub mod nonce;
/// Token revocation.
pub mod revocation;
/// Gateway request signing.
pub mod signing;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
/// Bearer-token verification.
pub mod verifier;

pub use audit::{AUDIT_RETENTION, AuditRecord, InvalidTokenAudit};
pub use cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, VerificationCache};
pub use error::{AuthError, ErrorBody, Result};
pub use headers::{bearer_token, propagated_identity};
pub use identity::{Identity, TokenRecord};
pub use nonce::{DurableNonceStore, InMemoryNonceStore, NonceStore};
pub use revocation::RevocationLedger;
pub use signing::{
    DEFAULT_MAX_AGE, DEFAULT_NONCE_TTL, GatewayKey, RequestSigner, SignatureConfig,
    SignatureVerifier, SignedRequest,
};
pub use verifier::{TokenVerifier, VerifierConfig};
