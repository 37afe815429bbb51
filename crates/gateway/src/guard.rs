//! Service-side verification of gateway-signed requests.

use std::sync::Arc;

use http::HeaderMap;
use perimeter_authn::{
    AuthError, DurableNonceStore, GatewayKey, Identity, InMemoryNonceStore, NonceStore,
    SignatureVerifier, nonce::DEFAULT_NONCE_CAPACITY, propagated_identity,
};
use perimeter_storage::{BatchConfig, StorageBackend, WriteBatcher};

use crate::{config::PerimeterConfig, error::GatewayError};

/// Admits requests to an internal service only if the gateway signed them.
#[derive(Debug)]
pub struct ServiceGuard {
    verifier: SignatureVerifier,
}

impl ServiceGuard {
    /// Wraps a signature verifier.
    #[must_use]
    pub fn new(verifier: SignatureVerifier) -> Self {
        Self { verifier }
    }

    /// Builds a guard from `config`, remembering nonces locally and in `store`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn from_config(
        config: &PerimeterConfig,
        store: Arc<dyn StorageBackend>,
    ) -> Result<Self, GatewayError> {
        let nonces: Arc<dyn NonceStore> = Arc::new(DurableNonceStore::new(
            InMemoryNonceStore::new(DEFAULT_NONCE_CAPACITY),
            Arc::clone(&store),
            WriteBatcher::new("nonce-log", store, BatchConfig::default()),
            config.environment,
        ));
        let key = GatewayKey::new(config.gateway_secret.expose().as_bytes())?;
        Ok(Self::new(SignatureVerifier::new(key, config.signature_config()?, nonces)))
    }

    /// The nonce store.
    #[must_use]
    pub fn nonces(&self) -> &Arc<dyn NonceStore> {
        self.verifier.nonces()
    }

    /// Verifies the gateway signature and returns the propagated identity.
    ///
    /// Identity headers are read only after the signature and nonce check
    /// out; `None` means the gateway forwarded a public request.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing the failed check.
    #[tracing::instrument(skip_all)]
    pub async fn verify(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        self.verifier.verify(headers).await?;
        propagated_identity(headers)
    }
}
