//! Shared test utilities for authentication testing.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! perimeter-authn = { path = "../authn", features = ["testutil"] }
//! ```

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use crate::identity::TokenRecord;

/// Token-signing secret used across tests.
pub const TEST_TOKEN_SECRET: &[u8] = b"test-token-signing-secret";

/// Gateway HMAC secret used across tests.
pub const TEST_GATEWAY_SECRET: &[u8] = b"test-gateway-hmac-secret";

/// Builds a token record for `email` that expires `expires_in` seconds from now.
#[must_use]
pub fn token_record(email: &str, version: u64, expires_in: i64) -> TokenRecord {
    let now = Utc::now().timestamp();
    TokenRecord {
        subject_id: format!("id-{email}"),
        email: email.to_owned(),
        display_name: "Test User".to_owned(),
        role: "user".to_owned(),
        version,
        issued_at: now,
        expires_at: now + expires_in,
    }
}

/// Signs `record` as an HS256 bearer token.
///
/// # Panics
///
/// Panics if encoding fails (should not happen with valid inputs).
#[must_use]
pub fn mint_token(secret: &[u8], record: &TokenRecord) -> String {
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), record, &EncodingKey::from_secret(secret))
        .expect("token encoding should succeed")
}
