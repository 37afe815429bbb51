//! Token payload and the identity derived from it.

use serde::{Deserialize, Serialize};

/// Decoded payload of a bearer token.
///
/// Issued externally; the perimeter only verifies and reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Subject identifier.
    #[serde(rename = "id")]
    pub subject_id: String,
    /// Subject email; also the revocation key.
    pub email: String,
    /// Human-readable name.
    #[serde(rename = "name")]
    pub display_name: String,
    /// Role propagated to internal services.
    pub role: String,
    /// Revocation version the token was issued under.
    #[serde(rename = "tokenVersion", default)]
    pub version: u64,
    /// Issued-at, seconds since the Unix epoch.
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Expiry, seconds since the Unix epoch.
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl TokenRecord {
    /// Returns `true` if the token expired at or before `now` (Unix seconds).
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// The identity this token vouches for.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            subject_id: self.subject_id.clone(),
            role: self.role.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// A verified caller, scoped to one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Subject identifier.
    pub subject_id: String,
    /// Role.
    pub role: String,
    /// Email.
    pub email: String,
    /// Display name.
    pub display_name: String,
}

impl From<&TokenRecord> for Identity {
    fn from(record: &TokenRecord) -> Self {
        record.identity()
    }
}
