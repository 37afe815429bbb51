//! Deployment environment and shared-store key layout.
//!
//! Every key the perimeter writes is namespaced by [`Environment`] so that
//! staging and production can share one store without colliding.
//!
//! | Key | Written by |
//! |-----|------------|
//! | `user:{env}:{email}:tokenVersion` | revocation ledger |
//! | `invalid-token:{env}:{timestamp}` | verification audit log |
//! | `nonce:{env}:{nonce}` | durable nonce store |
//! | `ratelimit:{env}:{client}:state` | actor rate limiter |
//! | `ratelimit:{env}:{client}:count` | shared-counter rate limiter |
//! | `ratelimit:{env}:{client}:blocked` | shared-counter rate limiter |

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development. The only environment honoring the dev signature bypass.
    Development,
    /// Pre-production.
    Staging,
    /// Production.
    #[default]
    Production,
}

impl Environment {
    /// The namespace segment used in store keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    /// Returns `true` for [`Environment::Development`].
    #[must_use]
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Invalid {
                field: "environment",
                reason: format!("unknown environment `{other}`"),
            }),
        }
    }
}

/// Revocation version key for `subject`.
#[must_use]
pub fn token_version(env: Environment, subject: &str) -> String {
    format!("user:{env}:{subject}:tokenVersion")
}

/// Audit log key for a failed verification at `timestamp`.
#[must_use]
pub fn invalid_token(env: Environment, timestamp: &str) -> String {
    format!("invalid-token:{env}:{timestamp}")
}

/// Durable replay-protection key for `nonce`.
#[must_use]
pub fn nonce(env: Environment, nonce: &str) -> String {
    format!("nonce:{env}:{nonce}")
}

/// Persisted actor limiter state for `client`.
#[must_use]
pub fn ratelimit_state(env: Environment, client: &str) -> String {
    format!("ratelimit:{env}:{client}:state")
}

/// Fixed-window counter for `client`.
#[must_use]
pub fn ratelimit_count(env: Environment, client: &str) -> String {
    format!("ratelimit:{env}:{client}:count")
}

/// Penalty flag for `client`.
#[must_use]
pub fn ratelimit_blocked(env: Environment, client: &str) -> String {
    format!("ratelimit:{env}:{client}:blocked")
}
