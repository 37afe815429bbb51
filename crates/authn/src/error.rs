//! Authentication error types.
//!
//! Every failure carries a stable machine-readable code ([`AuthError::code`])
//! and an HTTP status ([`AuthError::status`]). Callers surface the specific
//! code rather than collapsing failures into a generic "unauthorized".

use http::StatusCode;
use perimeter_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Authentication and inter-service trust errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Bearer token is malformed or its signature does not verify.
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// Bearer token's `exp` is in the past.
    #[error("Token expired")]
    TokenExpired,

    /// Bearer token's version no longer matches the revocation ledger.
    #[error("Token revoked")]
    TokenRevoked,

    /// One of the gateway timestamp, nonce or signature headers is absent.
    #[error("Missing gateway signature headers")]
    MissingHeaders,

    /// A gateway header is present but unparseable.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request nonce has already been accepted.
    #[error("Replay attack detected")]
    ReplayAttack,

    /// The request timestamp is outside the accepted window.
    #[error("Request timestamp outside accepted window")]
    RequestTimeout,

    /// The recomputed request signature does not match.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The revocation version could not be written.
    ///
    /// Fatal: revocation must never fail silently.
    #[error("Failed to write revocation version: {0}")]
    RevocationWriteFailed(
        /// The underlying store failure.
        #[source]
        StorageError,
    ),
}

impl AuthError {
    /// Creates a [`AuthError::TokenInvalid`].
    pub fn token_invalid(reason: impl Into<String>) -> Self {
        Self::TokenInvalid(reason.into())
    }

    /// Creates an [`AuthError::InvalidRequest`].
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// The machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TokenInvalid(_) => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::MissingHeaders => "MISSING_HEADERS",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ReplayAttack => "REPLAY_ATTACK",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::RevocationWriteFailed(_) => "REVOCATION_WRITE_FAILED",
        }
    }

    /// The HTTP status this error is surfaced with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RevocationWriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Renders the error as a response body.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.to_string(), self.code())
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidSignature => AuthError::token_invalid("signature mismatch"),
            ErrorKind::InvalidToken => AuthError::token_invalid("malformed token"),
            ErrorKind::InvalidAlgorithm => AuthError::token_invalid("unexpected algorithm"),
            _ => AuthError::token_invalid(format!("JWT error: {err}")),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// GraphQL-style error response body.
///
/// Serializes as `{"errors":[{"message":..,"extensions":{"code":..}}],"data":null}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Reported errors. Always exactly one.
    pub errors: Vec<ErrorEntry>,
    /// Always `null`.
    pub data: Option<()>,
}

/// One entry of [`ErrorBody::errors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable extensions.
    pub extensions: ErrorExtensions,
}

/// Error extensions carrying the machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorExtensions {
    /// Stable error code, e.g. `TOKEN_EXPIRED`.
    pub code: &'static str,
}

impl ErrorBody {
    /// Creates a body with a single error.
    #[must_use]
    pub fn new(message: impl Into<String>, code: &'static str) -> Self {
        Self {
            errors: vec![ErrorEntry {
                message: message.into(),
                extensions: ErrorExtensions { code },
            }],
            data: None,
        }
    }
}
