//! Gateway error types.

use http::{HeaderValue, Response, StatusCode, header::CONTENT_TYPE};
use perimeter_authn::AuthError;
use perimeter_storage::ConfigError;
use thiserror::Error;
use tracing_subscriber::util::TryInitError;

/// Errors raised while assembling the perimeter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// A setting is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A global tracing subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Telemetry(#[from] TryInitError),
}

/// Why the gateway turned a request away.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Rejection {
    /// The caller is over its rate limit.
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited {
        /// Configured budget.
        limit: u32,
        /// Whole seconds until the caller may retry.
        retry_after: u64,
    },

    /// Authentication or trust verification failed.
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
}

impl Rejection {
    /// HTTP status for this rejection.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(err) => err.status(),
        }
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => perimeter_ratelimit::response::RATE_LIMIT_EXCEEDED,
            Self::Unauthorized(err) => err.code(),
        }
    }

    /// Renders the rejection, using `now_unix` (seconds) for reset headers.
    #[must_use]
    pub fn to_response_at(&self, now_unix: u64) -> Response<String> {
        match self {
            Self::RateLimited { limit, retry_after } => {
                perimeter_ratelimit::too_many_requests(*limit, *retry_after, now_unix)
            },
            Self::Unauthorized(err) => {
                let mut response =
                    Response::new(serde_json::to_string(&err.to_body()).unwrap_or_default());
                *response.status_mut() = err.status();
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            },
        }
    }

    /// Renders the rejection at the current time.
    #[must_use]
    pub fn to_response(&self) -> Response<String> {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        self.to_response_at(now)
    }
}
