//! HTTP rendering of limiter decisions.

use http::{
    HeaderMap, HeaderName, HeaderValue, Response, StatusCode,
    header::{CONTENT_TYPE, RETRY_AFTER},
};
use serde_json::json;

use crate::decision::RateLimitDecision;

/// Machine-readable code carried by rate-limit rejections.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Configured budget.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Budget left.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Unix time (seconds) at which the caller may retry.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Builds the 429 response for a denied request.
///
/// `now_unix` is the current Unix time in seconds, used for the reset header.
#[must_use]
pub fn too_many_requests(limit: u32, retry_after: u64, now_unix: u64) -> Response<String> {
    let message = format!("Rate limit exceeded. Retry after {retry_after} seconds.");
    let body = json!({
        "errors": [{ "message": message }],
        "extensions": { "code": RATE_LIMIT_EXCEEDED },
        "data": null,
    });

    let mut response = Response::new(body.to_string());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    apply_quota_headers(headers, limit, 0);
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(now_unix.saturating_add(retry_after)));
    response
}

/// Renders a denial, or `None` when the decision allows the request.
#[must_use]
pub fn render_denial(decision: &RateLimitDecision, now_unix: u64) -> Option<Response<String>> {
    match *decision {
        RateLimitDecision::Deny { limit, retry_after } => {
            Some(too_many_requests(limit, retry_after, now_unix))
        },
        RateLimitDecision::Allow { .. } => None,
    }
}

/// Writes the quota headers onto an allowed response.
pub fn apply_quota_headers(headers: &mut HeaderMap, limit: u32, remaining: u32) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn denial_has_status_body_and_headers() {
        let response = too_many_requests(50, 40, 1_760_000_000);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[RETRY_AFTER], "40");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "50");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1760000040");
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["extensions"]["code"], RATE_LIMIT_EXCEEDED);
        assert!(body["data"].is_null());
        assert!(body["errors"][0]["message"].as_str().unwrap().contains("40 seconds"));
    }

    #[test]
    fn allowed_decision_renders_nothing() {
        let allow = RateLimitDecision::Allow { limit: 50, remaining: 3, delay: Duration::ZERO };
        assert!(render_denial(&allow, 0).is_none());

        let deny = RateLimitDecision::Deny { limit: 50, retry_after: 5 };
        assert_eq!(render_denial(&deny, 0).unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn quota_headers_overwrite() {
        let mut headers = HeaderMap::new();
        apply_quota_headers(&mut headers, 50, 49);
        apply_quota_headers(&mut headers, 50, 48);
        assert_eq!(headers.get_all(X_RATELIMIT_REMAINING).iter().count(), 1);
        assert_eq!(headers[X_RATELIMIT_REMAINING], "48");
    }
}
