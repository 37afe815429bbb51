//! Header names and extraction for inbound tokens and propagated identity.

use http::{HeaderMap, HeaderName, HeaderValue, header::AUTHORIZATION};

use crate::{
    error::{AuthError, Result},
    identity::Identity,
};

/// Signing time in milliseconds since the Unix epoch.
pub const X_GATEWAY_TIMESTAMP: HeaderName = HeaderName::from_static("x-gateway-timestamp");
/// Per-request random nonce.
pub const X_GATEWAY_NONCE: HeaderName = HeaderName::from_static("x-gateway-nonce");
/// Hex HMAC-SHA256 over the signature payload.
pub const X_GATEWAY_SIGNATURE: HeaderName = HeaderName::from_static("x-gateway-signature");
/// Propagated subject identifier.
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
/// Propagated role.
pub const X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");
/// Propagated email.
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
/// Propagated display name.
pub const X_USER_NAME: HeaderName = HeaderName::from_static("x-user-name");

/// Identity headers, in propagation order.
pub const IDENTITY_HEADERS: [HeaderName; 4] = [X_USER_ID, X_USER_ROLE, X_USER_EMAIL, X_USER_NAME];

/// Extracts the token from `Authorization: Bearer <token>`.
///
/// Returns `Ok(None)` when the header is absent, which marks an anonymous
/// request.
///
/// # Errors
///
/// Returns [`AuthError::TokenInvalid`] if the header is present but is not a
/// well-formed bearer credential.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AuthError::token_invalid("authorization header is not valid ASCII"))?;

    let (scheme, token) = value.split_once(' ').ok_or_else(|| {
        AuthError::token_invalid("authorization header is not a bearer credential")
    })?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::token_invalid("authorization scheme must be Bearer"));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::token_invalid("bearer token is empty"));
    }
    Ok(Some(token))
}

/// Reads a header as UTF-8, treating an empty value as absent.
pub(crate) fn text<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => std::str::from_utf8(value.as_bytes())
            .map(|s| Some(s).filter(|s| !s.is_empty()))
            .map_err(|_| AuthError::invalid_request(format!("{name} is not valid UTF-8"))),
    }
}

/// Reads the propagated identity from the `X-User-*` headers.
///
/// Only meaningful after the request's signature has been verified.
///
/// # Errors
///
/// Returns [`AuthError::InvalidRequest`] if a header is not valid UTF-8.
pub fn propagated_identity(headers: &HeaderMap) -> Result<Option<Identity>> {
    let Some(subject_id) = text(headers, &X_USER_ID)? else {
        return Ok(None);
    };
    let field = |name: &HeaderName| -> Result<String> {
        Ok(text(headers, name)?.unwrap_or_default().to_owned())
    };
    Ok(Some(Identity {
        subject_id: subject_id.to_owned(),
        role: field(&X_USER_ROLE)?,
        email: field(&X_USER_EMAIL)?,
        display_name: field(&X_USER_NAME)?,
    }))
}

/// Writes `identity` into the `X-User-*` headers, or strips them when absent.
///
/// # Errors
///
/// Returns [`AuthError::InvalidRequest`] if a field contains control characters.
pub fn write_identity(headers: &mut HeaderMap, identity: Option<&Identity>) -> Result<()> {
    for name in &IDENTITY_HEADERS {
        headers.remove(name);
    }
    let Some(identity) = identity else {
        return Ok(());
    };

    let values = [
        &identity.subject_id,
        &identity.role,
        &identity.email,
        &identity.display_name,
    ];
    for (name, value) in IDENTITY_HEADERS.into_iter().zip(values) {
        let value = HeaderValue::from_bytes(value.as_bytes()).map_err(|_| {
            AuthError::invalid_request(format!("{name} contains invalid characters"))
        })?;
        headers.insert(name, value);
    }
    Ok(())
}
