//! Auth endpoint handlers.
//!
//! Handlers take raw `String` bodies: on the wire a body is either plaintext
//! JSON or a payload-codec envelope, and the codec decides which transparently.
//! Responses go back out through the same codec.
//!
//! Status mapping lives in [`error_response`]; the orchestrator decides the
//! error kind, this layer only translates it. Token failures (`expired`,
//! `invalid`, `reused`) deliberately share one wire code; they stay
//! distinguishable in logs, not to the caller.

pub mod login;
pub mod refresh;
pub mod session;
pub mod twofactor;
pub mod types;

use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::SESSION_HEADER;
use crate::auth::{AuthError, AuthOrchestrator, Principal};
use crate::codec::PayloadCodec;

use types::ErrorResponse;

/// Decode a request body that may or may not be an envelope.
pub(super) fn decode_request<T: DeserializeOwned>(
    codec: &PayloadCodec,
    body: &str,
) -> Result<T, Response> {
    let plaintext = codec.decrypt(body);
    serde_json::from_str(&plaintext).map_err(|_| {
        // A parse failure after decryption fallback is the contextual error
        // the codec contract defers to this layer.
        encode_json(
            codec,
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "malformed_request".to_string(),
            },
        )
    })
}

/// Serialize and (when a key is configured) encrypt a response body.
pub(super) fn encode_json<T: Serialize>(
    codec: &PayloadCodec,
    status: StatusCode,
    value: &T,
) -> Response {
    match serde_json::to_string(value) {
        Ok(plaintext) => (status, codec.encrypt(&plaintext)).into_response(),
        Err(err) => {
            error!("failed to serialize response body: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Translate the error taxonomy into statuses and uniform error bodies.
pub(super) fn error_response(codec: &PayloadCodec, err: &AuthError) -> Response {
    let (status, code) = match err {
        AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
        AuthError::AccountLocked => (StatusCode::LOCKED, "account_locked"),
        AuthError::EmailNotConfirmed => (StatusCode::FORBIDDEN, "email_not_confirmed"),
        AuthError::SecondFactorRequired => (StatusCode::UNAUTHORIZED, "second_factor_required"),
        AuthError::SecondFactorInvalid => (StatusCode::BAD_REQUEST, "second_factor_invalid"),
        AuthError::SecondFactorExhausted => {
            (StatusCode::UNAUTHORIZED, "second_factor_exhausted")
        }
        AuthError::SecondFactorUnavailable => (StatusCode::NOT_FOUND, "second_factor_unavailable"),
        AuthError::LoginFlowExpired => (StatusCode::UNAUTHORIZED, "login_expired"),
        // One wire code for every token failure; the distinction is audit-only.
        AuthError::TokenExpired | AuthError::TokenInvalid | AuthError::TokenReused => {
            (StatusCode::UNAUTHORIZED, "token_invalid")
        }
        AuthError::SessionInvalid => (StatusCode::UNAUTHORIZED, "session_invalid"),
        AuthError::SessionEnded => (StatusCode::UNAUTHORIZED, "session_ended"),
        AuthError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        AuthError::TransientUpstream => (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable"),
        AuthError::Internal(source) => {
            error!("internal auth error: {source:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    };
    encode_json(
        codec,
        status,
        &ErrorResponse {
            error: code.to_string(),
        },
    )
}

/// Resolve the bearer token + session header into a principal, or the
/// matching error response.
pub(super) async fn require_principal(
    headers: &HeaderMap,
    orchestrator: &AuthOrchestrator,
    codec: &PayloadCodec,
) -> Result<Principal, Response> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(error_response(codec, &AuthError::TokenInvalid));
    };
    let Some(session_id) = extract_session_id(headers) else {
        return Err(error_response(codec, &AuthError::SessionInvalid));
    };
    orchestrator
        .authenticate(&token, &session_id)
        .await
        .map_err(|err| error_response(codec, &err))
}

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub(super) fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Extract a client IP from common proxy headers, for rate limiting and the
/// advisory fingerprint.
pub(super) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::{extract_bearer_token, extract_client_ip, extract_session_id};
    use axum::http::{HeaderMap, HeaderValue, header::AUTHORIZATION};

    #[test]
    fn bearer_token_extraction_trims_and_rejects_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(extract_bearer_token(&headers), Some("abc".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn session_id_comes_from_the_dedicated_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_session_id(&headers), None);
        headers.insert("x-session-id", HeaderValue::from_static(" sid-1 "));
        assert_eq!(extract_session_id(&headers), Some("sid-1".to_string()));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }
}
