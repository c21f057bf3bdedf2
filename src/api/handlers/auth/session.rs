//! Session lifecycle endpoints: keep-alive, unlock, logout, logout-all.

use axum::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use std::sync::Arc;

use crate::auth::{AuthError, AuthOrchestrator};
use crate::codec::PayloadCodec;

use super::types::{
    ErrorResponse, KeepAliveResponse, LogoutRequest, LogoutResponse, UnlockRequest, UnlockResponse,
};
use super::{
    decode_request, encode_json, error_response, extract_bearer_token, extract_session_id,
    require_principal,
};

/// Validate and extend the caller's session.
///
/// Session-state failures come back as `200 {isValid:false, reason}` so the
/// UI can tell "you were signed out" from "you were never signed in"; only
/// token failures are authorization errors.
#[utoipa::path(
    post,
    path = "/v1/auth/session/keep-alive",
    responses(
        (status = 200, description = "Session state", body = KeepAliveResponse),
        (status = 401, description = "Token failure", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn keep_alive(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
) -> Response {
    let Some(token) = extract_bearer_token(&headers) else {
        return error_response(&codec, &AuthError::TokenInvalid);
    };
    let Some(session_id) = extract_session_id(&headers) else {
        return error_response(&codec, &AuthError::SessionInvalid);
    };

    match orchestrator.keep_alive(&token, &session_id).await {
        Ok(record) => encode_json(
            &codec,
            StatusCode::OK,
            &KeepAliveResponse {
                is_valid: true,
                expires_at: Some(record.expires_at),
                reason: None,
            },
        ),
        Err(AuthError::SessionEnded) => encode_json(
            &codec,
            StatusCode::OK,
            &KeepAliveResponse {
                is_valid: false,
                expires_at: None,
                reason: Some("session_ended".to_string()),
            },
        ),
        Err(AuthError::SessionInvalid) => encode_json(
            &codec,
            StatusCode::OK,
            &KeepAliveResponse {
                is_valid: false,
                expires_at: None,
                reason: Some("session_invalid".to_string()),
            },
        ),
        Err(err) => error_response(&codec, &err),
    }
}

/// Re-verify the password behind the lock screen.
#[utoipa::path(
    post,
    path = "/v1/auth/session/unlock",
    request_body = UnlockRequest,
    responses(
        (status = 200, description = "Unlock outcome", body = UnlockResponse),
        (status = 401, description = "Wrong password or bad token", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn unlock(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let Some(token) = extract_bearer_token(&headers) else {
        return error_response(&codec, &AuthError::TokenInvalid);
    };
    let Some(session_id) = extract_session_id(&headers) else {
        return error_response(&codec, &AuthError::SessionInvalid);
    };
    let request: UnlockRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match orchestrator.unlock(&token, &session_id, &request.password).await {
        Ok(_record) => encode_json(
            &codec,
            StatusCode::OK,
            &UnlockResponse {
                success: true,
                account_locked: false,
                session_expired: false,
            },
        ),
        Err(AuthError::AccountLocked) => encode_json(
            &codec,
            StatusCode::OK,
            &UnlockResponse {
                success: false,
                account_locked: true,
                session_expired: false,
            },
        ),
        Err(AuthError::SessionEnded | AuthError::SessionInvalid) => encode_json(
            &codec,
            StatusCode::OK,
            &UnlockResponse {
                success: false,
                account_locked: false,
                session_expired: true,
            },
        ),
        Err(err) => error_response(&codec, &err),
    }
}

/// End the caller's session. Idempotent, and deliberately forgiving: server
/// revocation is attempted and its failure only logged, because the client
/// clears its local credentials either way.
#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = LogoutResponse)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
) -> Response {
    if let Some(session_id) = extract_session_id(&headers) {
        orchestrator.logout(&session_id).await;
    }
    encode_json(&codec, StatusCode::OK, &LogoutResponse { success: true })
}

/// "Log out everywhere." The caller's own session survives unless the body
/// asks for `includeCurrent`.
#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out everywhere", body = LogoutResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn logout_all(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let request: LogoutRequest = if body.trim().is_empty() {
        LogoutRequest {
            include_current: false,
        }
    } else {
        match decode_request(&codec, &body) {
            Ok(request) => request,
            Err(response) => return response,
        }
    };

    // The principal was just authenticated, so its session id is present.
    let Some(session_id) = extract_session_id(&headers) else {
        return error_response(&codec, &AuthError::SessionInvalid);
    };

    match orchestrator
        .logout_all(principal.user_id, &session_id, request.include_current)
        .await
    {
        Ok(_ended) => encode_json(&codec, StatusCode::OK, &LogoutResponse { success: true }),
        Err(err) => error_response(&codec, &err),
    }
}
