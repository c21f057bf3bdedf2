//! Login endpoint.

use axum::Extension;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::USER_AGENT};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::error;

use crate::SESSION_HEADER;
use crate::auth::{AuthOrchestrator, AuthenticatedSession, LoginOutcome};
use crate::codec::PayloadCodec;
use crate::session::ClientFingerprint;

use super::types::{ErrorResponse, LoginRequest, LoginResponse};
use super::{decode_request, encode_json, error_response, extract_client_ip};

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated, or second factor required", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 423, description = "Account locked", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let request: LoginRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let fingerprint = ClientFingerprint {
        ip: extract_client_ip(&headers),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        device: request.device_fingerprint.clone(),
    };

    match orchestrator
        .login(&request.identity, &request.password, fingerprint)
        .await
    {
        Ok(LoginOutcome::Authenticated(session)) => authenticated_response(&codec, &session),
        Ok(LoginOutcome::SecondFactorRequired { user_id, providers }) => encode_json(
            &codec,
            StatusCode::OK,
            &LoginResponse {
                requires_2fa: true,
                user_id: user_id.to_string(),
                providers: Some(providers),
                ..LoginResponse::default()
            },
        ),
        Err(err) => error_response(&codec, &err),
    }
}

/// Token material in the body, session identifier in the response header.
pub(super) fn authenticated_response(
    codec: &PayloadCodec,
    session: &AuthenticatedSession,
) -> Response {
    let body = LoginResponse {
        access_token: Some(session.tokens.access_token.clone()),
        refresh_token: Some(session.tokens.refresh_token.clone()),
        access_expires_at: Some(session.tokens.access_expires_at),
        refresh_expires_at: Some(session.tokens.refresh_expires_at),
        requires_2fa: false,
        user_id: session.tokens.user_id.to_string(),
        providers: None,
    };
    let mut response = encode_json(codec, StatusCode::OK, &body);
    match HeaderValue::from_str(&session.session_id) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_HEADER, value);
            response
        }
        Err(err) => {
            error!("session id is not a valid header value: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
