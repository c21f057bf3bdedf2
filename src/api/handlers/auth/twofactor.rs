//! Second-factor endpoints: challenge flow plus factor management.

use axum::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{AuthError, AuthOrchestrator};
use crate::codec::PayloadCodec;

use super::types::{
    BackupCodesResponse, EmailFactorRequest, ErrorResponse, LogoutResponse, ProvidersResponse,
    TotpEnableRequest, TotpEnrollResponse, TwoFactorSendRequest, TwoFactorVerifyRequest,
    TwoFactorVerifyResponse,
};
use super::{decode_request, encode_json, error_response, require_principal};

fn parse_user_id(codec: &PayloadCodec, raw: &str) -> Result<Uuid, Response> {
    // An unparseable user id gets the generic login-expired answer; the ids
    // are opaque to clients and a bad one says nothing about real accounts.
    Uuid::parse_str(raw).map_err(|_| error_response(codec, &AuthError::LoginFlowExpired))
}

/// Deliver a challenge code for a pending login.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/send",
    request_body = TwoFactorSendRequest,
    responses(
        (status = 200, description = "Code sent", body = LogoutResponse),
        (status = 401, description = "No pending login", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn send(
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let request: TwoFactorSendRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let user_id = match parse_user_id(&codec, &request.user_id) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match orchestrator.send_second_factor_code(user_id).await {
        Ok(()) => encode_json(&codec, StatusCode::OK, &LogoutResponse { success: true }),
        Err(err) => error_response(&codec, &err),
    }
}

/// Complete a pending login with a second-factor code.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/verify",
    request_body = TwoFactorVerifyRequest,
    responses(
        (status = 200, description = "Verified; tokens issued", body = TwoFactorVerifyResponse),
        (status = 400, description = "Invalid code", body = ErrorResponse),
        (status = 401, description = "Exhausted or no pending login", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn verify(
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let request: TwoFactorVerifyRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let user_id = match parse_user_id(&codec, &request.user_id) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match orchestrator.verify_two_factor(user_id, &request.code).await {
        Ok(session) => {
            let body = TwoFactorVerifyResponse {
                access_token: session.tokens.access_token.clone(),
                refresh_token: session.tokens.refresh_token.clone(),
                access_expires_at: session.tokens.access_expires_at,
                refresh_expires_at: session.tokens.refresh_expires_at,
                user_id: session.tokens.user_id.to_string(),
            };
            let mut response = encode_json(&codec, StatusCode::OK, &body);
            if let Ok(value) = axum::http::HeaderValue::from_str(&session.session_id) {
                response
                    .headers_mut()
                    .insert(crate::SESSION_HEADER, value);
            }
            response
        }
        Err(err) => error_response(&codec, &err),
    }
}

/// List the caller's usable factors (settings screen).
#[utoipa::path(
    get,
    path = "/v1/auth/2fa/providers",
    responses(
        (status = 200, description = "Enrolled factors", body = ProvidersResponse),
        (status = 404, description = "Nothing enrolled", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn providers(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match orchestrator.second_factor_providers(principal.user_id).await {
        Ok(providers) => encode_json(&codec, StatusCode::OK, &ProvidersResponse { providers }),
        Err(err) => error_response(&codec, &err),
    }
}

/// Start TOTP enrollment for the caller.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/enroll",
    responses(
        (status = 200, description = "Secret issued", body = TotpEnrollResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn enroll(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let account_name = principal.user_id.to_string();
    match orchestrator.enroll_totp(principal.user_id, &account_name).await {
        Ok(enrollment) => encode_json(
            &codec,
            StatusCode::OK,
            &TotpEnrollResponse {
                secret: enrollment.secret_base32,
                otpauth_url: enrollment.otpauth_url,
            },
        ),
        Err(err) => error_response(&codec, &err),
    }
}

/// Confirm the pending TOTP secret and switch the factor on.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/enable",
    request_body = TotpEnableRequest,
    responses(
        (status = 200, description = "Factor enabled", body = LogoutResponse),
        (status = 400, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn enable(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let request: TotpEnableRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match orchestrator.enable_totp(principal.user_id, &request.code).await {
        Ok(()) => encode_json(&codec, StatusCode::OK, &LogoutResponse { success: true }),
        Err(err) => error_response(&codec, &err),
    }
}

/// Switch on the delivered-code factor.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/enable-email",
    request_body = EmailFactorRequest,
    responses(
        (status = 200, description = "Factor enabled", body = LogoutResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn enable_email(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let request: EmailFactorRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match orchestrator
        .enable_email_factor(principal.user_id, request.destination)
        .await
    {
        Ok(()) => encode_json(&codec, StatusCode::OK, &LogoutResponse { success: true }),
        Err(err) => error_response(&codec, &err),
    }
}

/// Disable all second factors. Takes effect immediately.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/disable",
    responses(
        (status = 200, description = "Factors disabled", body = LogoutResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn disable(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match orchestrator.disable_second_factor(principal.user_id).await {
        Ok(()) => encode_json(&codec, StatusCode::OK, &LogoutResponse { success: true }),
        Err(err) => error_response(&codec, &err),
    }
}

/// Mint a fresh backup-code batch, shown once.
#[utoipa::path(
    post,
    path = "/v1/auth/2fa/backup-codes",
    responses(
        (status = 200, description = "New batch", body = BackupCodesResponse),
        (status = 404, description = "No active factor to back up", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn backup_codes(
    headers: HeaderMap,
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
) -> Response {
    let principal = match require_principal(&headers, &orchestrator, &codec).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match orchestrator.generate_backup_codes(principal.user_id).await {
        Ok(codes) => encode_json(&codec, StatusCode::OK, &BackupCodesResponse { codes }),
        Err(err) => error_response(&codec, &err),
    }
}
