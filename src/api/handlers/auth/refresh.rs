//! Token refresh endpoint.

use axum::Extension;
use axum::http::StatusCode;
use axum::response::Response;
use std::sync::Arc;

use crate::auth::AuthOrchestrator;
use crate::codec::PayloadCodec;

use super::types::{ErrorResponse, RefreshRequest, RefreshResponse};
use super::{decode_request, encode_json, error_response};

/// Rotate a refresh token.
///
/// Safe under concurrent calls with the same stale token: one wins and gets
/// new material, the rest see the uniform authorization failure.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh-token",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated pair", body = RefreshResponse),
        (status = 401, description = "Stale, invalid, or reused token", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn refresh(
    orchestrator: Extension<Arc<AuthOrchestrator>>,
    codec: Extension<PayloadCodec>,
    body: String,
) -> Response {
    let request: RefreshRequest = match decode_request(&codec, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match orchestrator
        .refresh(&request.access_token, &request.refresh_token)
        .await
    {
        Ok(pair) => encode_json(
            &codec,
            StatusCode::OK,
            &RefreshResponse {
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
                access_expires_at: pair.access_expires_at,
                refresh_expires_at: pair.refresh_expires_at,
            },
        ),
        Err(err) => error_response(&codec, &err),
    }
}
