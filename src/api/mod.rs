//! HTTP server assembly.

use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;

use crate::auth::AuthOrchestrator;
use crate::codec::PayloadCodec;

pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

/// The fully layered application, ready to serve. Shared by the binary and
/// the integration tests.
#[must_use]
pub fn app(
    orchestrator: Arc<AuthOrchestrator>,
    codec: PayloadCodec,
    frontend_origin: Option<HeaderValue>,
) -> Router {
    let (router, _openapi) = openapi::api_router().split_for_parts();

    let cors = match frontend_origin {
        Some(origin) => CorsLayer::new()
            .allow_headers([
                CONTENT_TYPE,
                AUTHORIZATION,
                HeaderName::from_static(crate::SESSION_HEADER),
            ])
            .allow_methods([Method::GET, Method::POST])
            .allow_origin(AllowOrigin::exact(origin))
            .allow_credentials(true)
            .expose_headers([HeaderName::from_static(crate::SESSION_HEADER)]),
        // No frontend configured (tests, same-origin deployments).
        None => CorsLayer::new(),
    };

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(Extension(orchestrator))
            .layer(Extension(codec)),
    )
}

/// Bind and serve until ctrl-c.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    port: u16,
    orchestrator: Arc<AuthOrchestrator>,
    codec: PayloadCodec,
    frontend_base_url: Option<&str>,
) -> Result<()> {
    let frontend_origin = frontend_base_url.map(frontend_origin).transpose()?;
    let app = app(orchestrator, codec, frontend_origin);

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod tests {
    use super::frontend_origin;

    #[test]
    fn frontend_origin_strips_path_and_keeps_port() {
        let origin = frontend_origin("https://portal.example.com:8443/app/").unwrap();
        assert_eq!(origin, "https://portal.example.com:8443");
    }

    #[test]
    fn frontend_origin_rejects_garbage() {
        assert!(frontend_origin("not a url").is_err());
    }
}
