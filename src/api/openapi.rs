use utoipa::openapi::{InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

use super::handlers::{auth, health};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut service_tag = Tag::new("staffdesk");
    service_tag.description = Some("Employee self-service portal API".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Authentication and session lifecycle".to_string());

    let mut base = cargo_openapi();
    base.tags = Some(vec![service_tag, auth_tag]);

    // `routes!` reads #[utoipa::path] to bind HTTP method + path and add the
    // route to OpenAPI.
    let router = OpenApiRouter::with_openapi(base)
        .routes(routes!(health::health))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::twofactor::send))
        .routes(routes!(auth::twofactor::verify))
        .routes(routes!(auth::twofactor::providers))
        .routes(routes!(auth::twofactor::enroll))
        .routes(routes!(auth::twofactor::enable))
        .routes(routes!(auth::twofactor::enable_email))
        .routes(routes!(auth::twofactor::disable))
        .routes(routes!(auth::twofactor::backup_codes))
        .routes(routes!(auth::refresh::refresh))
        .routes(routes!(auth::session::keep_alive))
        .routes(routes!(auth::session::unlock))
        .routes(routes!(auth::session::logout))
        .routes(routes!(auth::session::logout_all));

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}
