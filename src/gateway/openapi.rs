//! OpenAPI / Swagger UI Documentation
//!
//! Every service merges its own document into its router:
//!
//! - Swagger UI: `http://localhost:{port}/docs`
//! - OpenAPI JSON: `http://localhost:{port}/api-docs/openapi.json`

use utoipa::Modify;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa_swagger_ui::SwaggerUi;

use super::cookies::ACCESS_COOKIE;

/// Session security schemes: bearer header or `access_token` cookie
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some("HS256 access token (15 minutes)"))
                        .build(),
                ),
            );
            components.add_security_scheme(
                "cookie_auth",
                SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                    ACCESS_COOKIE,
                    "Access token set by login / register / refresh",
                ))),
            );
        }
    }
}

/// Swagger UI router serving `doc`
pub fn docs(service: &str, mut doc: utoipa::openapi::OpenApi) -> SwaggerUi {
    doc.info.title = format!("omni {} API", service);
    doc.info.version = env!("CARGO_PKG_VERSION").to_string();
    if doc.components.is_none() {
        doc.components = Some(utoipa::openapi::Components::new());
    }
    SecurityAddon.modify(&mut doc);
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use utoipa::OpenApi;

    #[derive(OpenApi)]
    #[openapi(info(title = "t"))]
    struct Empty;

    #[test]
    fn test_security_schemes_registered() {
        let mut doc = Empty::openapi();
        doc.components = Some(utoipa::openapi::Components::new());
        SecurityAddon.modify(&mut doc);
        let components = doc.components.expect("should have components");
        assert!(components.security_schemes.contains_key("bearer_auth"));
        assert!(components.security_schemes.contains_key("cookie_auth"));
    }
}
