//! HTTP plumbing shared by every service
//!
//! Error rendering, the JSON extractor, token verification, cookies, the
//! correlation-id span and the server loop. Each service builds its own
//! router on top of these.

pub mod auth;
pub mod cookies;
pub mod error;
pub mod extract;
pub mod openapi;
pub mod request_id;

pub use auth::{AuthUser, Claims, TokenKeys, TokenKind, require_auth};
pub use error::{ApiError, ApiResult, ErrorBody, created, ok};
pub use extract::JsonBody;
pub use openapi::docs;

use axum::{Router, middleware::from_fn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    #[schema(example = "fraud-detection")]
    pub service: String,
}

impl HealthResponse {
    pub fn healthy(service: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            service: service.to_string(),
        }
    }
}

/// Add the layers every service shares (correlation-id span)
pub fn with_common_layers(router: Router) -> Router {
    router.layer(from_fn(request_id::request_span))
}

/// Bind and serve until `shutdown` flips to `true`.
pub async fn serve(
    name: &'static str,
    router: Router,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!(service = name, %addr, "HTTP server listening");
    info!(service = name, "Swagger UI at http://{}/docs", addr);

    // peer address feeds the per-IP rate limiter and session records
    let app = with_common_layers(router).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    info!(service = name, "HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_body() {
        let json = serde_json::to_value(HealthResponse::healthy("wallets")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy", "service": "wallets"}));
    }
}
