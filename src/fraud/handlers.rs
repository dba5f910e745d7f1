//! Fraud-detection HTTP surface

use axum::{
    Router,
    extract::State,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;

use super::engine::FraudEngine;
use super::model::{Decision, RiskAssessmentRequest, RiskAssessmentResponse, RiskLevel};
use crate::gateway::{ApiResult, ErrorBody, HealthResponse, JsonBody, ok};

const SERVICE_NAME: &str = "fraud-detection";

#[derive(OpenApi)]
#[openapi(
    paths(assess_risk, health),
    components(schemas(
        RiskAssessmentRequest,
        RiskAssessmentResponse,
        RiskLevel,
        Decision,
        HealthResponse,
        ErrorBody
    )),
    tags((name = "Fraud", description = "In-line risk scoring"))
)]
pub struct FraudApiDoc;

pub fn router(engine: Arc<FraudEngine>) -> Router {
    Router::new()
        .route("/api/fraud-detection/assess", post(assess_risk))
        .route("/health", get(health))
        .with_state(engine)
}

/// Score a transaction before money moves
///
/// POST /api/fraud-detection/assess
#[utoipa::path(
    post,
    path = "/api/fraud-detection/assess",
    request_body = RiskAssessmentRequest,
    responses(
        (status = 200, description = "Risk assessed", body = RiskAssessmentResponse),
        (status = 400, description = "Missing ids or non-positive amount", body = ErrorBody)
    ),
    tag = "Fraud"
)]
pub async fn assess_risk(
    State(engine): State<Arc<FraudEngine>>,
    JsonBody(req): JsonBody<RiskAssessmentRequest>,
) -> ApiResult<RiskAssessmentResponse> {
    let resp = engine.assess(&req).await?;
    ok(resp)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "Fraud"
)]
pub async fn health() -> ApiResult<HealthResponse> {
    ok(HealthResponse::healthy(SERVICE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraud::FraudConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(FraudEngine::new(FraudConfig::default())))
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                Request::post("/api/fraud-detection/assess")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy", "service": "fraud-detection"}));
    }

    #[tokio::test]
    async fn test_assess_ok() {
        let (status, json) = post_json(
            app(),
            r#"{"transactionId":"t1","senderAccountId":"a","receiverAccountId":"b","amount":25,"currency":"USD","transactionType":"transfer","description":"lunch"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["transactionId"], "t1");
        assert_eq!(json["decision"], "approve");
        assert!(json["reasons"].is_array());
    }

    #[tokio::test]
    async fn test_assess_rejects_bad_requests() {
        let (status, json) =
            post_json(app(), r#"{"senderAccountId":"a","amount":25}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "Transaction ID is required");

        let (status, _) =
            post_json(app(), r#"{"transactionId":"t","senderAccountId":"a","amount":-3}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = post_json(app(), "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "failed");
    }
}
