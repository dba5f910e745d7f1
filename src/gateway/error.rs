//! HTTP error rendering
//!
//! Every service renders failures as `{status: "failed", code, message}`.
//! Domain error enums convert into [`ApiError`] through their `code()` and
//! `http_status()`; 5xx conversions are logged inside the request span so the
//! line carries the correlation id.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============================================================================
// Error body
// ============================================================================

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "failed")]
    pub status: String,
    #[schema(example = "VALIDATION_ERROR")]
    pub code: String,
    #[schema(example = "Amount must be greater than 0")]
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "VALIDATION_ERROR", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, "CONFLICT", message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(429, "RATE_LIMITED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(503, "SERVICE_UNAVAILABLE", message)
    }

    /// Shorthand for early returns from handlers
    pub fn into_err<T>(self) -> Result<T, ApiError> {
        Err(self)
    }

    /// Build from a domain error's `code()` / `http_status()` pair.
    pub fn from_domain(status: u16, code: &'static str, message: String) -> Self {
        if status >= 500 {
            tracing::error!(code, error = %message, "Request failed with infrastructure error");
        }
        Self::new(status, code, message)
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: "failed".to_string(),
            code: self.code.clone(),
            message: self.message.clone(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<crate::storage::StorageError> for ApiError {
    fn from(e: crate::storage::StorageError) -> Self {
        let status = if e.is_not_found() { 404 } else { 500 };
        ApiError::from_domain(status, e.code(), e.to_string())
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Wrap a success payload
pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(data))
}

/// `201 Created` with a JSON body
pub fn created<T: Serialize>(data: T) -> Result<(StatusCode, Json<T>), ApiError> {
    Ok((StatusCode::CREATED, Json(data)))
}
