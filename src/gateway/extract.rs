use axum::extract::FromRequest;

use super::error::ApiError;

/// `axum::Json` whose rejections render as 400 `{status: "failed", ...}`
/// instead of axum's plain-text 400/415/422.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);
