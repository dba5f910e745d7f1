use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::service::UserService;
use crate::gateway::{ApiError, AuthUser, auth::access_token};

/// Full authentication: token signature plus a live, active user record.
///
/// Unlike [`crate::gateway::require_auth`], a disabled or deleted account is
/// rejected even while its access token is still within its lifetime.
pub async fn authenticate(
    State(service): State<Arc<UserService>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = access_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let user = service.authenticate(&token).await?;
    request.extensions_mut().insert(AuthUser {
        account_id: user.account_id,
        email: user.email,
    });
    Ok(next.run(request).await)
}
