//! Users service HTTP surface
//!
//! Everything lives under `/api/users/auth`. Tokens travel as HttpOnly
//! cookies; protected routes also accept `Authorization: Bearer`.
//! `/internal/users/...` is for the transactions service and carries no session.

use axum::{
    Extension, Json, Router,
    extract::{ConnectInfo, FromRequestParts, Path, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use utoipa::OpenApi;

use super::middleware::authenticate;
use super::model::*;
use super::rate_limit::{RateLimiter, client_ip, rate_limit};
use super::service::{IssuedTokens, UserService};
use crate::core_types::KycStatus;
use crate::gateway::auth::access_token;
use crate::gateway::cookies::{
    ACCESS_COOKIE, REFRESH_COOKIE, append_set_cookies, build_cookie, clear_cookie, read_cookie,
};
use crate::gateway::{ApiError, ApiResult, AuthUser, ErrorBody, HealthResponse, JsonBody, ok};

const SERVICE_NAME: &str = "users";

#[derive(Clone)]
pub struct UsersState {
    pub service: Arc<UserService>,
    pub cookie_secure: bool,
}

type WithCookies<T> = Result<(StatusCode, HeaderMap, Json<T>), ApiError>;

impl UsersState {
    fn session_cookies(&self, tokens: &IssuedTokens) -> HeaderMap {
        let config = self.service.config();
        let mut headers = HeaderMap::new();
        append_set_cookies(
            &mut headers,
            [
                build_cookie(
                    ACCESS_COOKIE,
                    &tokens.access_token,
                    config.access_ttl_secs.max(0) as u64,
                    self.cookie_secure,
                ),
                build_cookie(
                    REFRESH_COOKIE,
                    &tokens.refresh_token,
                    config.refresh_ttl_secs.max(0) as u64,
                    self.cookie_secure,
                ),
            ],
        );
        headers
    }

    fn cleared_cookies(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        append_set_cookies(
            &mut headers,
            [
                clear_cookie(ACCESS_COOKIE, self.cookie_secure),
                clear_cookie(REFRESH_COOKIE, self.cookie_secure),
            ],
        );
        headers
    }
}

/// Peer address and User-Agent of the caller
impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0);
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(ClientInfo {
            ip_address: client_ip(&parts.headers, peer),
            user_agent,
        })
    }
}

fn refresh_cookie(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, REFRESH_COOKIE)
}

// ============================================================================
// Router
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        register,
        login,
        logout,
        refresh,
        check_session,
        get_profile,
        update_profile,
        delete_account,
        change_password,
        search_omni_tag,
        send_contact_request,
        list_contacts,
        pending_requests,
        sent_requests,
        accept_contact,
        reject_contact,
        block_contact,
        delete_contact,
        kyc_status,
        submit_kyc,
        approve_kyc,
        reject_kyc,
        list_sessions,
        logout_other_sessions,
        logout_session,
        internal_user_by_omni_tag,
        health,
    ),
    components(schemas(
        RegisterRequest,
        LoginRequest,
        UpdateProfileRequest,
        ChangePasswordRequest,
        KycSubmitRequest,
        ContactRequestBody,
        AuthResponse,
        UserSummary,
        SessionSummary,
        UserEnvelope,
        MessageResponse,
        ProfileView,
        ProfileUpdated,
        DeletionScheduled,
        PasswordChanged,
        KycDecision,
        KycStatusView,
        KycStatus,
        AccountStatus,
        ActiveSession,
        SessionList,
        ContactCreated,
        ContactList,
        ContactInfo,
        ContactStatus,
        RequestList,
        ContactRequestView,
        UserBasic,
        OmniTagLookup,
        HealthResponse,
        ErrorBody,
    )),
    tags(
        (name = "Account", description = "Registration, sign-in and profile"),
        (name = "Session", description = "Token refresh and device sessions"),
        (name = "Contacts", description = "Contact requests by omni-tag (auth required)"),
        (name = "KYC", description = "Identity verification"),
        (name = "Internal", description = "Lookups for the transactions service"),
        (name = "System", description = "Health checks")
    )
)]
pub struct UserApiDoc;

pub fn router(service: Arc<UserService>, limiter: Arc<RateLimiter>, cookie_secure: bool) -> Router {
    let state = UsersState {
        service: service.clone(),
        cookie_secure,
    };

    let throttled = Router::new()
        .route("/api/users/auth/refresh", post(refresh))
        .route("/api/users/auth/account/login", post(login))
        .layer(from_fn_with_state(limiter, rate_limit));

    let open = Router::new()
        .route("/api/users/auth/health", get(health))
        .route("/api/users/auth/check-session", get(check_session))
        .route("/api/users/auth/account/register", post(register))
        .route("/api/users/auth/account/logout", post(logout))
        .route("/api/users/auth/kyc/{accountId}/approve", post(approve_kyc))
        .route("/api/users/auth/kyc/{accountId}/reject", post(reject_kyc));

    let protected = Router::new()
        .route(
            "/api/users/auth/account/{accountId}",
            get(get_profile).put(update_profile).delete(delete_account),
        )
        .route("/api/users/auth/account/change-password", post(change_password))
        .route("/api/users/auth/search/omnitag/{omnitag}", get(search_omni_tag))
        .route("/api/users/auth/contacts/request", post(send_contact_request))
        .route(
            "/api/users/auth/contacts/{id}",
            get(list_contacts).delete(delete_contact),
        )
        .route("/api/users/auth/contacts/{id}/pending", get(pending_requests))
        .route("/api/users/auth/contacts/{id}/sent", get(sent_requests))
        .route("/api/users/auth/contacts/{id}/accept", post(accept_contact))
        .route("/api/users/auth/contacts/{id}/reject", post(reject_contact))
        .route("/api/users/auth/contacts/{id}/block", post(block_contact))
        .route("/api/users/auth/kyc/{accountId}/status", get(kyc_status))
        .route("/api/users/auth/kyc/{accountId}/submit", post(submit_kyc))
        .route("/api/users/auth/security/sessions", post(list_sessions).get(list_sessions))
        .route(
            "/api/users/auth/security/sessions/logout-others",
            post(logout_other_sessions),
        )
        .route(
            "/api/users/auth/security/sessions/logout/{sessionId}",
            post(logout_session),
        )
        .layer(from_fn_with_state(service, authenticate));

    let internal = Router::new().route(
        "/internal/users/omnitag/{omnitag}",
        get(internal_user_by_omni_tag),
    );

    Router::new()
        .merge(throttled)
        .merge(open)
        .merge(protected)
        .merge(internal)
        .route("/health", get(health))
        .with_state(state)
}

// ============================================================================
// Account
// ============================================================================

#[utoipa::path(
    post,
    path = "/api/users/auth/account/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and signed in; tokens set as cookies", body = AuthResponse),
        (status = 400, description = "Validation failure or invalid omni-tag", body = ErrorBody),
        (status = 409, description = "Email or omni-tag taken", body = ErrorBody)
    ),
    tag = "Account"
)]
pub async fn register(
    State(state): State<UsersState>,
    client: ClientInfo,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> WithCookies<AuthResponse> {
    let signed = state.service.register(&req, &client).await?;
    Ok((
        StatusCode::CREATED,
        state.session_cookies(&signed.tokens),
        Json(signed.response),
    ))
}

#[utoipa::path(
    post,
    path = "/api/users/auth/account/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in; tokens set as cookies", body = AuthResponse),
        (status = 401, description = "Wrong password or inactive account", body = ErrorBody),
        (status = 404, description = "No such user", body = ErrorBody),
        (status = 429, description = "Too many requests from this address", body = ErrorBody)
    ),
    tag = "Account"
)]
pub async fn login(
    State(state): State<UsersState>,
    client: ClientInfo,
    JsonBody(req): JsonBody<LoginRequest>,
) -> WithCookies<AuthResponse> {
    let signed = state.service.login(&req, &client).await?;
    Ok((
        StatusCode::OK,
        state.session_cookies(&signed.tokens),
        Json(signed.response),
    ))
}

#[utoipa::path(
    post,
    path = "/api/users/auth/account/logout",
    responses((status = 200, description = "Session closed, cookies cleared", body = MessageResponse)),
    tag = "Account"
)]
pub async fn logout(State(state): State<UsersState>, headers: HeaderMap) -> WithCookies<MessageResponse> {
    state.service.logout(refresh_cookie(&headers).as_deref()).await?;
    Ok((
        StatusCode::OK,
        state.cleared_cookies(),
        Json(MessageResponse::new("Successfully logged out")),
    ))
}

#[utoipa::path(
    get,
    path = "/api/users/auth/account/{accountId}",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Profile", body = ProfileView),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Account"
)]
pub async fn get_profile(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<ProfileView> {
    ok(state.service.profile(&user.account_id, &account_id).await?)
}

#[utoipa::path(
    put,
    path = "/api/users/auth/account/{accountId}",
    params(("accountId" = String, Path, description = "Account ID")),
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = ProfileUpdated),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Account"
)]
pub async fn update_profile(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
    JsonBody(req): JsonBody<UpdateProfileRequest>,
) -> ApiResult<ProfileUpdated> {
    ok(state
        .service
        .update_profile(&user.account_id, &account_id, &req)
        .await?)
}

#[utoipa::path(
    delete,
    path = "/api/users/auth/account/{accountId}",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Deletion scheduled after the grace period", body = DeletionScheduled),
        (status = 400, description = "Already disabled or pending deletion", body = ErrorBody),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Account"
)]
pub async fn delete_account(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> WithCookies<DeletionScheduled> {
    let scheduled = state
        .service
        .request_deletion(&user.account_id, &account_id)
        .await?;
    Ok((StatusCode::OK, state.cleared_cookies(), Json(scheduled)))
}

#[utoipa::path(
    post,
    path = "/api/users/auth/account/change-password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; every session revoked", body = PasswordChanged),
        (status = 400, description = "Mismatch or unchanged password", body = ErrorBody),
        (status = 401, description = "Current password wrong", body = ErrorBody),
        (status = 429, description = "Too many attempts", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Account"
)]
pub async fn change_password(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    JsonBody(req): JsonBody<ChangePasswordRequest>,
) -> WithCookies<PasswordChanged> {
    let changed = state.service.change_password(&user.account_id, &req).await?;
    Ok((StatusCode::OK, state.cleared_cookies(), Json(changed)))
}

#[utoipa::path(
    get,
    path = "/api/users/auth/search/omnitag/{omnitag}",
    params(("omnitag" = String, Path, description = "Omni-tag, case-sensitive")),
    responses(
        (status = 200, description = "Match; details only for accepted contacts", body = OmniTagLookup),
        (status = 404, description = "No active user with this tag", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Account"
)]
pub async fn search_omni_tag(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(omni_tag): Path<String>,
) -> ApiResult<OmniTagLookup> {
    ok(state
        .service
        .search_omni_tag(&user.account_id, &omni_tag)
        .await?)
}

// ============================================================================
// Session
// ============================================================================

#[utoipa::path(
    post,
    path = "/api/users/auth/refresh",
    responses(
        (status = 200, description = "Tokens rotated; new cookies set", body = UserEnvelope),
        (status = 401, description = "Missing, invalid or reused refresh token", body = ErrorBody),
        (status = 429, description = "Too many requests from this address", body = ErrorBody)
    ),
    tag = "Session"
)]
pub async fn refresh(State(state): State<UsersState>, headers: HeaderMap) -> WithCookies<UserEnvelope> {
    let refreshed = state
        .service
        .refresh(refresh_cookie(&headers).as_deref())
        .await?;
    Ok((
        StatusCode::OK,
        state.session_cookies(&refreshed.tokens),
        Json(UserEnvelope {
            user: refreshed.user,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/users/auth/check-session",
    responses(
        (status = 200, description = "Signed in; a new access cookie may be set", body = UserEnvelope),
        (status = 401, description = "No valid session found", body = ErrorBody)
    ),
    tag = "Session"
)]
pub async fn check_session(
    State(state): State<UsersState>,
    headers: HeaderMap,
) -> WithCookies<UserEnvelope> {
    let check = state
        .service
        .check_session(
            access_token(&headers).as_deref(),
            refresh_cookie(&headers).as_deref(),
        )
        .await?;
    let mut cookies = HeaderMap::new();
    if let Some(token) = check.access_token {
        let ttl = state.service.config().access_ttl_secs.max(0) as u64;
        append_set_cookies(
            &mut cookies,
            [build_cookie(ACCESS_COOKIE, &token, ttl, state.cookie_secure)],
        );
    }
    Ok((StatusCode::OK, cookies, Json(UserEnvelope { user: check.user })))
}

#[utoipa::path(
    post,
    path = "/api/users/auth/security/sessions",
    responses((status = 200, description = "Active sessions, newest first", body = SessionList)),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Session"
)]
pub async fn list_sessions(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
) -> ApiResult<SessionList> {
    ok(state
        .service
        .list_sessions(&user.account_id, refresh_cookie(&headers).as_deref())
        .await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/security/sessions/logout-others",
    responses(
        (status = 200, description = "Every other session revoked", body = MessageResponse),
        (status = 401, description = "Current session unknown", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Session"
)]
pub async fn logout_other_sessions(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
) -> ApiResult<MessageResponse> {
    state
        .service
        .logout_others(&user.account_id, refresh_cookie(&headers).as_deref())
        .await?;
    ok(MessageResponse::new("Successfully logged out all other devices"))
}

#[utoipa::path(
    post,
    path = "/api/users/auth/security/sessions/logout/{sessionId}",
    params(("sessionId" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session revoked", body = MessageResponse),
        (status = 404, description = "Session not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Session"
)]
pub async fn logout_session(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> ApiResult<MessageResponse> {
    state
        .service
        .logout_session(&user.account_id, &session_id)
        .await?;
    ok(MessageResponse::new("Session successfully logged out"))
}

// ============================================================================
// Contacts
// ============================================================================

#[utoipa::path(
    post,
    path = "/api/users/auth/contacts/request",
    request_body = ContactRequestBody,
    responses(
        (status = 201, description = "Request sent", body = ContactCreated),
        (status = 400, description = "Invalid tag or request to self", body = ErrorBody),
        (status = 404, description = "No active user with this tag", body = ErrorBody),
        (status = 409, description = "The two accounts are already linked", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn send_contact_request(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    JsonBody(req): JsonBody<ContactRequestBody>,
) -> Result<(StatusCode, Json<ContactCreated>), ApiError> {
    let sent = state
        .service
        .send_contact_request(&user.account_id, &req.omni_tag)
        .await?;
    Ok((StatusCode::CREATED, Json(sent)))
}

#[utoipa::path(
    get,
    path = "/api/users/auth/contacts/{id}",
    params(("id" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Accepted contacts", body = ContactList),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn list_contacts(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<ContactList> {
    ok(state.service.contacts(&user.account_id, &account_id).await?)
}

#[utoipa::path(
    get,
    path = "/api/users/auth/contacts/{id}/pending",
    params(("id" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Requests awaiting an answer", body = RequestList),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn pending_requests(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<RequestList> {
    ok(state
        .service
        .pending_requests(&user.account_id, &account_id)
        .await?)
}

#[utoipa::path(
    get,
    path = "/api/users/auth/contacts/{id}/sent",
    params(("id" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Requests sent, any status", body = RequestList),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn sent_requests(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<RequestList> {
    ok(state
        .service
        .sent_requests(&user.account_id, &account_id)
        .await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/contacts/{id}/accept",
    params(("id" = String, Path, description = "Contact ID")),
    responses(
        (status = 200, description = "Accepted", body = MessageResponse),
        (status = 400, description = "Not pending", body = ErrorBody),
        (status = 403, description = "Caller is not the addressee", body = ErrorBody),
        (status = 404, description = "Contact not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn accept_contact(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(contact_id): Path<String>,
) -> ApiResult<MessageResponse> {
    ok(state
        .service
        .accept_contact(&user.account_id, &contact_id)
        .await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/contacts/{id}/reject",
    params(("id" = String, Path, description = "Contact ID")),
    responses(
        (status = 200, description = "Rejected", body = MessageResponse),
        (status = 400, description = "Not pending", body = ErrorBody),
        (status = 403, description = "Caller is not the addressee", body = ErrorBody),
        (status = 404, description = "Contact not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn reject_contact(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(contact_id): Path<String>,
) -> ApiResult<MessageResponse> {
    ok(state
        .service
        .reject_contact(&user.account_id, &contact_id)
        .await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/contacts/{id}/block",
    params(("id" = String, Path, description = "Contact ID")),
    responses(
        (status = 200, description = "Blocked", body = MessageResponse),
        (status = 404, description = "Contact not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn block_contact(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(contact_id): Path<String>,
) -> ApiResult<MessageResponse> {
    ok(state
        .service
        .block_contact(&user.account_id, &contact_id)
        .await?)
}

#[utoipa::path(
    delete,
    path = "/api/users/auth/contacts/{id}",
    params(("id" = String, Path, description = "Contact ID")),
    responses(
        (status = 200, description = "Deleted", body = MessageResponse),
        (status = 404, description = "Contact not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Contacts"
)]
pub async fn delete_contact(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(contact_id): Path<String>,
) -> ApiResult<MessageResponse> {
    ok(state
        .service
        .delete_contact(&user.account_id, &contact_id)
        .await?)
}

// ============================================================================
// KYC
// ============================================================================

#[utoipa::path(
    get,
    path = "/api/users/auth/kyc/{accountId}/status",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Current KYC status", body = KycStatusView),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "KYC"
)]
pub async fn kyc_status(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<KycStatusView> {
    ok(state.service.kyc_status(&user.account_id, &account_id).await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/kyc/{accountId}/submit",
    params(("accountId" = String, Path, description = "Account ID")),
    request_body = KycSubmitRequest,
    responses(
        (status = 200, description = "Submitted for review", body = KycDecision),
        (status = 409, description = "Already approved", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "KYC"
)]
pub async fn submit_kyc(
    State(state): State<UsersState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
    JsonBody(req): JsonBody<KycSubmitRequest>,
) -> ApiResult<KycDecision> {
    ok(state
        .service
        .submit_kyc(&user.account_id, &account_id, &req)
        .await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/kyc/{accountId}/approve",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Approved; the wallet is activated", body = KycDecision),
        (status = 404, description = "User not found", body = ErrorBody),
        (status = 409, description = "Already approved", body = ErrorBody)
    ),
    tag = "KYC"
)]
pub async fn approve_kyc(
    State(state): State<UsersState>,
    Path(account_id): Path<String>,
) -> ApiResult<KycDecision> {
    ok(state.service.approve_kyc(&account_id).await?)
}

#[utoipa::path(
    post,
    path = "/api/users/auth/kyc/{accountId}/reject",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Rejected", body = KycDecision),
        (status = 404, description = "User not found", body = ErrorBody)
    ),
    tag = "KYC"
)]
pub async fn reject_kyc(
    State(state): State<UsersState>,
    Path(account_id): Path<String>,
) -> ApiResult<KycDecision> {
    ok(state.service.reject_kyc(&account_id).await?)
}

// ============================================================================
// Internal
// ============================================================================

#[utoipa::path(
    get,
    path = "/internal/users/omnitag/{omnitag}",
    params(("omnitag" = String, Path, description = "Omni-tag, case-sensitive")),
    responses(
        (status = 200, description = "Active user holding the tag", body = UserBasic),
        (status = 404, description = "No active user with this tag", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_user_by_omni_tag(
    State(state): State<UsersState>,
    Path(omni_tag): Path<String>,
) -> ApiResult<UserBasic> {
    let user = state
        .service
        .find_by_omni_tag(&omni_tag)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    ok(UserBasic {
        account_id: user.account_id,
        omni_tag: user.omni_tag,
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse)),
    tag = "System"
)]
pub async fn health() -> ApiResult<HealthResponse> {
    ok(HealthResponse::healthy(SERVICE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::service::test_support;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct App {
        router: Router,
    }

    struct Reply {
        status: StatusCode,
        cookies: Vec<String>,
        json: serde_json::Value,
    }

    impl Reply {
        fn cookie(&self, name: &str) -> Option<String> {
            let prefix = format!("{}=", name);
            self.cookies
                .iter()
                .find(|c| c.starts_with(&prefix))
                .and_then(|c| c[prefix.len()..].split(';').next())
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        }
    }

    impl App {
        fn new() -> Self {
            Self::with_limiter(RateLimiter::new(
                100.0,
                100,
                Duration::from_secs(180),
                Duration::from_secs(60),
            ))
        }

        fn with_limiter(limiter: RateLimiter) -> Self {
            let (svc, _broker) = test_support::service();
            Self {
                router: router(Arc::new(svc), Arc::new(limiter), false),
            }
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            cookies: &[(&str, &str)],
            body: Option<serde_json::Value>,
        ) -> Reply {
            let mut req = Request::builder()
                .method(method)
                .uri(uri)
                .header("user-agent", "Mozilla/5.0 Firefox/128.0")
                .header("x-forwarded-for", "198.51.100.4");
            if !cookies.is_empty() {
                let header = cookies
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ");
                req = req.header("cookie", header);
            }
            let req = match body {
                Some(b) => req
                    .header("content-type", "application/json")
                    .body(Body::from(b.to_string()))
                    .unwrap(),
                None => req.body(Body::empty()).unwrap(),
            };
            let resp = self.router.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let cookies = resp
                .headers()
                .get_all(header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            Reply {
                status,
                cookies,
                json,
            }
        }

        async fn register(&self, email: &str, tag: &str) -> Reply {
            self.call(
                "POST",
                "/api/users/auth/account/register",
                &[],
                Some(serde_json::json!({
                    "email": email,
                    "password": "pw-123456",
                    "firstName": "Ada",
                    "lastName": "Lovelace",
                    "omniTag": tag,
                    "currency": "USD"
                })),
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_register_sets_cookies() {
        let app = App::new();
        let reply = app.register("a@x.io", "A1").await;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert!(reply.cookie(ACCESS_COOKIE).is_some());
        assert!(reply.cookie(REFRESH_COOKIE).is_some());
        assert!(reply.cookies.iter().all(|c| c.contains("HttpOnly")));
        assert_eq!(reply.json["user"]["omniTag"], "A1");
        assert_eq!(reply.json["session"]["browser"], "Firefox");
        assert_eq!(reply.json["session"]["ipAddress"], "198.51.100.4");

        let dup = app.register("a@x.io", "B1").await;
        assert_eq!(dup.status, StatusCode::CONFLICT);
        assert_eq!(dup.json["code"], "EMAIL_TAKEN");

        let bad = app.register("c@x.io", "no_no").await;
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_profile_requires_session_cookie() {
        let app = App::new();
        let reg = app.register("a@x.io", "A1").await;
        let id = reg.json["user"]["id"].as_str().unwrap().to_string();
        let access = reg.cookie(ACCESS_COOKIE).unwrap();
        let uri = format!("/api/users/auth/account/{}", id);

        assert_eq!(app.call("GET", &uri, &[], None).await.status, StatusCode::UNAUTHORIZED);
        let reply = app.call("GET", &uri, &[(ACCESS_COOKIE, &access)], None).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["omniTag"], "A1");
        assert!(reply.json.get("passwordHash").is_none());

        let other = app
            .call("GET", "/api/users/auth/account/someone", &[(ACCESS_COOKIE, &access)], None)
            .await;
        assert_eq!(other.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_refresh_rotation_over_http() {
        let app = App::new();
        let reg = app.register("a@x.io", "A1").await;
        let r1 = reg.cookie(REFRESH_COOKIE).unwrap();

        let first = app
            .call("POST", "/api/users/auth/refresh", &[(REFRESH_COOKIE, &r1)], None)
            .await;
        assert_eq!(first.status, StatusCode::OK);
        let r2 = first.cookie(REFRESH_COOKIE).unwrap();
        assert_ne!(r1, r2);

        let reuse = app
            .call("POST", "/api/users/auth/refresh", &[(REFRESH_COOKIE, &r1)], None)
            .await;
        assert_eq!(reuse.status, StatusCode::UNAUTHORIZED);

        let again = app
            .call("POST", "/api/users/auth/refresh", &[(REFRESH_COOKIE, &r2)], None)
            .await;
        assert_eq!(again.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_check_session_mints_access_cookie() {
        let app = App::new();
        let reg = app.register("a@x.io", "A1").await;
        let refresh = reg.cookie(REFRESH_COOKIE).unwrap();

        let reply = app
            .call("GET", "/api/users/auth/check-session", &[(REFRESH_COOKIE, &refresh)], None)
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["user"]["email"], "a@x.io");
        assert!(reply.cookie(ACCESS_COOKIE).is_some());

        let none = app.call("GET", "/api/users/auth/check-session", &[], None).await;
        assert_eq!(none.status, StatusCode::UNAUTHORIZED);
        assert_eq!(none.json["message"], "No valid session found");
    }

    #[tokio::test]
    async fn test_logout_clears_cookies() {
        let app = App::new();
        let reg = app.register("a@x.io", "A1").await;
        let refresh = reg.cookie(REFRESH_COOKIE).unwrap();

        let out = app
            .call("POST", "/api/users/auth/account/logout", &[(REFRESH_COOKIE, &refresh)], None)
            .await;
        assert_eq!(out.status, StatusCode::OK);
        assert!(out.cookies.iter().any(|c| c.starts_with("refresh_token=;") && c.contains("Max-Age=0")));
        let after = app
            .call("POST", "/api/users/auth/refresh", &[(REFRESH_COOKIE, &refresh)], None)
            .await;
        assert_eq!(after.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_is_rate_limited() {
        let app = App::with_limiter(RateLimiter::new(
            0.001,
            3,
            Duration::from_secs(180),
            Duration::from_secs(60),
        ));
        let body = serde_json::json!({"email": "nobody@x.io", "password": "x"});
        for _ in 0..3 {
            let r = app
                .call("POST", "/api/users/auth/account/login", &[], Some(body.clone()))
                .await;
            assert_eq!(r.status, StatusCode::NOT_FOUND);
        }
        let limited = app
            .call("POST", "/api/users/auth/account/login", &[], Some(body))
            .await;
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
        // registration is not throttled
        assert_eq!(app.register("a@x.io", "A1").await.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_contacts_over_http() {
        let app = App::new();
        let a = app.register("a@x.io", "A1").await;
        let b = app.register("b@x.io", "B1").await;
        let a_access = a.cookie(ACCESS_COOKIE).unwrap();
        let b_access = b.cookie(ACCESS_COOKIE).unwrap();
        let b_id = b.json["user"]["id"].as_str().unwrap().to_string();

        let sent = app
            .call(
                "POST",
                "/api/users/auth/contacts/request",
                &[(ACCESS_COOKIE, &a_access)],
                Some(serde_json::json!({"omniTag": "B1"})),
            )
            .await;
        assert_eq!(sent.status, StatusCode::CREATED);
        let contact_id = sent.json["contactId"].as_str().unwrap().to_string();

        let pending = app
            .call(
                "GET",
                &format!("/api/users/auth/contacts/{}/pending", b_id),
                &[(ACCESS_COOKIE, &b_access)],
                None,
            )
            .await;
        assert_eq!(pending.json["count"], 1);

        let accepted = app
            .call(
                "POST",
                &format!("/api/users/auth/contacts/{}/accept", contact_id),
                &[(ACCESS_COOKIE, &b_access)],
                None,
            )
            .await;
        assert_eq!(accepted.status, StatusCode::OK);

        let search = app
            .call("GET", "/api/users/auth/search/omnitag/B1", &[(ACCESS_COOKIE, &a_access)], None)
            .await;
        assert_eq!(search.json["isContact"], true);
        assert_eq!(search.json["email"], "b@x.io");

        let deleted = app
            .call(
                "DELETE",
                &format!("/api/users/auth/contacts/{}", contact_id),
                &[(ACCESS_COOKIE, &a_access)],
                None,
            )
            .await;
        assert_eq!(deleted.json["message"], "Contact deleted successfully");
    }

    #[tokio::test]
    async fn test_kyc_approve_and_internal_lookup() {
        let app = App::new();
        let reg = app.register("a@x.io", "A1").await;
        let id = reg.json["user"]["id"].as_str().unwrap().to_string();

        let approved = app
            .call("POST", &format!("/api/users/auth/kyc/{}/approve", id), &[], None)
            .await;
        assert_eq!(approved.status, StatusCode::OK);
        assert_eq!(approved.json["kycStatus"], "approved");
        let again = app
            .call("POST", &format!("/api/users/auth/kyc/{}/approve", id), &[], None)
            .await;
        assert_eq!(again.status, StatusCode::CONFLICT);

        let hit = app.call("GET", "/internal/users/omnitag/A1", &[], None).await;
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.json, serde_json::json!({"accountId": id, "omniTag": "A1"}));
        let miss = app.call("GET", "/internal/users/omnitag/a1", &[], None).await;
        assert_eq!(miss.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sessions_over_http() {
        let app = App::new();
        let reg = app.register("a@x.io", "A1").await;
        let access = reg.cookie(ACCESS_COOKIE).unwrap();
        let refresh = reg.cookie(REFRESH_COOKIE).unwrap();
        let login = app
            .call(
                "POST",
                "/api/users/auth/account/login",
                &[],
                Some(serde_json::json!({"email": "a@x.io", "password": "pw-123456"})),
            )
            .await;
        assert_eq!(login.status, StatusCode::OK);
        let cookies = [(ACCESS_COOKIE, access.as_str()), (REFRESH_COOKIE, refresh.as_str())];

        let list = app
            .call("POST", "/api/users/auth/security/sessions", &cookies, None)
            .await;
        let sessions = list.json["activeSessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions.iter().filter(|s| s["isCurrentDevice"] == true).count(),
            1
        );

        let out = app
            .call("POST", "/api/users/auth/security/sessions/logout-others", &cookies, None)
            .await;
        assert_eq!(out.json["message"], "Successfully logged out all other devices");
        let missing = app
            .call("POST", "/api/users/auth/security/sessions/logout/nope", &cookies, None)
            .await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.json["message"], "Session not found");
    }

    #[tokio::test]
    async fn test_health() {
        let app = App::new();
        let reply = app.call("GET", "/health", &[], None).await;
        assert_eq!(reply.json["service"], "users");
    }
}
