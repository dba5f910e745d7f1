//! Transactions service HTTP surface

use axum::{
    Extension, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;

use super::engine::{StoredResponse, TransactionEngine};
use super::history::HistoryQuery;
use super::model::*;
use crate::gateway::{
    ApiError, ApiResult, AuthUser, ErrorBody, HealthResponse, JsonBody, TokenKeys, ok,
    require_auth,
};

const SERVICE_NAME: &str = "transactions";

#[derive(Clone)]
pub struct TransactionsState {
    pub engine: Arc<TransactionEngine>,
}

/// Pipeline responses go out byte for byte as stored, so replays match
impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        (status, [(header::CONTENT_TYPE, "application/json")], self.body).into_response()
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        transfer,
        purchase,
        account_history,
        wallet_history,
        get_transaction,
        health,
    ),
    components(schemas(
        TransferRequest,
        TransferResponse,
        PurchaseRequest,
        PurchaseResponse,
        Transaction,
        TransactionPage,
        TransactionType,
        TransactionCategory,
        TransactionStatus,
        HealthResponse,
        ErrorBody,
    )),
    tags(
        (name = "Transactions", description = "Transfers, card purchases and history (auth required)"),
        (name = "System", description = "Health checks")
    )
)]
pub struct TransactionApiDoc;

pub fn router(engine: Arc<TransactionEngine>, keys: Arc<TokenKeys>) -> Router {
    let state = TransactionsState { engine };

    let api = Router::new()
        .route("/api/transactions/transfer", post(transfer))
        .route("/api/transactions/purchase", post(purchase))
        .route(
            "/api/transactions/account/{accountId}",
            get(account_history),
        )
        .route("/api/transactions/wallet/{walletId}", get(wallet_history))
        .route("/api/transactions/{transactionId}", get(get_transaction))
        .layer(from_fn_with_state(keys, require_auth));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .with_state(state)
}

#[utoipa::path(
    post,
    path = "/api/transactions/transfer",
    request_body = TransferRequest,
    responses(
        (status = 200, description = "Transfer completed", body = TransferResponse),
        (status = 400, description = "Refused, declined or failed", body = TransferResponse),
        (status = 403, description = "Sender wallet belongs to another account", body = ErrorBody),
        (status = 409, description = "Same idempotency key already in flight", body = ErrorBody),
        (status = 503, description = "A downstream service is unavailable", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Transactions"
)]
pub async fn transfer(
    State(state): State<TransactionsState>,
    Extension(user): Extension<AuthUser>,
    JsonBody(req): JsonBody<TransferRequest>,
) -> Result<StoredResponse, ApiError> {
    Ok(state.engine.transfer(&user.account_id, &req).await?)
}

#[utoipa::path(
    post,
    path = "/api/transactions/purchase",
    request_body = PurchaseRequest,
    responses(
        (status = 200, description = "Purchase completed", body = PurchaseResponse),
        (status = 400, description = "Refused, declined or failed", body = PurchaseResponse),
        (status = 403, description = "Card belongs to another account", body = ErrorBody),
        (status = 409, description = "Same idempotency key already in flight", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Transactions"
)]
pub async fn purchase(
    State(state): State<TransactionsState>,
    Extension(user): Extension<AuthUser>,
    JsonBody(req): JsonBody<PurchaseRequest>,
) -> Result<StoredResponse, ApiError> {
    Ok(state.engine.purchase(&user.account_id, &req).await?)
}

#[utoipa::path(
    get,
    path = "/api/transactions/account/{accountId}",
    params(("accountId" = String, Path, description = "Account ID"), HistoryQuery),
    responses(
        (status = 200, description = "Newest first", body = TransactionPage),
        (status = 400, description = "Invalid filter", body = ErrorBody),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Transactions"
)]
pub async fn account_history(
    State(state): State<TransactionsState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<TransactionPage> {
    ok(state
        .engine
        .history_for_account(&user.account_id, &account_id, &query)
        .await?)
}

#[utoipa::path(
    get,
    path = "/api/transactions/wallet/{walletId}",
    params(("walletId" = String, Path, description = "Wallet ID"), HistoryQuery),
    responses(
        (status = 200, description = "Newest first", body = TransactionPage),
        (status = 403, description = "Another account's wallet", body = ErrorBody),
        (status = 404, description = "Wallet not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Transactions"
)]
pub async fn wallet_history(
    State(state): State<TransactionsState>,
    Extension(user): Extension<AuthUser>,
    Path(wallet_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<TransactionPage> {
    ok(state
        .engine
        .history_for_wallet(&user.account_id, &wallet_id, &query)
        .await?)
}

#[utoipa::path(
    get,
    path = "/api/transactions/{transactionId}",
    params(("transactionId" = String, Path, description = "Transaction ID")),
    responses(
        (status = 200, description = "Transaction", body = Transaction),
        (status = 403, description = "Caller is not a party", body = ErrorBody),
        (status = 404, description = "Transaction not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Transactions"
)]
pub async fn get_transaction(
    State(state): State<TransactionsState>,
    Extension(user): Extension<AuthUser>,
    Path(transaction_id): Path<String>,
) -> ApiResult<Transaction> {
    ok(state
        .engine
        .transaction_for(&user.account_id, &transaction_id)
        .await?)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "System"
)]
pub async fn health() -> ApiResult<HealthResponse> {
    ok(HealthResponse::healthy(SERVICE_NAME))
}
