//! Wallet service HTTP surface
//!
//! Public routes sit behind [`require_auth`] and only serve the caller's own
//! wallets and cards. `/internal/...` routes are reached by the transactions
//! service over the private network and carry no session.

use axum::{
    Extension, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use super::model::*;
use super::service::{CardCharge, WalletService};
use crate::gateway::{
    ApiError, ApiResult, AuthUser, ErrorBody, HealthResponse, JsonBody, TokenKeys, created, ok,
    require_auth,
};

const SERVICE_NAME: &str = "wallets";

#[derive(Clone)]
pub struct WalletState {
    pub service: Arc<WalletService>,
}

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CardCreatedResponse {
    pub message: String,
    pub card: CardView,
    /// Returned once, never retrievable again
    pub cvv: String,
    pub masked_card_number: String,
    pub last_four_digits: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CardMessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<CardView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CardDeletedResponse {
    pub message: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopUpData {
    pub new_balance: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TopUpResponse {
    pub status: String,
    pub message: String,
    pub data: TopUpData,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PhysicalCardResponse {
    pub message: String,
    pub status: String,
}

/// Body of the deposit test hook
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub op_id: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        get_wallet,
        list_wallets,
        create_card,
        list_cards,
        get_card,
        update_card,
        delete_card,
        block_card,
        top_up_card,
        request_physical_card,
        internal_get_wallet,
        internal_default_wallet,
        internal_get_card,
        internal_debit,
        internal_credit,
        internal_reverse,
        internal_charge_card,
        internal_reverse_card_charge,
        health,
    ),
    components(schemas(
        WalletView,
        CardView,
        BalanceChange,
        CardCharge,
        BalanceOpRequest,
        CreateCardRequest,
        UpdateCardRequest,
        BlockCardRequest,
        TopUpRequest,
        PhysicalCardRequest,
        CardCreatedResponse,
        CardMessageResponse,
        CardDeletedResponse,
        TopUpResponse,
        PhysicalCardResponse,
        HealthResponse,
        ErrorBody,
    )),
    tags(
        (name = "Wallets", description = "Wallet queries (auth required)"),
        (name = "Cards", description = "Virtual-card lifecycle (auth required)"),
        (name = "Internal", description = "Balance operations for the transactions service"),
        (name = "System", description = "Health checks")
    )
)]
pub struct WalletApiDoc;

pub fn router(service: Arc<WalletService>, keys: Arc<TokenKeys>) -> Router {
    let state = WalletState { service };

    let public = Router::new()
        .route("/api/wallets/{walletId}", get(get_wallet))
        .route("/api/wallets/list/{accountId}", get(list_wallets))
        .route("/api/wallets/cards", post(create_card))
        .route("/api/wallets/cards/account/{accountId}", get(list_cards))
        .route(
            "/api/wallets/cards/{cardId}",
            get(get_card).put(update_card).delete(delete_card),
        )
        .route("/api/wallets/cards/{cardId}/block", post(block_card))
        .route("/api/wallets/cards/{cardId}/topup", post(top_up_card))
        .route(
            "/api/wallets/cards/{cardId}/request-physical",
            post(request_physical_card),
        )
        .layer(from_fn_with_state(keys, require_auth));

    let internal = Router::new()
        .route("/internal/wallets/{walletId}", get(internal_get_wallet))
        .route(
            "/internal/wallets/default/{accountId}",
            get(internal_default_wallet),
        )
        .route("/internal/wallets/{walletId}/debit", post(internal_debit))
        .route("/internal/wallets/{walletId}/credit", post(internal_credit))
        .route("/internal/wallets/{walletId}/reverse", post(internal_reverse))
        .route("/internal/cards/{cardId}", get(internal_get_card))
        .route("/internal/cards/{cardId}/charge", post(internal_charge_card))
        .route(
            "/internal/cards/{cardId}/reverse",
            post(internal_reverse_card_charge),
        );

    let app = Router::new()
        .merge(public)
        .merge(internal)
        .route("/health", get(health));

    // SECURITY: the deposit hook mints money; compiled out without `mock-api`
    #[cfg(feature = "mock-api")]
    let app = app.route(
        "/internal/mock/wallets/{walletId}/deposit",
        post(mock_deposit),
    );

    app.with_state(state)
}

// ============================================================================
// Wallets
// ============================================================================

#[utoipa::path(
    get,
    path = "/api/wallets/{walletId}",
    params(("walletId" = String, Path, description = "Wallet ID")),
    responses(
        (status = 200, description = "Wallet", body = WalletView),
        (status = 403, description = "Another account's wallet", body = ErrorBody),
        (status = 404, description = "Wallet not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Wallets"
)]
pub async fn get_wallet(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(wallet_id): Path<String>,
) -> ApiResult<WalletView> {
    let wallet = state.service.wallet_for(&user.account_id, &wallet_id).await?;
    ok(WalletView::from(&wallet))
}

#[utoipa::path(
    get,
    path = "/api/wallets/list/{accountId}",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Wallets of the account", body = Vec<WalletView>),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Wallets"
)]
pub async fn list_wallets(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<Vec<WalletView>> {
    user.ensure_account(&account_id)?;
    let wallets = state.service.list_wallets(&account_id).await?;
    ok(wallets.iter().map(WalletView::from).collect())
}

// ============================================================================
// Cards
// ============================================================================

#[utoipa::path(
    post,
    path = "/api/wallets/cards",
    request_body = CreateCardRequest,
    responses(
        (status = 201, description = "Card issued; CVV shown once", body = CardCreatedResponse),
        (status = 400, description = "Validation or currency mismatch", body = ErrorBody),
        (status = 404, description = "Wallet not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn create_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    JsonBody(req): JsonBody<CreateCardRequest>,
) -> Result<(StatusCode, axum::Json<CardCreatedResponse>), ApiError> {
    let issued = state.service.create_card(&user.account_id, &req).await?;
    created(CardCreatedResponse {
        message: "Virtual card created successfully".to_string(),
        masked_card_number: issued.card.masked_card_number(),
        last_four_digits: issued.card.last_four_digits().to_string(),
        card: CardView::revealed(&issued.card),
        cvv: issued.cvv,
    })
}

#[utoipa::path(
    get,
    path = "/api/wallets/cards/account/{accountId}",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Cards, numbers masked", body = Vec<CardView>),
        (status = 403, description = "Another account", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn list_cards(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<String>,
) -> ApiResult<Vec<CardView>> {
    user.ensure_account(&account_id)?;
    let cards = state.service.list_cards(&account_id).await?;
    ok(cards.iter().map(CardView::masked).collect())
}

#[utoipa::path(
    get,
    path = "/api/wallets/cards/{cardId}",
    params(("cardId" = String, Path, description = "Card ID")),
    responses(
        (status = 200, description = "Card, number masked", body = CardView),
        (status = 404, description = "Card not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn get_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(card_id): Path<String>,
) -> ApiResult<CardView> {
    let card = state.service.card_for(&user.account_id, &card_id).await?;
    ok(CardView::masked(&card))
}

#[utoipa::path(
    put,
    path = "/api/wallets/cards/{cardId}",
    params(("cardId" = String, Path, description = "Card ID")),
    request_body = UpdateCardRequest,
    responses(
        (status = 200, description = "Card updated", body = CardMessageResponse),
        (status = 400, description = "Invalid limits or transition", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn update_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(card_id): Path<String>,
    JsonBody(req): JsonBody<UpdateCardRequest>,
) -> ApiResult<CardMessageResponse> {
    let card = state
        .service
        .update_card(&user.account_id, &card_id, &req)
        .await?;
    ok(CardMessageResponse {
        message: "Virtual card updated successfully".to_string(),
        card: Some(CardView::masked(&card)),
    })
}

#[utoipa::path(
    delete,
    path = "/api/wallets/cards/{cardId}",
    params(("cardId" = String, Path, description = "Card ID")),
    responses(
        (status = 200, description = "Card deleted", body = CardDeletedResponse),
        (status = 404, description = "Card not found", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn delete_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(card_id): Path<String>,
) -> ApiResult<CardDeletedResponse> {
    state.service.delete_card(&user.account_id, &card_id).await?;
    ok(CardDeletedResponse {
        message: "Virtual card deleted successfully".to_string(),
        deleted_at: Utc::now(),
    })
}

#[utoipa::path(
    post,
    path = "/api/wallets/cards/{cardId}/block",
    params(("cardId" = String, Path, description = "Card ID")),
    request_body = BlockCardRequest,
    responses(
        (status = 200, description = "Card blocked", body = CardMessageResponse),
        (status = 400, description = "Already blocked", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn block_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(card_id): Path<String>,
    JsonBody(req): JsonBody<BlockCardRequest>,
) -> ApiResult<CardMessageResponse> {
    state
        .service
        .block_card(&user.account_id, &card_id, &req)
        .await?;
    ok(CardMessageResponse {
        message: "Virtual card blocked successfully".to_string(),
        card: None,
    })
}

#[utoipa::path(
    post,
    path = "/api/wallets/cards/{cardId}/topup",
    params(("cardId" = String, Path, description = "Card ID")),
    request_body = TopUpRequest,
    responses(
        (status = 200, description = "Card topped up", body = TopUpResponse),
        (status = 400, description = "Invalid amount or blocked card", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn top_up_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(card_id): Path<String>,
    JsonBody(req): JsonBody<TopUpRequest>,
) -> ApiResult<TopUpResponse> {
    let card = state
        .service
        .top_up(&user.account_id, &card_id, req.amount)
        .await?;
    ok(TopUpResponse {
        status: "success".to_string(),
        message: "Card topped up successfully".to_string(),
        data: TopUpData {
            new_balance: card.available_balance,
            amount: req.amount,
        },
    })
}

#[utoipa::path(
    post,
    path = "/api/wallets/cards/{cardId}/request-physical",
    params(("cardId" = String, Path, description = "Card ID")),
    request_body = PhysicalCardRequest,
    responses(
        (status = 200, description = "Request recorded (latest request wins)", body = PhysicalCardResponse),
        (status = 400, description = "Missing delivery fields", body = ErrorBody)
    ),
    security(("bearer_auth" = []), ("cookie_auth" = [])),
    tag = "Cards"
)]
pub async fn request_physical_card(
    State(state): State<WalletState>,
    Extension(user): Extension<AuthUser>,
    Path(card_id): Path<String>,
    JsonBody(req): JsonBody<PhysicalCardRequest>,
) -> ApiResult<PhysicalCardResponse> {
    state
        .service
        .request_physical(&user.account_id, &card_id, &req)
        .await?;
    ok(PhysicalCardResponse {
        message: "Physical card request submitted successfully".to_string(),
        status: PhysicalCardStatus::Pending.to_string(),
    })
}

// ============================================================================
// Internal
// ============================================================================

#[utoipa::path(
    get,
    path = "/internal/wallets/{walletId}",
    params(("walletId" = String, Path, description = "Wallet ID")),
    responses(
        (status = 200, description = "Wallet snapshot", body = WalletView),
        (status = 404, description = "Wallet not found", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_get_wallet(
    State(state): State<WalletState>,
    Path(wallet_id): Path<String>,
) -> ApiResult<WalletView> {
    let wallet = state.service.wallet(&wallet_id).await?;
    ok(WalletView::from(&wallet))
}

#[utoipa::path(
    get,
    path = "/internal/wallets/default/{accountId}",
    params(("accountId" = String, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Default wallet of the account", body = WalletView),
        (status = 404, description = "No default wallet", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_default_wallet(
    State(state): State<WalletState>,
    Path(account_id): Path<String>,
) -> ApiResult<WalletView> {
    let wallet = state.service.default_wallet(&account_id).await?;
    ok(WalletView::from(&wallet))
}

#[utoipa::path(
    get,
    path = "/internal/cards/{cardId}",
    params(("cardId" = String, Path, description = "Card ID")),
    responses(
        (status = 200, description = "Card snapshot, number masked", body = CardView),
        (status = 404, description = "Card not found", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_get_card(
    State(state): State<WalletState>,
    Path(card_id): Path<String>,
) -> ApiResult<CardView> {
    let card = state.service.card(&card_id).await?;
    ok(CardView::masked(&card))
}

#[utoipa::path(
    post,
    path = "/internal/wallets/{walletId}/debit",
    params(("walletId" = String, Path, description = "Wallet ID")),
    request_body = BalanceOpRequest,
    responses(
        (status = 200, description = "Applied, or already applied", body = BalanceChange),
        (status = 400, description = "Insufficient balance or inactive wallet", body = ErrorBody),
        (status = 409, description = "Operation already reversed", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_debit(
    State(state): State<WalletState>,
    Path(wallet_id): Path<String>,
    JsonBody(req): JsonBody<BalanceOpRequest>,
) -> ApiResult<BalanceChange> {
    ok(state.service.debit(&wallet_id, &req.op_id, req.amount).await?)
}

#[utoipa::path(
    post,
    path = "/internal/wallets/{walletId}/credit",
    params(("walletId" = String, Path, description = "Wallet ID")),
    request_body = BalanceOpRequest,
    responses(
        (status = 200, description = "Applied, or already applied", body = BalanceChange),
        (status = 400, description = "Wallet cannot receive funds", body = ErrorBody),
        (status = 409, description = "Operation already reversed", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_credit(
    State(state): State<WalletState>,
    Path(wallet_id): Path<String>,
    JsonBody(req): JsonBody<BalanceOpRequest>,
) -> ApiResult<BalanceChange> {
    ok(state.service.credit(&wallet_id, &req.op_id, req.amount).await?)
}

#[utoipa::path(
    post,
    path = "/internal/wallets/{walletId}/reverse",
    params(("walletId" = String, Path, description = "Wallet ID")),
    request_body = BalanceOpRequest,
    responses(
        (status = 200, description = "Compensated; no-op for unknown operations", body = BalanceChange),
        (status = 400, description = "Credit already spent", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_reverse(
    State(state): State<WalletState>,
    Path(wallet_id): Path<String>,
    JsonBody(req): JsonBody<BalanceOpRequest>,
) -> ApiResult<BalanceChange> {
    ok(state.service.reverse(&wallet_id, &req.op_id).await?)
}

#[utoipa::path(
    post,
    path = "/internal/cards/{cardId}/charge",
    params(("cardId" = String, Path, description = "Card ID")),
    request_body = BalanceOpRequest,
    responses(
        (status = 200, description = "Card and wallet charged", body = CardCharge),
        (status = 400, description = "Card inactive, limits or balance", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_charge_card(
    State(state): State<WalletState>,
    Path(card_id): Path<String>,
    JsonBody(req): JsonBody<BalanceOpRequest>,
) -> ApiResult<CardCharge> {
    ok(state.service.charge_card(&card_id, &req.op_id, req.amount).await?)
}

#[utoipa::path(
    post,
    path = "/internal/cards/{cardId}/reverse",
    params(("cardId" = String, Path, description = "Card ID")),
    request_body = BalanceOpRequest,
    responses(
        (status = 200, description = "Both legs compensated", body = CardCharge),
        (status = 404, description = "Card not found", body = ErrorBody)
    ),
    tag = "Internal"
)]
pub async fn internal_reverse_card_charge(
    State(state): State<WalletState>,
    Path(card_id): Path<String>,
    JsonBody(req): JsonBody<BalanceOpRequest>,
) -> ApiResult<CardCharge> {
    ok(state.service.reverse_card_charge(&card_id, &req.op_id).await?)
}

/// Credit a wallet without a counterparty (test hook)
#[cfg(feature = "mock-api")]
pub async fn mock_deposit(
    State(state): State<WalletState>,
    Path(wallet_id): Path<String>,
    JsonBody(req): JsonBody<DepositRequest>,
) -> ApiResult<BalanceChange> {
    tracing::warn!(wallet_id = %wallet_id, amount = %req.amount, "Mock deposit");
    ok(state.service.deposit(&wallet_id, req.amount, req.op_id).await?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, KycStatus};
    use crate::gateway::TokenKind;
    use crate::wallet::service::test_support;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const SECRET: &str = "wallet-test-secret";

    struct Harness {
        app: Router,
        service: Arc<WalletService>,
        keys: TokenKeys,
    }

    impl Harness {
        fn new() -> Self {
            let (svc, _broker) = test_support::service();
            let service = Arc::new(svc);
            let keys = TokenKeys::new(SECRET);
            Self {
                app: router(service.clone(), Arc::new(keys.clone())),
                service,
                keys,
            }
        }

        fn token(&self, account_id: &str) -> String {
            self.keys
                .sign(
                    &format!("{}@x", account_id),
                    account_id,
                    TokenKind::Access,
                    Utc::now(),
                    chrono::Duration::minutes(15),
                )
                .unwrap()
                .0
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            account: Option<&str>,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(acc) = account {
                req = req.header("authorization", format!("Bearer {}", self.token(acc)));
            }
            let req = match body {
                Some(b) => req
                    .header("content-type", "application/json")
                    .body(Body::from(b.to_string()))
                    .unwrap(),
                None => req.body(Body::empty()).unwrap(),
            };
            let resp = self.app.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
            };
            (status, json)
        }

        async fn provision(&self, account: &str) -> Wallet {
            self.service
                .provision_account(&test_support::account_created(
                    account,
                    Currency::Usd,
                    KycStatus::Approved,
                ))
                .await
                .unwrap()
                .wallet
        }
    }

    #[tokio::test]
    async fn test_public_routes_require_auth() {
        let h = Harness::new();
        let w = h.provision("acc-1").await;
        let (status, json) = h
            .call("GET", &format!("/api/wallets/{}", w.wallet_id), None, None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["status"], "failed");

        let (status, json) = h
            .call("GET", &format!("/api/wallets/{}", w.wallet_id), Some("acc-1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["walletId"], w.wallet_id.as_str());
        assert_eq!(json["isDefault"], true);
        assert!(json.get("appliedOps").is_none());
    }

    #[tokio::test]
    async fn test_other_accounts_are_forbidden() {
        let h = Harness::new();
        let w = h.provision("acc-1").await;
        h.provision("acc-2").await;
        let (status, _) = h
            .call("GET", &format!("/api/wallets/{}", w.wallet_id), Some("acc-2"), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = h
            .call("GET", "/api/wallets/list/acc-1", Some("acc-2"), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, json) = h
            .call("GET", "/api/wallets/list/acc-1", Some("acc-1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_card_lifecycle_over_http() {
        let h = Harness::new();
        let w = h.provision("acc-1").await;

        let (status, json) = h
            .call(
                "POST",
                "/api/wallets/cards",
                Some("acc-1"),
                Some(serde_json::json!({"walletId": w.wallet_id, "cardType": "debit", "currency": "USD"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["message"], "Virtual card created successfully");
        assert_eq!(json["cvv"].as_str().unwrap().len(), 3);
        let number = json["card"]["cardNumber"].as_str().unwrap().to_string();
        assert_eq!(number.len(), 16);
        assert_eq!(
            json["maskedCardNumber"],
            format!("**** **** **** {}", &number[12..])
        );
        assert_eq!(json["card"]["cardStatus"], "pending");
        let card_id = json["card"]["id"].as_str().unwrap().to_string();

        let (status, json) = h
            .call("GET", &format!("/api/wallets/cards/{}", card_id), Some("acc-1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["cardNumber"].as_str().unwrap().starts_with("****"));
        assert!(json.get("cvvHash").is_none());

        let (status, json) = h
            .call(
                "PUT",
                &format!("/api/wallets/cards/{}", card_id),
                Some("acc-1"),
                Some(serde_json::json!({"isActive": true, "dailyLimit": 100})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Virtual card updated successfully");
        assert_eq!(json["card"]["cardStatus"], "active");

        let (status, json) = h
            .call(
                "POST",
                &format!("/api/wallets/cards/{}/topup", card_id),
                Some("acc-1"),
                Some(serde_json::json!({"amount": 25.5, "accountNumber": "", "description": "x"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["newBalance"], 25.5);
        assert_eq!(json["data"]["amount"], 25.5);

        let body = serde_json::json!({
            "deliveryAddress": "1 Main St",
            "deliveryCity": "Kingston",
            "deliveryCountry": "JM",
            "deliveryPostalCode": "00000"
        });
        for _ in 0..2 {
            let (status, json) = h
                .call(
                    "POST",
                    &format!("/api/wallets/cards/{}/request-physical", card_id),
                    Some("acc-1"),
                    Some(body.clone()),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(
                json,
                serde_json::json!({"message": "Physical card request submitted successfully", "status": "pending"})
            );
        }

        let (status, json) = h
            .call(
                "POST",
                &format!("/api/wallets/cards/{}/block", card_id),
                Some("acc-1"),
                Some(serde_json::json!({"blockReason": "lost", "blockReasonDescription": "left on bus"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Virtual card blocked successfully");

        let (status, _) = h
            .call(
                "POST",
                &format!("/api/wallets/cards/{}/topup", card_id),
                Some("acc-1"),
                Some(serde_json::json!({"amount": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = h
            .call("DELETE", &format!("/api/wallets/cards/{}", card_id), Some("acc-1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Virtual card deleted successfully");
        let (status, _) = h
            .call("GET", &format!("/api/wallets/cards/{}", card_id), Some("acc-1"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_cards_masks_numbers() {
        let h = Harness::new();
        h.provision("acc-1").await;
        let (status, json) = h
            .call("GET", "/api/wallets/cards/account/acc-1", Some("acc-1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let cards = json.as_array().unwrap();
        assert_eq!(cards.len(), 1);
        let masked = cards[0]["cardNumber"].as_str().unwrap();
        assert!(masked.starts_with("**** **** **** "));
        assert!(masked.ends_with(cards[0]["lastFourDigits"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_request_physical_card() {
        let h = Harness::new();
        let w = h.provision("acc-1").await;
        let uri = format!("/api/wallets/cards/card-{}/request-physical", w.wallet_id);
        let body = serde_json::json!({
            "deliveryAddress": "1 Harbour St",
            "deliveryCity": "Kingston",
            "deliveryCountry": "JM",
            "deliveryPostalCode": "JMAKN01"
        });

        let (status, json) = h.call("POST", &uri, Some("acc-1"), Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(
            json,
            serde_json::json!({
                "message": "Physical card request submitted successfully",
                "status": "pending"
            })
        );

        // repeated requests overwrite
        let (status, _) = h.call("POST", &uri, Some("acc-1"), Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = h.call("POST", &uri, Some("acc-2"), Some(body)).await;
        assert!(status.is_client_error());

        let (status, json) = h
            .call("POST", &uri, Some("acc-1"), Some(serde_json::json!({"deliveryCity": "Kingston"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "failed");
    }

    #[tokio::test]
    async fn test_internal_balance_ops_are_idempotent() {
        let h = Harness::new();
        let w = h.provision("acc-1").await;
        h.service
            .deposit(&w.wallet_id, Decimal::from(100), None)
            .await
            .unwrap();

        let uri = format!("/internal/wallets/{}/debit", w.wallet_id);
        let body = serde_json::json!({"opId": "tx-1:debit", "amount": 30});
        let (status, first) = h.call("POST", &uri, None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["balanceAfter"], 70.0);
        assert_eq!(first["applied"], true);
        let (_, second) = h.call("POST", &uri, None, Some(body)).await;
        assert_eq!(second["balanceAfter"], 70.0);
        assert_eq!(second["applied"], false);

        let (status, json) = h
            .call(
                "POST",
                &format!("/internal/wallets/{}/reverse", w.wallet_id),
                None,
                Some(serde_json::json!({"opId": "tx-1:debit"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["balanceAfter"], 100.0);

        let (status, json) = h
            .call(
                "POST",
                &format!("/internal/wallets/{}/debit", w.wallet_id),
                None,
                Some(serde_json::json!({"opId": "tx-2:debit", "amount": 1000})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INSUFFICIENT_BALANCE");

        let (status, json) = h
            .call("GET", "/internal/wallets/default/acc-1", None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["walletId"], w.wallet_id.as_str());
    }

    #[cfg(feature = "mock-api")]
    #[tokio::test]
    async fn test_mock_deposit() {
        let h = Harness::new();
        let w = h.provision("acc-1").await;
        let (status, json) = h
            .call(
                "POST",
                &format!("/internal/mock/wallets/{}/deposit", w.wallet_id),
                None,
                Some(serde_json::json!({"amount": 100})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["balanceAfter"], 100.0);
    }

    #[tokio::test]
    async fn test_health_and_docs() {
        let h = Harness::new();
        let (status, json) = h.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["service"], "wallets");
        let doc = WalletApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/wallets/cards/{cardId}/topup"));
        assert!(doc.paths.paths.contains_key("/internal/wallets/{walletId}/debit"));
    }
}
