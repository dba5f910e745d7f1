//! HTTP adapters for the Users, Wallets and Fraud-Detection services

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

use super::{AdapterError, AdapterResult, RiskAssessor, UserDirectory, UserRef, WalletGateway};
use crate::fraud::{RiskAssessmentRequest, RiskAssessmentResponse};
use crate::gateway::ErrorBody;
use crate::wallet::model::BalanceOpRequest;
use crate::wallet::service::CardCharge;
use crate::wallet::{BalanceChange, CardView, WalletView};

/// JSON client bound to one service's base URL
#[derive(Debug, Clone)]
struct JsonClient {
    service: &'static str,
    base: Url,
    http: reqwest::Client,
}

impl JsonClient {
    fn new(service: &'static str, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid {} URL: {}", service, base_url))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("invalid {} URL: {}", service, base_url));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { service, base, http })
    }

    fn url(&self, segments: &[&str]) -> AdapterResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::Unavailable(format!("{}: bad base URL", self.service)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<B, R>(&self, method: Method, segments: &[&str], body: Option<&B>) -> AdapterResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(segments)?;
        let mut request = self.http.request(method, url.clone());
        if let Some(b) = body {
            request = request.json(b);
        }
        let response = request.send().await.map_err(|e| {
            warn!(service = self.service, url = %url, error = %e, "Downstream call failed");
            AdapterError::Unavailable(format!("{} unreachable: {}", self.service, e))
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(|e| {
                AdapterError::Unavailable(format!("{} sent an unreadable response: {}", self.service, e))
            });
        }

        let error = response.json::<ErrorBody>().await.ok();
        let message = error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| format!("{} responded {}", self.service, status));
        if status == StatusCode::NOT_FOUND {
            return Err(AdapterError::NotFound(message));
        }
        if status.is_client_error() {
            let code = error
                .map(|e| e.code)
                .unwrap_or_else(|| status.as_u16().to_string());
            return Err(AdapterError::Rejected { code, message });
        }
        warn!(service = self.service, url = %url, status = status.as_u16(), "Downstream error");
        Err(AdapterError::Unavailable(message))
    }

    async fn get<R: DeserializeOwned>(&self, segments: &[&str]) -> AdapterResult<R> {
        self.call::<(), R>(Method::GET, segments, None).await
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> AdapterResult<R> {
        self.call(Method::POST, segments, Some(body)).await
    }
}

// ============================================================================
// Users
// ============================================================================

pub struct HttpUserDirectory {
    client: JsonClient,
}

impl HttpUserDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new("user-service", base_url, timeout)?,
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn find_by_omni_tag(&self, omni_tag: &str) -> AdapterResult<Option<UserRef>> {
        match self
            .client
            .get::<UserRef>(&["internal", "users", "omnitag", omni_tag])
            .await
        {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Wallets
// ============================================================================

pub struct HttpWalletGateway {
    client: JsonClient,
}

impl HttpWalletGateway {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new("wallet-service", base_url, timeout)?,
        })
    }

    fn op(op_id: &str, amount: Decimal) -> BalanceOpRequest {
        BalanceOpRequest {
            op_id: op_id.to_string(),
            amount,
        }
    }
}

#[async_trait]
impl WalletGateway for HttpWalletGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn wallet(&self, wallet_id: &str) -> AdapterResult<WalletView> {
        self.client.get(&["internal", "wallets", wallet_id]).await
    }

    async fn default_wallet(&self, account_id: &str) -> AdapterResult<WalletView> {
        self.client
            .get(&["internal", "wallets", "default", account_id])
            .await
    }

    async fn card(&self, card_id: &str) -> AdapterResult<CardView> {
        self.client.get(&["internal", "cards", card_id]).await
    }

    async fn debit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<BalanceChange> {
        self.client
            .post(&["internal", "wallets", wallet_id, "debit"], &Self::op(op_id, amount))
            .await
    }

    async fn credit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<BalanceChange> {
        self.client
            .post(&["internal", "wallets", wallet_id, "credit"], &Self::op(op_id, amount))
            .await
    }

    async fn reverse(&self, wallet_id: &str, op_id: &str) -> AdapterResult<BalanceChange> {
        self.client
            .post(
                &["internal", "wallets", wallet_id, "reverse"],
                &Self::op(op_id, Decimal::ZERO),
            )
            .await
    }

    async fn charge_card(&self, card_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<CardCharge> {
        self.client
            .post(&["internal", "cards", card_id, "charge"], &Self::op(op_id, amount))
            .await
    }

    async fn reverse_card_charge(&self, card_id: &str, op_id: &str) -> AdapterResult<CardCharge> {
        self.client
            .post(
                &["internal", "cards", card_id, "reverse"],
                &Self::op(op_id, Decimal::ZERO),
            )
            .await
    }
}

// ============================================================================
// Fraud detection
// ============================================================================

pub struct HttpRiskAssessor {
    client: JsonClient,
}

impl HttpRiskAssessor {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new("fraud-detection", base_url, timeout)?,
        })
    }
}

#[async_trait]
impl RiskAssessor for HttpRiskAssessor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn assess(&self, req: &RiskAssessmentRequest) -> AdapterResult<RiskAssessmentResponse> {
        self.client
            .post(&["api", "fraud-detection", "assess"], req)
            .await
    }
}
