//! In-process adapters, used when the services share one binary

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::{AdapterError, AdapterResult, RiskAssessor, UserDirectory, UserRef, WalletGateway};
use crate::fraud::{FraudEngine, RiskAssessmentRequest, RiskAssessmentResponse};
use crate::users::UserService;
use crate::wallet::service::CardCharge;
use crate::wallet::{BalanceChange, CardView, WalletError, WalletService, WalletView};

impl From<WalletError> for AdapterError {
    fn from(e: WalletError) -> Self {
        match e.http_status() {
            404 => AdapterError::NotFound(e.to_string()),
            s if s >= 500 => AdapterError::Unavailable(e.to_string()),
            _ => AdapterError::Rejected {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

pub struct LocalUserDirectory {
    users: Arc<UserService>,
}

impl LocalUserDirectory {
    pub fn new(users: Arc<UserService>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for LocalUserDirectory {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn find_by_omni_tag(&self, omni_tag: &str) -> AdapterResult<Option<UserRef>> {
        let user = self
            .users
            .find_by_omni_tag(omni_tag)
            .await
            .map_err(|e| AdapterError::Unavailable(e.to_string()))?;
        Ok(user.map(|u| UserRef {
            account_id: u.account_id,
            omni_tag: u.omni_tag,
        }))
    }
}

pub struct LocalWalletGateway {
    wallets: Arc<WalletService>,
}

impl LocalWalletGateway {
    pub fn new(wallets: Arc<WalletService>) -> Self {
        Self { wallets }
    }
}

#[async_trait]
impl WalletGateway for LocalWalletGateway {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn wallet(&self, wallet_id: &str) -> AdapterResult<WalletView> {
        let wallet = self.wallets.wallet(wallet_id).await?;
        Ok(WalletView::from(&wallet))
    }

    async fn default_wallet(&self, account_id: &str) -> AdapterResult<WalletView> {
        let wallet = self.wallets.default_wallet(account_id).await?;
        Ok(WalletView::from(&wallet))
    }

    async fn card(&self, card_id: &str) -> AdapterResult<CardView> {
        let card = self.wallets.card(card_id).await?;
        Ok(CardView::masked(&card))
    }

    async fn debit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<BalanceChange> {
        Ok(self.wallets.debit(wallet_id, op_id, amount).await?)
    }

    async fn credit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<BalanceChange> {
        Ok(self.wallets.credit(wallet_id, op_id, amount).await?)
    }

    async fn reverse(&self, wallet_id: &str, op_id: &str) -> AdapterResult<BalanceChange> {
        Ok(self.wallets.reverse(wallet_id, op_id).await?)
    }

    async fn charge_card(&self, card_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<CardCharge> {
        Ok(self.wallets.charge_card(card_id, op_id, amount).await?)
    }

    async fn reverse_card_charge(&self, card_id: &str, op_id: &str) -> AdapterResult<CardCharge> {
        Ok(self.wallets.reverse_card_charge(card_id, op_id).await?)
    }
}

pub struct LocalRiskAssessor {
    engine: Arc<FraudEngine>,
}

impl LocalRiskAssessor {
    pub fn new(engine: Arc<FraudEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RiskAssessor for LocalRiskAssessor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn assess(&self, req: &RiskAssessmentRequest) -> AdapterResult<RiskAssessmentResponse> {
        self.engine
            .assess(req)
            .await
            .map_err(|e| AdapterError::Rejected {
                code: e.code().to_string(),
                message: e.to_string(),
            })
    }
}
