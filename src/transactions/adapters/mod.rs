//! Service Adapters
//!
//! The engine talks to Users, Wallets and Fraud-Detection only through these
//! traits. [`http`] adapters call the other services over HTTP; [`local`]
//! adapters call them in-process when several services share one binary.
//!
//! Every wallet mutation carries an operation id and MUST be idempotent:
//! calling it again with the same id has the same effect as calling it once.

pub mod http;
pub mod local;

pub use http::{HttpRiskAssessor, HttpUserDirectory, HttpWalletGateway};
pub use local::{LocalRiskAssessor, LocalUserDirectory, LocalWalletGateway};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::core_types::AccountId;
use crate::fraud::{RiskAssessmentRequest, RiskAssessmentResponse};
use crate::wallet::service::CardCharge;
use crate::wallet::{BalanceChange, CardView, WalletView};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("{0}")]
    NotFound(String),

    /// The remote side understood the call and refused it
    #[error("{message}")]
    Rejected { code: String, message: String },

    /// Timeout, connection failure or 5xx: the outcome is unknown
    #[error("{0}")]
    Unavailable(String),
}

impl AdapterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_))
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Public identity of an account, as resolved from its omni-tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub account_id: AccountId,
    pub omni_tag: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when no account owns the tag
    async fn find_by_omni_tag(&self, omni_tag: &str) -> AdapterResult<Option<UserRef>>;
}

#[async_trait]
pub trait WalletGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn wallet(&self, wallet_id: &str) -> AdapterResult<WalletView>;

    async fn default_wallet(&self, account_id: &str) -> AdapterResult<WalletView>;

    async fn card(&self, card_id: &str) -> AdapterResult<CardView>;

    async fn debit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<BalanceChange>;

    async fn credit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<BalanceChange>;

    /// Compensate `op_id`. A no-op (and a tombstone) when it never landed.
    async fn reverse(&self, wallet_id: &str, op_id: &str) -> AdapterResult<BalanceChange>;

    /// Spend from a card and its backing wallet
    async fn charge_card(&self, card_id: &str, op_id: &str, amount: Decimal) -> AdapterResult<CardCharge>;

    async fn reverse_card_charge(&self, card_id: &str, op_id: &str) -> AdapterResult<CardCharge>;
}

#[async_trait]
pub trait RiskAssessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn assess(&self, req: &RiskAssessmentRequest) -> AdapterResult<RiskAssessmentResponse>;
}

/// The three collaborators of the engine
#[derive(Clone)]
pub struct Adapters {
    pub users: Arc<dyn UserDirectory>,
    pub wallets: Arc<dyn WalletGateway>,
    pub risk: Arc<dyn RiskAssessor>,
}
