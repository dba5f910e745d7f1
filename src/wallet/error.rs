//! Wallet Error Types

use thiserror::Error;

use super::model::CardStatus;
use crate::gateway::ApiError;
use crate::storage::StorageError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WalletError {
    // === Validation Errors ===
    #[error("{0}")]
    Validation(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Card currency must match wallet currency ({0})")]
    CardCurrencyMismatch(String),

    // === Lookup Errors ===
    #[error("Wallet not found")]
    WalletNotFound,

    #[error("Virtual card not found")]
    CardNotFound,

    #[error("Access to another account's wallet is forbidden")]
    Forbidden,

    // === Business Rules ===
    #[error("Wallet is not active")]
    WalletNotActive,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Card is not active")]
    CardNotActive,

    #[error("Insufficient card balance")]
    InsufficientCardBalance,

    #[error("Transaction exceeds daily limit")]
    DailyLimitExceeded,

    #[error("Transaction exceeds monthly limit")]
    MonthlyLimitExceeded,

    #[error("Card is already blocked")]
    CardAlreadyBlocked,

    #[error("Card cannot be topped up while {0}")]
    CardNotToppable(CardStatus),

    #[error("Card cannot move from {from} to {to}")]
    InvalidCardTransition { from: CardStatus, to: CardStatus },

    // === Idempotency ===
    #[error("Operation {0} was already reversed")]
    OperationReversed(String),

    // === System Errors ===
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::Validation(_) => "VALIDATION_ERROR",
            WalletError::InvalidAmount => "INVALID_AMOUNT",
            WalletError::CardCurrencyMismatch(_) => "CURRENCY_MISMATCH",
            WalletError::WalletNotFound => "WALLET_NOT_FOUND",
            WalletError::CardNotFound => "CARD_NOT_FOUND",
            WalletError::Forbidden => "FORBIDDEN",
            WalletError::WalletNotActive => "WALLET_NOT_ACTIVE",
            WalletError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            WalletError::CardNotActive => "CARD_NOT_ACTIVE",
            WalletError::InsufficientCardBalance => "INSUFFICIENT_CARD_BALANCE",
            WalletError::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            WalletError::MonthlyLimitExceeded => "MONTHLY_LIMIT_EXCEEDED",
            WalletError::CardAlreadyBlocked => "CARD_ALREADY_BLOCKED",
            WalletError::CardNotToppable(_) => "CARD_NOT_TOPPABLE",
            WalletError::InvalidCardTransition { .. } => "INVALID_CARD_TRANSITION",
            WalletError::OperationReversed(_) => "OPERATION_REVERSED",
            WalletError::Storage(e) => e.code(),
            WalletError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            WalletError::WalletNotFound | WalletError::CardNotFound => 404,
            WalletError::Forbidden => 403,
            WalletError::OperationReversed(_) => 409,
            WalletError::Storage(e) if e.is_not_found() => 404,
            WalletError::Storage(_) | WalletError::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Business-rule refusals (as opposed to bad input or infrastructure)
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            WalletError::WalletNotActive
                | WalletError::InsufficientBalance
                | WalletError::CardNotActive
                | WalletError::InsufficientCardBalance
                | WalletError::DailyLimitExceeded
                | WalletError::MonthlyLimitExceeded
                | WalletError::OperationReversed(_)
        )
    }

    /// Inverse of `code()` for the rules a remote caller needs to tell apart
    pub fn from_code(code: &str, message: &str) -> Option<Self> {
        Some(match code {
            "WALLET_NOT_FOUND" => WalletError::WalletNotFound,
            "CARD_NOT_FOUND" => WalletError::CardNotFound,
            "WALLET_NOT_ACTIVE" => WalletError::WalletNotActive,
            "INSUFFICIENT_BALANCE" => WalletError::InsufficientBalance,
            "CARD_NOT_ACTIVE" => WalletError::CardNotActive,
            "INSUFFICIENT_CARD_BALANCE" => WalletError::InsufficientCardBalance,
            "DAILY_LIMIT_EXCEEDED" => WalletError::DailyLimitExceeded,
            "MONTHLY_LIMIT_EXCEEDED" => WalletError::MonthlyLimitExceeded,
            "OPERATION_REVERSED" => WalletError::OperationReversed(message.to_string()),
            _ => return None,
        })
    }
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        let status = e.http_status();
        // 5xx is logged by from_domain
        if e.is_business_rule() {
            tracing::info!(code = e.code(), error = %e, "Request refused");
        } else if status < 500 {
            tracing::debug!(code = e.code(), error = %e, "Request rejected");
        }
        ApiError::from_domain(status, e.code(), e.to_string())
    }
}

pub type WalletResult<T> = Result<T, WalletError>;
