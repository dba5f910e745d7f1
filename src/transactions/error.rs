//! Transaction Error Types

use thiserror::Error;

use super::adapters::AdapterError;
use crate::core_types::Currency;
use crate::gateway::ApiError;
use crate::storage::StorageError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    // === Validation Errors ===
    #[error("{0}")]
    Validation(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Access to another account's transactions is forbidden")]
    Forbidden,

    // === Lookup Errors ===
    #[error("Sender wallet not found")]
    SenderWalletNotFound,

    #[error("Receiver not found")]
    ReceiverNotFound,

    #[error("Receiver wallet not found")]
    ReceiverWalletNotFound,

    #[error("Card not found")]
    CardNotFound,

    #[error("Wallet not found")]
    WalletNotFound,

    #[error("Transaction not found")]
    TransactionNotFound,

    // === Business Rules ===
    #[error("Sender wallet is not active")]
    SenderWalletNotActive,

    #[error("Wallet is not active")]
    WalletNotActive,

    #[error("Card is not active")]
    CardNotActive,

    #[error("Cannot transfer to yourself")]
    SelfTransfer,

    #[error("Currency mismatch: sender has {sender}, receiver has {receiver}")]
    CurrencyMismatch { sender: Currency, receiver: Currency },

    #[error("Currency mismatch between card and transaction")]
    CardCurrencyMismatch,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Insufficient card balance")]
    InsufficientCardBalance,

    #[error("Transaction exceeds daily limit")]
    DailyLimitExceeded,

    /// A downstream service refused the operation
    #[error("{message}")]
    Rejected { code: String, message: String },

    // === Idempotency ===
    #[error("A request with this idempotency key is already in progress")]
    RequestInProgress,

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // === System Errors ===
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransactionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransactionError::Validation(_) => "VALIDATION_ERROR",
            TransactionError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            TransactionError::Forbidden => "FORBIDDEN",
            TransactionError::SenderWalletNotFound => "SENDER_WALLET_NOT_FOUND",
            TransactionError::ReceiverNotFound => "RECEIVER_NOT_FOUND",
            TransactionError::ReceiverWalletNotFound => "RECEIVER_WALLET_NOT_FOUND",
            TransactionError::CardNotFound => "CARD_NOT_FOUND",
            TransactionError::WalletNotFound => "WALLET_NOT_FOUND",
            TransactionError::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            TransactionError::SenderWalletNotActive | TransactionError::WalletNotActive => {
                "WALLET_NOT_ACTIVE"
            }
            TransactionError::CardNotActive => "CARD_NOT_ACTIVE",
            TransactionError::SelfTransfer => "SELF_TRANSFER",
            TransactionError::CurrencyMismatch { .. } | TransactionError::CardCurrencyMismatch => {
                "CURRENCY_MISMATCH"
            }
            TransactionError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            TransactionError::InsufficientCardBalance => "INSUFFICIENT_CARD_BALANCE",
            TransactionError::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            TransactionError::Rejected { .. } => "UPSTREAM_REJECTED",
            TransactionError::RequestInProgress => "REQUEST_IN_PROGRESS",
            TransactionError::InvalidTransition(_) => "INVALID_STATE_TRANSITION",
            TransactionError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            TransactionError::Storage(e) => e.code(),
            TransactionError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            TransactionError::Forbidden => 403,
            TransactionError::SenderWalletNotFound
            | TransactionError::ReceiverNotFound
            | TransactionError::ReceiverWalletNotFound
            | TransactionError::CardNotFound
            | TransactionError::WalletNotFound
            | TransactionError::TransactionNotFound => 404,
            TransactionError::RequestInProgress | TransactionError::InvalidTransition(_) => 409,
            TransactionError::ServiceUnavailable(_) => 503,
            TransactionError::Storage(e) if e.is_not_found() => 404,
            TransactionError::Storage(_) | TransactionError::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Refusals that leave a failed transaction behind when they happen
    /// after the pending record exists
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            TransactionError::SenderWalletNotActive
                | TransactionError::WalletNotActive
                | TransactionError::CardNotActive
                | TransactionError::SelfTransfer
                | TransactionError::CurrencyMismatch { .. }
                | TransactionError::CardCurrencyMismatch
                | TransactionError::InsufficientBalance
                | TransactionError::InsufficientCardBalance
                | TransactionError::DailyLimitExceeded
                | TransactionError::Rejected { .. }
        )
    }

    /// Infrastructure failures release the idempotency reservation so the
    /// caller can retry with the same key.
    pub fn is_infrastructure(&self) -> bool {
        self.http_status() >= 500
    }
}

impl From<AdapterError> for TransactionError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::NotFound(what) => TransactionError::Rejected {
                code: "NOT_FOUND".to_string(),
                message: what,
            },
            AdapterError::Rejected { code, message } => TransactionError::Rejected { code, message },
            AdapterError::Unavailable(msg) => TransactionError::ServiceUnavailable(msg),
        }
    }
}

impl From<TransactionError> for ApiError {
    fn from(e: TransactionError) -> Self {
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

pub type TransactionResult<T> = Result<T, TransactionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(TransactionError::Validation("x".into()).http_status(), 400);
        assert_eq!(TransactionError::Forbidden.http_status(), 403);
        assert_eq!(TransactionError::ReceiverNotFound.http_status(), 404);
        assert_eq!(TransactionError::RequestInProgress.http_status(), 409);
        assert_eq!(TransactionError::SelfTransfer.http_status(), 400);
        assert_eq!(
            TransactionError::Storage(StorageError::Unavailable("down".into())).http_status(),
            500
        );
        assert_eq!(TransactionError::ServiceUnavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn test_currency_mismatch_message() {
        let e = TransactionError::CurrencyMismatch {
            sender: Currency::Usd,
            receiver: Currency::Jmd,
        };
        assert_eq!(e.to_string(), "Currency mismatch: sender has USD, receiver has JMD");
        assert_eq!(e.code(), "CURRENCY_MISMATCH");
        assert!(e.is_business_rule());
    }

    #[test]
    fn test_api_error_conversion() {
        let api: ApiError = TransactionError::InsufficientBalance.into();
        assert_eq!(api.body().code, "INSUFFICIENT_BALANCE");
        let api: ApiError = TransactionError::ServiceUnavailable("x".into()).into();
        assert_eq!(api.body().code, "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_adapter_mapping() {
        let e: TransactionError = AdapterError::Unavailable("timeout".into()).into();
        assert!(e.is_infrastructure());
        let e: TransactionError = AdapterError::Rejected {
            code: "INSUFFICIENT_BALANCE".into(),
            message: "Insufficient balance".into(),
        }
        .into();
        assert!(e.is_business_rule());
        assert_eq!(e.to_string(), "Insufficient balance");
    }
}
