use thiserror::Error;

use crate::gateway::ApiError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FraudError {
    #[error("Transaction ID is required")]
    MissingTransactionId,

    #[error("Sender account ID is required")]
    MissingSenderAccountId,

    #[error("Amount must be greater than 0")]
    InvalidAmount,
}

impl FraudError {
    pub fn code(&self) -> &'static str {
        match self {
            FraudError::MissingTransactionId => "MISSING_TRANSACTION_ID",
            FraudError::MissingSenderAccountId => "MISSING_SENDER_ACCOUNT_ID",
            FraudError::InvalidAmount => "INVALID_AMOUNT",
        }
    }

    pub fn http_status(&self) -> u16 {
        400
    }
}

impl From<FraudError> for ApiError {
    fn from(e: FraudError) -> Self {
        ApiError::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

pub type FraudResult<T> = Result<T, FraudError>;
