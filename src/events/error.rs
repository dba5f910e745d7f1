use thiserror::Error;

/// Event bus error kinds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Producer or subscription closed")]
    Closed,

    #[error("Invalid bus configuration: {0}")]
    InvalidConfig(String),

    #[error("Bus backend error: {0}")]
    Backend(String),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::UnknownTopic(_) => "UNKNOWN_TOPIC",
            BusError::SendFailed(_) => "SEND_FAILED",
            BusError::Timeout(_) => "BUS_TIMEOUT",
            BusError::Closed => "BUS_CLOSED",
            BusError::InvalidConfig(_) => "INVALID_BUS_CONFIG",
            BusError::Backend(_) => "BUS_BACKEND_ERROR",
        }
    }
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::SendFailed(format!("encode: {}", e))
    }
}

pub type BusResult<T> = Result<T, BusError>;
