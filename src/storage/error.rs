use thiserror::Error;

/// Storage error kinds.
///
/// `NotFound` is the only "expected" miss; everything else is surfaced as
/// an infrastructure failure by the callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Too much contention updating {0}")]
    Contention(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "NOT_FOUND",
            StorageError::Unavailable(_) => "STORE_UNAVAILABLE",
            StorageError::Serialization(_) => "SERIALIZATION_ERROR",
            StorageError::Contention(_) => "STORE_CONTENTION",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct() {
        assert!(StorageError::NotFound("user:a".into()).is_not_found());
        assert!(!StorageError::Unavailable("down".into()).is_not_found());
        assert_eq!(StorageError::Unavailable("x".into()).code(), "STORE_UNAVAILABLE");
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let storage: StorageError = err.into();
        assert!(matches!(storage, StorageError::Serialization(_)));
    }
}
