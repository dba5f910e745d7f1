//! Users Error Types

use thiserror::Error;

use crate::gateway::ApiError;
use crate::storage::StorageError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UserError {
    // === Validation Errors ===
    #[error("{0}")]
    Validation(String),

    #[error("Invalid Omni Tag: {0}")]
    InvalidOmniTag(String),

    #[error("New passwords do not match")]
    PasswordMismatch,

    #[error("New password cannot be the same as current password")]
    PasswordUnchanged,

    // === Lookup Errors ===
    #[error("User doesn't exist")]
    UserNotFound,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Contact not found")]
    ContactNotFound,

    // === Conflicts ===
    #[error("User already exists")]
    EmailTaken,

    #[error("Omni Tag already taken")]
    OmniTagTaken,

    #[error("Contact request already exists")]
    ContactExists,

    #[error("KYC already approved")]
    KycAlreadyApproved,

    // === Authentication ===
    #[error("Invalid password")]
    InvalidPassword,

    #[error("Current password is incorrect")]
    WrongCurrentPassword,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Too many password change attempts, try again later")]
    PasswordThrottled,

    // === Business Rules ===
    #[error("Cannot send contact request to yourself")]
    SelfContact,

    #[error("Contact request is not pending")]
    ContactNotPending,

    #[error("Account is already disabled or pending deletion")]
    AccountNotActive,

    // === System Errors ===
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UserError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        UserError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        UserError::Forbidden(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            UserError::Validation(_) => "VALIDATION_ERROR",
            UserError::InvalidOmniTag(_) => "INVALID_OMNI_TAG",
            UserError::PasswordMismatch => "PASSWORD_MISMATCH",
            UserError::PasswordUnchanged => "PASSWORD_UNCHANGED",
            UserError::UserNotFound => "USER_NOT_FOUND",
            UserError::SessionNotFound => "SESSION_NOT_FOUND",
            UserError::ContactNotFound => "CONTACT_NOT_FOUND",
            UserError::EmailTaken => "EMAIL_TAKEN",
            UserError::OmniTagTaken => "OMNI_TAG_TAKEN",
            UserError::ContactExists => "CONTACT_EXISTS",
            UserError::KycAlreadyApproved => "KYC_ALREADY_APPROVED",
            UserError::InvalidPassword => "INVALID_PASSWORD",
            UserError::WrongCurrentPassword => "INVALID_PASSWORD",
            UserError::Unauthorized(_) => "UNAUTHORIZED",
            UserError::Forbidden(_) => "FORBIDDEN",
            UserError::PasswordThrottled => "RATE_LIMITED",
            UserError::SelfContact => "SELF_CONTACT",
            UserError::ContactNotPending => "CONTACT_NOT_PENDING",
            UserError::AccountNotActive => "ACCOUNT_NOT_ACTIVE",
            UserError::Storage(e) => e.code(),
            UserError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            UserError::UserNotFound | UserError::SessionNotFound | UserError::ContactNotFound => 404,
            UserError::EmailTaken
            | UserError::OmniTagTaken
            | UserError::ContactExists
            | UserError::KycAlreadyApproved => 409,
            UserError::InvalidPassword
            | UserError::WrongCurrentPassword
            | UserError::Unauthorized(_) => 401,
            UserError::Forbidden(_) => 403,
            UserError::PasswordThrottled => 429,
            UserError::Storage(e) if e.is_not_found() => 404,
            UserError::Storage(_) | UserError::Internal(_) => 500,
            _ => 400,
        }
    }
}

impl From<UserError> for ApiError {
    fn from(e: UserError) -> Self {
        ApiError::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

impl From<validator::ValidationErrors> for UserError {
    fn from(errors: validator::ValidationErrors) -> Self {
        // first message of the first failing field, in field-name order
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let message = fields
            .first()
            .and_then(|(field, errs)| {
                errs.first().map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid {}", field))
                })
            })
            .unwrap_or_else(|| "Invalid request".to_string());
        UserError::Validation(message)
    }
}

pub type UserResult<T> = Result<T, UserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(UserError::UserNotFound.http_status(), 404);
        assert_eq!(UserError::InvalidPassword.http_status(), 401);
        assert_eq!(UserError::EmailTaken.http_status(), 409);
        assert_eq!(UserError::OmniTagTaken.http_status(), 409);
        assert_eq!(UserError::InvalidOmniTag("x".into()).http_status(), 400);
        assert_eq!(UserError::forbidden("no").http_status(), 403);
        assert_eq!(UserError::PasswordThrottled.http_status(), 429);
        assert_eq!(
            UserError::Storage(StorageError::Unavailable("x".into())).http_status(),
            500
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(UserError::EmailTaken.to_string(), "User already exists");
        assert_eq!(
            UserError::InvalidOmniTag("Omni tag cannot be empty".into()).to_string(),
            "Invalid Omni Tag: Omni tag cannot be empty"
        );
        assert_eq!(
            UserError::SelfContact.to_string(),
            "Cannot send contact request to yourself"
        );
    }

    #[test]
    fn test_api_error_conversion() {
        let api: ApiError = UserError::KycAlreadyApproved.into();
        assert_eq!(api.status.as_u16(), 409);
        assert_eq!(api.code, "KYC_ALREADY_APPROVED");
        assert_eq!(api.message, "KYC already approved");
    }
}
