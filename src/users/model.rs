//! User, session, refresh-token and contact records plus the request and
//! response bodies of the users API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::core_types::{AccountId, Currency, KycStatus};

/// Longest omni-tag accepted at registration
pub const OMNI_TAG_MAX_LEN: usize = 5;

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disabled,
    PendingDeletion,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
            AccountStatus::PendingDeletion => "pending_deletion",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored user record. Never rendered directly; see [`ProfileView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub account_id: AccountId,
    pub email: String,
    /// Case-sensitive, unique
    pub omni_tag: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub dob: String,
    #[serde(default)]
    pub gov_id: String,
    pub currency: Currency,
    #[serde(alias = "kycstatus")]
    pub kyc_status: KycStatus,
    #[serde(default)]
    pub data_authorization: bool,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_deletion: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

// ============================================================================
// Sessions and refresh tokens
// ============================================================================

/// One signed-in device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub account_id: AccountId,
    pub user_email: String,
    pub device_info: String,
    pub ip_address: String,
    pub country: String,
    pub browser: String,
    /// `jti` of the refresh token currently bound to this session
    pub refresh_token_id: String,
    pub last_login_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Server-side half of a refresh token, keyed by the token's `jti`.
/// A token whose record is gone is rejected even if its signature is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub account_id: AccountId,
    pub user_email: String,
    pub session_id: String,
    pub device_info: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Caller's network identity, captured per request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: String,
}

// ============================================================================
// Contacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Accepted,
    Rejected,
    Blocked,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::Accepted => "accepted",
            ContactStatus::Rejected => "rejected",
            ContactStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub requester_id: AccountId,
    pub addressee_id: AccountId,
    pub status: ContactStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn involves(&self, account_id: &str) -> bool {
        self.requester_id == account_id || self.addressee_id == account_id
    }

    /// The party that is not `account_id`
    pub fn counterparty(&self, account_id: &str) -> &str {
        if self.requester_id == account_id {
            &self.addressee_id
        } else {
            &self.requester_id
        }
    }
}

/// Accepted contact as shown to one of its parties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub account_id: AccountId,
    pub omni_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub status: ContactStatus,
    pub added_at: DateTime<Utc>,
    pub is_accepted: bool,
}

/// Only the omni-tag is visible before a request is accepted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserBasic {
    pub account_id: AccountId,
    #[serde(default)]
    pub omni_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestView {
    pub contact_id: String,
    pub from_user: UserBasic,
    pub to_user: UserBasic,
    pub status: ContactStatus,
    pub requested_at: DateTime<Utc>,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email address"))]
    #[schema(example = "ada@example.com")]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "correct horse battery staple")]
    pub password: String,
    #[validate(length(min = 1, message = "First name is required"))]
    pub first_name: String,
    #[validate(length(min = 1, message = "Last name is required"))]
    pub last_name: String,
    #[schema(example = "ada1")]
    pub omni_tag: String,
    /// Defaults to USD
    #[schema(example = "USD")]
    pub currency: Option<String>,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub postal_code: String,
    pub dob: String,
    pub gov_id: String,
    pub data_authorization: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Email is required"))]
    #[schema(example = "ada@example.com")]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

/// Every field is optional; only the supplied ones change
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub data_authorization: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangePasswordRequest {
    pub account_id: AccountId,
    pub email: String,
    pub current_password: String,
    pub new_password: String,
    pub confirm_new_password: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct KycSubmitRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub dob: Option<String>,
    pub gov_id: Option<String>,
    pub data_authorization: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactRequestBody {
    #[schema(example = "bob1")]
    pub omni_tag: String,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: AccountId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub omni_tag: Option<String>,
    pub kyc_status: KycStatus,
}

impl UserSummary {
    pub fn of(user: &User) -> Self {
        Self {
            id: user.account_id.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            omni_tag: None,
            kyc_status: user.kyc_status,
        }
    }

    pub fn with_omni_tag(user: &User) -> Self {
        Self {
            omni_tag: Some(user.omni_tag.clone()),
            ..Self::of(user)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub browser: String,
    pub ip_address: String,
    pub device_info: String,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            browser: s.browser.clone(),
            ip_address: s.ip_address.clone(),
            device_info: s.device_info.clone(),
        }
    }
}

/// Register / login body; tokens travel as cookies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub user: UserSummary,
    pub session: SessionSummary,
}

/// Refresh / check-session body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserEnvelope {
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub account_id: AccountId,
    pub email: String,
    pub omni_tag: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub postal_code: String,
    pub currency: Currency,
    pub kyc_status: KycStatus,
    pub data_authorization: bool,
    pub status: AccountStatus,
}

impl From<&User> for ProfileView {
    fn from(u: &User) -> Self {
        Self {
            account_id: u.account_id.clone(),
            email: u.email.clone(),
            omni_tag: u.omni_tag.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            phone: u.phone.clone(),
            address: u.address.clone(),
            city: u.city.clone(),
            state: u.state.clone(),
            country: u.country.clone(),
            postal_code: u.postal_code.clone(),
            currency: u.currency,
            kyc_status: u.kyc_status,
            data_authorization: u.data_authorization,
            status: u.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProfileUpdated {
    pub message: String,
    pub user: ProfileView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeletionScheduled {
    pub message: String,
    pub scheduled_deletion: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChanged {
    pub message: String,
    pub email: String,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KycDecision {
    pub message: String,
    pub account_id: AccountId,
    pub kyc_status: KycStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KycStatusView {
    pub account_id: AccountId,
    pub kyc_status: KycStatus,
    pub omni_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub id: String,
    pub browser: String,
    pub country: String,
    pub last_login_at: DateTime<Utc>,
    pub ip_address: String,
    pub device_info: String,
    pub is_current_device: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    pub active_sessions: Vec<ActiveSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContactCreated {
    pub message: String,
    pub contact_id: String,
    pub omni_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ContactList {
    pub contacts: Vec<ContactInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RequestList {
    pub requests: Vec<ContactRequestView>,
    pub count: usize,
}

/// Omni-tag search hit. Names and email are only filled for accepted contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OmniTagLookup {
    pub account_id: AccountId,
    pub omni_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_contact: Option<bool>,
}

// ============================================================================
// Omni-tags
// ============================================================================

/// 1 to 5 ASCII letters or digits
pub fn validate_omni_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("Omni tag cannot be empty".to_string());
    }
    let len = tag.chars().count();
    if len > OMNI_TAG_MAX_LEN {
        return Err(format!(
            "Omni tag must be {} characters or less, got {} characters",
            OMNI_TAG_MAX_LEN, len
        ));
    }
    if !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(
            "Omni tag must only contain letters (a-z, A-Z) and numbers (0-9)".to_string(),
        );
    }
    Ok(())
}
