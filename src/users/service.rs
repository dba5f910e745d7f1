//! Users Service
//!
//! Accounts, sessions and token rotation, profile and KYC. Contacts live in
//! [`super::contacts`] as a second `impl` block over the same service.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::error::{UserError, UserResult};
use super::model::*;
use super::password::{PasswordThrottle, hash_password, verify_password};
use super::sessions::parse_browser;
use super::store::UserStore;
use crate::config::AuthConfig;
use crate::core_types::{Currency, KycStatus};
use crate::events::payloads::{AccountCreated, AccountDeletionRequested};
use crate::events::{DomainEvent, EventProducer};
use crate::gateway::{Claims, TokenKeys, TokenKind};
use crate::storage::Store;

/// Shown for every session until a geo-IP lookup exists
const DEFAULT_COUNTRY: &str = "United States";

/// Freshly minted token pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of register / login
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub response: AuthResponse,
    pub tokens: IssuedTokens,
}

#[derive(Debug, Clone)]
pub struct Refreshed {
    pub user: UserSummary,
    pub tokens: IssuedTokens,
}

/// `access_token` is set when the session was revived from the refresh token
#[derive(Debug, Clone)]
pub struct SessionCheck {
    pub user: UserSummary,
    pub access_token: Option<String>,
}

pub struct UserService {
    pub(super) store: UserStore,
    keys: Arc<TokenKeys>,
    producer: EventProducer,
    config: AuthConfig,
    throttle: PasswordThrottle,
}

impl UserService {
    pub fn new(store: Store, keys: Arc<TokenKeys>, producer: EventProducer, config: AuthConfig) -> Self {
        let throttle = PasswordThrottle::new(
            config.change_password_max_attempts,
            std::time::Duration::from_secs(config.change_password_window_secs),
        );
        Self {
            store: UserStore::new(store),
            keys,
            producer,
            config,
            throttle,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<TokenKeys> {
        &self.keys
    }

    pub(super) async fn publish<E: DomainEvent>(&self, key: &str, event: E) {
        if let Err(e) = self.producer.emit(key, &event).await {
            warn!(topic = E::TOPIC, key, error = %e, "Failed to publish event");
        }
    }

    fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.access_ttl_secs)
    }

    fn refresh_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.refresh_ttl_secs)
    }

    fn refresh_ttl_std(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.refresh_ttl_secs.max(1) as u64)
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    fn sign(&self, user: &User, kind: TokenKind, now: DateTime<Utc>) -> UserResult<(String, Claims)> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl(),
            TokenKind::Refresh => self.refresh_ttl(),
        };
        self.keys
            .sign(&user.email, &user.account_id, kind, now, ttl)
            .map_err(|e| UserError::Internal(format!("Failed to sign token: {}", e)))
    }

    fn refresh_record(
        &self,
        claims: &Claims,
        session_id: &str,
        device_info: &str,
        now: DateTime<Utc>,
    ) -> RefreshTokenRecord {
        RefreshTokenRecord {
            token_id: claims.jti.clone(),
            account_id: claims.account_id.clone(),
            user_email: claims.sub.clone(),
            session_id: session_id.to_string(),
            device_info: device_info.to_string(),
            created_at: now,
            expires_at: now + self.refresh_ttl(),
        }
    }

    /// New session bound to a new token pair
    async fn open_session(&self, user: &User, client: &ClientInfo) -> UserResult<(Session, IssuedTokens)> {
        let now = Utc::now();
        let (access_token, _) = self.sign(user, TokenKind::Access, now)?;
        let (refresh_token, refresh_claims) = self.sign(user, TokenKind::Refresh, now)?;

        let session = Session {
            id: Uuid::new_v4().to_string(),
            account_id: user.account_id.clone(),
            user_email: user.email.clone(),
            device_info: client.user_agent.clone(),
            ip_address: client.ip_address.clone(),
            country: DEFAULT_COUNTRY.to_string(),
            browser: parse_browser(&client.user_agent).to_string(),
            refresh_token_id: refresh_claims.jti.clone(),
            last_login_at: now,
            created_at: now,
        };
        let record = self.refresh_record(&refresh_claims, &session.id, &client.user_agent, now);
        self.store
            .insert_session(&session, &record, self.refresh_ttl_std())
            .await?;
        Ok((
            session,
            IssuedTokens {
                access_token,
                refresh_token,
            },
        ))
    }

    /// Verify a refresh token and load its server-side record
    async fn live_refresh(&self, token: &str) -> UserResult<(Claims, RefreshTokenRecord)> {
        let invalid = || UserError::unauthorized("Invalid refresh token");
        let claims = self
            .keys
            .verify(token, TokenKind::Refresh)
            .map_err(|_| invalid())?;
        let record = self
            .store
            .find_refresh_token(&claims.jti)
            .await?
            .ok_or_else(invalid)?;
        Ok((claims, record))
    }

    /// Load the user behind a verified access token
    pub async fn authenticate(&self, access_token: &str) -> UserResult<User> {
        let claims = self
            .keys
            .verify(access_token, TokenKind::Access)
            .map_err(|_| UserError::unauthorized("Invalid or expired token"))?;
        let user = self
            .store
            .find_user(&claims.account_id)
            .await?
            .ok_or_else(|| UserError::unauthorized("User not found"))?;
        if !user.is_active() {
            return Err(UserError::unauthorized("Account is not active"));
        }
        Ok(user)
    }

    // ========================================================================
    // Registration and sign-in
    // ========================================================================

    pub async fn register(&self, req: &RegisterRequest, client: &ClientInfo) -> UserResult<SignedIn> {
        req.validate()?;
        validate_omni_tag(&req.omni_tag).map_err(UserError::InvalidOmniTag)?;
        let currency = match req.currency.as_deref().map(str::trim) {
            None | Some("") => Currency::Usd,
            Some(c) => c.parse::<Currency>().map_err(UserError::Validation)?,
        };

        let now = Utc::now();
        let user = User {
            account_id: Uuid::new_v4().to_string(),
            email: normalize_email(&req.email),
            omni_tag: req.omni_tag.clone(),
            password_hash: hash_password(&req.password)?,
            first_name: req.first_name.trim().to_string(),
            last_name: req.last_name.trim().to_string(),
            phone: req.phone.clone(),
            address: req.address.clone(),
            city: req.city.clone(),
            state: req.state.clone(),
            country: req.country.clone(),
            postal_code: req.postal_code.clone(),
            dob: req.dob.clone(),
            gov_id: req.gov_id.clone(),
            currency,
            kyc_status: KycStatus::Pending,
            data_authorization: req.data_authorization,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deletion_requested_at: None,
            scheduled_deletion: None,
        };
        self.store.create_user(&user).await?;
        info!(account_id = %user.account_id, omni_tag = %user.omni_tag, "User registered");

        self.publish(
            &user.account_id,
            AccountCreated {
                account_id: user.account_id.clone(),
                currency: user.currency,
                kyc_status: user.kyc_status,
            },
        )
        .await;

        let (session, tokens) = self.open_session(&user, client).await?;
        Ok(SignedIn {
            response: AuthResponse {
                user: UserSummary::with_omni_tag(&user),
                session: SessionSummary::from(&session),
            },
            tokens,
        })
    }

    pub async fn login(&self, req: &LoginRequest, client: &ClientInfo) -> UserResult<SignedIn> {
        req.validate()?;
        let user = self
            .store
            .find_by_email(&normalize_email(&req.email))
            .await?
            .ok_or(UserError::UserNotFound)?;
        if !verify_password(&req.password, &user.password_hash) {
            warn!(account_id = %user.account_id, "Login with invalid password");
            return Err(UserError::InvalidPassword);
        }
        if !user.is_active() {
            return Err(UserError::unauthorized("Account is not active"));
        }

        let (session, tokens) = self.open_session(&user, client).await?;
        info!(account_id = %user.account_id, session_id = %session.id, "User logged in");
        Ok(SignedIn {
            response: AuthResponse {
                user: UserSummary::of(&user),
                session: SessionSummary::from(&session),
            },
            tokens,
        })
    }

    /// Rotate a refresh token. The presented token is consumed; presenting it
    /// again afterwards is rejected.
    pub async fn refresh(&self, refresh_token: Option<&str>) -> UserResult<Refreshed> {
        let token = refresh_token.ok_or_else(|| UserError::unauthorized("Refresh token not found"))?;
        let (_, record) = self.live_refresh(token).await?;
        if !self.store.take_refresh_token(&record.token_id).await? {
            return Err(UserError::unauthorized("Invalid refresh token"));
        }

        let user = self.store.user(&record.account_id).await?;
        if !user.is_active() {
            return Err(UserError::unauthorized("Account is not active"));
        }

        let now = Utc::now();
        let (access_token, _) = self.sign(&user, TokenKind::Access, now)?;
        let (new_refresh, claims) = self.sign(&user, TokenKind::Refresh, now)?;
        let next = self.refresh_record(&claims, &record.session_id, &record.device_info, now);
        self.store
            .put_refresh_token(&next, self.refresh_ttl_std())
            .await?;

        let rebound = self
            .store
            .update_session(&record.session_id, |s| {
                s.last_login_at = now;
                s.refresh_token_id = next.token_id.clone();
                Ok(())
            })
            .await;
        if let Err(e) = rebound {
            // session was logged out while we rotated
            if let Err(drop_err) = self.store.take_refresh_token(&next.token_id).await {
                warn!(session_id = %record.session_id, error = %drop_err, "Failed to discard rotated refresh token");
            }
            return Err(match e {
                UserError::SessionNotFound => UserError::unauthorized("Invalid refresh token"),
                other => other,
            });
        }

        info!(account_id = %user.account_id, session_id = %record.session_id, "Refresh token rotated");
        Ok(Refreshed {
            user: UserSummary::of(&user),
            tokens: IssuedTokens {
                access_token,
                refresh_token: new_refresh,
            },
        })
    }

    /// Access token first; otherwise revive from the refresh token without
    /// rotating it.
    pub async fn check_session(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> UserResult<SessionCheck> {
        if let Some(token) = access_token {
            if let Ok(user) = self.authenticate(token).await {
                return Ok(SessionCheck {
                    user: UserSummary::of(&user),
                    access_token: None,
                });
            }
        }

        let no_session = || UserError::unauthorized("No valid session found");
        let token = refresh_token.ok_or_else(no_session)?;
        let (_, record) = self.live_refresh(token).await.map_err(|_| no_session())?;
        let user = self
            .store
            .find_user(&record.account_id)
            .await?
            .filter(User::is_active)
            .ok_or_else(no_session)?;

        let now = Utc::now();
        let (access, _) = self.sign(&user, TokenKind::Access, now)?;
        self.store
            .update_session(&record.session_id, |s| {
                s.last_login_at = now;
                Ok(())
            })
            .await
            .map_err(|e| match e {
                UserError::SessionNotFound => no_session(),
                other => other,
            })?;
        Ok(SessionCheck {
            user: UserSummary::of(&user),
            access_token: Some(access),
        })
    }

    /// Drop the session behind a refresh token. Unknown or invalid tokens are
    /// not an error; the cookies are cleared either way.
    pub async fn logout(&self, refresh_token: Option<&str>) -> UserResult<()> {
        let Some(token) = refresh_token else {
            return Ok(());
        };
        let Ok((_, record)) = self.live_refresh(token).await else {
            return Ok(());
        };
        match self.store.find_session(&record.session_id).await? {
            Some(session) => self.store.delete_session(&session).await?,
            None => {
                self.store.take_refresh_token(&record.token_id).await?;
            }
        }
        info!(account_id = %record.account_id, session_id = %record.session_id, "User logged out");
        Ok(())
    }

    // ========================================================================
    // Profile
    // ========================================================================

    pub async fn profile(&self, caller: &str, account_id: &str) -> UserResult<ProfileView> {
        ensure_self(caller, account_id, "Unauthorized: You can only view your own profile")?;
        let user = self.store.user(account_id).await?;
        Ok(ProfileView::from(&user))
    }

    pub async fn update_profile(
        &self,
        caller: &str,
        account_id: &str,
        req: &UpdateProfileRequest,
    ) -> UserResult<ProfileUpdated> {
        ensure_self(caller, account_id, "Unauthorized: You can only update your own profile")?;
        let now = Utc::now();
        let user = self
            .store
            .update_user(account_id, |u| {
                apply(&mut u.first_name, &req.first_name);
                apply(&mut u.last_name, &req.last_name);
                apply(&mut u.phone, &req.phone);
                apply(&mut u.address, &req.address);
                apply(&mut u.city, &req.city);
                apply(&mut u.state, &req.state);
                apply(&mut u.country, &req.country);
                apply(&mut u.postal_code, &req.postal_code);
                if let Some(v) = req.data_authorization {
                    u.data_authorization = v;
                }
                u.updated_at = now;
                Ok(())
            })
            .await?;
        Ok(ProfileUpdated {
            message: "Profile updated successfully".to_string(),
            user: ProfileView::from(&user),
        })
    }

    /// Schedule deletion after the grace period and revoke every session
    pub async fn request_deletion(&self, caller: &str, account_id: &str) -> UserResult<DeletionScheduled> {
        ensure_self(caller, account_id, "Unauthorized: You can only delete your own account")?;
        let now = Utc::now();
        let scheduled = now + chrono::Duration::days(self.config.deletion_grace_days);
        let user = self
            .store
            .update_user(account_id, |u| {
                if !u.is_active() {
                    return Err(UserError::AccountNotActive);
                }
                u.status = AccountStatus::PendingDeletion;
                u.deletion_requested_at = Some(now);
                u.scheduled_deletion = Some(scheduled);
                u.updated_at = now;
                Ok(())
            })
            .await?;

        let revoked = self.store.delete_sessions_except(account_id, None).await?;
        info!(account_id, revoked, %scheduled, "Account deletion requested");
        self.publish(
            account_id,
            AccountDeletionRequested {
                account_id: user.account_id.clone(),
                email: user.email.clone(),
                requested_at: now,
                scheduled_deletion: scheduled,
            },
        )
        .await;

        Ok(DeletionScheduled {
            message: "Account scheduled for deletion".to_string(),
            scheduled_deletion: scheduled,
        })
    }

    pub async fn change_password(&self, caller: &str, req: &ChangePasswordRequest) -> UserResult<PasswordChanged> {
        if req.new_password != req.confirm_new_password {
            return Err(UserError::PasswordMismatch);
        }
        if req.new_password.is_empty() {
            return Err(UserError::Validation("New password is required".to_string()));
        }
        if !self.throttle.try_acquire(caller) {
            warn!(account_id = caller, "Change-password attempts throttled");
            return Err(UserError::PasswordThrottled);
        }

        let email = normalize_email(&req.email);
        let user = self
            .store
            .find_by_email(&email)
            .await?
            .ok_or(UserError::UserNotFound)?;
        if user.account_id != req.account_id {
            return Err(UserError::unauthorized("Invalid account ID"));
        }
        ensure_self(caller, &user.account_id, "Unauthorized: You can only change your own password")?;
        if !verify_password(&req.current_password, &user.password_hash) {
            return Err(UserError::WrongCurrentPassword);
        }
        if req.new_password == req.current_password {
            return Err(UserError::PasswordUnchanged);
        }

        let hash = hash_password(&req.new_password)?;
        let now = Utc::now();
        self.store
            .update_user(&user.account_id, |u| {
                u.password_hash = hash.clone();
                u.updated_at = now;
                Ok(())
            })
            .await?;
        let revoked = self.store.delete_sessions_except(&user.account_id, None).await?;
        info!(account_id = %user.account_id, revoked, "Password changed");

        Ok(PasswordChanged {
            message: "Password changed successfully".to_string(),
            email: user.email,
            account_id: user.account_id,
        })
    }

    // ========================================================================
    // KYC
    // ========================================================================

    pub async fn kyc_status(&self, caller: &str, account_id: &str) -> UserResult<KycStatusView> {
        ensure_self(caller, account_id, "Unauthorized: You can only view your own KYC status")?;
        let user = self.store.user(account_id).await?;
        Ok(KycStatusView {
            account_id: user.account_id,
            kyc_status: user.kyc_status,
            omni_tag: user.omni_tag,
        })
    }

    /// Store the submitted identity fields and put the account back in review
    pub async fn submit_kyc(
        &self,
        caller: &str,
        account_id: &str,
        req: &KycSubmitRequest,
    ) -> UserResult<KycDecision> {
        ensure_self(caller, account_id, "Unauthorized: You can only submit your own KYC")?;
        let now = Utc::now();
        let user = self
            .store
            .update_user(account_id, |u| {
                if u.kyc_status == KycStatus::Approved {
                    return Err(UserError::KycAlreadyApproved);
                }
                apply(&mut u.first_name, &req.first_name);
                apply(&mut u.last_name, &req.last_name);
                apply(&mut u.phone, &req.phone);
                apply(&mut u.address, &req.address);
                apply(&mut u.city, &req.city);
                apply(&mut u.state, &req.state);
                apply(&mut u.country, &req.country);
                apply(&mut u.postal_code, &req.postal_code);
                apply(&mut u.dob, &req.dob);
                apply(&mut u.gov_id, &req.gov_id);
                if let Some(v) = req.data_authorization {
                    u.data_authorization = v;
                }
                u.kyc_status = KycStatus::Pending;
                u.updated_at = now;
                Ok(())
            })
            .await?;
        Ok(KycDecision {
            message: "KYC submitted successfully".to_string(),
            account_id: user.account_id,
            kyc_status: user.kyc_status,
        })
    }

    /// Approval re-announces the account so its wallet gets activated
    pub async fn approve_kyc(&self, account_id: &str) -> UserResult<KycDecision> {
        let now = Utc::now();
        let user = self
            .store
            .update_user(account_id, |u| {
                if u.kyc_status == KycStatus::Approved {
                    return Err(UserError::KycAlreadyApproved);
                }
                u.kyc_status = KycStatus::Approved;
                u.updated_at = now;
                Ok(())
            })
            .await?;
        info!(account_id, "KYC approved");

        self.publish(
            account_id,
            AccountCreated {
                account_id: user.account_id.clone(),
                currency: user.currency,
                kyc_status: user.kyc_status,
            },
        )
        .await;

        Ok(KycDecision {
            message: "KYC approved successfully".to_string(),
            account_id: user.account_id,
            kyc_status: user.kyc_status,
        })
    }

    pub async fn reject_kyc(&self, account_id: &str) -> UserResult<KycDecision> {
        let now = Utc::now();
        let user = self
            .store
            .update_user(account_id, |u| {
                u.kyc_status = KycStatus::Rejected;
                u.updated_at = now;
                Ok(())
            })
            .await?;
        info!(account_id, "KYC rejected");
        Ok(KycDecision {
            message: "KYC rejected".to_string(),
            account_id: user.account_id,
            kyc_status: user.kyc_status,
        })
    }

    // ========================================================================
    // Omni-tag lookup
    // ========================================================================

    /// Active user holding `omni_tag` (exact, case-sensitive match)
    pub async fn find_by_omni_tag(&self, omni_tag: &str) -> UserResult<Option<User>> {
        Ok(self
            .store
            .find_by_omni_tag(omni_tag)
            .await?
            .filter(User::is_active))
    }

    /// Search on behalf of `caller`; names and email only for accepted contacts
    pub async fn search_omni_tag(&self, caller: &str, omni_tag: &str) -> UserResult<OmniTagLookup> {
        validate_omni_tag(omni_tag).map_err(UserError::InvalidOmniTag)?;
        let user = self
            .find_by_omni_tag(omni_tag)
            .await?
            .ok_or(UserError::UserNotFound)?;

        let accepted = self
            .store
            .contact_between(caller, &user.account_id)
            .await?
            .map(|c| c.status == ContactStatus::Accepted)
            .unwrap_or(false);

        let mut hit = OmniTagLookup {
            account_id: user.account_id.clone(),
            omni_tag: user.omni_tag.clone(),
            first_name: None,
            last_name: None,
            email: None,
            is_contact: None,
        };
        if accepted && caller != user.account_id {
            hit.first_name = Some(user.first_name);
            hit.last_name = Some(user.last_name);
            hit.email = Some(user.email);
            hit.is_contact = Some(true);
        }
        Ok(hit)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Session id behind a refresh token, if the token is still live
    pub async fn current_session_id(&self, refresh_token: Option<&str>) -> Option<String> {
        let token = refresh_token?;
        self.live_refresh(token)
            .await
            .ok()
            .map(|(_, record)| record.session_id)
    }

    /// Active sessions, newest first. Sessions whose refresh token has
    /// expired or been revoked are removed on the way.
    pub async fn list_sessions(&self, caller: &str, refresh_token: Option<&str>) -> UserResult<SessionList> {
        let current = self.current_session_id(refresh_token).await;
        let mut active = Vec::new();
        for session in self.store.sessions_for_account(caller).await? {
            if self
                .store
                .find_refresh_token(&session.refresh_token_id)
                .await?
                .is_none()
            {
                self.store.delete_session(&session).await?;
                continue;
            }
            active.push(ActiveSession {
                is_current_device: current.as_deref() == Some(session.id.as_str()),
                id: session.id,
                browser: session.browser,
                country: session.country,
                last_login_at: session.last_login_at,
                ip_address: session.ip_address,
                device_info: session.device_info,
            });
        }
        Ok(SessionList {
            active_sessions: active,
        })
    }

    /// Revoke every session except the one the refresh token belongs to
    pub async fn logout_others(&self, caller: &str, refresh_token: Option<&str>) -> UserResult<usize> {
        let current = self
            .current_session_id(refresh_token)
            .await
            .ok_or_else(|| UserError::unauthorized("No active session found"))?;
        let removed = self
            .store
            .delete_sessions_except(caller, Some(&current))
            .await?;
        info!(account_id = caller, removed, "Logged out other devices");
        Ok(removed)
    }

    pub async fn logout_session(&self, caller: &str, session_id: &str) -> UserResult<()> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .filter(|s| s.account_id == caller)
            .ok_or(UserError::SessionNotFound)?;
        self.store.delete_session(&session).await?;
        info!(account_id = caller, session_id, "Session logged out");
        Ok(())
    }
}

/// Emails are case-sensitive keys; only surrounding whitespace is dropped
fn normalize_email(email: &str) -> String {
    email.trim().to_string()
}

fn apply(field: &mut String, value: &Option<String>) {
    if let Some(v) = value {
        *field = v.trim().to_string();
    }
}

pub(super) fn ensure_self(caller: &str, account_id: &str, message: &str) -> UserResult<()> {
    if caller != account_id {
        return Err(UserError::forbidden(message));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::events::topics;
    use crate::storage::Family;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emails_are_case_sensitive() {
        let (svc, _broker) = service();
        let upper = registered(&svc, "Bob@x.io", "b1").await;
        assert_eq!(upper.response.user.email, "Bob@x.io");
        let lower = registered(&svc, "bob@x.io", "b2").await;
        assert_ne!(lower.response.user.id, upper.response.user.id);

        let err = svc
            .register(&register_req("Bob@x.io", "b3"), &client("curl/8.0"))
            .await
            .unwrap_err();
        assert_eq!(err, UserError::EmailTaken);

        let login = svc
            .login(
                &LoginRequest {
                    email: "Bob@x.io".into(),
                    password: "pw-123456".into(),
                },
                &client("curl/8.0"),
            )
            .await
            .unwrap();
        assert_eq!(login.response.user.id, upper.response.user.id);
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let (svc, broker) = service();
        let signed = registered(&svc, "ada@example.com", "ada1").await;
        let user = &signed.response.user;
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.omni_tag.as_deref(), Some("ada1"));
        assert_eq!(user.kyc_status, KycStatus::Pending);
        assert_eq!(signed.response.session.browser, "Firefox");
        assert_eq!(signed.response.session.ip_address, "203.0.113.7");

        let login = svc
            .login(
                &LoginRequest {
                    email: "ada@example.com".into(),
                    password: "pw-123456".into(),
                },
                &client("curl/8.0"),
            )
            .await
            .unwrap();
        assert_eq!(login.response.user.id, user.id);
        assert!(login.response.user.omni_tag.is_none());
        assert_ne!(login.response.session.id, signed.response.session.id);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let created = broker.records(topics::ACCOUNT_CREATED);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].key, user.id);
        let event: AccountCreated = created[0].decode().unwrap();
        assert_eq!(event.kyc_status, KycStatus::Pending);
    }

    #[tokio::test]
    async fn test_register_conflicts_and_validation() {
        let (svc, _) = service();
        registered(&svc, "a@x.io", "A1").await;
        let c = client("curl");

        let err = svc.register(&register_req("A@x.io", "B1"), &c).await.unwrap_err();
        assert_eq!(err, UserError::EmailTaken);
        let err = svc.register(&register_req("b@x.io", "A1"), &c).await.unwrap_err();
        assert_eq!(err, UserError::OmniTagTaken);
        // omni-tags are case-sensitive
        svc.register(&register_req("b@x.io", "a1"), &c).await.unwrap();

        let err = svc.register(&register_req("c@x.io", "toolong"), &c).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().starts_with("Invalid Omni Tag: "));

        let err = svc.register(&register_req("nope", "C1"), &c).await.unwrap_err();
        assert_eq!(err, UserError::Validation("Invalid email address".into()));

        let mut req = register_req("d@x.io", "D1");
        req.currency = Some("XYZ".into());
        assert_eq!(svc.register(&req, &c).await.unwrap_err().http_status(), 400);
    }

    #[tokio::test]
    async fn test_login_failures() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let c = client("curl");
        let bad = LoginRequest {
            email: "a@x.io".into(),
            password: "wrong".into(),
        };
        assert_eq!(svc.login(&bad, &c).await.unwrap_err(), UserError::InvalidPassword);
        let missing = LoginRequest {
            email: "zz@x.io".into(),
            password: "x".into(),
        };
        assert_eq!(svc.login(&missing, &c).await.unwrap_err(), UserError::UserNotFound);

        let id = signed.response.user.id.clone();
        svc.request_deletion(&id, &id).await.unwrap();
        let good = LoginRequest {
            email: "a@x.io".into(),
            password: "pw-123456".into(),
        };
        assert_eq!(svc.login(&good, &c).await.unwrap_err().http_status(), 401);
    }

    #[tokio::test]
    async fn test_refresh_rotation_rejects_reuse() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let old = signed.tokens.refresh_token.clone();

        let rotated = svc.refresh(Some(&old)).await.unwrap();
        assert_ne!(rotated.tokens.refresh_token, old);
        assert_eq!(rotated.user.id, signed.response.user.id);

        let err = svc.refresh(Some(&old)).await.unwrap_err();
        assert_eq!(err, UserError::unauthorized("Invalid refresh token"));
        let err = svc.refresh(None).await.unwrap_err();
        assert_eq!(err, UserError::unauthorized("Refresh token not found"));

        // the session now points at the new token
        let id = &signed.response.user.id;
        let sessions = svc
            .list_sessions(id, Some(&rotated.tokens.refresh_token))
            .await
            .unwrap();
        assert_eq!(sessions.active_sessions.len(), 1);
        assert!(sessions.active_sessions[0].is_current_device);
        assert_eq!(sessions.active_sessions[0].id, signed.response.session.id);

        // and the new token keeps rotating
        svc.refresh(Some(&rotated.tokens.refresh_token)).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_after_session_removed_mid_rotation() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        // the session record goes away while its refresh token is still live
        svc.store
            .raw()
            .delete(Family::Sessions, &signed.response.session.id)
            .await
            .unwrap();

        let err = svc.refresh(Some(&signed.tokens.refresh_token)).await.unwrap_err();
        assert_eq!(err, UserError::unauthorized("Invalid refresh token"));
        let err = svc.refresh(Some(&signed.tokens.refresh_token)).await.unwrap_err();
        assert_eq!(err, UserError::unauthorized("Invalid refresh token"));
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_token() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        assert!(svc.refresh(Some(&signed.tokens.access_token)).await.is_err());
    }

    #[tokio::test]
    async fn test_check_session() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;

        let check = svc
            .check_session(Some(&signed.tokens.access_token), None)
            .await
            .unwrap();
        assert!(check.access_token.is_none());
        assert_eq!(check.user.email, "a@x.io");

        let check = svc
            .check_session(Some("garbage"), Some(&signed.tokens.refresh_token))
            .await
            .unwrap();
        let minted = check.access_token.unwrap();
        assert!(svc.authenticate(&minted).await.is_ok());

        // no rotation happened
        svc.refresh(Some(&signed.tokens.refresh_token)).await.unwrap();

        let err = svc.check_session(None, None).await.unwrap_err();
        assert_eq!(err, UserError::unauthorized("No valid session found"));
    }

    #[tokio::test]
    async fn test_logout_drops_session_and_token() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        svc.logout(Some(&signed.tokens.refresh_token)).await.unwrap();
        assert!(svc.refresh(Some(&signed.tokens.refresh_token)).await.is_err());
        let id = &signed.response.user.id;
        assert!(svc.list_sessions(id, None).await.unwrap().active_sessions.is_empty());
        // idempotent
        svc.logout(Some(&signed.tokens.refresh_token)).await.unwrap();
        svc.logout(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_management() {
        let (svc, _) = service();
        let first = registered(&svc, "a@x.io", "A1").await;
        let id = first.response.user.id.clone();
        let login = || LoginRequest {
            email: "a@x.io".into(),
            password: "pw-123456".into(),
        };
        let second = svc.login(&login(), &client("Chrome/120.0")).await.unwrap();
        let third = svc.login(&login(), &client("curl/8.0")).await.unwrap();

        let list = svc.list_sessions(&id, Some(&second.tokens.refresh_token)).await.unwrap();
        assert_eq!(list.active_sessions.len(), 3);
        assert_eq!(
            list.active_sessions.iter().filter(|s| s.is_current_device).count(),
            1
        );

        svc.logout_session(&id, &third.response.session.id).await.unwrap();
        assert_eq!(
            svc.logout_session(&id, &third.response.session.id).await.unwrap_err(),
            UserError::SessionNotFound
        );
        assert_eq!(
            svc.logout_session("someone-else", &second.response.session.id)
                .await
                .unwrap_err(),
            UserError::SessionNotFound
        );

        let removed = svc
            .logout_others(&id, Some(&second.tokens.refresh_token))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(svc.refresh(Some(&first.tokens.refresh_token)).await.is_err());
        let list = svc.list_sessions(&id, None).await.unwrap();
        assert_eq!(list.active_sessions.len(), 1);
        assert_eq!(list.active_sessions[0].id, second.response.session.id);
        assert_eq!(list.active_sessions[0].browser, "Chrome");
    }

    #[tokio::test]
    async fn test_change_password() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let id = signed.response.user.id.clone();
        let req = |current: &str, new: &str, confirm: &str| ChangePasswordRequest {
            account_id: id.clone(),
            email: "a@x.io".into(),
            current_password: current.into(),
            new_password: new.into(),
            confirm_new_password: confirm.into(),
        };

        assert_eq!(
            svc.change_password(&id, &req("pw-123456", "a", "b")).await.unwrap_err(),
            UserError::PasswordMismatch
        );
        assert_eq!(
            svc.change_password(&id, &req("wrong", "n", "n")).await.unwrap_err(),
            UserError::WrongCurrentPassword
        );
        assert_eq!(
            svc.change_password(&id, &req("pw-123456", "pw-123456", "pw-123456"))
                .await
                .unwrap_err(),
            UserError::PasswordUnchanged
        );

        let done = svc
            .change_password(&id, &req("pw-123456", "new-pass", "new-pass"))
            .await
            .unwrap();
        assert_eq!(done.message, "Password changed successfully");
        // every session is revoked
        assert!(svc.refresh(Some(&signed.tokens.refresh_token)).await.is_err());

        let login = LoginRequest {
            email: "a@x.io".into(),
            password: "new-pass".into(),
        };
        svc.login(&login, &client("curl")).await.unwrap();

        let mut other = req("new-pass", "x", "x");
        other.account_id = "not-mine".into();
        assert_eq!(
            svc.change_password(&id, &other).await.unwrap_err(),
            UserError::unauthorized("Invalid account ID")
        );
    }

    #[tokio::test]
    async fn test_change_password_is_throttled() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let id = signed.response.user.id.clone();
        let wrong = ChangePasswordRequest {
            account_id: id.clone(),
            email: "a@x.io".into(),
            current_password: "wrong".into(),
            new_password: "n".into(),
            confirm_new_password: "n".into(),
        };
        for _ in 0..5 {
            assert_eq!(
                svc.change_password(&id, &wrong).await.unwrap_err(),
                UserError::WrongCurrentPassword
            );
        }
        assert_eq!(
            svc.change_password(&id, &wrong).await.unwrap_err(),
            UserError::PasswordThrottled
        );
    }

    #[tokio::test]
    async fn test_profile_and_deletion() {
        let (svc, broker) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let id = signed.response.user.id.clone();

        assert_eq!(svc.profile("other", &id).await.unwrap_err().http_status(), 403);
        let updated = svc
            .update_profile(
                &id,
                &id,
                &UpdateProfileRequest {
                    city: Some("Kingston".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.user.city, "Kingston");
        assert_eq!(updated.user.first_name, "Ada");

        let scheduled = svc.request_deletion(&id, &id).await.unwrap();
        assert_eq!(scheduled.message, "Account scheduled for deletion");
        let days = (scheduled.scheduled_deletion - Utc::now()).num_days();
        assert!((29..=30).contains(&days));
        assert_eq!(
            svc.request_deletion(&id, &id).await.unwrap_err(),
            UserError::AccountNotActive
        );
        assert_eq!(svc.profile(&id, &id).await.unwrap().status, AccountStatus::PendingDeletion);
        assert!(svc.authenticate(&signed.tokens.access_token).await.is_err());
        assert!(svc.find_by_omni_tag("A1").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let events = broker.records(topics::ACCOUNT_DELETION_REQUESTED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, id);
    }

    #[tokio::test]
    async fn test_kyc_lifecycle() {
        let (svc, broker) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let id = signed.response.user.id.clone();

        let status = svc.kyc_status(&id, &id).await.unwrap();
        assert_eq!(status.kyc_status, KycStatus::Pending);
        assert_eq!(status.omni_tag, "A1");

        let submitted = svc
            .submit_kyc(
                &id,
                &id,
                &KycSubmitRequest {
                    gov_id: Some("X123".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(submitted.kyc_status, KycStatus::Pending);

        let approved = svc.approve_kyc(&id).await.unwrap();
        assert_eq!(approved.message, "KYC approved successfully");
        assert_eq!(approved.kyc_status, KycStatus::Approved);
        assert_eq!(svc.approve_kyc(&id).await.unwrap_err(), UserError::KycAlreadyApproved);
        assert_eq!(svc.approve_kyc("missing").await.unwrap_err(), UserError::UserNotFound);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let created = broker.records(topics::ACCOUNT_CREATED);
        assert_eq!(created.len(), 2);
        let last: AccountCreated = created[1].decode().unwrap();
        assert_eq!(last.kyc_status, KycStatus::Approved);

        let rejected = svc.reject_kyc(&id).await.unwrap();
        assert_eq!(rejected.kyc_status, KycStatus::Rejected);
    }

    #[tokio::test]
    async fn test_find_by_omni_tag() {
        let (svc, _) = service();
        let signed = registered(&svc, "a@x.io", "A1").await;
        let found = svc.find_by_omni_tag("A1").await.unwrap().unwrap();
        assert_eq!(found.account_id, signed.response.user.id);
        assert!(svc.find_by_omni_tag("Z9").await.unwrap().is_none());
    }
}
