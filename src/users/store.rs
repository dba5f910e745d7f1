use std::time::Duration;

use crate::storage::{Family, StorageError, StorageResult, Store, WriteBatch};

use super::error::{UserError, UserResult};
use super::model::{Contact, RefreshTokenRecord, Session, User};

fn account_set(account_id: &str) -> String {
    format!("account:{}", account_id)
}

fn email_marker(email: &str) -> String {
    format!("email:{}", email)
}

fn omni_tag_marker(tag: &str) -> String {
    format!("omnitag:{}", tag)
}

/// Order-independent key, so `a→b` and `b→a` collide
fn pair_marker(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("contact-pair:{}|{}", lo, hi)
}

/// User, session, refresh-token and contact records.
///
/// Email and omni-tag uniqueness are enforced with conditional puts on
/// marker keys that point at the owning account id.
#[derive(Clone)]
pub struct UserStore {
    store: Store,
}

impl UserStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Reserve the email and omni-tag, then write the record.
    /// On any conflict the reservations taken so far are released.
    pub async fn create_user(&self, user: &User) -> UserResult<()> {
        let email_key = email_marker(&user.email);
        if !self
            .store
            .insert(Family::Markers, &email_key, &user.account_id, None)
            .await?
        {
            return Err(UserError::EmailTaken);
        }

        let tag_key = omni_tag_marker(&user.omni_tag);
        let tag_reserved = match self
            .store
            .insert(Family::Markers, &tag_key, &user.account_id, None)
            .await
        {
            Ok(reserved) => reserved,
            Err(e) => {
                self.store.delete(Family::Markers, &email_key).await.ok();
                return Err(e.into());
            }
        };
        if !tag_reserved {
            self.store.delete(Family::Markers, &email_key).await?;
            return Err(UserError::OmniTagTaken);
        }

        if let Err(e) = self
            .store
            .put(Family::Users, &user.account_id, user, None)
            .await
        {
            self.store
                .apply(
                    WriteBatch::new()
                        .delete(Family::Markers, email_key)
                        .delete(Family::Markers, tag_key),
                )
                .await
                .ok();
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn find_user(&self, account_id: &str) -> StorageResult<Option<User>> {
        self.store.find(Family::Users, account_id).await
    }

    pub async fn user(&self, account_id: &str) -> UserResult<User> {
        self.find_user(account_id).await?.ok_or(UserError::UserNotFound)
    }

    pub async fn find_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        self.find_by_marker(&email_marker(email)).await
    }

    pub async fn find_by_omni_tag(&self, tag: &str) -> StorageResult<Option<User>> {
        self.find_by_marker(&omni_tag_marker(tag)).await
    }

    async fn find_by_marker(&self, marker: &str) -> StorageResult<Option<User>> {
        let account_id: Option<String> = self.store.find(Family::Markers, marker).await?;
        match account_id {
            Some(id) => self.find_user(&id).await,
            None => Ok(None),
        }
    }

    pub async fn update_user<F>(&self, account_id: &str, f: F) -> UserResult<User>
    where
        F: FnMut(&mut User) -> UserResult<()>,
    {
        self.store
            .update(Family::Users, account_id, f)
            .await
            .map_err(|e| match e {
                UserError::Storage(StorageError::NotFound(_)) => UserError::UserNotFound,
                other => other,
            })
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Session plus the refresh-token record bound to it
    pub async fn insert_session(
        &self,
        session: &Session,
        token: &RefreshTokenRecord,
        ttl: Duration,
    ) -> StorageResult<()> {
        let batch = WriteBatch::new()
            .put(
                Family::Sessions,
                session.id.clone(),
                serde_json::to_string(session)?,
            )
            .set_add(
                Family::Sessions,
                account_set(&session.account_id),
                session.id.clone(),
            );
        self.store.apply(batch).await?;
        self.put_refresh_token(token, ttl).await
    }

    pub async fn find_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        self.store.find(Family::Sessions, session_id).await
    }

    pub async fn sessions_for_account(&self, account_id: &str) -> StorageResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .store
            .members(Family::Sessions, &account_set(account_id), Family::Sessions)
            .await?;
        sessions.sort_by(|a, b| b.last_login_at.cmp(&a.last_login_at));
        Ok(sessions)
    }

    pub async fn update_session<F>(&self, session_id: &str, f: F) -> UserResult<Session>
    where
        F: FnMut(&mut Session) -> UserResult<()>,
    {
        self.store
            .update(Family::Sessions, session_id, f)
            .await
            .map_err(|e| match e {
                UserError::Storage(StorageError::NotFound(_)) => UserError::SessionNotFound,
                other => other,
            })
    }

    /// Remove a session and the refresh token bound to it
    pub async fn delete_session(&self, session: &Session) -> StorageResult<()> {
        self.store
            .apply(
                WriteBatch::new()
                    .delete(Family::Sessions, session.id.clone())
                    .set_remove(
                        Family::Sessions,
                        account_set(&session.account_id),
                        session.id.clone(),
                    )
                    .delete(Family::RefreshTokens, session.refresh_token_id.clone()),
            )
            .await
    }

    /// Returns how many sessions were removed
    pub async fn delete_sessions_except(
        &self,
        account_id: &str,
        keep: Option<&str>,
    ) -> StorageResult<usize> {
        let mut removed = 0;
        for session in self.sessions_for_account(account_id).await? {
            if Some(session.id.as_str()) == keep {
                continue;
            }
            self.delete_session(&session).await?;
            removed += 1;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Refresh tokens
    // ------------------------------------------------------------------------

    pub async fn put_refresh_token(
        &self,
        token: &RefreshTokenRecord,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.store
            .put(Family::RefreshTokens, &token.token_id, token, Some(ttl))
            .await
    }

    pub async fn find_refresh_token(
        &self,
        token_id: &str,
    ) -> StorageResult<Option<RefreshTokenRecord>> {
        self.store.find(Family::RefreshTokens, token_id).await
    }

    /// `true` when this call removed the record. Rotation uses it as a claim:
    /// of two concurrent refreshes with the same token only one wins.
    pub async fn take_refresh_token(&self, token_id: &str) -> StorageResult<bool> {
        self.store.delete(Family::RefreshTokens, token_id).await
    }

    // ------------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------------

    /// Conditional create on the (unordered) pair. `false` when any record
    /// already links the two accounts.
    pub async fn insert_contact(&self, contact: &Contact) -> StorageResult<bool> {
        let pair = pair_marker(&contact.requester_id, &contact.addressee_id);
        if !self
            .store
            .insert(Family::Markers, &pair, &contact.id, None)
            .await?
        {
            return Ok(false);
        }
        let batch = WriteBatch::new()
            .put(
                Family::Contacts,
                contact.id.clone(),
                serde_json::to_string(contact)?,
            )
            .set_add(
                Family::Contacts,
                account_set(&contact.requester_id),
                contact.id.clone(),
            )
            .set_add(
                Family::Contacts,
                account_set(&contact.addressee_id),
                contact.id.clone(),
            );
        self.store.apply(batch).await?;
        Ok(true)
    }

    pub async fn find_contact(&self, contact_id: &str) -> StorageResult<Option<Contact>> {
        self.store.find(Family::Contacts, contact_id).await
    }

    pub async fn contact_between(&self, a: &str, b: &str) -> StorageResult<Option<Contact>> {
        let id: Option<String> = self.store.find(Family::Markers, &pair_marker(a, b)).await?;
        match id {
            Some(id) => self.find_contact(&id).await,
            None => Ok(None),
        }
    }

    pub async fn contacts_for_account(&self, account_id: &str) -> StorageResult<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self
            .store
            .members(Family::Contacts, &account_set(account_id), Family::Contacts)
            .await?;
        contacts.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(contacts)
    }

    pub async fn update_contact<F>(&self, contact_id: &str, f: F) -> UserResult<Contact>
    where
        F: FnMut(&mut Contact) -> UserResult<()>,
    {
        self.store
            .update(Family::Contacts, contact_id, f)
            .await
            .map_err(|e| match e {
                UserError::Storage(StorageError::NotFound(_)) => UserError::ContactNotFound,
                other => other,
            })
    }

    pub async fn delete_contact(&self, contact: &Contact) -> StorageResult<()> {
        self.store
            .apply(
                WriteBatch::new()
                    .delete(Family::Contacts, contact.id.clone())
                    .set_remove(
                        Family::Contacts,
                        account_set(&contact.requester_id),
                        contact.id.clone(),
                    )
                    .set_remove(
                        Family::Contacts,
                        account_set(&contact.addressee_id),
                        contact.id.clone(),
                    )
                    .delete(
                        Family::Markers,
                        pair_marker(&contact.requester_id, &contact.addressee_id),
                    ),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, KycStatus};
    use crate::users::model::{AccountStatus, ContactStatus};
    use chrono::Utc;

    fn user(id: &str, email: &str, tag: &str) -> User {
        let now = Utc::now();
        User {
            account_id: id.into(),
            email: email.into(),
            omni_tag: tag.into(),
            password_hash: "h".into(),
            first_name: "F".into(),
            last_name: "L".into(),
            phone: String::new(),
            address: String::new(),
            city: String::new(),
            state: String::new(),
            country: String::new(),
            postal_code: String::new(),
            dob: String::new(),
            gov_id: String::new(),
            currency: Currency::Usd,
            kyc_status: KycStatus::Pending,
            data_authorization: false,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deletion_requested_at: None,
            scheduled_deletion: None,
        }
    }

    #[tokio::test]
    async fn test_create_user_enforces_uniqueness() {
        let store = UserStore::new(Store::in_memory());
        store.create_user(&user("a", "a@x", "A1")).await.unwrap();

        let err = store.create_user(&user("b", "a@x", "B1")).await.unwrap_err();
        assert_eq!(err, UserError::EmailTaken);

        let err = store.create_user(&user("b", "b@x", "A1")).await.unwrap_err();
        assert_eq!(err, UserError::OmniTagTaken);

        // the email reservation of the failed attempt was released
        store.create_user(&user("b", "b@x", "B1")).await.unwrap();
        assert_eq!(
            store.find_by_omni_tag("B1").await.unwrap().map(|u| u.account_id),
            Some("b".to_string())
        );
        assert!(store.find_by_omni_tag("b1").await.unwrap().is_none());
        assert!(store.find_by_email("a@x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_contact_pair_is_unordered() {
        let store = UserStore::new(Store::in_memory());
        let c = Contact {
            id: "c1".into(),
            requester_id: "a".into(),
            addressee_id: "b".into(),
            status: ContactStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
        };
        assert!(store.insert_contact(&c).await.unwrap());
        let reverse = Contact {
            id: "c2".into(),
            requester_id: "b".into(),
            addressee_id: "a".into(),
            ..c.clone()
        };
        assert!(!store.insert_contact(&reverse).await.unwrap());
        assert_eq!(store.contacts_for_account("b").await.unwrap().len(), 1);
        assert_eq!(
            store.contact_between("b", "a").await.unwrap().map(|c| c.id),
            Some("c1".to_string())
        );

        store.delete_contact(&c).await.unwrap();
        assert!(store.contacts_for_account("a").await.unwrap().is_empty());
        assert!(store.insert_contact(&reverse).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_token_is_taken_once() {
        let store = UserStore::new(Store::in_memory());
        let now = Utc::now();
        let record = RefreshTokenRecord {
            token_id: "jti-1".into(),
            account_id: "a".into(),
            user_email: "a@x".into(),
            session_id: "s1".into(),
            device_info: "curl".into(),
            created_at: now,
            expires_at: now,
        };
        store
            .put_refresh_token(&record, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.take_refresh_token("jti-1").await.unwrap());
        assert!(!store.take_refresh_token("jti-1").await.unwrap());
    }
}
