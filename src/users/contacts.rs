//! Contact requests between omni-tags
//!
//! A pair of accounts has at most one contact record, whichever side sent
//! the request. Notifications go to the counterparty's key.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::error::{UserError, UserResult};
use super::model::*;
use super::service::{UserService, ensure_self};
use crate::events::payloads::{
    ContactBlocked, ContactRequestAccepted, ContactRequestRejected, ContactRequestSent,
};

const VIEW_OWN_CONTACTS: &str = "Unauthorized: You can only view your own contacts";

impl UserService {
    pub async fn send_contact_request(&self, caller: &str, omni_tag: &str) -> UserResult<ContactCreated> {
        validate_omni_tag(omni_tag).map_err(UserError::InvalidOmniTag)?;
        let requester = self.store.user(caller).await?;
        let addressee = self
            .find_by_omni_tag(omni_tag)
            .await?
            .ok_or(UserError::UserNotFound)?;
        if addressee.account_id == requester.account_id {
            return Err(UserError::SelfContact);
        }

        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            requester_id: requester.account_id.clone(),
            addressee_id: addressee.account_id.clone(),
            status: ContactStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
        };
        if !self.store.insert_contact(&contact).await? {
            return Err(UserError::ContactExists);
        }
        info!(contact_id = %contact.id, requester = caller, addressee = %addressee.account_id, "Contact request sent");

        self.publish(
            &contact.addressee_id,
            ContactRequestSent {
                contact_id: contact.id.clone(),
                requester_id: contact.requester_id.clone(),
                addressee_id: contact.addressee_id.clone(),
                omni_tag: requester.omni_tag.clone(),
                timestamp: contact.requested_at,
            },
        )
        .await;

        Ok(ContactCreated {
            message: "Contact request sent successfully".to_string(),
            contact_id: contact.id,
            omni_tag: addressee.omni_tag,
        })
    }

    /// Move a pending request to `status`; only the addressee may answer
    async fn respond(&self, caller: &str, contact_id: &str, status: ContactStatus) -> UserResult<Contact> {
        let now = Utc::now();
        self.store
            .update_contact(contact_id, |c| {
                if c.addressee_id != caller {
                    return Err(UserError::forbidden(
                        "Unauthorized: Only the recipient can respond to this request",
                    ));
                }
                if c.status != ContactStatus::Pending {
                    return Err(UserError::ContactNotPending);
                }
                c.status = status;
                c.responded_at = Some(now);
                Ok(())
            })
            .await
    }

    pub async fn accept_contact(&self, caller: &str, contact_id: &str) -> UserResult<MessageResponse> {
        let contact = self.respond(caller, contact_id, ContactStatus::Accepted).await?;
        info!(contact_id, accepted_by = caller, "Contact request accepted");
        self.publish(
            &contact.requester_id,
            ContactRequestAccepted {
                contact_id: contact.id.clone(),
                requester_id: contact.requester_id.clone(),
                addressee_id: contact.addressee_id.clone(),
                accepted_by: caller.to_string(),
                timestamp: contact.responded_at.unwrap_or_else(Utc::now),
            },
        )
        .await;
        Ok(MessageResponse::new("Contact request accepted successfully"))
    }

    pub async fn reject_contact(&self, caller: &str, contact_id: &str) -> UserResult<MessageResponse> {
        let contact = self.respond(caller, contact_id, ContactStatus::Rejected).await?;
        info!(contact_id, rejected_by = caller, "Contact request rejected");
        self.publish(
            &contact.requester_id,
            ContactRequestRejected {
                contact_id: contact.id.clone(),
                requester_id: contact.requester_id.clone(),
                addressee_id: contact.addressee_id.clone(),
                rejected_by: caller.to_string(),
                timestamp: contact.responded_at.unwrap_or_else(Utc::now),
            },
        )
        .await;
        Ok(MessageResponse::new("Contact request rejected successfully"))
    }

    /// Either party may block, whatever the current status
    pub async fn block_contact(&self, caller: &str, contact_id: &str) -> UserResult<MessageResponse> {
        let now = Utc::now();
        let contact = self
            .store
            .update_contact(contact_id, |c| {
                if !c.involves(caller) {
                    return Err(UserError::ContactNotFound);
                }
                c.status = ContactStatus::Blocked;
                c.responded_at = Some(now);
                Ok(())
            })
            .await?;
        info!(contact_id, blocked_by = caller, "Contact blocked");
        self.publish(
            contact.counterparty(caller),
            ContactBlocked {
                contact_id: contact.id.clone(),
                requester_id: contact.requester_id.clone(),
                addressee_id: contact.addressee_id.clone(),
                blocked_by: caller.to_string(),
                timestamp: now,
            },
        )
        .await;
        Ok(MessageResponse::new("Contact blocked successfully"))
    }

    /// Removing the record frees the pair for a new request
    pub async fn delete_contact(&self, caller: &str, contact_id: &str) -> UserResult<MessageResponse> {
        let contact = self
            .store
            .find_contact(contact_id)
            .await?
            .filter(|c| c.involves(caller))
            .ok_or(UserError::ContactNotFound)?;
        self.store.delete_contact(&contact).await?;
        info!(contact_id, deleted_by = caller, "Contact deleted");
        Ok(MessageResponse::new("Contact deleted successfully"))
    }

    /// Accepted contacts of `account_id`, seen from its side
    pub async fn contacts(&self, caller: &str, account_id: &str) -> UserResult<ContactList> {
        ensure_self(caller, account_id, VIEW_OWN_CONTACTS)?;
        let mut contacts = Vec::new();
        for c in self.store.contacts_for_account(account_id).await? {
            if c.status != ContactStatus::Accepted {
                continue;
            }
            let Some(other) = self.store.find_user(c.counterparty(account_id)).await? else {
                continue;
            };
            contacts.push(ContactInfo {
                account_id: other.account_id,
                omni_tag: other.omni_tag,
                first_name: Some(other.first_name),
                last_name: Some(other.last_name),
                email: Some(other.email),
                status: c.status,
                added_at: c.responded_at.unwrap_or(c.requested_at),
                is_accepted: true,
            });
        }
        let count = contacts.len();
        Ok(ContactList { contacts, count })
    }

    /// Requests waiting for `account_id` to answer
    pub async fn pending_requests(&self, caller: &str, account_id: &str) -> UserResult<RequestList> {
        ensure_self(caller, account_id, VIEW_OWN_CONTACTS)?;
        self.request_list(account_id, |c| {
            c.addressee_id == account_id && c.status == ContactStatus::Pending
        })
        .await
    }

    /// Requests `account_id` sent, whatever their outcome
    pub async fn sent_requests(&self, caller: &str, account_id: &str) -> UserResult<RequestList> {
        ensure_self(caller, account_id, VIEW_OWN_CONTACTS)?;
        self.request_list(account_id, |c| c.requester_id == account_id)
            .await
    }

    async fn request_list<F>(&self, account_id: &str, keep: F) -> UserResult<RequestList>
    where
        F: Fn(&Contact) -> bool,
    {
        let mut requests = Vec::new();
        for c in self.store.contacts_for_account(account_id).await? {
            if !keep(&c) {
                continue;
            }
            requests.push(ContactRequestView {
                from_user: self.user_basic(&c.requester_id).await?,
                to_user: self.user_basic(&c.addressee_id).await?,
                contact_id: c.id,
                status: c.status,
                requested_at: c.requested_at,
            });
        }
        let count = requests.len();
        Ok(RequestList { requests, count })
    }

    async fn user_basic(&self, account_id: &str) -> UserResult<UserBasic> {
        let omni_tag = self
            .store
            .find_user(account_id)
            .await?
            .map(|u| u.omni_tag)
            .unwrap_or_default();
        Ok(UserBasic {
            account_id: account_id.to_string(),
            omni_tag,
        })
    }
}
