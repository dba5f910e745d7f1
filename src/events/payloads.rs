//! Event payloads.
//!
//! Every payload is JSON with camelCase field names. The topic is a property
//! of the type, so a payload can never be published on the wrong topic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::topics;
use crate::core_types::{Currency, KycStatus};
use crate::transactions::model::{TransactionCategory, TransactionStatus, TransactionType};

/// A typed event bound to one topic
pub trait DomainEvent: Serialize {
    const TOPIC: &'static str;
}

macro_rules! domain_event {
    ($ty:ty, $topic:expr) => {
        impl DomainEvent for $ty {
            const TOPIC: &'static str = $topic;
        }
    };
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    pub account_id: String,
    pub currency: Currency,
    #[serde(alias = "kycstatus")]
    pub kyc_status: KycStatus,
}

#[cfg(test)]
impl AccountCreated {
    pub fn for_test(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            currency: Currency::Usd,
            kyc_status: KycStatus::Approved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDeletionRequested {
    pub account_id: String,
    pub email: String,
    pub requested_at: DateTime<Utc>,
    pub scheduled_deletion: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestSent {
    pub contact_id: String,
    pub requester_id: String,
    pub addressee_id: String,
    /// Omni-tag of the requester, shown to the addressee
    pub omni_tag: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestAccepted {
    pub contact_id: String,
    pub requester_id: String,
    pub addressee_id: String,
    pub accepted_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestRejected {
    pub contact_id: String,
    pub requester_id: String,
    pub addressee_id: String,
    pub rejected_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactBlocked {
    pub contact_id: String,
    pub requester_id: String,
    pub addressee_id: String,
    pub blocked_by: String,
    pub timestamp: DateTime<Utc>,
}

domain_event!(AccountCreated, topics::ACCOUNT_CREATED);
domain_event!(AccountDeletionRequested, topics::ACCOUNT_DELETION_REQUESTED);
domain_event!(ContactRequestSent, topics::CONTACT_REQUEST_SENT);
domain_event!(ContactRequestAccepted, topics::CONTACT_REQUEST_ACCEPTED);
domain_event!(ContactRequestRejected, topics::CONTACT_REQUEST_REJECTED);
domain_event!(ContactBlocked, topics::CONTACT_BLOCKED);

// ============================================================================
// Wallets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCardCreated {
    pub card_id: String,
    pub account_id: String,
    pub wallet_id: String,
    pub card_type: String,
    pub currency: Currency,
    pub last_four_digits: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCardBlocked {
    pub card_id: String,
    pub account_id: String,
    pub block_reason: String,
    pub blocked_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCardToppedUp {
    pub card_id: String,
    pub account_id: String,
    pub wallet_id: String,
    pub amount: Decimal,
    pub new_balance: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCardDeleted {
    pub card_id: String,
    pub account_id: String,
    pub last_four_digits: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalCardRequested {
    pub card_id: String,
    pub account_id: String,
    pub delivery_address: String,
    pub delivery_city: String,
    pub delivery_country: String,
    pub timestamp: DateTime<Utc>,
}

domain_event!(VirtualCardCreated, topics::VIRTUAL_CARD_CREATED);
domain_event!(VirtualCardBlocked, topics::VIRTUAL_CARD_BLOCKED);
domain_event!(VirtualCardToppedUp, topics::VIRTUAL_CARD_TOPPED_UP);
domain_event!(VirtualCardDeleted, topics::VIRTUAL_CARD_DELETED);
domain_event!(PhysicalCardRequested, topics::PHYSICAL_CARD_REQUESTED);

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCreated {
    pub transaction_id: String,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_wallet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_wallet_id: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: TransactionCategory,
    pub status: TransactionStatus,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCompleted {
    pub transaction_id: String,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_wallet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_wallet_id: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: TransactionCategory,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_balance_after: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_balance_after: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFailed {
    pub transaction_id: String,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_account_id: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: TransactionCategory,
    pub description: String,
    pub failed_reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneySent {
    pub account_id: String,
    pub wallet_id: String,
    pub transaction_id: String,
    pub reference: String,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_omni_tag: Option<String>,
    pub description: String,
    pub balance_after: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyReceived {
    pub account_id: String,
    pub wallet_id: String,
    pub transaction_id: String,
    pub reference: String,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_omni_tag: Option<String>,
    pub description: String,
    pub balance_after: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPurchase {
    pub account_id: String,
    pub wallet_id: String,
    pub card_id: String,
    pub transaction_id: String,
    pub reference: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub merchant_name: String,
    pub merchant_category: String,
    pub description: String,
    pub card_balance: Decimal,
    pub wallet_balance: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRefund {
    pub account_id: String,
    pub wallet_id: String,
    pub card_id: String,
    pub transaction_id: String,
    pub reference: String,
    pub original_reference: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub merchant_name: String,
    pub description: String,
    pub card_balance: Decimal,
    pub wallet_balance: Decimal,
    pub timestamp: DateTime<Utc>,
}

domain_event!(TransactionCreated, topics::TRANSACTION_CREATED);
domain_event!(TransactionCompleted, topics::TRANSACTION_COMPLETED);
domain_event!(TransactionFailed, topics::TRANSACTION_FAILED);
domain_event!(MoneySent, topics::MONEY_SENT);
domain_event!(MoneyReceived, topics::MONEY_RECEIVED);
domain_event!(CardPurchase, topics::CARD_PURCHASE);
domain_event!(CardRefund, topics::CARD_REFUND);
