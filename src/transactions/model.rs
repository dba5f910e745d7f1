//! Transaction records, request/response DTOs and their enumerations.
//!
//! Persisted enum values are lowercase strings; anything else fails to parse.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::core_types::{AccountId, CardId, Currency, TransactionId, WalletId};

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    CardPurchase,
    CardRefund,
    Reversal,
    #[serde(alias = "fee_charged")]
    Fee,
    #[serde(alias = "interest_credited")]
    Interest,
}

impl TransactionType {
    pub const ALL: [TransactionType; 8] = [
        TransactionType::Deposit,
        TransactionType::Withdrawal,
        TransactionType::Transfer,
        TransactionType::CardPurchase,
        TransactionType::CardRefund,
        TransactionType::Reversal,
        TransactionType::Fee,
        TransactionType::Interest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::CardPurchase => "card_purchase",
            TransactionType::CardRefund => "card_refund",
            TransactionType::Reversal => "reversal",
            TransactionType::Fee => "fee",
            TransactionType::Interest => "interest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionCategory {
    Credit,
    Debit,
}

impl TransactionCategory {
    pub const ALL: [TransactionCategory; 2] = [TransactionCategory::Credit, TransactionCategory::Debit];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionCategory::Credit => "credit",
            TransactionCategory::Debit => "debit",
        }
    }
}

/// Status lattice:
///
/// ```text
/// pending ──▶ completed ──▶ reversed
///    │
///    ├──▶ failed
///    └──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 5] = [
        TransactionStatus::Pending,
        TransactionStatus::Completed,
        TransactionStatus::Failed,
        TransactionStatus::Reversed,
        TransactionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Reversed => "reversed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Failed) | (Pending, Cancelled) | (Completed, Reversed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Failed | TransactionStatus::Reversed | TransactionStatus::Cancelled
        )
    }
}

macro_rules! impl_wire_enum {
    ($ty:ident, $what:expr) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::ALL
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| format!("Invalid {}: {}", $what, s))
            }
        }
    };
}

impl_wire_enum!(TransactionType, "transaction type");
impl_wire_enum!(TransactionCategory, "transaction category");
impl_wire_enum!(TransactionStatus, "transaction status");

// ============================================================================
// Transaction record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    /// Human-facing unique handle, `TXN-YYYYMMDD-XXXXXXXX`
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_wallet_id: Option<WalletId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_wallet_id: Option<WalletId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<CardId>,
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: TransactionCategory,
    pub status: TransactionStatus,
    #[serde(default)]
    pub description: String,
    #[schema(value_type = f64)]
    pub balance_before: Decimal,
    #[schema(value_type = f64)]
    pub balance_after: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    /// Free-form details (merchant, risk fields, idempotency key). Ordered so
    /// the serialized form is stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schema(value_type = Object)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Move along the status lattice.
    ///
    /// `completed_at` is set on entering `completed` and kept only there;
    /// `failed_reason` is required to enter `failed`.
    pub fn transition(
        &mut self,
        next: TransactionStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!("{} -> {}", self.status, next));
        }
        match next {
            TransactionStatus::Completed => {
                self.completed_at = Some(now);
            }
            TransactionStatus::Failed => {
                let reason = reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "Transaction failed".to_string());
                self.failed_reason = Some(reason);
                self.completed_at = None;
            }
            _ => {
                if let Some(r) = reason {
                    self.failed_reason = Some(r);
                }
                self.completed_at = None;
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Account ids this record is listed under
    pub fn account_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(2);
        for id in [&self.sender_account_id, &self.receiver_account_id]
            .into_iter()
            .flatten()
        {
            if !ids.contains(&id.as_str()) {
                ids.push(id.as_str());
            }
        }
        ids
    }

    /// Wallet ids this record is listed under
    pub fn wallet_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(2);
        for id in [&self.sender_wallet_id, &self.receiver_wallet_id]
            .into_iter()
            .flatten()
        {
            if !ids.contains(&id.as_str()) {
                ids.push(id.as_str());
            }
        }
        ids
    }
}

// ============================================================================
// Requests / responses
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferRequest {
    pub sender_wallet_id: String,
    #[schema(example = "B1")]
    pub receiver_omni_tag: String,
    #[schema(value_type = f64, example = 10.0)]
    pub amount: Decimal,
    pub description: String,
    #[schema(example = "K1")]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PurchaseRequest {
    pub card_id: String,
    pub merchant_name: String,
    pub merchant_category: String,
    #[schema(value_type = f64)]
    pub amount: Decimal,
    #[schema(example = "USD")]
    pub currency: String,
    pub description: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    /// `success` or `failed`
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<f64>)]
    pub sender_balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<f64>)]
    pub receiver_balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Box<Transaction>>,
}

impl TransferResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            message: message.into(),
            transaction_id: None,
            reference: None,
            sender_balance: None,
            receiver_balance: None,
            transaction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<f64>)]
    pub card_balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<f64>)]
    pub wallet_balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Box<Transaction>>,
}

impl PurchaseResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            message: message.into(),
            transaction_id: None,
            reference: None,
            card_balance: None,
            wallet_balance: None,
            transaction: None,
        }
    }
}

/// One page of history
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(now: DateTime<Utc>) -> Transaction {
        Transaction {
            id: "t1".into(),
            reference: "TXN-20250101-ABCDEF12".into(),
            sender_account_id: Some("a".into()),
            receiver_account_id: Some("b".into()),
            sender_wallet_id: Some("wa".into()),
            receiver_wallet_id: Some("wb".into()),
            card_id: None,
            amount: Decimal::TEN,
            currency: Currency::Usd,
            transaction_type: TransactionType::Transfer,
            transaction_category: TransactionCategory::Debit,
            status: TransactionStatus::Pending,
            description: "hi".into(),
            balance_before: Decimal::ONE_HUNDRED,
            balance_after: Decimal::from(90),
            failed_reason: None,
            metadata: BTreeMap::new(),
            created_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_lattice() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Reversed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Reversed.can_transition_to(Completed));
    }

    #[test]
    fn test_completed_at_iff_completed() {
        let now = Utc::now();
        let mut t = sample(now);
        t.transition(TransactionStatus::Completed, None, now).unwrap();
        assert!(t.completed_at.is_some());
        t.transition(TransactionStatus::Reversed, None, now).unwrap();
        assert!(t.completed_at.is_none());
        assert!(t.transition(TransactionStatus::Completed, None, now).is_err());
    }

    #[test]
    fn test_failed_always_has_reason() {
        let now = Utc::now();
        let mut t = sample(now);
        t.transition(TransactionStatus::Failed, Some("  ".into()), now).unwrap();
        assert_eq!(t.failed_reason.as_deref(), Some("Transaction failed"));
    }

    #[test]
    fn test_enum_wire_values() {
        assert_eq!(serde_json::to_string(&TransactionType::CardPurchase).unwrap(), "\"card_purchase\"");
        assert_eq!(
            serde_json::from_str::<TransactionType>("\"fee_charged\"").unwrap(),
            TransactionType::Fee
        );
        assert!(serde_json::from_str::<TransactionStatus>("\"Pending\"").is_err());
        assert_eq!("debit".parse::<TransactionCategory>().unwrap(), TransactionCategory::Debit);
        assert_eq!(
            "bogus".parse::<TransactionStatus>().unwrap_err(),
            "Invalid transaction status: bogus"
        );
    }

    #[test]
    fn test_record_camel_case() {
        let t = sample(Utc::now());
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["senderAccountId"], "a");
        assert_eq!(json["transactionType"], "transfer");
        assert_eq!(json["balanceAfter"], 90.0);
        assert!(json.get("cardId").is_none());
        assert!(json.get("completedAt").is_none());
    }

    #[test]
    fn test_index_ids_dedup() {
        let mut t = sample(Utc::now());
        t.receiver_wallet_id = t.sender_wallet_id.clone();
        assert_eq!(t.wallet_ids(), vec!["wa"]);
        assert_eq!(t.account_ids(), vec!["a", "b"]);
    }
}
