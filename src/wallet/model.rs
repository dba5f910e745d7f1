//! Wallet and virtual-card records
//!
//! Stored records carry bookkeeping the API never shows (applied operation
//! ids, the raw card number, the CVV hash). Handlers always answer with the
//! `*View` types.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use super::card;
use super::error::WalletError;
use crate::core_types::{AccountId, CardId, Currency, WalletId};

// ============================================================================
// Enumerations
// ============================================================================

macro_rules! wire_enum {
    ($ty:ident, $label:expr, { $($variant:ident => $text:expr),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("Invalid {}: {}", $label, other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WalletType {
    Primary,
    Savings,
    Escrow,
}

wire_enum!(WalletType, "wallet type", {
    Primary => "primary",
    Savings => "savings",
    Escrow => "escrow",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Active,
    Inactive,
    Suspended,
    Disabled,
}

wire_enum!(WalletStatus, "wallet status", {
    Active => "active",
    Inactive => "inactive",
    Suspended => "suspended",
    Disabled => "disabled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Active,
    Inactive,
    Pending,
    Blocked,
    Expired,
}

wire_enum!(CardStatus, "card status", {
    Active => "active",
    Inactive => "inactive",
    Pending => "pending",
    Blocked => "blocked",
    Expired => "expired",
});

impl CardStatus {
    /// Card lifecycle.
    ///
    /// ```text
    /// pending ──activate──▶ active ──block──▶ blocked ──activate──▶ active
    ///    │                    │
    ///    └──block──▶ blocked  └──deactivate──▶ inactive ──activate──▶ active
    /// ```
    /// An inactive card may also be blocked. Expired is final.
    pub fn can_transition_to(&self, next: CardStatus) -> bool {
        use CardStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Blocked)
                | (Active, Blocked)
                | (Active, Inactive)
                | (Inactive, Active)
                | (Inactive, Blocked)
                | (Blocked, Active)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    #[default]
    Debit,
    Credit,
}

wire_enum!(CardType, "card type", {
    Debit => "debit",
    Credit => "credit",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardBrand {
    #[default]
    Visa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Lost,
    Stolen,
    SuspiciousActivity,
    CustomerRequest,
}

wire_enum!(BlockReason, "block reason", {
    Lost => "lost",
    Stolen => "stolen",
    SuspiciousActivity => "suspicious_activity",
    CustomerRequest => "customer_request",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalCardStatus {
    Pending,
    Shipped,
    Delivered,
}

wire_enum!(PhysicalCardStatus, "physical card status", {
    Pending => "pending",
    Shipped => "shipped",
    Delivered => "delivered",
});

// ============================================================================
// Applied operations
// ============================================================================

/// One balance operation remembered by the record it touched.
///
/// `reversed` with a zero delta is a tombstone: the reverse arrived before
/// (or instead of) the apply, so a late apply must not land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOp {
    pub op_id: String,
    pub delta: Decimal,
    pub reversed: bool,
}

/// Bounded window of applied operation ids, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpLog(VecDeque<AppliedOp>);

impl OpLog {
    pub fn find(&self, op_id: &str) -> Option<&AppliedOp> {
        self.0.iter().find(|op| op.op_id == op_id)
    }

    fn find_mut(&mut self, op_id: &str) -> Option<&mut AppliedOp> {
        self.0.iter_mut().find(|op| op.op_id == op_id)
    }

    fn push(&mut self, op: AppliedOp, window: usize) {
        self.0.push_back(op);
        while self.0.len() > window.max(1) {
            self.0.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply `delta` once under `op_id`.
    ///
    /// Returns the delta to add to the balance now: `Some(delta)` the first
    /// time, `None` on a replay. A tombstoned id is refused.
    fn admit(&mut self, op_id: &str, delta: Decimal, window: usize) -> Result<Option<Decimal>, WalletError> {
        match self.find(op_id) {
            Some(op) if op.reversed => Err(WalletError::OperationReversed(op_id.to_string())),
            Some(_) => Ok(None),
            None => {
                self.push(
                    AppliedOp {
                        op_id: op_id.to_string(),
                        delta,
                        reversed: false,
                    },
                    window,
                );
                Ok(Some(delta))
            }
        }
    }

    /// Undo `op_id`. Returns the delta to add to the balance now (zero when
    /// there is nothing to undo).
    fn revoke(&mut self, op_id: &str, window: usize) -> Decimal {
        match self.find_mut(op_id) {
            Some(op) if op.reversed => Decimal::ZERO,
            Some(op) => {
                op.reversed = true;
                -op.delta
            }
            None => {
                self.push(
                    AppliedOp {
                        op_id: op_id.to_string(),
                        delta: Decimal::ZERO,
                        reversed: true,
                    },
                    window,
                );
                Decimal::ZERO
            }
        }
    }
}

/// Outcome of a balance operation on a wallet or a card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub op_id: String,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub currency: Currency,
    /// `false` when the operation had already been applied (or reversed)
    pub applied: bool,
}

// ============================================================================
// Wallet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub wallet_type: WalletType,
    pub balance: Decimal,
    pub currency: Currency,
    pub status: WalletStatus,
    pub is_default: bool,
    pub daily_limit: Decimal,
    pub monthly_limit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub applied_ops: OpLog,
}

impl Wallet {
    /// Deterministic id of an account's default wallet
    pub fn default_id(account_id: &str) -> WalletId {
        format!("wallet-{}", account_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }

    /// Debit once under `op_id`. Requires an active wallet and enough funds.
    pub fn debit(
        &mut self,
        op_id: &str,
        amount: Decimal,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, WalletError> {
        if self.applied_ops.find(op_id).is_none() {
            if !self.is_active() {
                return Err(WalletError::WalletNotActive);
            }
            if self.balance < amount {
                return Err(WalletError::InsufficientBalance);
            }
        }
        self.change(op_id, -amount, window, now)
    }

    /// Credit once under `op_id`. Suspended and disabled wallets refuse money.
    pub fn credit(
        &mut self,
        op_id: &str,
        amount: Decimal,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, WalletError> {
        if self.applied_ops.find(op_id).is_none()
            && matches!(self.status, WalletStatus::Suspended | WalletStatus::Disabled)
        {
            return Err(WalletError::WalletNotActive);
        }
        self.change(op_id, amount, window, now)
    }

    fn change(
        &mut self,
        op_id: &str,
        delta: Decimal,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, WalletError> {
        let before = self.balance;
        let applied = match self.applied_ops.admit(op_id, delta, window)? {
            Some(d) => {
                self.balance += d;
                self.updated_at = now;
                true
            }
            None => false,
        };
        Ok(BalanceChange {
            op_id: op_id.to_string(),
            balance_before: if applied { before } else { self.balance },
            balance_after: self.balance,
            currency: self.currency,
            applied,
        })
    }

    /// Undo `op_id`. Unknown ids are tombstoned so a late apply is refused.
    /// Undoing a credit the holder already spent fails with insufficient balance.
    pub fn reverse(
        &mut self,
        op_id: &str,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, WalletError> {
        let pending_undo = self
            .applied_ops
            .find(op_id)
            .filter(|op| !op.reversed)
            .map(|op| -op.delta)
            .unwrap_or(Decimal::ZERO);
        if self.balance + pending_undo < Decimal::ZERO {
            return Err(WalletError::InsufficientBalance);
        }
        let before = self.balance;
        let undo = self.applied_ops.revoke(op_id, window);
        self.balance += undo;
        self.updated_at = now;
        Ok(BalanceChange {
            op_id: op_id.to_string(),
            balance_before: before,
            balance_after: self.balance,
            currency: self.currency,
            applied: !undo.is_zero(),
        })
    }
}

/// Wallet as the API shows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WalletView {
    pub wallet_id: WalletId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub wallet_type: WalletType,
    pub balance: Decimal,
    pub currency: Currency,
    pub status: WalletStatus,
    pub is_default: bool,
    pub daily_limit: Decimal,
    pub monthly_limit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Wallet> for WalletView {
    fn from(w: &Wallet) -> Self {
        Self {
            wallet_id: w.wallet_id.clone(),
            account_id: w.account_id.clone(),
            wallet_type: w.wallet_type,
            balance: w.balance,
            currency: w.currency,
            status: w.status,
            is_default: w.is_default,
            daily_limit: w.daily_limit,
            monthly_limit: w.monthly_limit,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

// ============================================================================
// Virtual card
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualCard {
    pub id: CardId,
    pub wallet_id: WalletId,
    pub account_id: AccountId,
    pub card_type: CardType,
    pub card_brand: CardBrand,
    pub currency: Currency,
    pub card_status: CardStatus,
    pub daily_limit: Decimal,
    pub monthly_limit: Decimal,
    pub name_on_card: String,
    pub card_number: String,
    pub cvv_hash: String,
    pub expiry_date: NaiveDate,
    pub is_active: bool,
    pub is_physical_card_requested: bool,
    #[serde(default)]
    pub block_reason: Option<BlockReason>,
    #[serde(default)]
    pub block_reason_description: Option<String>,
    #[serde(default)]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked_by: Option<String>,
    pub available_balance: Decimal,
    pub total_topped_up: Decimal,
    #[serde(default)]
    pub last_top_up_date: Option<DateTime<Utc>>,
    pub total_spend_today: Decimal,
    pub total_spent_this_month: Decimal,
    #[serde(default)]
    pub last_transaction_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_transaction_amount: Option<Decimal>,
    #[serde(default)]
    pub physical_card_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivery_address: Option<String>,
    #[serde(default)]
    pub delivery_city: Option<String>,
    #[serde(default)]
    pub delivery_country: Option<String>,
    #[serde(default)]
    pub delivery_postal_code: Option<String>,
    #[serde(default)]
    pub physical_card_status: Option<PhysicalCardStatus>,
    #[serde(default)]
    pub card_metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub applied_ops: OpLog,
}

impl VirtualCard {
    /// Deterministic id of the default card of a wallet
    pub fn default_id(wallet_id: &str) -> CardId {
        format!("card-{}", wallet_id)
    }

    pub fn last_four_digits(&self) -> &str {
        card::last_four(&self.card_number)
    }

    pub fn masked_card_number(&self) -> String {
        card::mask(&self.card_number)
    }

    /// Move along the lifecycle, keeping `is_active` in step.
    pub fn transition(&mut self, next: CardStatus, now: DateTime<Utc>) -> Result<(), WalletError> {
        if self.card_status == next {
            return Ok(());
        }
        if !self.card_status.can_transition_to(next) {
            return Err(WalletError::InvalidCardTransition {
                from: self.card_status,
                to: next,
            });
        }
        if self.card_status == CardStatus::Blocked {
            self.block_reason = None;
            self.block_reason_description = None;
            self.blocked_at = None;
            self.blocked_by = None;
        }
        self.card_status = next;
        self.is_active = next == CardStatus::Active;
        self.updated_at = now;
        Ok(())
    }

    fn roll_spend_windows(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_transaction_date {
            if last.date_naive() != now.date_naive() {
                self.total_spend_today = Decimal::ZERO;
            }
            if last.format("%Y-%m").to_string() != now.format("%Y-%m").to_string() {
                self.total_spent_this_month = Decimal::ZERO;
            }
        }
    }

    /// Spend from the card once under `op_id`.
    pub fn charge(
        &mut self,
        op_id: &str,
        amount: Decimal,
        window: usize,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, WalletError> {
        let before = self.available_balance;
        if self.applied_ops.find(op_id).is_none() {
            if self.card_status != CardStatus::Active {
                return Err(WalletError::CardNotActive);
            }
            if self.available_balance < amount {
                return Err(WalletError::InsufficientCardBalance);
            }
            self.roll_spend_windows(now);
            if self.total_spend_today + amount > self.daily_limit {
                return Err(WalletError::DailyLimitExceeded);
            }
            if self.total_spent_this_month + amount > self.monthly_limit {
                return Err(WalletError::MonthlyLimitExceeded);
            }
        }
        let applied = match self.applied_ops.admit(op_id, -amount, window)? {
            Some(delta) => {
                self.available_balance += delta;
                self.total_spend_today += amount;
                self.total_spent_this_month += amount;
                self.last_transaction_date = Some(now);
                self.last_transaction_amount = Some(amount);
                self.updated_at = now;
                true
            }
            None => false,
        };
        Ok(BalanceChange {
            op_id: op_id.to_string(),
            balance_before: if applied { before } else { self.available_balance },
            balance_after: self.available_balance,
            currency: self.currency,
            applied,
        })
    }

    /// Undo a charge. Unknown ids are tombstoned.
    pub fn reverse(&mut self, op_id: &str, window: usize, now: DateTime<Utc>) -> BalanceChange {
        let before = self.available_balance;
        let undo = self.applied_ops.revoke(op_id, window);
        if !undo.is_zero() {
            self.available_balance += undo;
            if self
                .last_transaction_date
                .is_some_and(|d| d.date_naive() == now.date_naive())
            {
                self.total_spend_today = (self.total_spend_today - undo).max(Decimal::ZERO);
            }
            self.total_spent_this_month = (self.total_spent_this_month - undo).max(Decimal::ZERO);
        }
        self.updated_at = now;
        BalanceChange {
            op_id: op_id.to_string(),
            balance_before: before,
            balance_after: self.available_balance,
            currency: self.currency,
            applied: !undo.is_zero(),
        }
    }
}

/// Card as the API shows it. `card_number` is masked except in the
/// creation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    pub id: CardId,
    pub wallet_id: WalletId,
    pub account_id: AccountId,
    pub card_type: CardType,
    pub card_brand: CardBrand,
    pub currency: Currency,
    pub card_status: CardStatus,
    pub daily_limit: Decimal,
    pub monthly_limit: Decimal,
    pub name_on_card: String,
    pub card_number: String,
    pub last_four_digits: String,
    pub expiry_date: NaiveDate,
    pub is_active: bool,
    pub is_physical_card_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    pub available_balance: Decimal,
    pub total_topped_up: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_top_up_date: Option<DateTime<Utc>>,
    pub total_spend_today: Decimal,
    pub total_spent_this_month: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transaction_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_card_status: Option<PhysicalCardStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_postal_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CardView {
    pub fn masked(card: &VirtualCard) -> Self {
        Self::build(card, card.masked_card_number())
    }

    /// Full number; only for the response that also carries the CVV.
    pub fn revealed(card: &VirtualCard) -> Self {
        Self::build(card, card.card_number.clone())
    }

    fn build(c: &VirtualCard, card_number: String) -> Self {
        Self {
            id: c.id.clone(),
            wallet_id: c.wallet_id.clone(),
            account_id: c.account_id.clone(),
            card_type: c.card_type,
            card_brand: c.card_brand,
            currency: c.currency,
            card_status: c.card_status,
            daily_limit: c.daily_limit,
            monthly_limit: c.monthly_limit,
            name_on_card: c.name_on_card.clone(),
            card_number,
            last_four_digits: c.last_four_digits().to_string(),
            expiry_date: c.expiry_date,
            is_active: c.is_active,
            is_physical_card_requested: c.is_physical_card_requested,
            block_reason: c.block_reason,
            block_reason_description: c.block_reason_description.clone(),
            blocked_at: c.blocked_at,
            available_balance: c.available_balance,
            total_topped_up: c.total_topped_up,
            last_top_up_date: c.last_top_up_date,
            total_spend_today: c.total_spend_today,
            total_spent_this_month: c.total_spent_this_month,
            last_transaction_date: c.last_transaction_date,
            physical_card_status: c.physical_card_status,
            delivery_address: c.delivery_address.clone(),
            delivery_city: c.delivery_city.clone(),
            delivery_country: c.delivery_country.clone(),
            delivery_postal_code: c.delivery_postal_code.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateCardRequest {
    pub wallet_id: String,
    pub card_type: CardType,
    pub card_brand: CardBrand,
    /// Must equal the wallet's currency when given
    pub currency: Option<String>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub name_on_card: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateCardRequest {
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub name_on_card: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockCardRequest {
    pub block_reason: BlockReason,
    #[serde(default, alias = "blockReasonDesc")]
    pub block_reason_description: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TopUpRequest {
    pub account_number: String,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PhysicalCardRequest {
    pub delivery_address: String,
    pub delivery_city: String,
    pub delivery_country: String,
    pub delivery_postal_code: String,
}

/// Body of the internal balance operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceOpRequest {
    pub op_id: String,
    #[serde(default)]
    pub amount: Decimal,
}
