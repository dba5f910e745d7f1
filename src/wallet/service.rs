//! Wallet Service
//!
//! Every balance mutation is a CAS update of a single record, keyed by an
//! operation id so HTTP retries from the transactions service land once.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::WalletConfig;
use super::card;
use super::error::{WalletError, WalletResult};
use super::model::*;
use super::store::WalletStore;
use crate::core_types::{AccountId, Currency, KycStatus};
use crate::events::payloads::{
    AccountCreated, PhysicalCardRequested, VirtualCardBlocked, VirtualCardCreated,
    VirtualCardDeleted, VirtualCardToppedUp,
};
use crate::events::{DomainEvent, EventProducer};
use crate::storage::Store;

/// A freshly issued card together with its one-time plaintext CVV
#[derive(Debug, Clone)]
pub struct IssuedCard {
    pub card: VirtualCard,
    pub cvv: String,
}

/// Both legs of a card purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CardCharge {
    pub card: BalanceChange,
    pub wallet: BalanceChange,
}

/// Result of handling one `account-created` delivery
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub wallet: Wallet,
    pub card: VirtualCard,
    pub wallet_created: bool,
    pub card_created: bool,
}

pub struct WalletService {
    store: WalletStore,
    config: WalletConfig,
    producer: EventProducer,
}

impl WalletService {
    pub fn new(store: Store, config: WalletConfig, producer: EventProducer) -> Self {
        Self {
            store: WalletStore::new(store),
            config,
            producer,
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    async fn publish<E: DomainEvent>(&self, key: &str, event: E) {
        if let Err(e) = self.producer.emit(key, &event).await {
            warn!(topic = E::TOPIC, key, error = %e, "Failed to publish event");
        }
    }

    fn window(&self) -> usize {
        self.config.applied_ops_window
    }

    // ========================================================================
    // Wallets
    // ========================================================================

    pub async fn wallet(&self, wallet_id: &str) -> WalletResult<Wallet> {
        self.store.wallet(wallet_id).await
    }

    /// Wallet lookup on behalf of an authenticated account
    pub async fn wallet_for(&self, caller: &str, wallet_id: &str) -> WalletResult<Wallet> {
        let wallet = self.store.wallet(wallet_id).await?;
        ensure_owner(caller, &wallet.account_id)?;
        Ok(wallet)
    }

    pub async fn list_wallets(&self, account_id: &str) -> WalletResult<Vec<Wallet>> {
        Ok(self.store.wallets_for_account(account_id).await?)
    }

    pub async fn default_wallet(&self, account_id: &str) -> WalletResult<Wallet> {
        self.store
            .default_wallet(account_id)
            .await?
            .ok_or(WalletError::WalletNotFound)
    }

    pub async fn debit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> WalletResult<BalanceChange> {
        validate_op(op_id, amount)?;
        let now = Utc::now();
        let window = self.window();
        let mut out = None;
        self.store
            .update_wallet(wallet_id, |w| {
                out = Some(w.debit(op_id, amount, window, now)?);
                Ok(())
            })
            .await?;
        let change = captured(out)?;
        debug!(wallet_id, op_id, %amount, applied = change.applied, "Wallet debited");
        Ok(change)
    }

    pub async fn credit(&self, wallet_id: &str, op_id: &str, amount: Decimal) -> WalletResult<BalanceChange> {
        validate_op(op_id, amount)?;
        let now = Utc::now();
        let window = self.window();
        let mut out = None;
        self.store
            .update_wallet(wallet_id, |w| {
                out = Some(w.credit(op_id, amount, window, now)?);
                Ok(())
            })
            .await?;
        let change = captured(out)?;
        debug!(wallet_id, op_id, %amount, applied = change.applied, "Wallet credited");
        Ok(change)
    }

    /// Compensate an earlier debit or credit. Safe to call for ops that never
    /// landed.
    pub async fn reverse(&self, wallet_id: &str, op_id: &str) -> WalletResult<BalanceChange> {
        if op_id.trim().is_empty() {
            return Err(WalletError::Validation("Operation ID is required".into()));
        }
        let now = Utc::now();
        let window = self.window();
        let mut out = None;
        self.store
            .update_wallet(wallet_id, |w| {
                out = Some(w.reverse(op_id, window, now)?);
                Ok(())
            })
            .await?;
        let change = captured(out)?;
        info!(wallet_id, op_id, applied = change.applied, "Wallet operation reversed");
        Ok(change)
    }

    /// Test hook: credit a wallet out of thin air
    pub async fn deposit(
        &self,
        wallet_id: &str,
        amount: Decimal,
        op_id: Option<String>,
    ) -> WalletResult<BalanceChange> {
        let op_id = op_id.unwrap_or_else(|| format!("deposit:{}", Uuid::new_v4()));
        self.credit(wallet_id, &op_id, amount).await
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    fn new_wallet(&self, event: &AccountCreated, now: DateTime<Utc>) -> Wallet {
        let status = if event.kyc_status == KycStatus::Approved {
            WalletStatus::Active
        } else {
            WalletStatus::Inactive
        };
        Wallet {
            wallet_id: Wallet::default_id(&event.account_id),
            account_id: event.account_id.clone(),
            wallet_type: WalletType::Primary,
            balance: Decimal::ZERO,
            currency: event.currency,
            status,
            is_default: true,
            daily_limit: self.config.default_daily_limit,
            monthly_limit: self.config.default_monthly_limit,
            created_at: now,
            updated_at: now,
            applied_ops: OpLog::default(),
        }
    }

    /// Materialise the default wallet and its debit card.
    ///
    /// Replays are no-ops, except that a re-emission after KYC approval
    /// promotes an inactive wallet (and its pending default card) to active.
    pub async fn provision_account(&self, event: &AccountCreated) -> WalletResult<Provisioned> {
        let now = Utc::now();
        let approved = event.kyc_status == KycStatus::Approved;
        let fresh = self.new_wallet(event, now);
        let wallet_id = fresh.wallet_id.clone();

        let wallet_created = self.store.insert_wallet(&fresh).await?;
        let wallet = if wallet_created {
            info!(account_id = %event.account_id, wallet_id = %wallet_id, status = %fresh.status, "Default wallet created");
            fresh
        } else {
            self.store
                .update_wallet(&wallet_id, |w| {
                    if approved && w.status == WalletStatus::Inactive {
                        w.status = WalletStatus::Active;
                        w.updated_at = now;
                    }
                    Ok(())
                })
                .await?
        };

        let card_id = VirtualCard::default_id(&wallet_id);
        let (card, card_created) = match self.store.find_card(&card_id).await? {
            Some(existing) => {
                let card = if wallet.is_active() && existing.card_status == CardStatus::Pending {
                    self.store
                        .update_card(&card_id, |c| c.transition(CardStatus::Active, now))
                        .await?
                } else {
                    existing
                };
                (card, false)
            }
            None => {
                let status = if wallet.is_active() {
                    CardStatus::Active
                } else {
                    CardStatus::Pending
                };
                let issued = self.build_card(
                    card_id.clone(),
                    &wallet,
                    CardType::Debit,
                    self.config.default_name_on_card.clone(),
                    wallet.daily_limit,
                    wallet.monthly_limit,
                    status,
                    now,
                )?;
                if self.store.insert_card(&issued.card).await? {
                    (issued.card, true)
                } else {
                    // lost a race with a concurrent delivery
                    (self.store.card(&card_id).await?, false)
                }
            }
        };

        if card_created {
            info!(account_id = %wallet.account_id, card_id = %card.id, "Default virtual card created");
            self.publish(&wallet.account_id, card_created_event(&card, now)).await;
        }

        Ok(Provisioned {
            wallet,
            card,
            wallet_created,
            card_created,
        })
    }

    /// Disable every wallet of an account. Cards follow their wallet.
    pub async fn disable_account(&self, account_id: &str) -> WalletResult<usize> {
        let now = Utc::now();
        let mut disabled = 0;
        for wallet in self.store.wallets_for_account(account_id).await? {
            if wallet.status == WalletStatus::Disabled {
                continue;
            }
            self.store
                .update_wallet(&wallet.wallet_id, |w| {
                    w.status = WalletStatus::Disabled;
                    w.updated_at = now;
                    Ok(())
                })
                .await?;
            disabled += 1;
        }
        info!(account_id, disabled, "Wallets disabled for account deletion");
        Ok(disabled)
    }

    // ========================================================================
    // Cards
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn build_card(
        &self,
        id: String,
        wallet: &Wallet,
        card_type: CardType,
        name_on_card: String,
        daily_limit: Decimal,
        monthly_limit: Decimal,
        status: CardStatus,
        now: DateTime<Utc>,
    ) -> WalletResult<IssuedCard> {
        let card_number = card::generate_card_number(&self.config.card_issuer_prefix)?;
        let cvv = card::generate_cvv();
        let cvv_hash = card::hash_cvv(&cvv, &self.config.kdf)?;
        let card = VirtualCard {
            id,
            wallet_id: wallet.wallet_id.clone(),
            account_id: wallet.account_id.clone(),
            card_type,
            card_brand: CardBrand::Visa,
            currency: wallet.currency,
            card_status: status,
            daily_limit,
            monthly_limit,
            name_on_card,
            card_number,
            cvv_hash,
            expiry_date: card::expiry_date(now.date_naive(), self.config.card_validity_years),
            is_active: status == CardStatus::Active,
            is_physical_card_requested: false,
            block_reason: None,
            block_reason_description: None,
            blocked_at: None,
            blocked_by: None,
            available_balance: Decimal::ZERO,
            total_topped_up: Decimal::ZERO,
            last_top_up_date: None,
            total_spend_today: Decimal::ZERO,
            total_spent_this_month: Decimal::ZERO,
            last_transaction_date: None,
            last_transaction_amount: None,
            physical_card_requested_at: None,
            delivery_address: None,
            delivery_city: None,
            delivery_country: None,
            delivery_postal_code: None,
            physical_card_status: None,
            card_metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            applied_ops: OpLog::default(),
        };
        Ok(IssuedCard { card, cvv })
    }

    /// Issue a card on one of the caller's wallets. The card stays `pending`
    /// until activated.
    pub async fn create_card(&self, caller: &str, req: &CreateCardRequest) -> WalletResult<IssuedCard> {
        if req.wallet_id.trim().is_empty() {
            return Err(WalletError::Validation("Wallet ID is required".into()));
        }
        let wallet = self.wallet_for(caller, &req.wallet_id).await?;
        if let Some(raw) = req.currency.as_deref().filter(|c| !c.is_empty()) {
            let currency: Currency = raw.parse().map_err(WalletError::Validation)?;
            if currency != wallet.currency {
                return Err(WalletError::CardCurrencyMismatch(wallet.currency.to_string()));
            }
        }
        let daily_limit = req.daily_limit.unwrap_or(wallet.daily_limit);
        let monthly_limit = req.monthly_limit.unwrap_or(wallet.monthly_limit);
        validate_limits(daily_limit, monthly_limit)?;
        let name_on_card = req
            .name_on_card
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.config.default_name_on_card.clone());

        let now = Utc::now();
        let issued = self.build_card(
            Uuid::new_v4().to_string(),
            &wallet,
            req.card_type,
            name_on_card,
            daily_limit,
            monthly_limit,
            CardStatus::Pending,
            now,
        )?;
        if !self.store.insert_card(&issued.card).await? {
            return Err(WalletError::Internal("card id collision".into()));
        }
        info!(card_id = %issued.card.id, wallet_id = %wallet.wallet_id, "Virtual card created");
        self.publish(&wallet.account_id, card_created_event(&issued.card, now))
            .await;
        Ok(issued)
    }

    pub async fn card(&self, card_id: &str) -> WalletResult<VirtualCard> {
        self.store.card(card_id).await
    }

    pub async fn card_for(&self, caller: &str, card_id: &str) -> WalletResult<VirtualCard> {
        let card = self.store.card(card_id).await?;
        ensure_owner(caller, &card.account_id)?;
        Ok(card)
    }

    pub async fn list_cards(&self, account_id: &str) -> WalletResult<Vec<VirtualCard>> {
        Ok(self.store.cards_for_account(account_id).await?)
    }

    pub async fn update_card(
        &self,
        caller: &str,
        card_id: &str,
        req: &UpdateCardRequest,
    ) -> WalletResult<VirtualCard> {
        self.card_for(caller, card_id).await?;
        let now = Utc::now();
        self.store
            .update_card(card_id, |c| {
                let daily = req.daily_limit.unwrap_or(c.daily_limit);
                let monthly = req.monthly_limit.unwrap_or(c.monthly_limit);
                validate_limits(daily, monthly)?;
                c.daily_limit = daily;
                c.monthly_limit = monthly;
                if let Some(name) = req.name_on_card.as_deref() {
                    if name.trim().is_empty() {
                        return Err(WalletError::Validation("Name on card cannot be empty".into()));
                    }
                    c.name_on_card = name.to_string();
                }
                if let Some(active) = req.is_active {
                    let next = if active {
                        CardStatus::Active
                    } else {
                        CardStatus::Inactive
                    };
                    c.transition(next, now)?;
                }
                c.updated_at = now;
                Ok(())
            })
            .await
    }

    pub async fn block_card(
        &self,
        caller: &str,
        card_id: &str,
        req: &BlockCardRequest,
    ) -> WalletResult<VirtualCard> {
        self.card_for(caller, card_id).await?;
        let now = Utc::now();
        let card = self
            .store
            .update_card(card_id, |c| {
                if c.card_status == CardStatus::Blocked {
                    return Err(WalletError::CardAlreadyBlocked);
                }
                c.transition(CardStatus::Blocked, now)?;
                c.block_reason = Some(req.block_reason);
                c.block_reason_description = Some(req.block_reason_description.clone());
                c.blocked_at = Some(now);
                c.blocked_by = Some(caller.to_string());
                Ok(())
            })
            .await?;
        info!(card_id, reason = %req.block_reason, "Virtual card blocked");
        self.publish(
            &card.account_id,
            VirtualCardBlocked {
                card_id: card.id.clone(),
                account_id: card.account_id.clone(),
                block_reason: req.block_reason.to_string(),
                blocked_by: caller.to_string(),
                timestamp: now,
            },
        )
        .await;
        Ok(card)
    }

    /// Add funds to the card balance. The linked wallet is not debited.
    pub async fn top_up(&self, caller: &str, card_id: &str, amount: Decimal) -> WalletResult<VirtualCard> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount);
        }
        self.card_for(caller, card_id).await?;
        let now = Utc::now();
        let card = self
            .store
            .update_card(card_id, |c| {
                if matches!(c.card_status, CardStatus::Blocked | CardStatus::Expired) {
                    return Err(WalletError::CardNotToppable(c.card_status));
                }
                c.available_balance += amount;
                c.total_topped_up += amount;
                c.last_top_up_date = Some(now);
                c.updated_at = now;
                Ok(())
            })
            .await?;
        self.publish(
            &card.account_id,
            VirtualCardToppedUp {
                card_id: card.id.clone(),
                account_id: card.account_id.clone(),
                wallet_id: card.wallet_id.clone(),
                amount,
                new_balance: card.available_balance,
                timestamp: now,
            },
        )
        .await;
        Ok(card)
    }

    /// Record a physical-card request. Repeated requests overwrite the
    /// delivery details (latest write wins).
    pub async fn request_physical(
        &self,
        caller: &str,
        card_id: &str,
        req: &PhysicalCardRequest,
    ) -> WalletResult<VirtualCard> {
        if [&req.delivery_address, &req.delivery_city, &req.delivery_country]
            .iter()
            .any(|f| f.trim().is_empty())
        {
            return Err(WalletError::Validation(
                "Delivery address, city and country are required".into(),
            ));
        }
        self.card_for(caller, card_id).await?;
        let now = Utc::now();
        let card = self
            .store
            .update_card(card_id, |c| {
                if matches!(c.card_status, CardStatus::Blocked | CardStatus::Expired) {
                    return Err(WalletError::CardNotActive);
                }
                c.is_physical_card_requested = true;
                c.physical_card_requested_at = Some(now);
                c.physical_card_status = Some(PhysicalCardStatus::Pending);
                c.delivery_address = Some(req.delivery_address.clone());
                c.delivery_city = Some(req.delivery_city.clone());
                c.delivery_country = Some(req.delivery_country.clone());
                c.delivery_postal_code = Some(req.delivery_postal_code.clone());
                c.updated_at = now;
                Ok(())
            })
            .await?;
        self.publish(
            &card.account_id,
            PhysicalCardRequested {
                card_id: card.id.clone(),
                account_id: card.account_id.clone(),
                delivery_address: req.delivery_address.clone(),
                delivery_city: req.delivery_city.clone(),
                delivery_country: req.delivery_country.clone(),
                timestamp: now,
            },
        )
        .await;
        Ok(card)
    }

    pub async fn delete_card(&self, caller: &str, card_id: &str) -> WalletResult<VirtualCard> {
        let card = self.card_for(caller, card_id).await?;
        self.store.delete_card(&card).await?;
        info!(card_id, account_id = %card.account_id, "Virtual card deleted");
        self.publish(
            &card.account_id,
            VirtualCardDeleted {
                card_id: card.id.clone(),
                account_id: card.account_id.clone(),
                last_four_digits: card.last_four_digits().to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;
        Ok(card)
    }

    /// Card purchase: spend from the card, then debit the backing wallet.
    /// A failed wallet leg reverses the card leg before returning.
    pub async fn charge_card(&self, card_id: &str, op_id: &str, amount: Decimal) -> WalletResult<CardCharge> {
        validate_op(op_id, amount)?;
        let now = Utc::now();
        let window = self.window();

        let mut out = None;
        let card = self
            .store
            .update_card(card_id, |c| {
                out = Some(c.charge(op_id, amount, window, now)?);
                Ok(())
            })
            .await?;
        let card_leg = captured(out)?;

        match self.debit(&card.wallet_id, op_id, amount).await {
            Ok(wallet_leg) => Ok(CardCharge {
                card: card_leg,
                wallet: wallet_leg,
            }),
            Err(e) => {
                warn!(card_id, op_id, error = %e, "Wallet leg failed, reversing card charge");
                if let Err(undo) = self.reverse_card_leg(card_id, op_id).await {
                    warn!(card_id, op_id, error = %undo, "Card charge reversal failed");
                }
                Err(e)
            }
        }
    }

    async fn reverse_card_leg(&self, card_id: &str, op_id: &str) -> WalletResult<BalanceChange> {
        let now = Utc::now();
        let window = self.window();
        let mut out = None;
        self.store
            .update_card(card_id, |c| {
                out = Some(c.reverse(op_id, window, now));
                Ok(())
            })
            .await?;
        captured(out)
    }

    /// Undo both legs of a card purchase
    pub async fn reverse_card_charge(&self, card_id: &str, op_id: &str) -> WalletResult<CardCharge> {
        let card = self.store.card(card_id).await?;
        let wallet = self.reverse(&card.wallet_id, op_id).await?;
        let card = self.reverse_card_leg(card_id, op_id).await?;
        Ok(CardCharge { card, wallet })
    }
}

fn card_created_event(card: &VirtualCard, now: DateTime<Utc>) -> VirtualCardCreated {
    VirtualCardCreated {
        card_id: card.id.clone(),
        account_id: card.account_id.clone(),
        wallet_id: card.wallet_id.clone(),
        card_type: card.card_type.to_string(),
        currency: card.currency,
        last_four_digits: card.last_four_digits().to_string(),
        timestamp: now,
    }
}

fn ensure_owner(caller: &str, owner: &AccountId) -> WalletResult<()> {
    if caller != owner {
        return Err(WalletError::Forbidden);
    }
    Ok(())
}

fn validate_op(op_id: &str, amount: Decimal) -> WalletResult<()> {
    if op_id.trim().is_empty() {
        return Err(WalletError::Validation("Operation ID is required".into()));
    }
    if amount <= Decimal::ZERO {
        return Err(WalletError::InvalidAmount);
    }
    Ok(())
}

fn validate_limits(daily: Decimal, monthly: Decimal) -> WalletResult<()> {
    if daily <= Decimal::ZERO || monthly <= Decimal::ZERO {
        return Err(WalletError::Validation("Card limits must be greater than zero".into()));
    }
    if daily > monthly {
        return Err(WalletError::Validation(
            "Daily limit cannot exceed monthly limit".into(),
        ));
    }
    Ok(())
}

fn captured(out: Option<BalanceChange>) -> WalletResult<BalanceChange> {
    out.ok_or_else(|| WalletError::Internal("balance update produced no result".into()))
}
