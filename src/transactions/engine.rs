//! Transaction Engine
//!
//! Transfer and card-purchase pipelines. Once the pending record exists the
//! engine either completes it or fails it (after compensating whatever money
//! moved) before returning. The one exception is a compensation that itself
//! cannot be confirmed: the record then stays `pending` and the reaper
//! retries the compensation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::TransactionsConfig;
use super::adapters::{AdapterError, Adapters};
use super::error::{TransactionError, TransactionResult};
use super::history::HistoryQuery;
use super::idempotency::{IdempotencyStore, Reservation};
use super::model::*;
use super::store::{TransactionStore, account_index, new_reference, wallet_index};
use crate::core_types::Currency;
use crate::events::payloads::{
    CardPurchase, MoneyReceived, MoneySent, TransactionCompleted, TransactionCreated,
    TransactionFailed,
};
use crate::events::{DomainEvent, EventProducer};
use crate::fraud::{RiskAssessmentRequest, RiskAssessmentResponse};
use crate::storage::Store;
use crate::wallet::{CardStatus, WalletStatus};

const REFERENCE_ATTEMPTS: usize = 5;

const TIMED_OUT_REASON: &str = "Transaction timed out and was reversed";

/// Status and exact body of a pipeline response, as cached for replays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: String,
}

impl StoredResponse {
    fn json<T: Serialize>(status_code: u16, body: &T) -> TransactionResult<Self> {
        let body = serde_json::to_string(body)
            .map_err(|e| TransactionError::Internal(format!("response encoding: {}", e)))?;
        Ok(Self { status_code, body })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Result of the fraud gate
enum Gate {
    Proceed(Transaction),
    /// The transaction was failed; the message goes to the caller
    Stop(Transaction, String),
}

pub struct TransactionEngine {
    store: TransactionStore,
    idempotency: IdempotencyStore,
    adapters: Adapters,
    producer: EventProducer,
    config: TransactionsConfig,
    fraud_fail_open: bool,
}

impl TransactionEngine {
    pub fn new(
        store: Store,
        adapters: Adapters,
        producer: EventProducer,
        config: TransactionsConfig,
        fraud_fail_open: bool,
    ) -> Self {
        Self {
            store: TransactionStore::new(store.clone()),
            idempotency: IdempotencyStore::new(
                store,
                config.idempotency_ttl(),
                config.in_flight_ttl(),
            ),
            adapters,
            producer,
            config,
            fraud_fail_open,
        }
    }

    pub fn config(&self) -> &TransactionsConfig {
        &self.config
    }

    async fn publish<E: DomainEvent>(&self, key: &str, event: E) {
        if let Err(e) = self.producer.emit(key, &event).await {
            warn!(topic = E::TOPIC, key, error = %e, "Failed to publish event");
        }
    }

    /// Run `work` at most once per `(caller, key)`.
    ///
    /// Responses are cached once the outcome is final (completed, or failed
    /// with its record persisted). Errors release the key so the caller can
    /// retry after fixing the cause.
    async fn idempotent<F>(&self, caller: &str, key: &str, work: F) -> TransactionResult<StoredResponse>
    where
        F: Future<Output = TransactionResult<StoredResponse>>,
    {
        match self.idempotency.reserve(caller, key).await? {
            Reservation::Cached(resp) => return Ok(resp),
            Reservation::InProgress => return Err(TransactionError::RequestInProgress),
            Reservation::Fresh => {}
        }
        match work.await {
            Ok(resp) => {
                if let Err(e) = self.idempotency.finalize(caller, key, &resp).await {
                    warn!(account_id = caller, key, error = %e, "Failed to cache response");
                }
                Ok(resp)
            }
            Err(e) => {
                if let Err(release) = self.idempotency.release(caller, key).await {
                    warn!(account_id = caller, key, error = %release, "Failed to release idempotency key");
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Transfer
    // ========================================================================

    pub async fn transfer(&self, caller: &str, req: &TransferRequest) -> TransactionResult<StoredResponse> {
        validate_transfer(req)?;
        self.idempotent(caller, &req.idempotency_key, self.run_transfer(caller, req))
            .await
    }

    async fn run_transfer(&self, caller: &str, req: &TransferRequest) -> TransactionResult<StoredResponse> {
        let wallets = &self.adapters.wallets;

        let sender = wallets
            .wallet(req.sender_wallet_id.trim())
            .await
            .map_err(lookup(TransactionError::SenderWalletNotFound))?;
        if sender.account_id != caller {
            return Err(TransactionError::Forbidden);
        }
        if sender.status != WalletStatus::Active {
            return Err(TransactionError::SenderWalletNotActive);
        }

        let receiver = self
            .adapters
            .users
            .find_by_omni_tag(req.receiver_omni_tag.trim())
            .await?
            .ok_or(TransactionError::ReceiverNotFound)?;
        if receiver.account_id == sender.account_id {
            return Err(TransactionError::SelfTransfer);
        }
        let receiver_wallet = wallets
            .default_wallet(&receiver.account_id)
            .await
            .map_err(lookup(TransactionError::ReceiverWalletNotFound))?;

        if sender.currency != receiver_wallet.currency {
            return Err(TransactionError::CurrencyMismatch {
                sender: sender.currency,
                receiver: receiver_wallet.currency,
            });
        }
        if sender.balance < req.amount {
            return Err(TransactionError::InsufficientBalance);
        }

        let now = Utc::now();
        let mut metadata = BTreeMap::new();
        metadata.insert("receiverOmniTag".to_string(), json!(receiver.omni_tag));
        metadata.insert("idempotencyKey".to_string(), json!(req.idempotency_key));
        let pending = Transaction {
            id: Uuid::new_v4().to_string(),
            reference: String::new(),
            sender_account_id: Some(sender.account_id.clone()),
            receiver_account_id: Some(receiver.account_id.clone()),
            sender_wallet_id: Some(sender.wallet_id.clone()),
            receiver_wallet_id: Some(receiver_wallet.wallet_id.clone()),
            card_id: None,
            amount: req.amount,
            currency: sender.currency,
            transaction_type: TransactionType::Transfer,
            transaction_category: TransactionCategory::Debit,
            status: TransactionStatus::Pending,
            description: req.description.clone(),
            balance_before: sender.balance,
            balance_after: sender.balance - req.amount,
            failed_reason: None,
            metadata,
            created_at: now,
            completed_at: None,
            updated_at: now,
        };
        let tx = self.persist(pending).await?;
        info!(
            transaction_id = %tx.id,
            reference = %tx.reference,
            amount = %tx.amount,
            currency = %tx.currency,
            "Transfer pending"
        );
        self.publish(caller, created_event(&tx)).await;

        let tx = match self.gate(tx, &receiver.account_id).await? {
            Gate::Proceed(tx) => tx,
            Gate::Stop(tx, message) => return transfer_failed(&tx, message),
        };

        // Saga: debit the sender, then credit the receiver
        let debit_op = format!("{}:debit", tx.id);
        let debit = match wallets.debit(&sender.wallet_id, &debit_op, tx.amount).await {
            Ok(change) => change,
            Err(e) => return self.abort_transfer(&tx, e).await,
        };
        let credit_op = format!("{}:credit", tx.id);
        let credit = match wallets
            .credit(&receiver_wallet.wallet_id, &credit_op, tx.amount)
            .await
        {
            Ok(change) => change,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "Credit leg failed, compensating debit");
                return self.abort_transfer(&tx, e).await;
            }
        };

        let now = Utc::now();
        let completed = self
            .store
            .update(&tx.id, |t| {
                t.balance_before = debit.balance_before;
                t.balance_after = debit.balance_after;
                t.metadata
                    .insert("receiverBalanceAfter".to_string(), json!(credit.balance_after));
                t.transition(TransactionStatus::Completed, None, now)
                    .map_err(TransactionError::InvalidTransition)
            })
            .await;
        let tx = match completed {
            Ok(tx) => tx,
            Err(TransactionError::InvalidTransition(_)) => {
                // The reaper got here first and reversed both legs
                let tx = self.store.get(&tx.id).await?;
                let reason = tx.failed_reason.clone().unwrap_or_default();
                return transfer_failed(&tx, reason);
            }
            Err(e) => return Err(e),
        };

        info!(
            transaction_id = %tx.id,
            reference = %tx.reference,
            sender_balance = %debit.balance_after,
            receiver_balance = %credit.balance_after,
            "Transfer completed"
        );
        self.publish(
            caller,
            completed_event(&tx, Some(debit.balance_after), Some(credit.balance_after)),
        )
        .await;
        self.publish(
            &sender.account_id,
            MoneySent {
                account_id: sender.account_id.clone(),
                wallet_id: sender.wallet_id.clone(),
                transaction_id: tx.id.clone(),
                reference: tx.reference.clone(),
                amount: tx.amount,
                currency: tx.currency,
                receiver_account_id: Some(receiver.account_id.clone()),
                receiver_omni_tag: Some(receiver.omni_tag.clone()),
                description: tx.description.clone(),
                balance_after: debit.balance_after,
                timestamp: now,
            },
        )
        .await;
        self.publish(
            &receiver.account_id,
            MoneyReceived {
                account_id: receiver.account_id.clone(),
                wallet_id: receiver_wallet.wallet_id.clone(),
                transaction_id: tx.id.clone(),
                reference: tx.reference.clone(),
                amount: tx.amount,
                currency: tx.currency,
                sender_account_id: Some(sender.account_id.clone()),
                sender_omni_tag: None,
                description: tx.description.clone(),
                balance_after: credit.balance_after,
                timestamp: now,
            },
        )
        .await;

        StoredResponse::json(
            200,
            &TransferResponse {
                status: "success".to_string(),
                message: "Transfer completed successfully".to_string(),
                transaction_id: Some(tx.id.clone()),
                reference: Some(tx.reference.clone()),
                sender_balance: Some(debit.balance_after),
                receiver_balance: Some(credit.balance_after),
                transaction: Some(Box::new(tx)),
            },
        )
    }

    /// A money leg failed: undo every leg, then fail the record
    async fn abort_transfer(&self, tx: &Transaction, cause: AdapterError) -> TransactionResult<StoredResponse> {
        if let Err(undo) = self.undo_legs(tx).await {
            error!(
                transaction_id = %tx.id,
                cause = %cause,
                error = %undo,
                "Compensation failed, leaving transaction pending for the reaper"
            );
            return Err(cause.into());
        }
        let reason = cause.to_string();
        let failed = self.fail(&tx.id, &reason, BTreeMap::new()).await?;
        transfer_failed(&failed, reason)
    }

    // ========================================================================
    // Card purchase
    // ========================================================================

    pub async fn purchase(&self, caller: &str, req: &PurchaseRequest) -> TransactionResult<StoredResponse> {
        let currency = validate_purchase(req)?;
        self.idempotent(
            caller,
            &req.idempotency_key,
            self.run_purchase(caller, req, currency),
        )
        .await
    }

    async fn run_purchase(
        &self,
        caller: &str,
        req: &PurchaseRequest,
        currency: Currency,
    ) -> TransactionResult<StoredResponse> {
        let wallets = &self.adapters.wallets;

        let card = wallets
            .card(req.card_id.trim())
            .await
            .map_err(lookup(TransactionError::CardNotFound))?;
        if card.account_id != caller {
            return Err(TransactionError::Forbidden);
        }
        if card.card_status != CardStatus::Active {
            return Err(TransactionError::CardNotActive);
        }
        let wallet = wallets
            .wallet(&card.wallet_id)
            .await
            .map_err(lookup(TransactionError::WalletNotFound))?;
        if wallet.status != WalletStatus::Active {
            return Err(TransactionError::WalletNotActive);
        }
        if card.currency != currency {
            return Err(TransactionError::CardCurrencyMismatch);
        }
        if card.available_balance < req.amount {
            return Err(TransactionError::InsufficientCardBalance);
        }
        if req.amount > card.daily_limit {
            return Err(TransactionError::DailyLimitExceeded);
        }

        let now = Utc::now();
        let mut metadata = BTreeMap::new();
        metadata.insert("merchantName".to_string(), json!(req.merchant_name));
        metadata.insert("merchantCategory".to_string(), json!(req.merchant_category));
        metadata.insert("idempotencyKey".to_string(), json!(req.idempotency_key));
        metadata.insert("cardType".to_string(), json!(card.card_type));
        metadata.insert("cardBrand".to_string(), json!(card.card_brand));
        let description = if req.description.trim().is_empty() {
            format!("Purchase at {}", req.merchant_name)
        } else {
            req.description.clone()
        };
        let pending = Transaction {
            id: Uuid::new_v4().to_string(),
            reference: String::new(),
            sender_account_id: Some(card.account_id.clone()),
            receiver_account_id: None,
            sender_wallet_id: Some(wallet.wallet_id.clone()),
            receiver_wallet_id: None,
            card_id: Some(card.id.clone()),
            amount: req.amount,
            currency,
            transaction_type: TransactionType::CardPurchase,
            transaction_category: TransactionCategory::Debit,
            status: TransactionStatus::Pending,
            description,
            balance_before: card.available_balance,
            balance_after: card.available_balance - req.amount,
            failed_reason: None,
            metadata,
            created_at: now,
            completed_at: None,
            updated_at: now,
        };
        let tx = self.persist(pending).await?;
        info!(
            transaction_id = %tx.id,
            reference = %tx.reference,
            card_id = %card.id,
            merchant = %req.merchant_name,
            amount = %tx.amount,
            "Card purchase pending"
        );
        self.publish(caller, created_event(&tx)).await;

        let tx = match self.gate(tx, &req.merchant_name).await? {
            Gate::Proceed(tx) => tx,
            Gate::Stop(tx, message) => return purchase_failed(&tx, message),
        };

        let op = purchase_op(&tx.id);
        let charge = match wallets.charge_card(&card.id, &op, tx.amount).await {
            Ok(charge) => charge,
            Err(e) => {
                if e.is_unavailable() {
                    if let Err(undo) = self.undo_legs(&tx).await {
                        error!(
                            transaction_id = %tx.id,
                            error = %undo,
                            "Card charge outcome unknown and reversal failed"
                        );
                        return Err(e.into());
                    }
                }
                let reason = e.to_string();
                let failed = self.fail(&tx.id, &reason, BTreeMap::new()).await?;
                return purchase_failed(&failed, reason);
            }
        };

        let now = Utc::now();
        let completed = self
            .store
            .update(&tx.id, |t| {
                t.balance_before = charge.card.balance_before;
                t.balance_after = charge.card.balance_after;
                t.metadata
                    .insert("walletBalanceAfter".to_string(), json!(charge.wallet.balance_after));
                t.transition(TransactionStatus::Completed, None, now)
                    .map_err(TransactionError::InvalidTransition)
            })
            .await;
        let tx = match completed {
            Ok(tx) => tx,
            Err(TransactionError::InvalidTransition(_)) => {
                let tx = self.store.get(&tx.id).await?;
                let reason = tx.failed_reason.clone().unwrap_or_default();
                return purchase_failed(&tx, reason);
            }
            Err(e) => return Err(e),
        };

        info!(
            transaction_id = %tx.id,
            reference = %tx.reference,
            card_balance = %charge.card.balance_after,
            "Card purchase completed"
        );
        self.publish(
            caller,
            completed_event(&tx, Some(charge.card.balance_after), None),
        )
        .await;
        self.publish(
            caller,
            CardPurchase {
                account_id: card.account_id.clone(),
                wallet_id: wallet.wallet_id.clone(),
                card_id: card.id.clone(),
                transaction_id: tx.id.clone(),
                reference: tx.reference.clone(),
                amount: tx.amount,
                currency: tx.currency,
                merchant_name: req.merchant_name.clone(),
                merchant_category: req.merchant_category.clone(),
                description: tx.description.clone(),
                card_balance: charge.card.balance_after,
                wallet_balance: charge.wallet.balance_after,
                timestamp: now,
            },
        )
        .await;

        StoredResponse::json(
            200,
            &PurchaseResponse {
                status: "success".to_string(),
                message: "Purchase completed successfully".to_string(),
                transaction_id: Some(tx.id.clone()),
                reference: Some(tx.reference.clone()),
                card_balance: Some(charge.card.balance_after),
                wallet_balance: Some(charge.wallet.balance_after),
                transaction: Some(Box::new(tx)),
            },
        )
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    /// Allocate a unique reference and write the pending record
    async fn persist(&self, mut tx: Transaction) -> TransactionResult<Transaction> {
        for _ in 0..REFERENCE_ATTEMPTS {
            tx.reference = new_reference(tx.created_at);
            if self.store.reserve_reference(&tx).await? {
                self.store.create(&tx).await?;
                return Ok(tx);
            }
            warn!(reference = %tx.reference, "Reference collision, regenerating");
        }
        Err(TransactionError::Internal(
            "could not allocate a unique reference".into(),
        ))
    }

    /// Synchronous fraud check. Only `decline` stops the pipeline; an
    /// unreachable scorer lets it through when configured to fail open.
    async fn gate(&self, tx: Transaction, counterparty: &str) -> TransactionResult<Gate> {
        let mut extra = HashMap::new();
        for (k, v) in &tx.metadata {
            if k != "idempotencyKey" {
                extra.insert(k.clone(), v.clone());
            }
        }
        let req = RiskAssessmentRequest {
            transaction_id: tx.id.clone(),
            sender_account_id: tx.sender_account_id.clone().unwrap_or_default(),
            receiver_account_id: counterparty.to_string(),
            amount: tx.amount,
            currency: tx.currency.to_string(),
            transaction_type: tx.transaction_type.to_string(),
            description: tx.description.clone(),
            metadata: extra,
        };

        match self.adapters.risk.assess(&req).await {
            Ok(assessment) => {
                let meta = risk_metadata(&assessment);
                if assessment.decision.blocks() {
                    warn!(
                        transaction_id = %tx.id,
                        risk_score = assessment.risk_score,
                        risk_level = %assessment.risk_level,
                        "Declined by fraud detection"
                    );
                    let reason = format!("Declined by fraud detection: {}", assessment.risk_level);
                    let failed = self.fail(&tx.id, &reason, meta).await?;
                    return Ok(Gate::Stop(
                        failed,
                        format!(
                            "Transaction declined due to risk assessment: {}",
                            assessment.risk_level
                        ),
                    ));
                }
                Ok(Gate::Proceed(self.annotate(&tx.id, meta).await?))
            }
            Err(e) if e.is_unavailable() && self.fraud_fail_open => {
                warn!(transaction_id = %tx.id, error = %e, "Fraud detection unavailable, proceeding");
                let meta = BTreeMap::from([("riskDecision".to_string(), json!("unavailable"))]);
                Ok(Gate::Proceed(self.annotate(&tx.id, meta).await?))
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "Risk assessment failed");
                let meta = BTreeMap::from([("riskDecision".to_string(), json!("unavailable"))]);
                let failed = self
                    .fail(&tx.id, &format!("Risk assessment failed: {}", e), meta)
                    .await?;
                Ok(Gate::Stop(
                    failed,
                    "Transaction could not be risk assessed".to_string(),
                ))
            }
        }
    }

    async fn annotate(&self, id: &str, meta: BTreeMap<String, Value>) -> TransactionResult<Transaction> {
        self.store
            .update(id, |t| {
                t.metadata.extend(meta.clone());
                Ok(())
            })
            .await
    }

    /// Move a pending record to `failed` and announce it. Records that are
    /// already terminal are returned unchanged.
    async fn fail(
        &self,
        id: &str,
        reason: &str,
        meta: BTreeMap<String, Value>,
    ) -> TransactionResult<Transaction> {
        let now = Utc::now();
        let mut changed = false;
        let tx = self
            .store
            .update(id, |t| {
                changed = false;
                if t.status != TransactionStatus::Pending {
                    return Ok(());
                }
                t.metadata.extend(meta.clone());
                t.transition(TransactionStatus::Failed, Some(reason.to_string()), now)
                    .map_err(TransactionError::InvalidTransition)?;
                changed = true;
                Ok(())
            })
            .await?;
        if changed {
            info!(transaction_id = %tx.id, reason, "Transaction failed");
            self.publish(event_key(&tx), failed_event(&tx)).await;
        }
        Ok(tx)
    }

    /// Reverse every money leg a transaction may have applied. Reversals are
    /// idempotent and tombstone legs that never landed.
    async fn undo_legs(&self, tx: &Transaction) -> Result<(), AdapterError> {
        let wallets = &self.adapters.wallets;
        if tx.transaction_type == TransactionType::CardPurchase {
            if let Some(card_id) = &tx.card_id {
                wallets.reverse_card_charge(card_id, &purchase_op(&tx.id)).await?;
            }
            return Ok(());
        }
        if let Some(receiver_wallet) = &tx.receiver_wallet_id {
            wallets
                .reverse(receiver_wallet, &format!("{}:credit", tx.id))
                .await?;
        }
        if let Some(sender_wallet) = &tx.sender_wallet_id {
            wallets
                .reverse(sender_wallet, &format!("{}:debit", tx.id))
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Pending transactions created more than `threshold` ago
    pub async fn stale_pending(
        &self,
        threshold: chrono::Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> TransactionResult<Vec<Transaction>> {
        Ok(self.store.stale_pending(now - threshold, limit).await?)
    }

    /// Compensate a stuck transaction and fail it
    pub async fn compensate(&self, tx: &Transaction) -> TransactionResult<Transaction> {
        self.undo_legs(tx).await?;
        self.fail(&tx.id, TIMED_OUT_REASON, BTreeMap::new()).await
    }

    // ========================================================================
    // History
    // ========================================================================

    pub async fn history_for_account(
        &self,
        caller: &str,
        account_id: &str,
        query: &HistoryQuery,
    ) -> TransactionResult<TransactionPage> {
        if caller != account_id {
            return Err(TransactionError::Forbidden);
        }
        self.page(&account_index(account_id), query).await
    }

    pub async fn history_for_wallet(
        &self,
        caller: &str,
        wallet_id: &str,
        query: &HistoryQuery,
    ) -> TransactionResult<TransactionPage> {
        let wallet = self
            .adapters
            .wallets
            .wallet(wallet_id)
            .await
            .map_err(lookup(TransactionError::WalletNotFound))?;
        if wallet.account_id != caller {
            return Err(TransactionError::Forbidden);
        }
        self.page(&wallet_index(wallet_id), query).await
    }

    async fn page(&self, index: &str, query: &HistoryQuery) -> TransactionResult<TransactionPage> {
        let req = query.parse(self.config.default_limit, self.config.max_limit)?;
        let (transactions, total) = self
            .store
            .page(index, &req.filter, req.limit, req.offset)
            .await?;
        Ok(TransactionPage {
            transactions,
            total,
            limit: req.limit,
            offset: req.offset,
        })
    }

    /// A single transaction, visible to either party
    pub async fn transaction_for(&self, caller: &str, id: &str) -> TransactionResult<Transaction> {
        let tx = self.store.get(id).await?;
        if !tx.account_ids().contains(&caller) {
            return Err(TransactionError::Forbidden);
        }
        Ok(tx)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_transfer(req: &TransferRequest) -> TransactionResult<()> {
    if req.amount <= Decimal::ZERO {
        return Err(TransactionError::Validation("Amount must be greater than 0".into()));
    }
    if req.idempotency_key.trim().is_empty() {
        return Err(TransactionError::Validation("Idempotency key is required".into()));
    }
    if req.sender_wallet_id.trim().is_empty() {
        return Err(TransactionError::Validation("Sender wallet ID is required".into()));
    }
    if req.receiver_omni_tag.trim().is_empty() {
        return Err(TransactionError::Validation("Receiver OmniTag is required".into()));
    }
    Ok(())
}

fn validate_purchase(req: &PurchaseRequest) -> TransactionResult<Currency> {
    if req.card_id.trim().is_empty() {
        return Err(TransactionError::Validation("Card ID is required".into()));
    }
    if req.merchant_name.trim().is_empty() {
        return Err(TransactionError::Validation("Merchant name is required".into()));
    }
    if req.amount <= Decimal::ZERO {
        return Err(TransactionError::Validation("Amount must be greater than 0".into()));
    }
    if req.idempotency_key.trim().is_empty() {
        return Err(TransactionError::Validation("Idempotency key is required".into()));
    }
    req.currency
        .trim()
        .parse::<Currency>()
        .map_err(|_| TransactionError::UnsupportedCurrency(req.currency.clone()))
}

/// Not-found becomes `missing`; everything else keeps its adapter mapping
fn lookup(missing: TransactionError) -> impl FnOnce(AdapterError) -> TransactionError {
    move |e| {
        if e.is_not_found() {
            missing
        } else {
            e.into()
        }
    }
}

fn purchase_op(tx_id: &str) -> String {
    format!("{}:purchase", tx_id)
}

fn event_key(tx: &Transaction) -> &str {
    tx.sender_account_id
        .as_deref()
        .or(tx.receiver_account_id.as_deref())
        .unwrap_or(tx.id.as_str())
}

fn risk_metadata(a: &RiskAssessmentResponse) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("riskScore".to_string(), json!(a.risk_score)),
        ("riskLevel".to_string(), json!(a.risk_level)),
        ("riskDecision".to_string(), json!(a.decision)),
        ("riskReasons".to_string(), json!(a.reasons)),
    ])
}

fn transfer_failed(tx: &Transaction, message: String) -> TransactionResult<StoredResponse> {
    let mut resp = TransferResponse::failed(message);
    resp.transaction_id = Some(tx.id.clone());
    resp.reference = Some(tx.reference.clone());
    resp.transaction = Some(Box::new(tx.clone()));
    StoredResponse::json(400, &resp)
}

fn purchase_failed(tx: &Transaction, message: String) -> TransactionResult<StoredResponse> {
    let mut resp = PurchaseResponse::failed(message);
    resp.transaction_id = Some(tx.id.clone());
    resp.reference = Some(tx.reference.clone());
    resp.transaction = Some(Box::new(tx.clone()));
    StoredResponse::json(400, &resp)
}

fn created_event(tx: &Transaction) -> TransactionCreated {
    TransactionCreated {
        transaction_id: tx.id.clone(),
        reference: tx.reference.clone(),
        sender_account_id: tx.sender_account_id.clone(),
        receiver_account_id: tx.receiver_account_id.clone(),
        sender_wallet_id: tx.sender_wallet_id.clone(),
        receiver_wallet_id: tx.receiver_wallet_id.clone(),
        amount: tx.amount,
        currency: tx.currency,
        transaction_type: tx.transaction_type,
        transaction_category: tx.transaction_category,
        status: tx.status,
        description: tx.description.clone(),
        timestamp: tx.created_at,
    }
}

fn completed_event(
    tx: &Transaction,
    sender_balance_after: Option<Decimal>,
    receiver_balance_after: Option<Decimal>,
) -> TransactionCompleted {
    TransactionCompleted {
        transaction_id: tx.id.clone(),
        reference: tx.reference.clone(),
        sender_account_id: tx.sender_account_id.clone(),
        receiver_account_id: tx.receiver_account_id.clone(),
        sender_wallet_id: tx.sender_wallet_id.clone(),
        receiver_wallet_id: tx.receiver_wallet_id.clone(),
        amount: tx.amount,
        currency: tx.currency,
        transaction_type: tx.transaction_type,
        transaction_category: tx.transaction_category,
        description: tx.description.clone(),
        sender_balance_after,
        receiver_balance_after,
        timestamp: tx.updated_at,
        completed_at: tx.completed_at.unwrap_or(tx.updated_at),
    }
}

fn failed_event(tx: &Transaction) -> TransactionFailed {
    TransactionFailed {
        transaction_id: tx.id.clone(),
        reference: tx.reference.clone(),
        sender_account_id: tx.sender_account_id.clone(),
        receiver_account_id: tx.receiver_account_id.clone(),
        amount: tx.amount,
        currency: tx.currency,
        transaction_type: tx.transaction_type,
        transaction_category: tx.transaction_category,
        description: tx.description.clone(),
        failed_reason: tx.failed_reason.clone().unwrap_or_default(),
        timestamp: tx.updated_at,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::events::topics;
    use crate::fraud::{Decision, RiskLevel};

    #[tokio::test]
    async fn test_transfer_happy_path() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;

        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 200);
        let json = body(&resp);
        assert_eq!(json["status"], "success");
        assert_eq!(json["message"], "Transfer completed successfully");
        assert_eq!(json["senderBalance"], 90.0);
        assert_eq!(json["receiverBalance"], 10.0);
        assert_eq!(json["transaction"]["status"], "completed");
        assert_eq!(json["transaction"]["balanceBefore"], 100.0);
        assert_eq!(json["transaction"]["balanceAfter"], 90.0);
        assert_eq!(json["transaction"]["metadata"]["receiverOmniTag"], "B1");
        assert!(json["reference"].as_str().unwrap().starts_with("TXN-"));

        assert_eq!(h.balance("acc-a").await, Decimal::from(90));
        assert_eq!(h.balance("acc-b").await, Decimal::from(10));
        assert_eq!(h.risk.calls(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(h.broker.records(topics::TRANSACTION_CREATED).len(), 1);
        assert_eq!(h.broker.records(topics::TRANSACTION_COMPLETED).len(), 1);
        assert_eq!(h.broker.records(topics::MONEY_SENT).len(), 1);
        let received = h.broker.records(topics::MONEY_RECEIVED);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].key, "acc-b");
    }

    #[tokio::test]
    async fn test_replay_returns_identical_body() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        let first = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        let second = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.balance("acc-a").await, Decimal::from(90));
        assert_eq!(h.balance("acc-b").await, Decimal::from(10));
        assert_eq!(h.risk.calls(), 1);
    }

    #[tokio::test]
    async fn test_validation_messages() {
        let h = Harness::new().await;
        let mut req = Harness::transfer_req(0, "K1");
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert_eq!(err.to_string(), "Amount must be greater than 0");

        req.amount = Decimal::ONE;
        req.idempotency_key = " ".into();
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert_eq!(err.to_string(), "Idempotency key is required");

        req.idempotency_key = "K".into();
        req.receiver_omni_tag = String::new();
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert_eq!(err.to_string(), "Receiver OmniTag is required");
    }

    #[tokio::test]
    async fn test_pre_persist_refusals() {
        let h = Harness::new().await;
        h.fund("acc-a", 5).await;

        let err = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap_err();
        assert_eq!(err, TransactionError::InsufficientBalance);

        let mut req = Harness::transfer_req(1, "K2");
        req.receiver_omni_tag = "A1".into();
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert_eq!(err, TransactionError::SelfTransfer);

        req.receiver_omni_tag = "ZZ".into();
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert_eq!(err, TransactionError::ReceiverNotFound);

        let err = h.engine.transfer("acc-b", &Harness::transfer_req(1, "K3")).await.unwrap_err();
        assert_eq!(err, TransactionError::Forbidden);

        let mut req = Harness::transfer_req(1, "K4");
        req.sender_wallet_id = "wallet-nope".into();
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert_eq!(err, TransactionError::SenderWalletNotFound);

        // Refusals release the key: the same key works once funded
        h.fund("acc-a", 100).await;
        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn test_currency_mismatch() {
        let h = Harness::new().await;
        h.wallets
            .provision_account(&crate::wallet::service::test_support::account_created(
                "acc-j",
                Currency::Jmd,
                crate::core_types::KycStatus::Approved,
            ))
            .await
            .unwrap();
        h.users.add("J1", "acc-j");
        h.fund("acc-a", 100).await;

        let mut req = Harness::transfer_req(10, "K1");
        req.receiver_omni_tag = "J1".into();
        let err = h.engine.transfer("acc-a", &req).await.unwrap_err();
        assert!(err.to_string().starts_with("Currency mismatch"));
        assert_eq!(h.balance("acc-a").await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_fraud_decline_fails_and_caches() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        h.risk.set_decision(85, RiskLevel::High, Decision::Decline);

        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K2")).await.unwrap();
        assert_eq!(resp.status_code, 400);
        let json = body(&resp);
        assert_eq!(json["status"], "failed");
        assert_eq!(json["message"], "Transaction declined due to risk assessment: high");
        let tx = &json["transaction"];
        assert_eq!(tx["status"], "failed");
        assert_eq!(tx["failedReason"], "Declined by fraud detection: high");
        assert_eq!(tx["metadata"]["riskLevel"], "high");
        assert_eq!(tx["metadata"]["riskDecision"], "decline");
        assert_eq!(h.balance("acc-a").await, Decimal::from(100));

        // Cached: a replay does not rescore
        let again = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K2")).await.unwrap();
        assert_eq!(again, resp);
        assert_eq!(h.risk.calls(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(h.broker.records(topics::TRANSACTION_FAILED).len(), 1);
        assert!(h.broker.records(topics::TRANSACTION_COMPLETED).is_empty());
    }

    #[tokio::test]
    async fn test_review_does_not_block() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        h.risk.set_decision(55, RiskLevel::High, Decision::Review);
        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(body(&resp)["transaction"]["metadata"]["riskDecision"], "review");
    }

    #[tokio::test]
    async fn test_fraud_unavailable_fail_open_and_closed() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        h.risk.set_unavailable();
        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(body(&resp)["transaction"]["metadata"]["riskDecision"], "unavailable");

        let h = Harness::with_fail_open(false).await;
        h.fund("acc-a", 100).await;
        h.risk.set_unavailable();
        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 400);
        assert_eq!(body(&resp)["transaction"]["status"], "failed");
        assert_eq!(h.balance("acc-a").await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_credit_failure_compensates_debit() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        h.faults.set_fail_credit(Some(AdapterError::Rejected {
            code: "WALLET_NOT_ACTIVE".into(),
            message: "Wallet is not active".into(),
        }));

        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 400);
        let json = body(&resp);
        assert_eq!(json["message"], "Wallet is not active");
        assert_eq!(json["transaction"]["status"], "failed");
        assert_eq!(h.balance("acc-a").await, Decimal::from(100));
        assert_eq!(h.balance("acc-b").await, Decimal::ZERO);
        assert_eq!(h.faults.reverse_count(), 2);
    }

    #[tokio::test]
    async fn test_lost_credit_response_is_undone() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        h.faults.set_credit_lands_then_fails(true);

        let resp = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap();
        assert_eq!(resp.status_code, 400);
        assert_eq!(h.balance("acc-a").await, Decimal::from(100));
        assert_eq!(h.balance("acc-b").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_failed_compensation_leaves_pending_and_releases_key() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        h.faults
            .set_fail_credit(Some(AdapterError::Unavailable("timeout".into())));
        h.faults
            .set_fail_reverse(Some(AdapterError::Unavailable("timeout".into())));

        let err = h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await.unwrap_err();
        assert!(err.is_infrastructure());
        assert_eq!(h.balance("acc-a").await, Decimal::from(90));

        let stale = h
            .engine
            .stale_pending(chrono::Duration::zero(), 10, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        // The wallets come back; compensation now lands
        h.faults.set_fail_reverse(None);
        let failed = h.engine.compensate(&stale[0]).await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.failed_reason.as_deref(), Some(TIMED_OUT_REASON));
        assert_eq!(h.balance("acc-a").await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_history_and_lookup() {
        let h = Harness::new().await;
        h.fund("acc-a", 100).await;
        for i in 0..3 {
            h.engine
                .transfer("acc-a", &Harness::transfer_req(5, &format!("K{}", i)))
                .await
                .unwrap();
        }
        let page = h
            .engine
            .history_for_account("acc-a", "acc-a", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.limit, 20);
        assert!(page.transactions[0].created_at >= page.transactions[2].created_at);

        let page = h
            .engine
            .history_for_wallet("acc-b", "wallet-acc-b", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 3);

        let err = h
            .engine
            .history_for_account("acc-b", "acc-a", &HistoryQuery::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::Forbidden);

        let id = page.transactions[0].id.clone();
        assert!(h.engine.transaction_for("acc-a", &id).await.is_ok());
        assert!(h.engine.transaction_for("acc-b", &id).await.is_ok());
        assert_eq!(
            h.engine.transaction_for("acc-x", &id).await.unwrap_err(),
            TransactionError::Forbidden
        );
        assert_eq!(
            h.engine.transaction_for("acc-a", "nope").await.unwrap_err(),
            TransactionError::TransactionNotFound
        );
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_move_money_once() {
        let h = std::sync::Arc::new(Harness::new().await);
        h.fund("acc-a", 100).await;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.engine.transfer("acc-a", &Harness::transfer_req(10, "K1")).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(resp) => {
                    assert_eq!(resp.status_code, 200);
                    ok += 1;
                }
                Err(e) => assert_eq!(e, TransactionError::RequestInProgress),
            }
        }
        assert!(ok >= 1);
        assert_eq!(h.balance("acc-a").await, Decimal::from(90));
        assert_eq!(h.balance("acc-b").await, Decimal::from(10));
    }
}
