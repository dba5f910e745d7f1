use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::{TransactionError, TransactionResult};
use super::history::HistoryFilter;
use super::model::{Transaction, TransactionStatus};
use crate::storage::{Family, Store, StorageError, StorageResult, WriteBatch};

const PENDING_SET: &str = "pending";

pub fn account_index(account_id: &str) -> String {
    format!("account:{}", account_id)
}

pub fn wallet_index(wallet_id: &str) -> String {
    format!("wallet:{}", wallet_id)
}

fn reference_marker(reference: &str) -> String {
    format!("reference:{}", reference)
}

/// `TXN-YYYYMMDD-XXXXXXXX`
pub fn new_reference(now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    format!("TXN-{}-{}", now.format("%Y%m%d"), suffix)
}

/// Transaction records with their per-account / per-wallet time indexes and
/// the set of ids still `pending`.
#[derive(Clone)]
pub struct TransactionStore {
    store: Store,
}

impl TransactionStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Claim `tx.reference`. `false` when another transaction owns it.
    pub async fn reserve_reference(&self, tx: &Transaction) -> StorageResult<bool> {
        self.store
            .insert(Family::Markers, &reference_marker(&tx.reference), &tx.id, None)
            .await
    }

    /// Write a new record and list it in every index it belongs to.
    /// The reference must already be reserved.
    pub async fn create(&self, tx: &Transaction) -> StorageResult<()> {
        let score = tx.created_at.timestamp_millis();
        let mut batch =
            WriteBatch::new().put(Family::Transactions, tx.id.clone(), serde_json::to_string(tx)?);
        for account in tx.account_ids() {
            batch = batch.index_add(Family::Transactions, account_index(account), tx.id.clone(), score);
        }
        for wallet in tx.wallet_ids() {
            batch = batch.index_add(Family::Transactions, wallet_index(wallet), tx.id.clone(), score);
        }
        if tx.status == TransactionStatus::Pending {
            batch = batch.set_add(Family::Transactions, PENDING_SET, tx.id.clone());
        }
        self.store.apply(batch).await
    }

    pub async fn find(&self, id: &str) -> StorageResult<Option<Transaction>> {
        self.store.find(Family::Transactions, id).await
    }

    pub async fn get(&self, id: &str) -> TransactionResult<Transaction> {
        self.find(id).await?.ok_or(TransactionError::TransactionNotFound)
    }

    /// CAS read-modify-write; drops the id from the pending set once the
    /// record leaves `pending`.
    pub async fn update<F>(&self, id: &str, f: F) -> TransactionResult<Transaction>
    where
        F: FnMut(&mut Transaction) -> TransactionResult<()>,
    {
        let tx: Transaction = self
            .store
            .update(Family::Transactions, id, f)
            .await
            .map_err(|e| match e {
                TransactionError::Storage(StorageError::NotFound(_)) => {
                    TransactionError::TransactionNotFound
                }
                other => other,
            })?;
        if tx.status != TransactionStatus::Pending {
            self.store
                .kv()
                .set_remove(Family::Transactions, PENDING_SET, id)
                .await?;
        }
        Ok(tx)
    }

    /// Transactions still pending that were created before `cutoff`, oldest first
    pub async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Transaction>> {
        let mut pending: Vec<Transaction> = self
            .store
            .members(Family::Transactions, PENDING_SET, Family::Transactions)
            .await?;
        pending.retain(|t| t.status == TransactionStatus::Pending && t.created_at < cutoff);
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    /// Newest-first page of an index.
    ///
    /// Without filters the page is cut by the index itself; with filters the
    /// whole index is loaded and filtered before slicing.
    pub async fn page(
        &self,
        index: &str,
        filter: &HistoryFilter,
        limit: usize,
        offset: usize,
    ) -> StorageResult<(Vec<Transaction>, usize)> {
        let kv = self.store.kv();
        if filter.is_empty() {
            let total = kv.index_len(Family::Transactions, index).await?;
            let ids = kv
                .index_rev_range(Family::Transactions, index, offset, limit)
                .await?;
            let mut page = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(tx) = self.find(&id).await? {
                    page.push(tx);
                }
            }
            return Ok((page, total));
        }

        let len = kv.index_len(Family::Transactions, index).await?;
        let ids = kv.index_rev_range(Family::Transactions, index, 0, len).await?;
        let mut matching = Vec::new();
        for id in ids {
            if let Some(tx) = self.find(&id).await? {
                if filter.matches(&tx) {
                    matching.push(tx);
                }
            }
        }
        let total = matching.len();
        let page = matching.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }
}
