use crate::storage::{Family, Store, StorageError, StorageResult, WriteBatch};

use super::error::{WalletError, WalletResult};
use super::model::{VirtualCard, Wallet};

fn account_set(account_id: &str) -> String {
    format!("account:{}", account_id)
}

/// Wallet and card records plus their per-account sets
#[derive(Clone)]
pub struct WalletStore {
    store: Store,
}

impl WalletStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // ------------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------------

    /// Conditional create. Returns `false` when the id is taken; the account
    /// set is (re)written either way so a half-finished earlier attempt heals.
    pub async fn insert_wallet(&self, wallet: &Wallet) -> StorageResult<bool> {
        let inserted = self
            .store
            .insert(Family::Wallets, &wallet.wallet_id, wallet, None)
            .await?;
        self.store
            .kv()
            .set_add(Family::Wallets, &account_set(&wallet.account_id), &wallet.wallet_id)
            .await?;
        Ok(inserted)
    }

    pub async fn find_wallet(&self, wallet_id: &str) -> StorageResult<Option<Wallet>> {
        self.store.find(Family::Wallets, wallet_id).await
    }

    pub async fn wallet(&self, wallet_id: &str) -> WalletResult<Wallet> {
        self.find_wallet(wallet_id)
            .await?
            .ok_or(WalletError::WalletNotFound)
    }

    pub async fn wallets_for_account(&self, account_id: &str) -> StorageResult<Vec<Wallet>> {
        let mut wallets: Vec<Wallet> = self
            .store
            .members(Family::Wallets, &account_set(account_id), Family::Wallets)
            .await?;
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(wallets)
    }

    pub async fn default_wallet(&self, account_id: &str) -> StorageResult<Option<Wallet>> {
        if let Some(w) = self.find_wallet(&Wallet::default_id(account_id)).await? {
            return Ok(Some(w));
        }
        Ok(self
            .wallets_for_account(account_id)
            .await?
            .into_iter()
            .find(|w| w.is_default))
    }

    /// CAS read-modify-write of one wallet
    pub async fn update_wallet<F>(&self, wallet_id: &str, f: F) -> WalletResult<Wallet>
    where
        F: FnMut(&mut Wallet) -> WalletResult<()>,
    {
        self.store
            .update(Family::Wallets, wallet_id, f)
            .await
            .map_err(not_found_as(WalletError::WalletNotFound))
    }

    // ------------------------------------------------------------------------
    // Cards
    // ------------------------------------------------------------------------

    pub async fn insert_card(&self, card: &VirtualCard) -> StorageResult<bool> {
        let inserted = self.store.insert(Family::Cards, &card.id, card, None).await?;
        self.store
            .kv()
            .set_add(Family::Cards, &account_set(&card.account_id), &card.id)
            .await?;
        Ok(inserted)
    }

    pub async fn find_card(&self, card_id: &str) -> StorageResult<Option<VirtualCard>> {
        self.store.find(Family::Cards, card_id).await
    }

    pub async fn card(&self, card_id: &str) -> WalletResult<VirtualCard> {
        self.find_card(card_id).await?.ok_or(WalletError::CardNotFound)
    }

    pub async fn cards_for_account(&self, account_id: &str) -> StorageResult<Vec<VirtualCard>> {
        let mut cards: Vec<VirtualCard> = self
            .store
            .members(Family::Cards, &account_set(account_id), Family::Cards)
            .await?;
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cards)
    }

    pub async fn update_card<F>(&self, card_id: &str, f: F) -> WalletResult<VirtualCard>
    where
        F: FnMut(&mut VirtualCard) -> WalletResult<()>,
    {
        self.store
            .update(Family::Cards, card_id, f)
            .await
            .map_err(not_found_as(WalletError::CardNotFound))
    }

    pub async fn delete_card(&self, card: &VirtualCard) -> StorageResult<()> {
        self.store
            .apply(
                WriteBatch::new()
                    .delete(Family::Cards, card.id.clone())
                    .set_remove(Family::Cards, account_set(&card.account_id), card.id.clone()),
            )
            .await
    }
}

fn not_found_as(replacement: WalletError) -> impl FnOnce(WalletError) -> WalletError {
    move |e| match e {
        WalletError::Storage(StorageError::NotFound(_)) => replacement,
        other => other,
    }
}
