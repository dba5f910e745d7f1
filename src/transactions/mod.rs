//! Transactions service
//!
//! Omni-tag transfers and card purchases. Each pipeline runs
//! validate → resolve → gate → persist-pending → apply → mark-completed → emit,
//! with money moved through a [`adapters::WalletGateway`] saga so a failed
//! leg is compensated instead of half-applied.
//!
//! - [`engine::TransactionEngine`]: the two pipelines plus history reads
//! - [`idempotency::IdempotencyStore`]: `(account, key)` reservations and cached responses
//! - [`reaper::TransactionReaper`]: compensates transactions stuck in `pending`
//! - [`handlers`]: `/api/transactions/...`

pub mod adapters;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod history;
pub mod idempotency;
pub mod model;
pub mod reaper;
pub mod store;


pub use adapters::{Adapters, AdapterError, RiskAssessor, UserDirectory, UserRef, WalletGateway};
pub use engine::{StoredResponse, TransactionEngine};
pub use error::{TransactionError, TransactionResult};
pub use model::{
    PurchaseRequest, PurchaseResponse, Transaction, TransactionCategory, TransactionPage,
    TransactionStatus, TransactionType, TransferRequest, TransferResponse,
};
pub use reaper::TransactionReaper;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the pending-transaction reaper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How often to scan for stale pending transactions
    pub scan_interval_secs: u64,
    /// How long a transaction must sit in `pending` to be compensated
    pub stale_threshold_secs: u64,
    /// Maximum transactions handled per scan
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

impl ReaperConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionsConfig {
    /// Lifetime of a cached idempotent response
    pub idempotency_ttl_secs: u64,
    /// Lifetime of an `in_progress` reservation, so a crashed request does
    /// not pin its key for a whole day
    pub in_flight_ttl_secs: u64,
    pub default_limit: usize,
    pub max_limit: usize,
    pub reaper: ReaperConfig,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: 24 * 60 * 60,
            in_flight_ttl_secs: 120,
            default_limit: 20,
            max_limit: 100,
            reaper: ReaperConfig::default(),
        }
    }
}

impl TransactionsConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn in_flight_ttl(&self) -> Duration {
        Duration::from_secs(self.in_flight_ttl_secs.max(1))
    }
}
