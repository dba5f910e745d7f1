//! Recent-transaction window.
//!
//! Entries are appended in arrival order, so the oldest is always at the
//! front. Retention is the tighter of an age limit and an entry cap; both are
//! enforced on every insert and by the janitor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub transaction_id: String,
    pub sender_account_id: String,
    pub receiver_account_id: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Per-sender counters over the two velocity windows, read in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Velocity {
    pub sender_count_1h: usize,
    pub sender_count_24h: usize,
    pub sender_total_1h: Decimal,
    pub sender_total_24h: Decimal,
    /// Same sender to the same receiver in the last hour
    pub pair_count_1h: usize,
}

pub struct TransactionMemory {
    entries: RwLock<VecDeque<HistoryEntry>>,
    max_age: ChronoDuration,
    max_entries: usize,
}

impl TransactionMemory {
    pub fn new(max_age: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_age: ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(24)),
            max_entries,
        }
    }

    pub async fn record(&self, entry: HistoryEntry, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        Self::prune_locked(&mut entries, now - self.max_age, self.max_entries);
    }

    /// Drop expired and overflowing entries. Returns how many were removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        Self::prune_locked(&mut entries, now - self.max_age, self.max_entries)
    }

    fn prune_locked(
        entries: &mut VecDeque<HistoryEntry>,
        cutoff: DateTime<Utc>,
        max_entries: usize,
    ) -> usize {
        let before = entries.len();
        while entries.front().is_some_and(|e| e.timestamp <= cutoff) {
            entries.pop_front();
        }
        while entries.len() > max_entries {
            entries.pop_front();
        }
        before - entries.len()
    }

    pub async fn velocity(&self, sender: &str, receiver: &str, now: DateTime<Utc>) -> Velocity {
        let hour_ago = now - ChronoDuration::hours(1);
        let day_ago = now - ChronoDuration::hours(24);
        let entries = self.entries.read().await;

        let mut v = Velocity::default();
        for e in entries.iter().rev() {
            if e.timestamp <= day_ago {
                break;
            }
            if e.sender_account_id != sender {
                continue;
            }
            v.sender_count_24h += 1;
            v.sender_total_24h += e.amount;
            if e.timestamp > hour_ago {
                v.sender_count_1h += 1;
                v.sender_total_1h += e.amount;
                if e.receiver_account_id == receiver {
                    v.pair_count_1h += 1;
                }
            }
        }
        v
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
