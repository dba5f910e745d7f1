//! Idempotency store
//!
//! A request under `(accountId, key)` first reserves the key with a
//! conditional put (`in_progress`), does its work, then either finalises the
//! reservation with the exact response it returned or releases it when the
//! outcome was an error the caller may retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::engine::StoredResponse;
use crate::storage::{Family, Store, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyRecord {
    InProgress {
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
    },
    Completed {
        #[serde(rename = "statusCode")]
        status_code: u16,
        body: String,
        #[serde(rename = "completedAt")]
        completed_at: DateTime<Utc>,
    },
}

/// Outcome of [`IdempotencyStore::reserve`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The key is ours; do the work
    Fresh,
    /// Another request holds the key right now
    InProgress,
    /// The key was used before; replay this
    Cached(StoredResponse),
}

#[derive(Clone)]
pub struct IdempotencyStore {
    store: Store,
    ttl: Duration,
    in_flight_ttl: Duration,
}

fn record_key(account_id: &str, key: &str) -> String {
    format!("{}:{}", account_id, key)
}

impl IdempotencyStore {
    pub fn new(store: Store, ttl: Duration, in_flight_ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            in_flight_ttl,
        }
    }

    pub async fn reserve(&self, account_id: &str, key: &str) -> StorageResult<Reservation> {
        let k = record_key(account_id, key);
        // Two attempts: the existing record may expire between the failed
        // insert and the read.
        for _ in 0..2 {
            let marker = IdempotencyRecord::InProgress {
                started_at: Utc::now(),
            };
            if self
                .store
                .insert(Family::Idempotency, &k, &marker, Some(self.in_flight_ttl))
                .await?
            {
                return Ok(Reservation::Fresh);
            }
            match self.store.find::<IdempotencyRecord>(Family::Idempotency, &k).await? {
                Some(IdempotencyRecord::InProgress { .. }) => return Ok(Reservation::InProgress),
                Some(IdempotencyRecord::Completed {
                    status_code, body, ..
                }) => {
                    debug!(account_id, key, status_code, "Replaying cached response");
                    return Ok(Reservation::Cached(StoredResponse { status_code, body }));
                }
                None => continue,
            }
        }
        Ok(Reservation::InProgress)
    }

    /// Remember `response` for the rest of the TTL
    pub async fn finalize(
        &self,
        account_id: &str,
        key: &str,
        response: &StoredResponse,
    ) -> StorageResult<()> {
        let record = IdempotencyRecord::Completed {
            status_code: response.status_code,
            body: response.body.clone(),
            completed_at: Utc::now(),
        };
        self.store
            .put(Family::Idempotency, &record_key(account_id, key), &record, Some(self.ttl))
            .await
    }

    pub async fn release(&self, account_id: &str, key: &str) -> StorageResult<()> {
        self.store
            .delete(Family::Idempotency, &record_key(account_id, key))
            .await?;
        Ok(())
    }
}
