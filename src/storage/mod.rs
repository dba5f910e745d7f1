//! Storage Adapter
//!
//! One key/record interface ([`KvStore`]) with two interchangeable backends:
//!
//! - [`MemoryStore`]: one guard per record family, used for local runs and tests
//! - [`RedisStore`]: remote key-value store, multi-step writes pipelined in `MULTI`
//!
//! Records are opaque strings (JSON in practice); [`Store`] is the typed facade
//! the services use. Besides plain records each family has named sets
//! (sessions per user, wallets per account, ...) and sorted indexes
//! (transactions per account/wallet by creation time).

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::Store;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BackendKind, ServiceKind, StorageConfig};

/// Record family. Each family has its own key space and, in memory, its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Users,
    Sessions,
    RefreshTokens,
    Contacts,
    Wallets,
    Cards,
    Transactions,
    Idempotency,
    Markers,
}

impl Family {
    pub const ALL: [Family; 9] = [
        Family::Users,
        Family::Sessions,
        Family::RefreshTokens,
        Family::Contacts,
        Family::Wallets,
        Family::Cards,
        Family::Transactions,
        Family::Idempotency,
        Family::Markers,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Family::Users => "user",
            Family::Sessions => "session",
            Family::RefreshTokens => "refresh",
            Family::Contacts => "contact",
            Family::Wallets => "wallet",
            Family::Cards => "card",
            Family::Transactions => "transaction",
            Family::Idempotency => "idempotency",
            Family::Markers => "marker",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

/// One step of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put {
        family: Family,
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        family: Family,
        key: String,
    },
    SetAdd {
        family: Family,
        set: String,
        member: String,
    },
    SetRemove {
        family: Family,
        set: String,
        member: String,
    },
    IndexAdd {
        family: Family,
        index: String,
        member: String,
        score: i64,
    },
    IndexRemove {
        family: Family,
        index: String,
        member: String,
    },
}

impl BatchOp {
    pub fn family(&self) -> Family {
        match self {
            BatchOp::Put { family, .. }
            | BatchOp::Delete { family, .. }
            | BatchOp::SetAdd { family, .. }
            | BatchOp::SetRemove { family, .. }
            | BatchOp::IndexAdd { family, .. }
            | BatchOp::IndexRemove { family, .. } => *family,
        }
    }
}

/// A group of writes applied together (one lock acquisition in memory,
/// one `MULTI` pipeline in Redis).
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, family: Family, key: impl Into<String>, value: String) -> Self {
        self.ops.push(BatchOp::Put {
            family,
            key: key.into(),
            value,
            ttl: None,
        });
        self
    }

    pub fn delete(mut self, family: Family, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Delete {
            family,
            key: key.into(),
        });
        self
    }

    pub fn set_add(mut self, family: Family, set: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SetAdd {
            family,
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(
        mut self,
        family: Family,
        set: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        self.ops.push(BatchOp::SetRemove {
            family,
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn index_add(
        mut self,
        family: Family,
        index: impl Into<String>,
        member: impl Into<String>,
        score: i64,
    ) -> Self {
        self.ops.push(BatchOp::IndexAdd {
            family,
            index: index.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn index_remove(
        mut self,
        family: Family,
        index: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        self.ops.push(BatchOp::IndexRemove {
            family,
            index: index.into(),
            member: member.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key/record storage capability set.
///
/// Every backend satisfies this trait; the concrete backend is picked once at
/// bootstrap by [`open_store`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logging
    fn backend(&self) -> &'static str;

    /// Fetch a record. Missing records are `StorageError::NotFound`.
    async fn get(&self, family: Family, key: &str) -> StorageResult<String>;

    async fn put(
        &self,
        family: Family,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Conditional put. Returns `false` when the key already exists.
    async fn put_if_absent(
        &self,
        family: Family,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<bool>;

    /// Replace the record only if it still equals `expected`.
    /// Keeps any existing TTL. Returns `false` on mismatch or missing record.
    async fn compare_and_swap(
        &self,
        family: Family,
        key: &str,
        expected: &str,
        value: String,
    ) -> StorageResult<bool>;

    /// Returns whether a record was removed.
    async fn delete(&self, family: Family, key: &str) -> StorageResult<bool>;

    async fn exists(&self, family: Family, key: &str) -> StorageResult<bool>;

    /// All live records of a family (scan-filter is done by the caller).
    async fn scan(&self, family: Family) -> StorageResult<Vec<String>>;

    async fn set_add(&self, family: Family, set: &str, member: &str) -> StorageResult<()>;

    async fn set_remove(&self, family: Family, set: &str, member: &str) -> StorageResult<()>;

    async fn set_members(&self, family: Family, set: &str) -> StorageResult<Vec<String>>;

    async fn index_add(
        &self,
        family: Family,
        index: &str,
        member: &str,
        score: i64,
    ) -> StorageResult<()>;

    async fn index_remove(&self, family: Family, index: &str, member: &str) -> StorageResult<()>;

    /// Members by descending score, skipping `offset`, at most `limit`.
    async fn index_rev_range(
        &self,
        family: Family,
        index: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<String>>;

    async fn index_len(&self, family: Family, index: &str) -> StorageResult<usize>;

    async fn apply(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Readiness probe
    async fn ping(&self) -> StorageResult<()>;
}

/// Open the backend chosen by configuration for one service.
pub async fn open_store(
    config: &StorageConfig,
    service: ServiceKind,
) -> anyhow::Result<Arc<dyn KvStore>> {
    match config.backend {
        BackendKind::Memory => {
            info!(service = service.as_str(), "Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        BackendKind::Redis => {
            let redis = config.redis_for(service);
            info!(
                service = service.as_str(),
                host = %redis.host,
                port = redis.port,
                "Connecting to remote key-value store"
            );
            let store = RedisStore::connect(&redis.url()).await?;
            store.ping().await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_prefixes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for f in Family::ALL {
            assert!(seen.insert(f.prefix()), "duplicate prefix {}", f.prefix());
        }
        assert_eq!(Family::ALL.len(), 9);
        assert_eq!(Family::Markers.index(), 8);
    }

    #[test]
    fn test_write_batch_builder() {
        let batch = WriteBatch::new()
            .put(Family::Transactions, "t1", "{}".into())
            .index_add(Family::Transactions, "account:a", "t1", 10)
            .set_add(Family::Transactions, "pending", "t1");
        assert_eq!(batch.ops().len(), 3);
        assert!(batch.ops().iter().all(|op| op.family() == Family::Transactions));
        assert!(!batch.is_empty());
    }
}
