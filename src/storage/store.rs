use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::{Family, KvStore, StorageError, StorageResult, WriteBatch};

/// Attempts before an optimistic update gives up
const MAX_CAS_ATTEMPTS: usize = 16;

/// Typed JSON facade over a [`KvStore`] backend.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
}

impl Store {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Convenience for tests and local runs
    pub fn in_memory() -> Self {
        Self::new(Arc::new(super::MemoryStore::new()))
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub async fn get<T: DeserializeOwned>(&self, family: Family, key: &str) -> StorageResult<T> {
        let raw = self.kv.get(family, key).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Like [`Store::get`] but a miss is `None`.
    pub async fn find<T: DeserializeOwned>(
        &self,
        family: Family,
        key: &str,
    ) -> StorageResult<Option<T>> {
        match self.get(family, key).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put<T: Serialize>(
        &self,
        family: Family,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.put(family, key, raw, ttl).await
    }

    /// Conditional create. `false` when the key is already taken.
    pub async fn insert<T: Serialize>(
        &self,
        family: Family,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let raw = serde_json::to_string(value)?;
        self.kv.put_if_absent(family, key, raw, ttl).await
    }

    pub async fn delete(&self, family: Family, key: &str) -> StorageResult<bool> {
        self.kv.delete(family, key).await
    }

    pub async fn exists(&self, family: Family, key: &str) -> StorageResult<bool> {
        self.kv.exists(family, key).await
    }

    /// Every record of a family that deserializes as `T`.
    pub async fn scan<T: DeserializeOwned>(&self, family: Family) -> StorageResult<Vec<T>> {
        let raw = self.kv.scan(family).await?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(StorageError::from))
            .collect()
    }

    /// Load the records listed in a set, skipping members whose record is gone.
    pub async fn members<T: DeserializeOwned>(
        &self,
        set_family: Family,
        set: &str,
        record_family: Family,
    ) -> StorageResult<Vec<T>> {
        let ids = self.kv.set_members(set_family, set).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = self.find(record_family, &id).await? {
                out.push(v);
            }
        }
        Ok(out)
    }

    pub async fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        self.kv.apply(batch).await
    }

    /// Optimistic read-modify-write.
    ///
    /// `f` receives the current record and either returns a domain error
    /// (which aborts without writing) or mutates it in place. The write only
    /// lands if nobody else changed the record in between; otherwise the
    /// closure runs again on the fresh value.
    pub async fn update<T, E, F>(&self, family: Family, key: &str, mut f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StorageError>,
        F: FnMut(&mut T) -> Result<(), E>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.kv.get(family, key).await?;
            let mut value: T = serde_json::from_str(&raw).map_err(StorageError::from)?;
            f(&mut value)?;
            let next = serde_json::to_string(&value).map_err(StorageError::from)?;
            if next == raw {
                return Ok(value);
            }
            if self.kv.compare_and_swap(family, key, &raw, next).await? {
                return Ok(value);
            }
        }
        Err(StorageError::Contention(format!("{}:{}", family.prefix(), key)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        value: i64,
    }

    #[derive(Debug, PartialEq)]
    enum TestError {
        Negative,
        Storage(StorageError),
    }

    impl From<StorageError> for TestError {
        fn from(e: StorageError) -> Self {
            TestError::Storage(e)
        }
    }

    #[tokio::test]
    async fn test_find_and_insert() {
        let store = Store::in_memory();
        let c = Counter {
            id: "c".into(),
            value: 1,
        };
        assert!(store.insert(Family::Markers, "c", &c, None).await.unwrap());
        assert!(!store.insert(Family::Markers, "c", &c, None).await.unwrap());
        let found: Option<Counter> = store.find(Family::Markers, "c").await.unwrap();
        assert_eq!(found, Some(c));
        let missing: Option<Counter> = store.find(Family::Markers, "nope").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_update_applies_closure() {
        let store = Store::in_memory();
        store
            .put(
                Family::Wallets,
                "c",
                &Counter {
                    id: "c".into(),
                    value: 1,
                },
                None,
            )
            .await
            .unwrap();
        let updated: Counter = store
            .update::<Counter, TestError, _>(Family::Wallets, "c", |c| {
                c.value += 10;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.value, 11);
        let stored: Counter = store.get(Family::Wallets, "c").await.unwrap();
        assert_eq!(stored.value, 11);
    }

    #[tokio::test]
    async fn test_update_domain_error_does_not_write() {
        let store = Store::in_memory();
        store
            .put(
                Family::Wallets,
                "c",
                &Counter {
                    id: "c".into(),
                    value: 1,
                },
                None,
            )
            .await
            .unwrap();
        let err = store
            .update::<Counter, TestError, _>(Family::Wallets, "c", |c| {
                c.value -= 5;
                if c.value < 0 {
                    return Err(TestError::Negative);
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, TestError::Negative);
        let stored: Counter = store.get(Family::Wallets, "c").await.unwrap();
        assert_eq!(stored.value, 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = Store::in_memory();
        let err = store
            .update::<Counter, TestError, _>(Family::Wallets, "zz", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let store = Store::in_memory();
        store
            .put(
                Family::Wallets,
                "c",
                &Counter {
                    id: "c".into(),
                    value: 0,
                },
                None,
            )
            .await
            .unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    s.update::<Counter, TestError, _>(Family::Wallets, "c", |c| {
                        c.value += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stored: Counter = store.get(Family::Wallets, "c").await.unwrap();
        assert_eq!(stored.value, 80);
    }
}
