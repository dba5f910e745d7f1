//! In-memory backend.
//!
//! One `Mutex` per record family. Every operation holds the guard only for a
//! constant-time section (hash map access); no `.await` happens while locked.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BatchOp, Family, KvStore, StorageError, StorageResult, WriteBatch};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct FamilyState {
    records: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
    /// Ordered by (score, member); reverse iteration gives newest first
    indexes: HashMap<String, BTreeSet<(i64, String)>>,
}

impl FamilyState {
    fn live(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        let expired = matches!(self.records.get(key), Some(e) if !e.is_live(now));
        if expired {
            self.records.remove(key);
        }
        self.records.get(key)
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Put { key, value, ttl, .. } => {
                self.records.insert(key, Entry::new(value, ttl));
            }
            BatchOp::Delete { key, .. } => {
                self.records.remove(&key);
            }
            BatchOp::SetAdd { set, member, .. } => {
                self.sets.entry(set).or_default().insert(member);
            }
            BatchOp::SetRemove { set, member, .. } => {
                if let Some(s) = self.sets.get_mut(&set) {
                    s.remove(&member);
                    if s.is_empty() {
                        self.sets.remove(&set);
                    }
                }
            }
            BatchOp::IndexAdd {
                index,
                member,
                score,
                ..
            } => {
                let idx = self.indexes.entry(index).or_default();
                idx.retain(|(_, m)| m != &member);
                idx.insert((score, member));
            }
            BatchOp::IndexRemove { index, member, .. } => {
                if let Some(idx) = self.indexes.get_mut(&index) {
                    idx.retain(|(_, m)| m != &member);
                }
            }
        }
    }
}

/// In-memory [`KvStore`]
pub struct MemoryStore {
    families: Vec<Mutex<FamilyState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            families: Family::ALL
                .iter()
                .map(|_| Mutex::new(FamilyState::default()))
                .collect(),
        }
    }

    fn lock(&self, family: Family) -> StorageResult<MutexGuard<'_, FamilyState>> {
        self.families[family.index()]
            .lock()
            .map_err(|_| StorageError::Unavailable(format!("{} lock poisoned", family.prefix())))
    }

    /// Number of live records in a family
    pub fn len(&self, family: Family) -> usize {
        let now = Instant::now();
        self.lock(family)
            .map(|state| state.records.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, family: Family) -> bool {
        self.len(family) == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, family: Family, key: &str) -> StorageResult<String> {
        let mut state = self.lock(family)?;
        state
            .live(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| StorageError::NotFound(format!("{}:{}", family.prefix(), key)))
    }

    async fn put(
        &self,
        family: Family,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut state = self.lock(family)?;
        state.records.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        family: Family,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let mut state = self.lock(family)?;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.records.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        family: Family,
        key: &str,
        expected: &str,
        value: String,
    ) -> StorageResult<bool> {
        let mut state = self.lock(family)?;
        let expires_at = match state.live(key) {
            Some(entry) if entry.value == expected => entry.expires_at,
            _ => return Ok(false),
        };
        state
            .records
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(true)
    }

    async fn delete(&self, family: Family, key: &str) -> StorageResult<bool> {
        let mut state = self.lock(family)?;
        let existed = state.live(key).is_some();
        state.records.remove(key);
        Ok(existed)
    }

    async fn exists(&self, family: Family, key: &str) -> StorageResult<bool> {
        let mut state = self.lock(family)?;
        Ok(state.live(key).is_some())
    }

    async fn scan(&self, family: Family) -> StorageResult<Vec<String>> {
        let mut state = self.lock(family)?;
        let now = Instant::now();
        state.records.retain(|_, e| e.is_live(now));
        Ok(state.records.values().map(|e| e.value.clone()).collect())
    }

    async fn set_add(&self, family: Family, set: &str, member: &str) -> StorageResult<()> {
        let mut state = self.lock(family)?;
        state.apply(BatchOp::SetAdd {
            family,
            set: set.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn set_remove(&self, family: Family, set: &str, member: &str) -> StorageResult<()> {
        let mut state = self.lock(family)?;
        state.apply(BatchOp::SetRemove {
            family,
            set: set.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn set_members(&self, family: Family, set: &str) -> StorageResult<Vec<String>> {
        let state = self.lock(family)?;
        Ok(state
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn index_add(
        &self,
        family: Family,
        index: &str,
        member: &str,
        score: i64,
    ) -> StorageResult<()> {
        let mut state = self.lock(family)?;
        state.apply(BatchOp::IndexAdd {
            family,
            index: index.to_string(),
            member: member.to_string(),
            score,
        });
        Ok(())
    }

    async fn index_remove(&self, family: Family, index: &str, member: &str) -> StorageResult<()> {
        let mut state = self.lock(family)?;
        state.apply(BatchOp::IndexRemove {
            family,
            index: index.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn index_rev_range(
        &self,
        family: Family,
        index: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let state = self.lock(family)?;
        Ok(state
            .indexes
            .get(index)
            .map(|idx| {
                idx.iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn index_len(&self, family: Family, index: &str) -> StorageResult<usize> {
        let state = self.lock(family)?;
        Ok(state.indexes.get(index).map(|i| i.len()).unwrap_or(0))
    }

    async fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        // Lock every touched family in enum order so concurrent batches cannot deadlock
        let mut families: Vec<Family> = batch.ops().iter().map(|op| op.family()).collect();
        families.sort();
        families.dedup();

        let mut guards = Vec::with_capacity(families.len());
        for family in &families {
            guards.push((*family, self.lock(*family)?));
        }

        for op in batch.into_ops() {
            let family = op.family();
            if let Some((_, guard)) = guards.iter_mut().find(|(f, _)| *f == family) {
                guard.apply(op);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get(Family::Users, "nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store
            .put(Family::Wallets, "w1", "v1".into(), None)
            .await
            .unwrap();
        assert_eq!(store.get(Family::Wallets, "w1").await.unwrap(), "v1");
        assert!(store.exists(Family::Wallets, "w1").await.unwrap());
        // same key in another family is independent
        assert!(!store.exists(Family::Cards, "w1").await.unwrap());

        assert!(store.delete(Family::Wallets, "w1").await.unwrap());
        assert!(!store.delete(Family::Wallets, "w1").await.unwrap());
        assert!(store.is_empty(Family::Wallets));
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();
        assert!(
            store
                .put_if_absent(Family::Markers, "m", "a".into(), None)
                .await
                .unwrap()
        );
        assert!(
            !store
                .put_if_absent(Family::Markers, "m", "b".into(), None)
                .await
                .unwrap()
        );
        assert_eq!(store.get(Family::Markers, "m").await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .put(
                Family::Idempotency,
                "k",
                "v".into(),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        assert!(store.exists(Family::Idempotency, "k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists(Family::Idempotency, "k").await.unwrap());
        // expired keys can be claimed again
        assert!(
            store
                .put_if_absent(Family::Idempotency, "k", "v2".into(), None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.put(Family::Users, "u", "1".into(), None).await.unwrap();
        assert!(
            !store
                .compare_and_swap(Family::Users, "u", "0", "2".into())
                .await
                .unwrap()
        );
        assert!(
            store
                .compare_and_swap(Family::Users, "u", "1", "2".into())
                .await
                .unwrap()
        );
        assert_eq!(store.get(Family::Users, "u").await.unwrap(), "2");
        assert!(
            !store
                .compare_and_swap(Family::Users, "missing", "1", "2".into())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.set_add(Family::Sessions, "a@x", "s1").await.unwrap();
        store.set_add(Family::Sessions, "a@x", "s2").await.unwrap();
        store.set_add(Family::Sessions, "a@x", "s1").await.unwrap();
        let mut members = store.set_members(Family::Sessions, "a@x").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["s1", "s2"]);

        store.set_remove(Family::Sessions, "a@x", "s1").await.unwrap();
        assert_eq!(
            store.set_members(Family::Sessions, "a@x").await.unwrap(),
            vec!["s2"]
        );
        assert!(
            store
                .set_members(Family::Sessions, "b@x")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_index_reverse_order_and_paging() {
        let store = MemoryStore::new();
        for (i, id) in ["t1", "t2", "t3", "t4"].iter().enumerate() {
            store
                .index_add(Family::Transactions, "account:a", id, i as i64)
                .await
                .unwrap();
        }
        let page = store
            .index_rev_range(Family::Transactions, "account:a", 0, 2)
            .await
            .unwrap();
        assert_eq!(page, vec!["t4", "t3"]);
        let page = store
            .index_rev_range(Family::Transactions, "account:a", 2, 10)
            .await
            .unwrap();
        assert_eq!(page, vec!["t2", "t1"]);
        assert_eq!(
            store
                .index_len(Family::Transactions, "account:a")
                .await
                .unwrap(),
            4
        );

        // re-adding a member moves it instead of duplicating
        store
            .index_add(Family::Transactions, "account:a", "t1", 99)
            .await
            .unwrap();
        let page = store
            .index_rev_range(Family::Transactions, "account:a", 0, 1)
            .await
            .unwrap();
        assert_eq!(page, vec!["t1"]);
        assert_eq!(
            store
                .index_len(Family::Transactions, "account:a")
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_batch_spans_families() {
        let store = MemoryStore::new();
        let batch = WriteBatch::new()
            .put(Family::Transactions, "t1", "{}".into())
            .put(Family::Markers, "ref:TXN-1", "t1".into())
            .index_add(Family::Transactions, "wallet:w", "t1", 5)
            .set_add(Family::Transactions, "pending", "t1");
        store.apply(batch).await.unwrap();

        assert!(store.exists(Family::Transactions, "t1").await.unwrap());
        assert_eq!(store.get(Family::Markers, "ref:TXN-1").await.unwrap(), "t1");
        assert_eq!(
            store
                .set_members(Family::Transactions, "pending")
                .await
                .unwrap(),
            vec!["t1"]
        );
        assert_eq!(
            store
                .index_len(Family::Transactions, "wallet:w")
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_scan_returns_live_records() {
        let store = MemoryStore::new();
        store.put(Family::Users, "a", "A".into(), None).await.unwrap();
        store.put(Family::Users, "b", "B".into(), None).await.unwrap();
        store
            .put(Family::Users, "c", "C".into(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut all = store.scan(Family::Users).await.unwrap();
        all.sort();
        assert_eq!(all, vec!["A", "B"]);
    }
}
