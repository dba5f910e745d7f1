//! Redis backend.
//!
//! Key layout per family prefix:
//! - record: `{prefix}:{key}`
//! - set:    `set:{prefix}:{name}`
//! - index:  `idx:{prefix}:{name}` (sorted set, score = creation millis)

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

use super::{BatchOp, Family, KvStore, StorageError, StorageResult, WriteBatch};

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
"#;

const SCAN_COUNT: usize = 200;

fn record_key(family: Family, key: &str) -> String {
    format!("{}:{}", family.prefix(), key)
}

fn set_key(family: Family, set: &str) -> String {
    format!("set:{}:{}", family.prefix(), set)
}

fn index_key(family: Family, index: &str) -> String {
    format!("idx:{}:{}", family.prefix(), index)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis-backed [`KvStore`]
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    cas: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, family: Family, key: &str) -> StorageResult<String> {
        let full = record_key(family, key);
        let value = redis::cmd("GET")
            .arg(&full)
            .query_async::<_, Option<String>>(&mut self.conn())
            .await?;
        value.ok_or(StorageError::NotFound(full))
    }

    async fn put(
        &self,
        family: Family,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(record_key(family, key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        family: Family,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(record_key(family, key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply = cmd
            .query_async::<_, Option<String>>(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        family: Family,
        key: &str,
        expected: &str,
        value: String,
    ) -> StorageResult<bool> {
        let swapped = self
            .cas
            .key(record_key(family, key))
            .arg(expected)
            .arg(value)
            .invoke_async::<_, i32>(&mut self.conn())
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, family: Family, key: &str) -> StorageResult<bool> {
        let removed = redis::cmd("DEL")
            .arg(record_key(family, key))
            .query_async::<_, i64>(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, family: Family, key: &str) -> StorageResult<bool> {
        let n = redis::cmd("EXISTS")
            .arg(record_key(family, key))
            .query_async::<_, i64>(&mut self.conn())
            .await?;
        Ok(n > 0)
    }

    async fn scan(&self, family: Family) -> StorageResult<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{}:*", family.prefix());
        let mut cursor: u64 = 0;
        let mut values = Vec::new();
        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await?;
            if !keys.is_empty() {
                let batch = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async::<_, Vec<Option<String>>>(&mut conn)
                    .await?;
                // keys may expire between SCAN and MGET
                values.extend(batch.into_iter().flatten());
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(values)
    }

    async fn set_add(&self, family: Family, set: &str, member: &str) -> StorageResult<()> {
        redis::cmd("SADD")
            .arg(set_key(family, set))
            .arg(member)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_remove(&self, family: Family, set: &str, member: &str) -> StorageResult<()> {
        redis::cmd("SREM")
            .arg(set_key(family, set))
            .arg(member)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_members(&self, family: Family, set: &str) -> StorageResult<Vec<String>> {
        let members = redis::cmd("SMEMBERS")
            .arg(set_key(family, set))
            .query_async::<_, Vec<String>>(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn index_add(
        &self,
        family: Family,
        index: &str,
        member: &str,
        score: i64,
    ) -> StorageResult<()> {
        redis::cmd("ZADD")
            .arg(index_key(family, index))
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn index_remove(&self, family: Family, index: &str, member: &str) -> StorageResult<()> {
        redis::cmd("ZREM")
            .arg(index_key(family, index))
            .arg(member)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn index_rev_range(
        &self,
        family: Family,
        index: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = offset.saturating_add(limit - 1);
        let members = redis::cmd("ZREVRANGE")
            .arg(index_key(family, index))
            .arg(offset)
            .arg(stop)
            .query_async::<_, Vec<String>>(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn index_len(&self, family: Family, index: &str) -> StorageResult<usize> {
        let n = redis::cmd("ZCARD")
            .arg(index_key(family, index))
            .query_async::<_, usize>(&mut self.conn())
            .await?;
        Ok(n)
    }

    async fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put {
                    family,
                    key,
                    value,
                    ttl,
                } => {
                    let cmd = pipe.cmd("SET").arg(record_key(family, &key)).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl_millis(ttl));
                    }
                    cmd.ignore();
                }
                BatchOp::Delete { family, key } => {
                    pipe.cmd("DEL").arg(record_key(family, &key)).ignore();
                }
                BatchOp::SetAdd {
                    family,
                    set,
                    member,
                } => {
                    pipe.cmd("SADD")
                        .arg(set_key(family, &set))
                        .arg(member)
                        .ignore();
                }
                BatchOp::SetRemove {
                    family,
                    set,
                    member,
                } => {
                    pipe.cmd("SREM")
                        .arg(set_key(family, &set))
                        .arg(member)
                        .ignore();
                }
                BatchOp::IndexAdd {
                    family,
                    index,
                    member,
                    score,
                } => {
                    pipe.cmd("ZADD")
                        .arg(index_key(family, &index))
                        .arg(score)
                        .arg(member)
                        .ignore();
                }
                BatchOp::IndexRemove {
                    family,
                    index,
                    member,
                } => {
                    pipe.cmd("ZREM")
                        .arg(index_key(family, &index))
                        .arg(member)
                        .ignore();
                }
            }
        }
        pipe.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        let _: String = redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(record_key(Family::Users, "a@x.com"), "user:a@x.com");
        assert_eq!(set_key(Family::Sessions, "a@x.com"), "set:session:a@x.com");
        assert_eq!(
            index_key(Family::Transactions, "account:1"),
            "idx:transaction:account:1"
        );
    }

    #[test]
    fn test_record_scan_pattern_skips_sets_and_indexes() {
        // SCAN MATCH "user:*" must not pick up "set:user:*" / "idx:user:*"
        let pattern_prefix = format!("{}:", Family::Users.prefix());
        assert!(!set_key(Family::Users, "x").starts_with(&pattern_prefix));
        assert!(!index_key(Family::Users, "x").starts_with(&pattern_prefix));
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
