//! Redis Streams bus.
//!
//! Layout:
//! - `bus:topic:{topic}`: partition count (`SET NX`)
//! - `bus:stream:{topic}:{p}`: one stream per partition
//! - `bus:lease:{group}:{topic}:{p}`: in-flight owner of a partition (`SET NX PX`)
//!
//! Every partition is read through a consumer name fixed to its slot (`p{n}`),
//! so a new owner picks up entries a crashed owner read but never acked by
//! reading the pending list (id `0`) before new entries (`>`).

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::producer::RequiredAcks;
use super::{
    BusError, BusResult, EventBus, Message, Offset, Record, Subscription, TopicSpec, partition_for,
};
use crate::config::BusConfig;

const STREAM_MAX_LEN: usize = 100_000;
const LEASE_TTL_MS: u64 = 30_000;
const IDLE_SLEEP: Duration = Duration::from_millis(50);
const HEADER_PREFIX: &str = "h:";

const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn topic_key(topic: &str) -> String {
    format!("bus:topic:{}", topic)
}

fn stream_key(topic: &str, partition: u32) -> String {
    format!("bus:stream:{}:{}", topic, partition)
}

fn lease_key(group: &str, topic: &str, partition: u32) -> String {
    format!("bus:lease:{}:{}:{}", group, topic, partition)
}

fn consumer_name(partition: u32) -> String {
    format!("p{}", partition)
}

pub struct RedisStreamBus {
    conn: MultiplexedConnection,
    default_partitions: u32,
    required_acks: RequiredAcks,
    /// topic -> partition count
    partitions: DashMap<String, u32>,
}

impl RedisStreamBus {
    pub async fn connect(url: &str, config: &BusConfig) -> BusResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async::<_, String>(&mut conn.clone())
            .await?;
        Ok(Self {
            conn,
            default_partitions: config.partitions.max(1),
            required_acks: config.producer.required_acks,
            partitions: DashMap::new(),
        })
    }

    async fn partitions_of(&self, topic: &str) -> BusResult<u32> {
        if let Some(n) = self.partitions.get(topic) {
            return Ok(*n);
        }
        let stored = redis::cmd("GET")
            .arg(topic_key(topic))
            .query_async::<_, Option<u32>>(&mut self.conn.clone())
            .await?;
        let n = match stored {
            Some(n) => n,
            None => {
                // Implicit creation, like a broker with topic auto-create on
                self.create_topic(&TopicSpec::new(topic, self.default_partitions, 1))
                    .await?;
                self.default_partitions
            }
        };
        self.partitions.insert(topic.to_string(), n);
        Ok(n)
    }
}

#[async_trait]
impl EventBus for RedisStreamBus {
    fn backend(&self) -> &'static str {
        "redis-streams"
    }

    async fn create_topic(&self, spec: &TopicSpec) -> BusResult<()> {
        let created = redis::cmd("SET")
            .arg(topic_key(&spec.name))
            .arg(spec.partitions.max(1))
            .arg("NX")
            .query_async::<_, Option<String>>(&mut self.conn.clone())
            .await?;
        if created.is_some() {
            info!(
                topic = %spec.name,
                partitions = spec.partitions,
                replication_factor = spec.replication_factor,
                "Topic created"
            );
        }
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> BusResult<bool> {
        let n = redis::cmd("EXISTS")
            .arg(topic_key(topic))
            .query_async::<_, i64>(&mut self.conn.clone())
            .await?;
        Ok(n > 0)
    }

    async fn send(&self, records: Vec<Record>) -> BusResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for record in &records {
            let n = self.partitions_of(&record.topic).await?;
            let p = partition_for(&record.key, n);
            let cmd = pipe
                .cmd("XADD")
                .arg(stream_key(&record.topic, p))
                .arg("MAXLEN")
                .arg("~")
                .arg(STREAM_MAX_LEN)
                .arg("*")
                .arg("key")
                .arg(&record.key)
                .arg("payload")
                .arg(&record.payload);
            for (name, value) in &record.headers {
                cmd.arg(format!("{}{}", HEADER_PREFIX, name)).arg(value);
            }
            cmd.ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| BusError::SendFailed(e.to_string()))?;

        if self.required_acks == RequiredAcks::All {
            // Wait for one replica so a primary failover cannot drop the batch
            let replicas = redis::cmd("WAIT")
                .arg(1)
                .arg(10_000)
                .query_async::<_, i64>(&mut conn)
                .await?;
            if replicas < 1 {
                return Err(BusError::SendFailed("no replica acknowledged".into()));
            }
        }
        debug!(count = records.len(), "Appended records to streams");
        Ok(())
    }

    async fn subscribe(&self, group: &str, topics: &[String]) -> BusResult<Box<dyn Subscription>> {
        let mut slots = Vec::new();
        let mut conn = self.conn.clone();
        for topic in topics {
            let n = self.partitions_of(topic).await?;
            for p in 0..n {
                let created = redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream_key(topic, p))
                    .arg(group)
                    .arg("0")
                    .arg("MKSTREAM")
                    .query_async::<_, ()>(&mut conn)
                    .await;
                if let Err(e) = created {
                    // BUSYGROUP: the group already exists
                    if e.code() != Some("BUSYGROUP") {
                        return Err(e.into());
                    }
                }
                slots.push((topic.clone(), p));
            }
        }
        Ok(Box::new(StreamSubscription {
            conn,
            group: group.to_string(),
            member: ulid::Ulid::new().to_string(),
            slots,
            cursor: 0,
            release: Arc::new(redis::Script::new(RELEASE_LEASE)),
        }))
    }
}

struct StreamSubscription {
    conn: MultiplexedConnection,
    group: String,
    member: String,
    slots: Vec<(String, u32)>,
    cursor: usize,
    release: Arc<redis::Script>,
}

impl StreamSubscription {
    async fn acquire(&mut self, topic: &str, partition: u32) -> BusResult<bool> {
        let key = lease_key(&self.group, topic, partition);
        let acquired = redis::cmd("SET")
            .arg(&key)
            .arg(&self.member)
            .arg("NX")
            .arg("PX")
            .arg(LEASE_TTL_MS)
            .query_async::<_, Option<String>>(&mut self.conn)
            .await?;
        if acquired.is_some() {
            return Ok(true);
        }
        let holder = redis::cmd("GET")
            .arg(&key)
            .query_async::<_, Option<String>>(&mut self.conn)
            .await?;
        Ok(holder.as_deref() == Some(self.member.as_str()))
    }

    async fn release(&mut self, topic: &str, partition: u32) -> BusResult<()> {
        let _: i64 = self
            .release
            .key(lease_key(&self.group, topic, partition))
            .arg(&self.member)
            .invoke_async::<_, i64>(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn read_one(&mut self, topic: &str, partition: u32, id: &str) -> BusResult<Option<Message>> {
        let reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer_name(partition))
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(stream_key(topic, partition))
            .arg(id)
            .query_async::<_, Option<StreamReadReply>>(&mut self.conn)
            .await?;
        let Some(reply) = reply else {
            return Ok(None);
        };
        let Some(entry) = reply.keys.into_iter().flat_map(|k| k.ids).next() else {
            return Ok(None);
        };

        let mut key = String::new();
        let mut payload = Vec::new();
        let mut headers = Vec::new();
        for (field, value) in entry.map {
            let bytes: Vec<u8> = redis::from_redis_value(&value)?;
            if field == "key" {
                key = String::from_utf8_lossy(&bytes).to_string();
            } else if field == "payload" {
                payload = bytes;
            } else if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
                headers.push((name.to_string(), String::from_utf8_lossy(&bytes).to_string()));
            }
        }
        Ok(Some(Message {
            topic: topic.to_string(),
            partition,
            offset: Offset::Stream(entry.id),
            key,
            payload,
            headers,
        }))
    }

    async fn try_take(&mut self) -> BusResult<Option<Message>> {
        let n = self.slots.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            let (topic, partition) = self.slots[idx].clone();
            if !self.acquire(&topic, partition).await? {
                continue;
            }
            // Redeliver what a previous owner left unacked before moving on
            let msg = match self.read_one(&topic, partition, "0").await? {
                Some(m) => Some(m),
                None => self.read_one(&topic, partition, ">").await?,
            };
            match msg {
                Some(m) => {
                    self.cursor = idx + 1;
                    return Ok(Some(m));
                }
                None => self.release(&topic, partition).await?,
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Subscription for StreamSubscription {
    async fn poll(&mut self, max_wait: Duration) -> BusResult<Option<Message>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(msg) = self.try_take().await? {
                return Ok(Some(msg));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(IDLE_SLEEP.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, msg: &Message) -> BusResult<()> {
        let Offset::Stream(id) = &msg.offset else {
            return Err(BusError::Backend(format!(
                "foreign offset {} committed to stream bus",
                msg.offset
            )));
        };
        redis::cmd("XACK")
            .arg(stream_key(&msg.topic, msg.partition))
            .arg(&self.group)
            .arg(id)
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        self.release(&msg.topic, msg.partition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(topic_key("account-created"), "bus:topic:account-created");
        assert_eq!(stream_key("account-created", 2), "bus:stream:account-created:2");
        assert_eq!(
            lease_key("wallet-service", "account-created", 0),
            "bus:lease:wallet-service:account-created:0"
        );
        assert_eq!(consumer_name(1), "p1");
    }
}
