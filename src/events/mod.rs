//! Event Bus
//!
//! Keyed, partitioned, at-least-once delivery on named topics.
//!
//! - [`EventBus`] / [`Subscription`]: the backend capability set
//! - [`broker::InMemoryBroker`]: partitioned logs in process (local runs, tests)
//! - [`redis_bus::RedisStreamBus`]: one Redis stream per partition
//! - [`producer::EventProducer`]: batching producer with per-record acks
//! - [`consumer::ConsumerRunner`]: poll / handle / retry / dead-letter / commit loop
//!
//! Partition selection is `crc32(key) % partitions`, so every event of one
//! account lands on the same partition and is consumed in order.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod payloads;
pub mod producer;
pub mod redis_bus;
pub mod topics;

pub use broker::InMemoryBroker;
pub use consumer::{ConsumerRunner, ConsumerSettings, EventHandler, HandlerError};
pub use error::{BusError, BusResult};
pub use payloads::DomainEvent;
pub use producer::{EventProducer, ProducerConfig};
pub use redis_bus::RedisStreamBus;
pub use topics::{TopicSpec, ensure_topics};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BackendKind, BusConfig};

/// Consistent-hash partitioner
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    crc32fast::hash(key.as_bytes()) % partitions
}

/// A keyed record to append to a topic
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Record {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Position of a delivered message inside its partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offset {
    /// In-memory log index
    Log(u64),
    /// Redis stream entry id
    Stream(String),
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Log(n) => write!(f, "{}", n),
            Offset::Stream(id) => f.write_str(id),
        }
    }
}

/// A record delivered to a consumer group member
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: Offset,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Bus backend capability set
#[async_trait]
pub trait EventBus: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Create the topic if missing. Existing topics are left untouched.
    async fn create_topic(&self, spec: &TopicSpec) -> BusResult<()>;

    async fn topic_exists(&self, topic: &str) -> BusResult<bool>;

    /// Append records. Returns once the backend acknowledged all of them.
    async fn send(&self, records: Vec<Record>) -> BusResult<()>;

    /// Join `group` for the given topics.
    async fn subscribe(&self, group: &str, topics: &[String]) -> BusResult<Box<dyn Subscription>>;
}

/// One member of a consumer group.
///
/// A delivered message keeps its partition owned by this member until it is
/// committed; no other member of the group receives from that partition
/// meanwhile.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `max_wait` for the next message.
    async fn poll(&mut self, max_wait: Duration) -> BusResult<Option<Message>>;

    /// Mark `msg` processed and release its partition.
    async fn commit(&mut self, msg: &Message) -> BusResult<()>;
}

/// Open the bus backend chosen by configuration.
pub async fn open_bus(config: &BusConfig) -> anyhow::Result<Arc<dyn EventBus>> {
    match config.backend {
        BackendKind::Memory => {
            info!(partitions = config.partitions, "Using in-memory event broker");
            Ok(Arc::new(InMemoryBroker::new(config.partitions)))
        }
        BackendKind::Redis => {
            info!(host = %config.redis.host, port = config.redis.port, "Connecting to stream bus");
            let bus = RedisStreamBus::connect(&config.redis.url(), config).await?;
            Ok(Arc::new(bus))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitioner_is_stable() {
        let p1 = partition_for("acc-1", 3);
        let p2 = partition_for("acc-1", 3);
        assert_eq!(p1, p2);
        assert!(p1 < 3);
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_partitioner_spreads_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            seen.insert(partition_for(&format!("acc-{}", i), 3));
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_message_header_lookup() {
        let msg = Message {
            topic: "t".into(),
            partition: 0,
            offset: Offset::Log(4),
            key: "k".into(),
            payload: b"{}".to_vec(),
            headers: vec![("x-attempts".into(), "3".into())],
        };
        assert_eq!(msg.header("x-attempts"), Some("3"));
        assert_eq!(msg.header("missing"), None);
        assert_eq!(msg.offset.to_string(), "4");
    }
}
