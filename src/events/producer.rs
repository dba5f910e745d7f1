//! Batching producer.
//!
//! `emit` hands the encoded record to a background task over an mpsc channel
//! and waits for that record's acknowledgement on a oneshot. The task groups
//! whatever arrives within the batch window (or until the batch is full) into
//! a single `send` to the bus.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{BusError, BusResult, DomainEvent, EventBus, Record};

/// Upper bound on how long a caller may be held by batching
pub const MAX_BATCH_WINDOW_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    None,
    One,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub compression: Compression,
    pub required_acks: RequiredAcks,
    pub batch_window_ms: u64,
    pub batch_size: usize,
    pub write_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Snappy,
            required_acks: RequiredAcks::One,
            batch_window_ms: MAX_BATCH_WINDOW_MS,
            batch_size: 100,
            write_timeout_ms: 10_000,
            queue_capacity: 1024,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.compression != Compression::Snappy {
            return Err(BusError::InvalidConfig(format!(
                "compression must be snappy, got {:?}",
                self.compression
            )));
        }
        if self.required_acks == RequiredAcks::None {
            return Err(BusError::InvalidConfig(
                "at least one broker ack is required".into(),
            ));
        }
        if self.batch_window_ms > MAX_BATCH_WINDOW_MS {
            return Err(BusError::InvalidConfig(format!(
                "batch window {} ms exceeds {} ms",
                self.batch_window_ms, MAX_BATCH_WINDOW_MS
            )));
        }
        if self.batch_size == 0 || self.queue_capacity == 0 {
            return Err(BusError::InvalidConfig(
                "batch size and queue capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

struct Pending {
    record: Record,
    ack: oneshot::Sender<BusResult<()>>,
}

/// Handle used by services to publish events. Cheap to clone.
#[derive(Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<Pending>,
    write_timeout: Duration,
}

impl EventProducer {
    /// Validate `config` and spawn the batching task.
    pub fn start(
        bus: Arc<dyn EventBus>,
        config: &ProducerConfig,
    ) -> BusResult<(Self, JoinHandle<()>)> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let handle = tokio::spawn(run_batcher(
            bus,
            rx,
            config.batch_window(),
            config.batch_size,
            config.write_timeout(),
        ));
        Ok((
            Self {
                tx,
                write_timeout: config.write_timeout(),
            },
            handle,
        ))
    }

    /// Publish a typed event keyed by `key` (an account id).
    pub async fn emit<E: DomainEvent>(&self, key: &str, event: &E) -> BusResult<()> {
        let payload = serde_json::to_vec(event)?;
        self.send(Record::new(E::TOPIC, key, payload)).await
    }

    pub async fn send(&self, record: Record) -> BusResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Pending { record, ack })
            .await
            .map_err(|_| BusError::Closed)?;
        match tokio::time::timeout(self.write_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(self.write_timeout.as_millis() as u64)),
        }
    }
}

async fn run_batcher(
    bus: Arc<dyn EventBus>,
    mut rx: mpsc::Receiver<Pending>,
    window: Duration,
    batch_size: usize,
    write_timeout: Duration,
) {
    while let Some(first) = rx.recv().await {
        let deadline = tokio::time::Instant::now() + window;
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(p)) => batch.push(p),
                Ok(None) | Err(_) => break,
            }
        }

        let (records, acks): (Vec<_>, Vec<_>) =
            batch.into_iter().map(|p| (p.record, p.ack)).unzip();
        let count = records.len();
        let result = match tokio::time::timeout(write_timeout, bus.send(records)).await {
            Ok(r) => r,
            Err(_) => Err(BusError::Timeout(write_timeout.as_millis() as u64)),
        };
        match &result {
            Ok(()) => debug!(count, backend = bus.backend(), "Flushed event batch"),
            Err(e) => error!(count, error = %e, "Event batch send failed"),
        }
        for ack in acks {
            // caller may have timed out already
            let _ = ack.send(result.clone());
        }
    }
    debug!("Producer queue closed, batcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::payloads::AccountCreated;
    use crate::events::{InMemoryBroker, Subscription, TopicSpec};
    use async_trait::async_trait;

    fn fast_config() -> ProducerConfig {
        ProducerConfig {
            batch_window_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ProducerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression, Compression::Snappy);
        assert_eq!(config.required_acks, RequiredAcks::One);
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_weakened_config_rejected() {
        let no_acks = ProducerConfig {
            required_acks: RequiredAcks::None,
            ..Default::default()
        };
        assert!(matches!(no_acks.validate(), Err(BusError::InvalidConfig(_))));

        let gzip = ProducerConfig {
            compression: Compression::Gzip,
            ..Default::default()
        };
        assert!(gzip.validate().is_err());

        let slow = ProducerConfig {
            batch_window_ms: 500,
            ..Default::default()
        };
        assert!(slow.validate().is_err());
    }

    #[tokio::test]
    async fn test_emit_lands_on_topic() {
        let broker = InMemoryBroker::new(3);
        let (producer, _task) = EventProducer::start(Arc::new(broker.clone()), &fast_config()).unwrap();
        let event = AccountCreated::for_test("acc-1");
        producer.emit("acc-1", &event).await.unwrap();

        let records = broker.records("account-created");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "acc-1");
        let decoded: AccountCreated = records[0].decode().unwrap();
        assert_eq!(decoded.account_id, "acc-1");
    }

    #[tokio::test]
    async fn test_concurrent_emits_are_batched_and_acked() {
        let broker = InMemoryBroker::new(3);
        let (producer, _task) = EventProducer::start(Arc::new(broker.clone()), &fast_config()).unwrap();
        let mut handles = Vec::new();
        for i in 0..20 {
            let p = producer.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("acc-{}", i);
                p.emit(&key, &AccountCreated::for_test(&key)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(broker.records("account-created").len(), 20);
    }

    struct FailingBus;

    #[async_trait]
    impl EventBus for FailingBus {
        fn backend(&self) -> &'static str {
            "failing"
        }
        async fn create_topic(&self, _spec: &TopicSpec) -> BusResult<()> {
            Ok(())
        }
        async fn topic_exists(&self, _topic: &str) -> BusResult<bool> {
            Ok(true)
        }
        async fn send(&self, _records: Vec<Record>) -> BusResult<()> {
            Err(BusError::SendFailed("broker down".into()))
        }
        async fn subscribe(
            &self,
            _group: &str,
            _topics: &[String],
        ) -> BusResult<Box<dyn Subscription>> {
            Err(BusError::Closed)
        }
    }

    #[tokio::test]
    async fn test_send_failure_reaches_caller() {
        let (producer, _task) = EventProducer::start(Arc::new(FailingBus), &fast_config()).unwrap();
        let err = producer
            .emit("acc-1", &AccountCreated::for_test("acc-1"))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::SendFailed("broker down".into()));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = ProducerConfig {
            required_acks: RequiredAcks::None,
            ..Default::default()
        };
        assert!(EventProducer::start(Arc::new(FailingBus), &config).is_err());
    }
}
