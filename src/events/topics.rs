//! Topic names and start-up provisioning.

use std::time::Duration;
use tracing::{info, warn};

use super::{BusError, BusResult, EventBus};

pub const ACCOUNT_CREATED: &str = "account-created";
pub const ACCOUNT_DELETION_REQUESTED: &str = "account-deletion-requested";

pub const CONTACT_REQUEST_SENT: &str = "contact-request-sent";
pub const CONTACT_REQUEST_ACCEPTED: &str = "contact-request-accepted";
pub const CONTACT_REQUEST_REJECTED: &str = "contact-request-rejected";
pub const CONTACT_BLOCKED: &str = "contact-blocked";

pub const VIRTUAL_CARD_CREATED: &str = "virtual-card-created";
pub const VIRTUAL_CARD_BLOCKED: &str = "virtual-card-blocked";
pub const VIRTUAL_CARD_TOPPED_UP: &str = "virtual-card-topped-up";
pub const VIRTUAL_CARD_DELETED: &str = "virtual-card-deleted";
pub const PHYSICAL_CARD_REQUESTED: &str = "physical-card-requested";

pub const TRANSACTION_CREATED: &str = "transaction-created";
pub const TRANSACTION_COMPLETED: &str = "transaction-completed";
pub const TRANSACTION_FAILED: &str = "transaction-failed";
pub const MONEY_SENT: &str = "money-sent";
pub const MONEY_RECEIVED: &str = "money-received";
pub const CARD_PURCHASE: &str = "card-purchase";
pub const CARD_REFUND: &str = "card-refund";

/// Topics the wallet service consumes and must find on start-up
pub const WALLET_INPUT_TOPICS: [&str; 2] = [ACCOUNT_CREATED, ACCOUNT_DELETION_REQUESTED];

pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}{}", topic, DEAD_LETTER_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Assert that `topics` (and their dead-letter topics) exist.
///
/// Each round tries to create every missing topic; a failing round is retried
/// after `backoff`, up to `attempts` rounds in total.
pub async fn ensure_topics(
    bus: &dyn EventBus,
    topics: &[&str],
    partitions: u32,
    replication_factor: u16,
    attempts: u32,
    backoff: Duration,
) -> BusResult<()> {
    let mut specs = Vec::with_capacity(topics.len() * 2);
    for t in topics {
        specs.push(TopicSpec::new(*t, partitions, replication_factor));
        specs.push(TopicSpec::new(dead_letter_topic(t), partitions, replication_factor));
    }

    let attempts = attempts.max(1);
    let mut last_err = BusError::Backend("no provisioning attempt made".into());
    for attempt in 1..=attempts {
        match provision_round(bus, &specs).await {
            Ok(()) => {
                info!(
                    topics = ?topics,
                    partitions,
                    replication_factor,
                    attempt,
                    "Topics ready"
                );
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "Topic provisioning failed");
                last_err = e;
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err)
}

async fn provision_round(bus: &dyn EventBus, specs: &[TopicSpec]) -> BusResult<()> {
    for spec in specs {
        if !bus.topic_exists(&spec.name).await? {
            bus.create_topic(spec).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InMemoryBroker, Record, Subscription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` existence checks
    struct FlakyBus {
        inner: InMemoryBroker,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn create_topic(&self, spec: &TopicSpec) -> BusResult<()> {
            self.inner.create_topic(spec).await
        }

        async fn topic_exists(&self, topic: &str) -> BusResult<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(BusError::Backend("broker not reachable".into()));
            }
            self.inner.topic_exists(topic).await
        }

        async fn send(&self, records: Vec<Record>) -> BusResult<()> {
            self.inner.send(records).await
        }

        async fn subscribe(
            &self,
            group: &str,
            topics: &[String],
        ) -> BusResult<Box<dyn Subscription>> {
            self.inner.subscribe(group, topics).await
        }
    }

    #[tokio::test]
    async fn test_ensure_topics_creates_topics_and_dlq() {
        let bus = InMemoryBroker::new(3);
        ensure_topics(&bus, &WALLET_INPUT_TOPICS, 3, 1, 5, Duration::ZERO)
            .await
            .unwrap();
        for t in WALLET_INPUT_TOPICS {
            assert!(bus.topic_exists(t).await.unwrap());
            assert!(bus.topic_exists(&dead_letter_topic(t)).await.unwrap());
            assert_eq!(bus.partition_count(t), Some(3));
        }
    }

    #[tokio::test]
    async fn test_ensure_topics_retries_then_succeeds() {
        let bus = FlakyBus {
            inner: InMemoryBroker::new(3),
            failures: 2,
            calls: AtomicUsize::new(0),
        };
        ensure_topics(&bus, &[ACCOUNT_CREATED], 3, 1, 5, Duration::ZERO)
            .await
            .unwrap();
        assert!(bus.inner.topic_exists(ACCOUNT_CREATED).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_topics_gives_up() {
        let bus = FlakyBus {
            inner: InMemoryBroker::new(3),
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let err = ensure_topics(&bus, &[ACCOUNT_CREATED], 3, 1, 5, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Backend(_)));
        assert_eq!(bus.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_dead_letter_name() {
        assert_eq!(dead_letter_topic("account-created"), "account-created.dlq");
    }
}
