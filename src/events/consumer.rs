//! Consumer loop.
//!
//! poll -> handle -> (retry with backoff) -> dead-letter on give-up -> commit.
//! Handlers must be idempotent: the same record can be delivered again after a
//! crash between handling and commit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::topics::dead_letter_topic;
use super::{BusResult, EventBus, Message, Record, Subscription};

pub const DLQ_REASON_HEADER: &str = "x-dlq-reason";
pub const DLQ_ATTEMPTS_HEADER: &str = "x-dlq-attempts";
pub const DLQ_SOURCE_TOPIC_HEADER: &str = "x-dlq-source-topic";
pub const DLQ_SOURCE_PARTITION_HEADER: &str = "x-dlq-source-partition";
pub const DLQ_SOURCE_OFFSET_HEADER: &str = "x-dlq-source-offset";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Longest single poll; also bounds shutdown latency
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub dead_letter: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            dead_letter: true,
        }
    }
}

impl ConsumerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure (store or network); worth another attempt
    #[error("retryable: {0}")]
    Retryable(String),

    /// The record can never be processed (bad payload, broken invariant)
    #[error("fatal: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, msg: &Message) -> Result<(), HandlerError>;
}

enum Outcome {
    Done,
    /// Shutdown arrived mid-retry; leave the record uncommitted
    Interrupted,
}

pub struct ConsumerRunner {
    bus: Arc<dyn EventBus>,
    group: String,
    topics: Vec<String>,
    handler: Arc<dyn EventHandler>,
    settings: ConsumerSettings,
}

impl ConsumerRunner {
    pub fn new(
        bus: Arc<dyn EventBus>,
        group: impl Into<String>,
        topics: Vec<String>,
        handler: Arc<dyn EventHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            bus,
            group: group.into(),
            topics,
            handler,
            settings,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> BusResult<()> {
        let mut sub = self.bus.subscribe(&self.group, &self.topics).await?;
        info!(
            group = %self.group,
            handler = self.handler.name(),
            topics = ?self.topics,
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                r = sub.poll(self.settings.poll_interval()) => r,
                _ = shutdown.changed() => break,
            };
            let msg = match polled {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) => {
                    error!(group = %self.group, error = %e, "Poll failed");
                    if sleep_or_shutdown(self.settings.poll_interval(), &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.process(sub.as_mut(), &msg, &mut shutdown).await {
                Ok(Outcome::Done) => {}
                Ok(Outcome::Interrupted) => break,
                Err(e) => {
                    // Not committed: the record comes back once the lease is released
                    error!(
                        group = %self.group,
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = %msg.offset,
                        error = %e,
                        "Failed to settle message"
                    );
                    if sleep_or_shutdown(self.settings.poll_interval(), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(group = %self.group, handler = self.handler.name(), "Consumer stopped");
        Ok(())
    }

    async fn process(
        &self,
        sub: &mut dyn Subscription,
        msg: &Message,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BusResult<Outcome> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.handler.handle(msg).await {
                Ok(()) => {
                    debug!(
                        topic = %msg.topic,
                        key = %msg.key,
                        offset = %msg.offset,
                        attempt,
                        "Message handled"
                    );
                    sub.commit(msg).await?;
                    return Ok(Outcome::Done);
                }
                Err(HandlerError::Retryable(reason)) if attempt < max_attempts => {
                    let delay = self.settings.backoff(attempt);
                    warn!(
                        topic = %msg.topic,
                        key = %msg.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Handler failed, retrying"
                    );
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Ok(Outcome::Interrupted);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        topic = %msg.topic,
                        key = %msg.key,
                        offset = %msg.offset,
                        attempt,
                        error = %e,
                        "Giving up on message"
                    );
                    if self.settings.dead_letter {
                        self.dead_letter(msg, &e, attempt).await?;
                    }
                    sub.commit(msg).await?;
                    return Ok(Outcome::Done);
                }
            }
        }
    }

    async fn dead_letter(&self, msg: &Message, err: &HandlerError, attempts: u32) -> BusResult<()> {
        let mut record = Record::new(
            dead_letter_topic(&msg.topic),
            msg.key.clone(),
            msg.payload.clone(),
        );
        record.headers = msg.headers.clone();
        let record = record
            .with_header(DLQ_REASON_HEADER, err.to_string())
            .with_header(DLQ_ATTEMPTS_HEADER, attempts.to_string())
            .with_header(DLQ_SOURCE_TOPIC_HEADER, msg.topic.clone())
            .with_header(DLQ_SOURCE_PARTITION_HEADER, msg.partition.to_string())
            .with_header(DLQ_SOURCE_OFFSET_HEADER, msg.offset.to_string());
        self.bus.send(vec![record]).await?;
        warn!(topic = %msg.topic, key = %msg.key, "Message moved to dead-letter topic");
        Ok(())
    }
}

/// Returns `true` when shutdown was signalled during the wait.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let changed = tokio::select! {
        _ = tokio::time::sleep(delay) => return false,
        r = shutdown.changed() => r,
    };
    changed.is_err() || *shutdown.borrow()
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that replays a scripted list of outcomes, then succeeds
    pub struct ScriptedHandler {
        script: Mutex<VecDeque<Result<(), HandlerError>>>,
        pub calls: AtomicUsize,
        pub seen: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        pub fn new(script: Vec<Result<(), HandlerError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&msg.payload).to_string());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }
}
