//! In-process partitioned broker.
//!
//! Each topic is a fixed number of append-only partition logs. Consumer groups
//! keep one committed offset per partition plus at most one in-flight lease,
//! which is what gives every partition a single owner at a time: a member
//! that holds the lease must commit (or let the lease expire) before anybody
//! in the group sees the next record of that partition.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{
    BusError, BusResult, EventBus, Message, Offset, Record, Subscription, TopicSpec, partition_for,
};

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Stored {
    key: String,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct Topic {
    partitions: Vec<Vec<Stored>>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    member: u64,
    offset: u64,
    expires_at: Instant,
}

type Slot = (String, u32);

#[derive(Debug, Default)]
struct GroupState {
    committed: HashMap<Slot, u64>,
    in_flight: HashMap<Slot, Lease>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    groups: HashMap<String, GroupState>,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    default_partitions: u32,
    lease_ttl: Duration,
    auto_create: bool,
    next_member: AtomicU64,
}

impl Shared {
    fn lock(&self) -> BusResult<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| BusError::Backend("broker state poisoned".into()))
    }
}

/// In-memory [`EventBus`]. Cloning shares the same logs.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new(default_partitions: u32) -> Self {
        Self::build(default_partitions, DEFAULT_LEASE_TTL, true)
    }

    /// Lease TTL bounds how long a crashed member can hold a partition.
    pub fn with_lease_ttl(self, lease_ttl: Duration) -> Self {
        Self::build(self.shared.default_partitions, lease_ttl, self.shared.auto_create)
    }

    /// Reject sends/subscriptions to topics that were never created.
    pub fn strict(self) -> Self {
        Self::build(self.shared.default_partitions, self.shared.lease_ttl, false)
    }

    fn build(default_partitions: u32, lease_ttl: Duration, auto_create: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                default_partitions: default_partitions.max(1),
                lease_ttl,
                auto_create,
                next_member: AtomicU64::new(1),
            }),
        }
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        let state = self.shared.lock().ok()?;
        state.topics.get(topic).map(|t| t.partitions.len() as u32)
    }

    /// Every record of a topic, partition by partition, in log order.
    pub fn records(&self, topic: &str) -> Vec<Message> {
        let Ok(state) = self.shared.lock() else {
            return Vec::new();
        };
        let Some(t) = state.topics.get(topic) else {
            return Vec::new();
        };
        t.partitions
            .iter()
            .enumerate()
            .flat_map(|(p, log)| {
                log.iter().enumerate().map(move |(offset, stored)| Message {
                    topic: topic.to_string(),
                    partition: p as u32,
                    offset: Offset::Log(offset as u64),
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                    headers: stored.headers.clone(),
                })
            })
            .collect()
    }

    /// Committed offset of `group` on one partition (0 when nothing committed)
    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> u64 {
        self.shared
            .lock()
            .ok()
            .and_then(|s| {
                s.groups
                    .get(group)
                    .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
            })
            .unwrap_or(0)
    }

    fn ensure_topic<'a>(
        &self,
        topics: &'a mut HashMap<String, Topic>,
        name: &str,
    ) -> BusResult<&'a mut Topic> {
        if !topics.contains_key(name) {
            if !self.shared.auto_create {
                return Err(BusError::UnknownTopic(name.to_string()));
            }
            topics.insert(name.to_string(), Topic::new(self.shared.default_partitions));
        }
        topics
            .get_mut(name)
            .ok_or_else(|| BusError::UnknownTopic(name.to_string()))
    }
}

#[async_trait]
impl EventBus for InMemoryBroker {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_topic(&self, spec: &TopicSpec) -> BusResult<()> {
        let mut state = self.shared.lock()?;
        state
            .topics
            .entry(spec.name.clone())
            .or_insert_with(|| Topic::new(spec.partitions));
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> BusResult<bool> {
        let state = self.shared.lock()?;
        Ok(state.topics.contains_key(topic))
    }

    async fn send(&self, records: Vec<Record>) -> BusResult<()> {
        {
            let mut state = self.shared.lock()?;
            for record in records {
                let topic = self.ensure_topic(&mut state.topics, &record.topic)?;
                let p = partition_for(&record.key, topic.partitions.len() as u32) as usize;
                topic.partitions[p].push(Stored {
                    key: record.key,
                    payload: record.payload,
                    headers: record.headers,
                });
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, group: &str, topics: &[String]) -> BusResult<Box<dyn Subscription>> {
        let mut state = self.shared.lock()?;
        for t in topics {
            self.ensure_topic(&mut state.topics, t)?;
        }
        state.groups.entry(group.to_string()).or_default();
        let member = self.shared.next_member.fetch_add(1, Ordering::Relaxed);
        debug!(group, member, topics = ?topics, "Member joined group");
        Ok(Box::new(BrokerSubscription {
            shared: Arc::clone(&self.shared),
            group: group.to_string(),
            topics: topics.to_vec(),
            member,
            cursor: 0,
        }))
    }
}

struct BrokerSubscription {
    shared: Arc<Shared>,
    group: String,
    topics: Vec<String>,
    member: u64,
    /// Round-robin start so one busy partition cannot starve the rest
    cursor: usize,
}

impl BrokerSubscription {
    fn try_take(&mut self) -> BusResult<Option<Message>> {
        let mut guard = self.shared.lock()?;
        let now = Instant::now();
        let BrokerState { topics, groups } = &mut *guard;
        let group = groups.entry(self.group.clone()).or_default();

        let mut slots: Vec<Slot> = Vec::new();
        for name in &self.topics {
            if let Some(t) = topics.get(name) {
                slots.extend((0..t.partitions.len() as u32).map(|p| (name.clone(), p)));
            }
        }
        if slots.is_empty() {
            return Ok(None);
        }

        for i in 0..slots.len() {
            let idx = (self.cursor + i) % slots.len();
            let slot = &slots[idx];
            let Some(log) = topics
                .get(&slot.0)
                .and_then(|t| t.partitions.get(slot.1 as usize))
            else {
                continue;
            };
            let committed = group.committed.get(slot).copied().unwrap_or(0);
            if committed as usize >= log.len() {
                continue;
            }
            if group
                .in_flight
                .get(slot)
                .is_some_and(|lease| lease.expires_at > now)
            {
                continue;
            }
            let stored = &log[committed as usize];
            group.in_flight.insert(
                slot.clone(),
                Lease {
                    member: self.member,
                    offset: committed,
                    expires_at: now + self.shared.lease_ttl,
                },
            );
            self.cursor = idx + 1;
            return Ok(Some(Message {
                topic: slot.0.clone(),
                partition: slot.1,
                offset: Offset::Log(committed),
                key: stored.key.clone(),
                payload: stored.payload.clone(),
                headers: stored.headers.clone(),
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl Subscription for BrokerSubscription {
    async fn poll(&mut self, max_wait: Duration) -> BusResult<Option<Message>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_take()? {
                return Ok(Some(msg));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, msg: &Message) -> BusResult<()> {
        let Offset::Log(offset) = msg.offset else {
            return Err(BusError::Backend(format!(
                "foreign offset {} committed to memory broker",
                msg.offset
            )));
        };
        {
            let mut state = self.shared.lock()?;
            let group = state.groups.entry(self.group.clone()).or_default();
            let slot = (msg.topic.clone(), msg.partition);
            match group.in_flight.get(&slot) {
                Some(lease) if lease.member == self.member && lease.offset == offset => {
                    group.in_flight.remove(&slot);
                    group.committed.insert(slot, offset + 1);
                }
                _ => {
                    // Lease expired and was taken over; the new owner redelivers
                    warn!(
                        group = %self.group,
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset,
                        "Commit ignored, partition lease lost"
                    );
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(group) = state.groups.get_mut(&self.group) {
                group.in_flight.retain(|_, lease| lease.member != self.member);
            }
        }
        self.shared.notify.notify_waiters();
    }
}
