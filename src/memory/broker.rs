use crate::dispatch::WireMessage;
use crate::topics::{TopicAdmin, TopicDescriptor, TopicOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<Vec<StoredMessage>>,
    next_unkeyed: usize,
}

#[derive(Debug, Default)]
struct GroupState {
    generation: u64,
    /// Members in join order with the topics each subscribed to
    members: Vec<(u64, Vec<String>)>,
    committed: HashMap<(String, i32), i64>,
}

impl GroupState {
    /// Position of `member` among the members subscribed to `topic`, and
    /// how many such members there are.
    fn slot(&self, member: u64, topic: &str) -> Option<(usize, usize)> {
        let subscribers: Vec<u64> = self
            .members
            .iter()
            .filter(|(_, topics)| topics.iter().any(|t| t == topic))
            .map(|(id, _)| *id)
            .collect();
        let index = subscribers.iter().position(|id| *id == member)?;
        Some((index, subscribers.len()))
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    rejected: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    published: Notify,
    creations: AtomicUsize,
    next_member: AtomicU64,
}

/// A process-local partitioned log with consumer groups.
///
/// Keyed messages land on `fnv1a(key) % partitions`; an unkeyed publish
/// call sticks to one partition, rotating between calls. Partitions are
/// assigned round robin among the group members subscribed to each topic,
/// and every join or leave starts a
/// new generation. Committed offsets point at the next message to read.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a topic. Returns false if it already existed.
    pub fn create_topic(&self, name: &str, partitions: usize) -> bool {
        let mut state = self.state();
        if state.topics.contains_key(name) {
            return false;
        }
        state.topics.insert(
            name.to_string(),
            TopicLog {
                partitions: vec![Vec::new(); partitions.max(1)],
                next_unkeyed: 0,
            },
        );
        true
    }

    /// Makes later creation attempts for `name` fail.
    pub fn reject_topic(&self, name: &str) {
        self.state().rejected.insert(name.to_string());
    }

    pub fn topics(&self) -> Vec<String> {
        self.state().topics.keys().cloned().collect()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state().topics.get(topic).map(|t| t.partitions.len())
    }

    /// Number of topic creations requested through [`TopicAdmin`].
    pub fn creation_count(&self) -> usize {
        self.inner.creations.load(Ordering::SeqCst)
    }

    /// Appends every payload atomically. Returns `(partition, offset)` per
    /// payload.
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payloads: Vec<Vec<u8>>,
    ) -> Result<Vec<(i32, i64)>> {
        let mut state = self.state();
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::invalid_message(format!("unknown topic '{}'", topic)))?;

        let count = log.partitions.len();
        let partition = match key {
            Some(key) => (fnv1a(key) % count as u64) as usize,
            None => {
                let partition = log.next_unkeyed % count;
                log.next_unkeyed = log.next_unkeyed.wrapping_add(1);
                partition
            }
        };

        let timestamp_ms = Utc::now().timestamp_millis();
        let messages = &mut log.partitions[partition];
        let positions = payloads
            .into_iter()
            .map(|payload| {
                messages.push(StoredMessage {
                    key: key.map(<[u8]>::to_vec),
                    payload,
                    timestamp_ms,
                });
                (partition as i32, messages.len() as i64 - 1)
            })
            .collect();
        drop(state);

        self.inner.published.notify_waiters();
        Ok(positions)
    }

    /// Reads up to `max` messages starting at `from`.
    pub fn read(&self, topic: &str, partition: i32, from: i64, max: usize) -> Vec<WireMessage> {
        let state = self.state();
        let Some(messages) = state
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
        else {
            return Vec::new();
        };

        let start = from.max(0) as usize;
        messages
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, stored)| WireMessage {
                topic: topic.to_string(),
                partition,
                offset: offset as i64,
                key: stored.key.clone(),
                payload: stored.payload.clone(),
                timestamp_ms: Some(stored.timestamp_ms),
            })
            .collect()
    }

    pub fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        self.state()
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .map_or(0, |messages| messages.len() as i64)
    }

    /// Resolves when something is published.
    pub async fn wait_for_publish(&self) {
        self.inner.published.notified().await;
    }

    /// Adds a member to `group`. Fails when a topic does not exist.
    pub fn join(&self, group: &str, topics: &[String]) -> Result<u64> {
        let mut state = self.state();
        let missing: Vec<String> = topics
            .iter()
            .filter(|t| !state.topics.contains_key(t.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::SubscriptionFailure {
                topics: topics.to_vec(),
                reason: format!("unknown topic(s): {}", missing.join(", ")),
            });
        }

        let member = self.inner.next_member.fetch_add(1, Ordering::SeqCst);
        let group = state.groups.entry(group.to_string()).or_default();
        group.members.push((member, topics.to_vec()));
        group.generation += 1;
        debug!(member, generation = group.generation, "Member joined group");
        Ok(member)
    }

    pub fn leave(&self, group: &str, member: u64) {
        let mut state = self.state();
        if let Some(group) = state.groups.get_mut(group) {
            let before = group.members.len();
            group.members.retain(|(m, _)| *m != member);
            if group.members.len() != before {
                group.generation += 1;
            }
        }
    }

    pub fn generation(&self, group: &str) -> u64 {
        self.state().groups.get(group).map_or(0, |g| g.generation)
    }

    /// Partitions of `topics` assigned to `member`. Each topic's partitions
    /// are shared only among the members subscribed to it.
    pub fn assignment(&self, group: &str, member: u64, topics: &[String]) -> Vec<(String, i32)> {
        let state = self.state();
        let Some(group) = state.groups.get(group) else {
            return Vec::new();
        };

        topics
            .iter()
            .filter_map(|topic| {
                let count = state.topics.get(topic)?.partitions.len();
                let (index, members) = group.slot(member, topic)?;
                Some((topic, count, index, members))
            })
            .flat_map(|(topic, count, index, members)| {
                (0..count)
                    .filter(move |p| p % members == index)
                    .map(move |p| (topic.clone(), p as i32))
            })
            .collect()
    }

    pub fn is_assigned(&self, group: &str, member: u64, topic: &str, partition: i32) -> bool {
        let state = self.state();
        let exists = state
            .topics
            .get(topic)
            .map_or(false, |log| partition >= 0 && (partition as usize) < log.partitions.len());
        let Some(group) = state.groups.get(group) else {
            return false;
        };
        match group.slot(member, topic) {
            Some((index, members)) => exists && partition as usize % members == index,
            None => false,
        }
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    pub fn commit(&self, group: &str, topic: &str, partition: i32, next_offset: i64) {
        let mut state = self.state();
        let group = state.groups.entry(group.to_string()).or_default();
        group
            .committed
            .insert((topic.to_string(), partition), next_offset);
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.topics())
    }

    async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<Vec<TopicOutcome>> {
        let outcomes = topics
            .iter()
            .map(|descriptor| {
                self.inner.creations.fetch_add(1, Ordering::SeqCst);
                let rejected = self.state().rejected.contains(&descriptor.name);
                let result = if rejected {
                    Err(format!("creation of '{}' rejected", descriptor.name))
                } else {
                    let partitions = descriptor.partitions.unwrap_or(1).max(1) as usize;
                    self.create_topic(&descriptor.name, partitions);
                    Ok(None)
                };
                TopicOutcome {
                    topic: descriptor.name.clone(),
                    result,
                }
            })
            .collect();
        Ok(outcomes)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
