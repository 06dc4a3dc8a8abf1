use crate::broker::SubscriptionState;
use crate::config::{KafkaConfig, RunConfig};
use crate::dispatch::{dispatch_partition, BatchControl, BatchOutcome, Router, WireMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Assignment = HashSet<(String, i32)>;

/// A manual commit is due only when auto commit is off and the batch
/// stored at least one offset. Committing with nothing stored fails
/// with `NoOffset`.
pub(crate) fn commit_due(
    auto_commit: bool,
    results: &[((String, i32), Result<BatchOutcome>)],
) -> bool {
    !auto_commit
        && results
            .iter()
            .any(|(_, result)| matches!(result, Ok(outcome) if outcome.processed > 0))
}

/// Creates a consumer for `group_id` and subscribes it to `topics`.
///
/// Offsets are stored explicitly once a message is handled. With
/// `auto_commit` the stored offsets are committed in the background,
/// otherwise after every batch.
pub(crate) fn subscribe(
    config: &KafkaConfig,
    group_id: &str,
    topics: &[String],
    from_beginning: bool,
    run: &RunConfig,
) -> Result<StreamConsumer> {
    let mut client = super::client_config(config);
    client
        .set("group.id", group_id)
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", run.auto_commit.to_string())
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set(
            "auto.offset.reset",
            if from_beginning { "earliest" } else { "latest" },
        );
    if let Some(interval) = run.auto_commit_interval_ms {
        client.set("auto.commit.interval.ms", interval.to_string());
    }

    let consumer: StreamConsumer = client.create().map_err(|e| Error::Kafka(e))?;

    let names: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&names)
        .map_err(|e| Error::SubscriptionFailure {
            topics: topics.to_vec(),
            reason: e.to_string(),
        })?;

    info!(group = %group_id, topics = ?topics, "Kafka consumer subscribed");
    Ok(consumer)
}

fn wire_message<M: Message>(message: &M) -> WireMessage {
    WireMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

fn current_assignment(consumer: &StreamConsumer) -> Assignment {
    match consumer.assignment() {
        Ok(list) => list
            .elements()
            .iter()
            .map(|elem| (elem.topic().to_string(), elem.partition()))
            .collect(),
        Err(e) => {
            warn!("Failed to read consumer assignment: {}", e);
            HashSet::new()
        }
    }
}

pub(crate) struct ConsumerLoop {
    pub consumer: Arc<StreamConsumer>,
    pub router: Arc<Router>,
    pub use_batches: bool,
    pub run: RunConfig,
}

impl ConsumerLoop {
    pub async fn run(self, cancel: CancellationToken, state: watch::Sender<SubscriptionState>) {
        let consumer = self.consumer.clone();
        let concurrency = self.run.partitions_consumed_concurrently.max(1);
        let redelivery_delay = Duration::from_millis(self.run.redelivery_delay_ms);

        // Partitions rewound after a fault skip messages until the rewound
        // offset arrives again
        let mut rewound: HashMap<(String, i32), i64> = HashMap::new();
        let mut messages = consumer
            .stream()
            .map(|result| result.map(|message| wire_message(&message)))
            .ready_chunks(self.run.max_batch_size.max(1));

        let mut failed = false;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => match next {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let mut partitions: BTreeMap<(String, i32), Vec<WireMessage>> = BTreeMap::new();
            for item in chunk {
                let message = match item {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Kafka consumer error: {}", e);
                        continue;
                    }
                };
                let key = (message.topic.clone(), message.partition);
                if let Some(expected) = rewound.get(&key) {
                    if message.offset != *expected {
                        debug!(offset = message.offset, expected, "Skipping message fetched before rewind");
                        continue;
                    }
                    rewound.remove(&key);
                }
                partitions.entry(key).or_default().push(message);
            }
            if partitions.is_empty() {
                continue;
            }

            let assignment = Arc::new(current_assignment(&consumer));
            let results: Vec<((String, i32), Result<BatchOutcome>)> = stream::iter(partitions)
                .map(|(key, batch)| {
                    let control = PartitionControl {
                        consumer: consumer.clone(),
                        topic: key.0.clone(),
                        partition: key.1,
                        assignment: assignment.clone(),
                        cancel: cancel.clone(),
                    };
                    let router = self.router.clone();
                    let use_batches = self.use_batches;
                    async move {
                        let outcome = dispatch_partition(&router, &batch, &control, use_batches).await;
                        (key, outcome)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let commit = commit_due(self.run.auto_commit, &results);
            let mut faults = Vec::new();
            for (key, result) in results {
                match result {
                    Ok(outcome) => {
                        if let Some(offset) = outcome.rewind_to() {
                            faults.push((key, offset));
                        }
                    }
                    Err(e) => {
                        error!(topic = %key.0, partition = key.1, "Partition dispatch failed: {}", e);
                        failed = true;
                    }
                }
            }

            if commit {
                if let Err(e) = consumer.commit_consumer_state(CommitMode::Async) {
                    warn!("Failed to commit offsets: {}", e);
                }
            }

            if failed {
                break;
            }

            if !faults.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(redelivery_delay) => {}
                }
                for ((topic, partition), offset) in faults {
                    match consumer.seek(&topic, partition, Offset::Offset(offset), Duration::from_secs(5)) {
                        Ok(()) => {
                            debug!(topic = %topic, partition, offset, "Rewound partition for redelivery");
                            rewound.insert((topic, partition), offset);
                        }
                        Err(e) => {
                            error!(topic = %topic, partition, offset, "Failed to rewind partition: {}", e);
                        }
                    }
                }
            }
        }

        drop(messages);
        if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
            debug!("Final offset commit skipped: {}", e);
        }
        consumer.unsubscribe();
        state.send_replace(if failed {
            SubscriptionState::Failed
        } else {
            SubscriptionState::Stopped
        });
        info!("Kafka consumer stopped");
    }
}

struct PartitionControl {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    /// Assignment when the batch was fetched
    assignment: Arc<Assignment>,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchControl for PartitionControl {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && current_assignment(&self.consumer).contains(&(self.topic.clone(), self.partition))
    }

    fn is_stale(&self) -> bool {
        current_assignment(&self.consumer) != *self.assignment
    }

    async fn resolve_offset(&self, message: &WireMessage) -> Result<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .map_err(|e| Error::Kafka(e))?;
        self.consumer
            .store_offsets(&list)
            .map_err(|e| Error::Kafka(e))
    }

    async fn heartbeat(&self) -> Result<()> {
        // librdkafka heartbeats in the background; surface a fatal client error
        match self.consumer.client().fatal_error() {
            Some((code, reason)) => {
                error!("Fatal Kafka consumer error: {}", reason);
                Err(Error::Kafka(KafkaError::MessageConsumption(code)))
            }
            None => Ok(()),
        }
    }
}
