use super::broker::InMemoryBroker;
use crate::broker::{
    Ack, BrokerAdapter, ConsumerConfig, Lifecycle, SendOptions, SubscriptionHandle,
    SubscriptionState, Subscriptions,
};
use crate::config::{Backend, Config, RunConfig};
use crate::dispatch::{dispatch_partition, BatchControl, BatchOutcome, Router, WireMessage};
use crate::envelope::Envelope;
use crate::topics::{self, TopicRegistry};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Adapter over an [`InMemoryBroker`].
pub struct InMemoryBrokerAdapter {
    broker: InMemoryBroker,
    create_topics: bool,
    default_group_id: String,
    registry: TopicRegistry,
    state: Lifecycle,
    subscriptions: Subscriptions,
}

impl InMemoryBrokerAdapter {
    pub fn new(config: &Config, broker: InMemoryBroker) -> Self {
        Self {
            broker,
            create_topics: config.create_topics,
            default_group_id: config
                .consumer
                .group_id
                .clone()
                .unwrap_or_else(|| "broker-adapter".to_string()),
            registry: TopicRegistry::from_config(config),
            state: Lifecycle::Constructed,
            subscriptions: Subscriptions::default(),
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    async fn attach(&mut self) -> Result<()> {
        if self.create_topics {
            topics::provision(&mut self.registry, &self.broker).await?;
        }
        self.registry.bind_names();
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryBrokerAdapter {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn state(&self) -> Lifecycle {
        self.state
    }

    fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    async fn init(&mut self) -> Result<()> {
        if !self.state.begin_init()? {
            return Ok(());
        }

        let result = self.attach().await;
        self.state.finish_init(&result);
        result
    }

    #[instrument(skip(self, config), fields(aggregates = config.aggregates.len()))]
    async fn add_consumer(&self, config: ConsumerConfig) -> Result<SubscriptionHandle> {
        self.state.ensure_initialised()?;

        let router = config.router(&self.registry)?;
        let topics = router.topics();
        let group = config
            .group_id
            .clone()
            .unwrap_or_else(|| self.default_group_id.clone());

        let mut from_beginning = HashSet::new();
        for (aggregate, consumer) in &config.aggregates {
            if consumer.from_beginning {
                from_beginning.insert(self.registry.resolve(aggregate)?.to_string());
            }
        }

        let member = self.broker.join(&group, &topics)?;
        let mut latest = HashMap::new();
        for topic in topics.iter().filter(|t| !from_beginning.contains(*t)) {
            let partitions = self.broker.partition_count(topic).unwrap_or(0);
            for partition in 0..partitions as i32 {
                latest.insert(
                    (topic.clone(), partition),
                    self.broker.end_offset(topic, partition),
                );
            }
        }
        info!(group = %group, member, topics = ?topics, "In-memory consumer subscribed");

        let worker = PollLoop {
            broker: self.broker.clone(),
            group,
            member,
            topics: topics.clone(),
            from_beginning,
            latest,
            router: Arc::new(router),
            use_batches: config.use_batches,
            run: config.run,
        };
        Ok(self
            .subscriptions
            .spawn(topics, None, move |cancel, state| worker.run(cancel, state)))
    }

    async fn send_message(
        &self,
        aggregate: &str,
        envelopes: &[Envelope],
        options: SendOptions,
    ) -> Result<Vec<Ack>> {
        self.state.ensure_initialised()?;
        let topic = self.registry.resolve(aggregate)?;

        let payloads = envelopes
            .iter()
            .map(Envelope::to_vec)
            .collect::<Result<Vec<_>>>()?;
        let key = options.partition_key.as_deref().map(str::as_bytes);
        let positions = self
            .broker
            .publish(topic, key, payloads)
            .map_err(|e| Error::publish(aggregate, envelopes.to_vec(), e))?;

        debug!("Appended {} event(s) to {}", positions.len(), topic);
        Ok(envelopes
            .iter()
            .zip(positions)
            .map(|(envelope, (partition, offset))| Ack::positioned(envelope, topic, partition, offset))
            .collect())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state == Lifecycle::Closed {
            return Ok(());
        }

        self.subscriptions.shutdown().await;
        self.state = Lifecycle::Closed;
        info!("In-memory broker adapter disconnected");
        Ok(())
    }
}

struct PollLoop {
    broker: InMemoryBroker,
    group: String,
    member: u64,
    topics: Vec<String>,
    from_beginning: HashSet<String>,
    latest: HashMap<(String, i32), i64>,
    router: Arc<Router>,
    use_batches: bool,
    run: RunConfig,
}

impl PollLoop {
    fn start_offset(&self, topic: &str, partition: i32) -> i64 {
        if let Some(committed) = self.broker.committed(&self.group, topic, partition) {
            return committed;
        }
        if self.from_beginning.contains(topic) {
            0
        } else {
            self.latest
                .get(&(topic.to_string(), partition))
                .copied()
                .unwrap_or(0)
        }
    }

    async fn run(self, cancel: CancellationToken, state: watch::Sender<SubscriptionState>) {
        let poll_interval = Duration::from_millis(self.run.poll_interval_ms);
        let redelivery_delay = Duration::from_millis(self.run.redelivery_delay_ms);
        let concurrency = self.run.partitions_consumed_concurrently.max(1);

        let mut positions: HashMap<(String, i32), i64> = HashMap::new();
        let mut generation = self.broker.generation(&self.group);

        while !cancel.is_cancelled() {
            let current = self.broker.generation(&self.group);
            if current != generation {
                debug!(group = %self.group, generation = current, "Group rebalanced");
                positions.clear();
                generation = current;
            }

            let mut batches = Vec::new();
            for (topic, partition) in self.broker.assignment(&self.group, self.member, &self.topics) {
                let position = match positions.get(&(topic.clone(), partition)) {
                    Some(position) => *position,
                    None => self.start_offset(&topic, partition),
                };
                positions.insert((topic.clone(), partition), position);

                let messages = self
                    .broker
                    .read(&topic, partition, position, self.run.max_batch_size);
                if !messages.is_empty() {
                    batches.push(messages);
                }
            }

            if batches.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.broker.wait_for_publish() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }

            let results: Vec<(WireMessage, Result<BatchOutcome>)> = stream::iter(batches)
                .map(|messages| {
                    let first = messages[0].clone();
                    let control = PartitionControl {
                        broker: self.broker.clone(),
                        group: self.group.clone(),
                        member: self.member,
                        topic: first.topic.clone(),
                        partition: first.partition,
                        generation,
                        cancel: cancel.clone(),
                    };
                    let router = self.router.clone();
                    let use_batches = self.use_batches;
                    async move {
                        let outcome =
                            dispatch_partition(&router, &messages, &control, use_batches).await;
                        (first, outcome)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let mut faulted = false;
            for (first, result) in results {
                let key = (first.topic.clone(), first.partition);
                match result {
                    Ok(outcome) if outcome.rewind_to().is_none() => {
                        positions.insert(key, first.offset + outcome.processed as i64);
                    }
                    Ok(_) => {
                        positions.remove(&key);
                        faulted = true;
                    }
                    Err(e) => {
                        error!(
                            topic = %first.topic,
                            partition = first.partition,
                            "Partition dispatch failed: {}", e
                        );
                        positions.remove(&key);
                        faulted = true;
                    }
                }
            }

            if faulted {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(redelivery_delay) => {}
                }
            }
        }

        self.broker.leave(&self.group, self.member);
        state.send_replace(SubscriptionState::Stopped);
        info!(group = %self.group, member = self.member, "In-memory consumer stopped");
    }
}

struct PartitionControl {
    broker: InMemoryBroker,
    group: String,
    member: u64,
    topic: String,
    partition: i32,
    generation: u64,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchControl for PartitionControl {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .broker
                .is_assigned(&self.group, self.member, &self.topic, self.partition)
    }

    fn is_stale(&self) -> bool {
        self.broker.generation(&self.group) != self.generation
    }

    async fn resolve_offset(&self, message: &WireMessage) -> Result<()> {
        self.broker
            .commit(&self.group, &message.topic, message.partition, message.offset + 1);
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }
}
