use super::consumer::{self, ConsumerLoop};
use super::{KafkaProducer, KafkaTopicAdmin};
use crate::broker::{
    Ack, BrokerAdapter, ConsumerConfig, Lifecycle, SendOptions, SubscriptionHandle, Subscriptions,
};
use crate::config::{Backend, Config, KafkaConfig};
use crate::envelope::Envelope;
use crate::topics::{self, TopicRegistry};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub struct KafkaBrokerAdapter {
    config: KafkaConfig,
    create_topics: bool,
    default_group_id: String,
    registry: TopicRegistry,
    producer: Option<KafkaProducer>,
    state: Lifecycle,
    subscriptions: Subscriptions,
}

impl KafkaBrokerAdapter {
    /// Validates the configuration without connecting.
    pub fn new(config: &Config) -> Result<Self> {
        let kafka = config.kafka_config()?.clone();
        let default_group_id = config
            .consumer
            .group_id
            .clone()
            .unwrap_or_else(|| kafka.group_id.clone());

        Ok(Self {
            config: kafka,
            create_topics: config.create_topics,
            default_group_id,
            registry: TopicRegistry::from_config(config),
            producer: None,
            state: Lifecycle::Constructed,
            subscriptions: Subscriptions::default(),
        })
    }

    async fn connect(&mut self) -> Result<()> {
        let admin = KafkaTopicAdmin::new(&self.config)?;
        let brokers = admin.check_connection()?;
        info!("Connected to Kafka cluster with {} broker(s)", brokers);

        let producer = KafkaProducer::new(&self.config)?;
        if self.create_topics {
            let report = topics::provision(&mut self.registry, &admin).await?;
            info!(
                existing = report.existing.len(),
                created = report.created.len(),
                "Kafka topics provisioned"
            );
        }
        self.registry.bind_names();

        self.producer = Some(producer);
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for KafkaBrokerAdapter {
    fn backend(&self) -> Backend {
        Backend::Kafka
    }

    fn state(&self) -> Lifecycle {
        self.state
    }

    fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    #[instrument(skip(self), fields(brokers = %self.config.brokers.join(",")))]
    async fn init(&mut self) -> Result<()> {
        if !self.state.begin_init()? {
            return Ok(());
        }

        let result = self.connect().await;
        if result.is_err() {
            self.producer = None;
        }
        self.state.finish_init(&result);
        result
    }

    #[instrument(skip(self, config), fields(aggregates = config.aggregates.len()))]
    async fn add_consumer(&self, config: ConsumerConfig) -> Result<SubscriptionHandle> {
        self.state.ensure_initialised()?;

        let router = config.router(&self.registry)?;
        let topics = router.topics();
        let group_id = config
            .group_id
            .clone()
            .unwrap_or_else(|| self.default_group_id.clone());

        let stream_consumer = consumer::subscribe(
            &self.config,
            &group_id,
            &topics,
            config.from_beginning(),
            &config.run,
        )?;

        let worker = ConsumerLoop {
            consumer: Arc::new(stream_consumer),
            router: Arc::new(router),
            use_batches: config.use_batches,
            run: config.run,
        };
        Ok(self
            .subscriptions
            .spawn(topics, None, move |cancel, state| worker.run(cancel, state)))
    }

    #[instrument(skip(self, envelopes, options), fields(count = envelopes.len()))]
    async fn send_message(
        &self,
        aggregate: &str,
        envelopes: &[Envelope],
        options: SendOptions,
    ) -> Result<Vec<Ack>> {
        self.state.ensure_initialised()?;
        let topic = self.registry.resolve(aggregate)?;
        let producer = self.producer.as_ref().ok_or(Error::NotInitialised)?;

        producer
            .send_batch(aggregate, topic, options.partition_key.as_deref(), envelopes)
            .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state == Lifecycle::Closed {
            return Ok(());
        }

        self.subscriptions.shutdown().await;
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.flush(Duration::from_millis(self.config.message_timeout_ms)) {
                warn!("Failed to flush producer on disconnect: {}", e);
            }
        }
        self.state = Lifecycle::Closed;
        info!("Kafka broker adapter disconnected");
        Ok(())
    }
}
