use super::client::{NotificationClient, PublishRequest, SnsTopicAdmin};
use crate::broker::{
    Ack, BrokerAdapter, ConsumerConfig, Lifecycle, SendOptions, SubscriptionHandle,
    SubscriptionState, Subscriptions,
};
use crate::config::{Backend, Config, SnsConfig};
use crate::envelope::Envelope;
use crate::topics::{self, ResolutionStrategy, TopicRegistry};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Push-based adapter over a [`NotificationClient`].
pub struct SnsBrokerAdapter {
    client: Arc<dyn NotificationClient>,
    config: SnsConfig,
    create_topics: bool,
    registry: TopicRegistry,
    state: Lifecycle,
    subscriptions: Subscriptions,
}

impl SnsBrokerAdapter {
    pub fn new(config: &Config, client: Arc<dyn NotificationClient>) -> Result<Self> {
        Ok(Self {
            client,
            config: config.sns_config()?.clone(),
            create_topics: config.create_topics,
            registry: TopicRegistry::from_config(config),
            state: Lifecycle::Constructed,
            subscriptions: Subscriptions::default(),
        })
    }

    /// Builds the adapter with an AWS SDK client.
    #[cfg(feature = "sns")]
    pub async fn from_config(config: &Config) -> Result<Self> {
        let client = super::AwsSnsClient::from_config(config.sns_config()?).await;
        Self::new(config, Arc::new(client))
    }

    /// Resolves topic ARNs: configured ARNs first, then templated ARNs when
    /// region and account are known, then one listing pass. Provisioning
    /// replaces the listing pass when topic creation is enabled.
    async fn resolve_topics(&mut self) -> Result<()> {
        if let (Some(region), Some(account_id)) = (&self.config.region, &self.config.account_id) {
            self.registry.template_arns(region, account_id);
        }

        let admin = SnsTopicAdmin::new(self.client.as_ref());
        if self.create_topics {
            let report = topics::provision(&mut self.registry, &admin).await?;
            info!(
                existing = report.existing.len(),
                created = report.created.len(),
                "SNS topics provisioned"
            );
        } else if self.registry.unresolved().next().is_some() {
            topics::resolve_existing(&mut self.registry, &admin).await?;
        }

        for descriptor in self.registry.descriptors() {
            if descriptor.resolution() == Some(ResolutionStrategy::Static) {
                debug!(
                    aggregate = %descriptor.aggregate,
                    topic = descriptor.backend_id().unwrap_or_default(),
                    "Using configured topic ARN"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for SnsBrokerAdapter {
    fn backend(&self) -> Backend {
        Backend::Sns
    }

    fn state(&self) -> Lifecycle {
        self.state
    }

    fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    #[instrument(skip(self))]
    async fn init(&mut self) -> Result<()> {
        if !self.state.begin_init()? {
            return Ok(());
        }

        let result = self.resolve_topics().await;
        self.state.finish_init(&result);
        result
    }

    #[instrument(skip(self, config), fields(aggregates = config.aggregates.len()))]
    async fn add_consumer(&self, config: ConsumerConfig) -> Result<SubscriptionHandle> {
        self.state.ensure_initialised()?;

        let router = config.router(&self.registry)?;
        let topics = router.topics();
        let endpoint = config
            .push_endpoint
            .clone()
            .ok_or_else(|| Error::SubscriptionFailure {
                topics: topics.clone(),
                reason: "SNS consumers require a push endpoint".to_string(),
            })?;

        let mut subscribed = Vec::with_capacity(topics.len());
        for topic_arn in &topics {
            match self.client.subscribe(topic_arn, &endpoint).await {
                Ok(subscription_arn) => {
                    info!("Subscribed {} to {}", endpoint.endpoint, topic_arn);
                    subscribed.push(subscription_arn);
                }
                Err(e) => {
                    warn!("Failed to subscribe to {}: {}", topic_arn, e);
                    for subscription_arn in &subscribed {
                        if let Err(e) = self.client.unsubscribe(subscription_arn).await {
                            warn!("Failed to release subscription {}: {}", subscription_arn, e);
                        }
                    }
                    return Err(Error::SubscriptionFailure {
                        topics,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let client = self.client.clone();
        let handle = self.subscriptions.spawn(topics, Some(router), move |cancel, state| async move {
            cancel.cancelled().await;

            let mut released = true;
            for subscription_arn in &subscribed {
                if let Err(e) = client.unsubscribe(subscription_arn).await {
                    warn!("Failed to release subscription {}: {}", subscription_arn, e);
                    released = false;
                }
            }
            state.send_replace(if released {
                SubscriptionState::Stopped
            } else {
                SubscriptionState::Failed
            });
        });

        Ok(handle)
    }

    #[instrument(skip(self, envelopes, options), fields(count = envelopes.len()))]
    async fn send_message(
        &self,
        aggregate: &str,
        envelopes: &[Envelope],
        options: SendOptions,
    ) -> Result<Vec<Ack>> {
        self.state.ensure_initialised()?;
        let topic_arn = self.registry.resolve(aggregate)?;

        let fifo = topic_arn.ends_with(".fifo");
        if !fifo && options.partition_key.is_some() {
            debug!("Ignoring partition key for standard topic {}", topic_arn);
        }
        let group_id = options
            .partition_key
            .clone()
            .unwrap_or_else(|| aggregate.to_string());

        let mut acks = Vec::with_capacity(envelopes.len());
        for (i, envelope) in envelopes.iter().enumerate() {
            let request = PublishRequest {
                topic_arn: topic_arn.to_string(),
                message: envelope.to_json_string()?,
                message_group_id: fifo.then(|| group_id.clone()),
                deduplication_id: fifo.then(|| envelope.id().to_string()),
            };

            match self.client.publish(request).await {
                Ok(response) => acks.push(Ack {
                    event_id: envelope.id(),
                    topic: topic_arn.to_string(),
                    partition: None,
                    offset: None,
                    message_id: response.message_id,
                    sequence_number: response.sequence_number,
                }),
                Err(e) => {
                    warn!(
                        "Published {}/{} event(s) to {} before failure: {}",
                        i,
                        envelopes.len(),
                        topic_arn,
                        e
                    );
                    return Err(Error::publish(aggregate, envelopes[i..].to_vec(), e));
                }
            }
        }

        debug!("Published {} event(s) to {}", acks.len(), topic_arn);
        Ok(acks)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state == Lifecycle::Closed {
            return Ok(());
        }

        self.subscriptions.shutdown().await;
        self.state = Lifecycle::Closed;
        info!("SNS broker adapter disconnected");
        Ok(())
    }
}
