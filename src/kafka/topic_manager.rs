use crate::config::KafkaConfig;
use crate::topics::{TopicAdmin, TopicDescriptor, TopicOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct KafkaTopicAdmin {
    admin_client: AdminClient<DefaultClientContext>,
    default_partitions: i32,
    default_replication_factor: i32,
    metadata_timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin_client: AdminClient<_> = super::client_config(config)
            .create()
            .map_err(|e| Error::Kafka(e))?;

        Ok(Self {
            admin_client,
            default_partitions: config.default_partitions,
            default_replication_factor: config.default_replication_factor,
            metadata_timeout: Duration::from_secs(config.metadata_timeout_secs),
        })
    }

    /// Fetches cluster metadata, failing when no broker answers in time.
    pub fn check_connection(&self) -> Result<usize> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(None, self.metadata_timeout)
            .map_err(|e| Error::Kafka(e))?;

        debug!(
            "Connected to {} broker(s), {} topic(s)",
            metadata.brokers().len(),
            metadata.topics().len()
        );
        Ok(metadata.brokers().len())
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    pub async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let opts = AdminOptions::new()
            .operation_timeout(Some(Duration::from_secs(30)));

        let results = self.admin_client
            .delete_topics(&[topic_name], &opts)
            .await
            .map_err(|e| Error::Kafka(e))?;

        for result in results {
            match result {
                Ok(topic) => {
                    info!("Successfully deleted topic: {}", topic);
                }
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(None, self.metadata_timeout)
            .map_err(|e| Error::Kafka(e))?;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }

    #[instrument(skip(self, topics), fields(count = topics.len()))]
    async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<Vec<TopicOutcome>> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|descriptor| {
                let mut topic = NewTopic::new(
                    &descriptor.name,
                    descriptor.partitions.unwrap_or(self.default_partitions),
                    TopicReplication::Fixed(
                        descriptor
                            .replication_factor
                            .unwrap_or(self.default_replication_factor),
                    ),
                );
                for (key, value) in &descriptor.config_entries {
                    topic = topic.set(key, value);
                }
                topic
            })
            .collect();

        let opts = AdminOptions::new()
            .operation_timeout(Some(Duration::from_secs(30)));

        let results = self.admin_client
            .create_topics(&new_topics, &opts)
            .await
            .map_err(|e| Error::Kafka(e))?;

        Ok(results
            .into_iter()
            .map(|result| match result {
                Ok(topic) => TopicOutcome {
                    topic,
                    result: Ok(None),
                },
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' was created concurrently", topic);
                    TopicOutcome {
                        topic,
                        result: Ok(None),
                    }
                }
                Err((topic, code)) => TopicOutcome {
                    topic,
                    result: Err(code.to_string()),
                },
            })
            .collect())
    }
}
