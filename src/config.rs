use crate::envelope::{SpecVersion, DEFAULT_CONTENT_TYPE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const PARTITIONERS: &[&str] = &[
    "random",
    "consistent",
    "consistent_random",
    "murmur2",
    "murmur2_random",
    "fnv1a",
    "fnv1a_random",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub backend: Backend,
    #[serde(default)]
    pub create_topics: bool,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub sns: Option<SnsConfig>,
    #[serde(default)]
    pub topics: BTreeMap<String, TopicConfig>,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Kafka,
    Sns,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_partitioner")]
    pub partitioner: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_partitions")]
    pub default_partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub default_replication_factor: i32,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: default_client_id(),
            group_id: default_group_id(),
            tls: None,
            partitioner: default_partitioner(),
            compression: default_compression(),
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            batch_size: default_batch_size(),
            message_timeout_ms: default_message_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            default_partitions: default_partitions(),
            default_replication_factor: default_replication_factor(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

/// Client certificate material, given as paths to PEM files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SnsConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopicConfig {
    pub topic: String,
    #[serde(default)]
    pub partitions: Option<i32>,
    #[serde(default)]
    pub replication_factor: Option<i32>,
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default)]
    pub config_entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub spec_version: SpecVersion,
    #[serde(default)]
    pub type_prefix: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            spec_version: SpecVersion::default(),
            type_prefix: None,
            content_type: default_content_type(),
        }
    }
}

/// Defaults applied to consumer registrations built from configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConsumerSettings {
    #[serde(default)]
    pub use_batches: bool,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub run: RunConfig,
}

/// Run-time tuning of a consumer loop.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    #[serde(default)]
    pub auto_commit_interval_ms: Option<u64>,
    #[serde(default = "default_partitions_consumed_concurrently")]
    pub partitions_consumed_concurrently: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            auto_commit: default_auto_commit(),
            auto_commit_interval_ms: None,
            partitions_consumed_concurrently: default_partitions_consumed_concurrently(),
            max_batch_size: default_max_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("BROKER_ADAPTER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    /// A configuration for the in-memory backend with the given topics.
    pub fn in_memory<I, A, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = (A, T)>,
        A: Into<String>,
        T: Into<String>,
    {
        Self {
            backend: Backend::Memory,
            create_topics: true,
            kafka: None,
            sns: None,
            topics: topics
                .into_iter()
                .map(|(aggregate, topic)| {
                    (
                        aggregate.into(),
                        TopicConfig {
                            topic: topic.into(),
                            ..TopicConfig::default()
                        },
                    )
                })
                .collect(),
            events: EventsConfig::default(),
            consumer: ConsumerSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.backend {
            Backend::Kafka => {
                let kafka = self.kafka_config()?;
                if kafka.brokers.is_empty() {
                    return Err(Error::Config("kafka.brokers must not be empty".to_string()));
                }
                if !PARTITIONERS.contains(&kafka.partitioner.as_str()) {
                    return Err(Error::Config(format!(
                        "unknown partitioner '{}', expected one of {:?}",
                        kafka.partitioner, PARTITIONERS
                    )));
                }
            }
            Backend::Sns => {
                self.sns_config()?;
            }
            Backend::Memory => {}
        }

        for (aggregate, topic) in &self.topics {
            if aggregate.is_empty() || topic.topic.is_empty() {
                return Err(Error::Config(format!(
                    "topic mapping '{}' -> '{}' must have non-empty names",
                    aggregate, topic.topic
                )));
            }
        }

        if self.consumer.run.partitions_consumed_concurrently == 0
            || self.consumer.run.max_batch_size == 0
        {
            return Err(Error::Config(
                "consumer concurrency and batch size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn kafka_config(&self) -> Result<&KafkaConfig> {
        self.kafka
            .as_ref()
            .ok_or_else(|| Error::Config("backend 'kafka' requires a [kafka] section".to_string()))
    }

    pub fn sns_config(&self) -> Result<&SnsConfig> {
        self.sns
            .as_ref()
            .ok_or_else(|| Error::Config("backend 'sns' requires an [sns] section".to_string()))
    }
}

fn default_client_id() -> String {
    "broker-adapter".to_string()
}

fn default_group_id() -> String {
    "broker-adapter".to_string()
}

fn default_partitioner() -> String {
    // Same key placement as the Java client
    "murmur2_random".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_batch_size() -> usize {
    16384
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn default_auto_commit() -> bool {
    true
}

fn default_partitions_consumed_concurrently() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_redelivery_delay_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_kafka_config_with_defaults() {
        let file = write_config(
            r#"
backend = "kafka"
create_topics = true

[kafka]
brokers = ["localhost:9092"]

[topics.user]
topic = "events.identity.user"
partitions = 3

[events]
spec_version = "0.3"
type_prefix = "com.example"
"#,
        );

        let config = Config::from_file(file.path()).unwrap();
        let kafka = config.kafka_config().unwrap();

        assert_eq!(config.backend, Backend::Kafka);
        assert!(config.create_topics);
        assert_eq!(kafka.partitioner, "murmur2_random");
        assert_eq!(kafka.acks, "all");
        assert_eq!(config.topics["user"].topic, "events.identity.user");
        assert_eq!(config.topics["user"].partitions, Some(3));
        assert_eq!(config.events.spec_version, SpecVersion::V0_3);
        assert_eq!(config.events.content_type, "application/json");
        assert_eq!(config.consumer.run.max_batch_size, 100);
        assert!(config.consumer.run.auto_commit);
    }

    #[test]
    fn test_missing_backend_section_is_rejected() {
        let file = write_config(
            r#"
backend = "sns"

[topics.user]
topic = "company_events_identity_user"
"#,
        );

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_partitioner_is_rejected() {
        let mut config = Config::in_memory([("user", "events.identity.user")]);
        config.backend = Backend::Kafka;
        config.kafka = Some(KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            client_id: default_client_id(),
            group_id: default_group_id(),
            tls: None,
            partitioner: "round_robin".to_string(),
            compression: default_compression(),
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            batch_size: default_batch_size(),
            message_timeout_ms: default_message_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            default_partitions: default_partitions(),
            default_replication_factor: default_replication_factor(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
        });

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_in_memory_config() {
        let config = Config::in_memory([("user", "events.identity.user"), ("order", "events.sales.order")]);

        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.topics.len(), 2);
        assert!(config.validate().is_ok());
    }
}
