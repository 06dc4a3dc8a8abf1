#![allow(dead_code)]

use broker_adapter::config::{KafkaConfig, RunConfig};
use broker_adapter::{
    handler_fn, Backend, Config, Envelope, EnvelopeFactory, EnvelopeOptions, MessageHandler,
    WireMessage,
};
use serde_json::Value;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory configuration with fast polling for tests.
pub fn memory_config(topics: &[(&str, &str)]) -> Config {
    let mut config = Config::in_memory(topics.iter().copied());
    config.consumer.run = RunConfig {
        poll_interval_ms: 10,
        redelivery_delay_ms: 20,
        ..RunConfig::default()
    };
    config
}

/// Kafka configuration from `TEST_KAFKA_BROKERS`, with names unique per process.
pub fn kafka_config(aggregates: &[&str]) -> Config {
    let id = std::process::id();
    let topics: Vec<(String, String)> = aggregates
        .iter()
        .map(|aggregate| (aggregate.to_string(), format!("test_{}.{}", id, aggregate)))
        .collect();

    let mut config = Config::in_memory(topics);
    config.backend = Backend::Kafka;
    config.kafka = Some(KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        client_id: format!("broker-adapter-test-{}", id),
        group_id: format!("broker-adapter-test-{}", id),
        compression: "none".to_string(), // No compression for tests
        acks: "all".to_string(),
        linger_ms: 0,
        batch_size: 1,
        default_partitions: 3,
        ..KafkaConfig::default()
    });
    config.consumer.run.poll_interval_ms = 10;
    config.consumer.run.redelivery_delay_ms = 100;
    config
}

pub fn factory() -> EnvelopeFactory {
    EnvelopeFactory::default()
}

pub fn event(aggregate: &str, event_type: &str, data: Value) -> Envelope {
    factory()
        .create(aggregate, event_type, "/tests", &data, EnvelopeOptions::default())
        .unwrap()
}

/// Handler that records every message it sees.
#[derive(Clone, Default)]
pub struct Collector {
    received: Arc<Mutex<Vec<WireMessage>>>,
}

impl Collector {
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        let received = self.received.clone();
        handler_fn(move |message| {
            let received = received.clone();
            async move {
                received.lock().unwrap().push(message);
                Ok(())
            }
        })
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.messages()
            .iter()
            .map(|message| message.envelope().unwrap())
            .collect()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
