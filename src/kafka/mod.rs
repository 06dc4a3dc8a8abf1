pub mod adapter;
pub mod consumer;
pub mod producer;
pub mod topic_manager;


pub use adapter::KafkaBrokerAdapter;
pub use producer::KafkaProducer;
pub use topic_manager::KafkaTopicAdmin;

use crate::config::KafkaConfig;
use rdkafka::ClientConfig;

/// Settings shared by the producer, consumer and admin clients.
pub(crate) fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id);

    if let Some(tls) = &config.tls {
        client
            .set("security.protocol", "ssl")
            .set("ssl.certificate.location", tls.cert_path.to_string_lossy())
            .set("ssl.key.location", tls.key_path.to_string_lossy());
        if let Some(ca) = &tls.ca_path {
            client.set("ssl.ca.location", ca.to_string_lossy());
        }
    }

    client
}
