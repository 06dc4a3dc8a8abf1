//! Error types and result handling for broker-adapter.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use broker_adapter::{Error, Result};
//!
//! fn resolve(aggregate: &str) -> Result<&'static str> {
//!     Err(Error::UnknownAggregate { aggregate: aggregate.to_string() })
//! }
//!
//! match resolve("user") {
//!     Ok(topic) => println!("Publishing to {}", topic),
//!     Err(Error::UnknownAggregate { aggregate }) => eprintln!("No topic for {}", aggregate),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use crate::envelope::Envelope;
use thiserror::Error;

/// Boxed error produced by a backend client or a message handler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A topic that could not be created or reconciled during provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFailure {
    /// Backend topic name
    pub topic: String,
    /// Reason reported by the backend
    pub reason: String,
}

/// The main error type for broker-adapter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation other than `init` was called before `init` completed.
    #[error("Broker adapter is not initialised")]
    NotInitialised,

    /// No topic is mapped (or resolved) for the aggregate.
    #[error("No topic for aggregate: {aggregate}")]
    UnknownAggregate {
        /// The aggregate that was looked up
        aggregate: String,
    },

    /// One or more topics could not be created or reconciled.
    #[error("Topic provisioning failed: {}", describe_failures(.failures))]
    ProvisioningFailure {
        /// Every topic that failed, in registry order
        failures: Vec<TopicFailure>,
    },

    /// The backend rejected a send or failed to acknowledge it.
    #[error("Error publishing {} {} event(s): {source}", .aggregate, .attempted.len())]
    PublishFailure {
        /// Aggregate the events were published for
        aggregate: String,
        /// Envelopes that were not acknowledged
        attempted: Vec<Envelope>,
        /// Error reported by the backend client
        #[source]
        source: BoxError,
    },

    /// Subscribing to one of the requested topics failed.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailure {
        /// Topics requested by the registration
        topics: Vec<String>,
        /// Description of the failure
        reason: String,
    },

    /// A caller supplied handler returned an error for a message.
    #[error("Handler failed for {topic}[{partition}]@{offset}: {source}")]
    HandlerFault {
        /// Topic the message was read from
        topic: String,
        /// Partition the message was read from
        partition: i32,
        /// Offset of the failed message
        offset: i64,
        /// Error returned by the handler
        #[source]
        source: BoxError,
    },

    /// Kafka client, producer or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Notification service client error.
    #[error("SNS error: {0}")]
    Sns(#[source] BoxError),

    /// JSON serialization error when encoding or decoding envelopes.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or malformed wire message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// I/O error, typically from reading TLS material or configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable label used in structured logs.
    pub fn classification(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::NotInitialised => "precondition",
            Error::UnknownAggregate { .. } => "precondition",
            Error::ProvisioningFailure { .. } => "provisioning",
            Error::PublishFailure { .. } => "publish",
            Error::SubscriptionFailure { .. } => "subscription",
            Error::HandlerFault { .. } => "handler",
            Error::Kafka(_) | Error::Sns(_) => "backend",
            Error::Serialization(_) | Error::InvalidMessage { .. } => "serialization",
            Error::Io(_) => "io",
        }
    }

    pub(crate) fn publish(
        aggregate: &str,
        attempted: Vec<Envelope>,
        source: impl Into<BoxError>,
    ) -> Self {
        Error::PublishFailure {
            aggregate: aggregate.to_string(),
            attempted,
            source: source.into(),
        }
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }
}

fn describe_failures(failures: &[TopicFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.topic, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A convenient Result type alias for broker-adapter operations.
///
/// This is equivalent to `std::result::Result<T, broker_adapter::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_failure_lists_every_topic() {
        let err = Error::ProvisioningFailure {
            failures: vec![
                TopicFailure {
                    topic: "events.user".to_string(),
                    reason: "policy violation".to_string(),
                },
                TopicFailure {
                    topic: "events.order".to_string(),
                    reason: "invalid replication factor".to_string(),
                },
            ],
        };

        let text = err.to_string();
        assert!(text.contains("events.user: policy violation"));
        assert!(text.contains("events.order: invalid replication factor"));
        assert_eq!(err.classification(), "provisioning");
    }

    #[test]
    fn test_publish_failure_keeps_source() {
        let err = Error::publish("user", Vec::new(), "broker unavailable");

        assert_eq!(err.classification(), "publish");
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("broker unavailable"));
    }
}
