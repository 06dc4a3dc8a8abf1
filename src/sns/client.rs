use crate::broker::PushEndpoint;
use crate::error::BoxError;
use crate::topics::{TopicAdmin, TopicDescriptor, TopicOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Delivery protocol of an SNS subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnsProtocol {
    Http,
    Https,
    Email,
    EmailJson,
    Sms,
    Sqs,
    Application,
    Lambda,
    Firehose,
}

impl SnsProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnsProtocol::Http => "http",
            SnsProtocol::Https => "https",
            SnsProtocol::Email => "email",
            SnsProtocol::EmailJson => "email-json",
            SnsProtocol::Sms => "sms",
            SnsProtocol::Sqs => "sqs",
            SnsProtocol::Application => "application",
            SnsProtocol::Lambda => "lambda",
            SnsProtocol::Firehose => "firehose",
        }
    }
}

impl fmt::Display for SnsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnsProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(SnsProtocol::Http),
            "https" => Ok(SnsProtocol::Https),
            "email" => Ok(SnsProtocol::Email),
            "email-json" => Ok(SnsProtocol::EmailJson),
            "sms" => Ok(SnsProtocol::Sms),
            "sqs" => Ok(SnsProtocol::Sqs),
            "application" => Ok(SnsProtocol::Application),
            "lambda" => Ok(SnsProtocol::Lambda),
            "firehose" => Ok(SnsProtocol::Firehose),
            other => Err(Error::Config(format!("unknown SNS protocol '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic_arn: String,
    pub message: String,
    /// Required by FIFO topics, rejected by standard ones
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResponse {
    pub message_id: Option<String>,
    pub sequence_number: Option<String>,
}

/// The SNS operations the adapter needs.
#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn list_topic_arns(&self) -> std::result::Result<Vec<String>, BoxError>;

    /// Creates (or returns the existing) topic and returns its ARN.
    async fn create_topic(
        &self,
        name: &str,
        aggregate: &str,
        attributes: &BTreeMap<String, String>,
    ) -> std::result::Result<String, BoxError>;

    /// Returns the subscription ARN.
    async fn subscribe(
        &self,
        topic_arn: &str,
        endpoint: &PushEndpoint,
    ) -> std::result::Result<String, BoxError>;

    async fn unsubscribe(&self, subscription_arn: &str) -> std::result::Result<(), BoxError>;

    async fn publish(
        &self,
        request: PublishRequest,
    ) -> std::result::Result<PublishResponse, BoxError>;
}

/// Topic provisioning through a [`NotificationClient`].
pub struct SnsTopicAdmin<'a> {
    client: &'a dyn NotificationClient,
}

impl<'a> SnsTopicAdmin<'a> {
    pub fn new(client: &'a dyn NotificationClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TopicAdmin for SnsTopicAdmin<'_> {
    async fn list_topics(&self) -> Result<Vec<String>> {
        self.client.list_topic_arns().await.map_err(Error::Sns)
    }

    async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<Vec<TopicOutcome>> {
        let mut outcomes = Vec::with_capacity(topics.len());
        for descriptor in topics {
            let result = self
                .client
                .create_topic(&descriptor.name, &descriptor.aggregate, &descriptor.config_entries)
                .await
                .map(Some)
                .map_err(|e| e.to_string());
            outcomes.push(TopicOutcome {
                topic: descriptor.name.clone(),
                result,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!(SnsProtocol::EmailJson.as_str(), "email-json");
        assert_eq!("https".parse::<SnsProtocol>().unwrap(), SnsProtocol::Https);
        assert!("carrier-pigeon".parse::<SnsProtocol>().is_err());
    }
}
