use super::client::{NotificationClient, PublishRequest, PublishResponse};
use crate::broker::PushEndpoint;
use crate::config::SnsConfig;
use crate::error::BoxError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::config::Region;
use aws_sdk_sns::types::Tag;
use aws_sdk_sns::Client;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// [`NotificationClient`] backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct AwsSnsClient {
    client: Client,
}

impl AwsSnsClient {
    /// Loads credentials from the default provider chain. An explicit
    /// endpoint points the client at a local emulator.
    pub async fn from_config(config: &SnsConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let shared = loader.load().await;
        Self {
            client: Client::new(&shared),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn sdk_error<E>(err: E) -> BoxError
where
    aws_sdk_sns::Error: From<E>,
{
    Box::new(aws_sdk_sns::Error::from(err))
}

#[async_trait]
impl NotificationClient for AwsSnsClient {
    async fn list_topic_arns(&self) -> Result<Vec<String>, BoxError> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(sdk_error)?;

            arns.extend(
                page.topics()
                    .iter()
                    .filter_map(|topic| topic.topic_arn().map(str::to_string)),
            );

            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!("Listed {} SNS topic(s)", arns.len());
        Ok(arns)
    }

    async fn create_topic(
        &self,
        name: &str,
        aggregate: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, BoxError> {
        let tag = Tag::builder().key("aggregate").value(aggregate).build()?;
        let mut request = self.client.create_topic().name(name).tags(tag);
        if name.ends_with(".fifo") {
            request = request.attributes("FifoTopic", "true");
        }
        for (key, value) in attributes {
            request = request.attributes(key, value);
        }

        let output = request.send().await.map_err(sdk_error)?;
        let arn = output
            .topic_arn()
            .ok_or("CreateTopic response carries no TopicArn")?;
        Ok(arn.to_string())
    }

    async fn subscribe(&self, topic_arn: &str, endpoint: &PushEndpoint) -> Result<String, BoxError> {
        let attributes: HashMap<String, String> = endpoint
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let output = self
            .client
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(endpoint.protocol.as_str())
            .endpoint(&endpoint.endpoint)
            .set_attributes((!attributes.is_empty()).then_some(attributes))
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(sdk_error)?;

        let arn = output
            .subscription_arn()
            .ok_or("Subscribe response carries no SubscriptionArn")?;
        Ok(arn.to_string())
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<(), BoxError> {
        self.client
            .unsubscribe()
            .subscription_arn(subscription_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, BoxError> {
        let output = self
            .client
            .publish()
            .topic_arn(request.topic_arn)
            .message(request.message)
            .set_message_group_id(request.message_group_id)
            .set_message_deduplication_id(request.deduplication_id)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(PublishResponse {
            message_id: output.message_id().map(str::to_string),
            sequence_number: output.sequence_number().map(str::to_string),
        })
    }
}
