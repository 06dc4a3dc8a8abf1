//! Decoding of SNS HTTP(S) deliveries.
//!
//! SNS posts a JSON document to subscribed endpoints. `Notification`
//! documents carry the published envelope in `Message`; confirmation
//! documents must be acknowledged by visiting `SubscribeURL`.

use crate::dispatch::WireMessage;
use crate::{Error, Result};
use chrono::DateTime;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum SnsDelivery {
    Notification(WireMessage),
    SubscriptionConfirmation {
        topic_arn: String,
        subscribe_url: String,
        token: String,
    },
    UnsubscribeConfirmation {
        topic_arn: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDelivery {
    #[serde(rename = "Type")]
    kind: String,
    topic_arn: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    sequence_number: Option<String>,
    #[serde(default, rename = "SubscribeURL")]
    subscribe_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Parses the body of an SNS delivery request.
pub fn decode_notification(body: &[u8]) -> Result<SnsDelivery> {
    let raw: RawDelivery = serde_json::from_slice(body)?;

    match raw.kind.as_str() {
        "Notification" => {
            let message = raw
                .message
                .ok_or_else(|| Error::invalid_message("notification without Message"))?;
            let timestamp_ms = raw
                .timestamp
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.timestamp_millis());
            // FIFO topics number their messages, standard topics do not
            let offset = raw
                .sequence_number
                .as_deref()
                .and_then(|n| n.parse::<i64>().ok())
                .unwrap_or(0);

            Ok(SnsDelivery::Notification(WireMessage {
                topic: raw.topic_arn,
                partition: 0,
                offset,
                key: None,
                payload: message.into_bytes(),
                timestamp_ms,
            }))
        }
        "SubscriptionConfirmation" => Ok(SnsDelivery::SubscriptionConfirmation {
            topic_arn: raw.topic_arn,
            subscribe_url: raw
                .subscribe_url
                .ok_or_else(|| Error::invalid_message("confirmation without SubscribeURL"))?,
            token: raw.token.unwrap_or_default(),
        }),
        "UnsubscribeConfirmation" => Ok(SnsDelivery::UnsubscribeConfirmation {
            topic_arn: raw.topic_arn,
        }),
        other => Err(Error::invalid_message(format!(
            "unknown SNS delivery type '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_notification() {
        let envelope = json!({"specversion": "1.0", "id": "x"}).to_string();
        let body = json!({
            "Type": "Notification",
            "MessageId": "22b80b92-fdea-4c2c-8f9d-bdfb0c7bf324",
            "TopicArn": "arn:aws:sns:eu-west-1:123456789012:events_user",
            "Message": envelope,
            "Timestamp": "2024-05-01T12:00:00.000Z",
            "SignatureVersion": "1"
        });

        match decode_notification(body.to_string().as_bytes()).unwrap() {
            SnsDelivery::Notification(message) => {
                assert_eq!(message.topic, "arn:aws:sns:eu-west-1:123456789012:events_user");
                assert_eq!(message.payload, envelope.as_bytes());
                assert_eq!(message.timestamp_ms, Some(1714564800000));
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[test]
    fn test_decode_subscription_confirmation() {
        let body = json!({
            "Type": "SubscriptionConfirmation",
            "TopicArn": "arn:aws:sns:eu-west-1:123456789012:events_user",
            "Token": "2336412f37",
            "SubscribeURL": "https://sns.eu-west-1.amazonaws.com/?Action=ConfirmSubscription"
        });

        let delivery = decode_notification(body.to_string().as_bytes()).unwrap();
        assert!(matches!(
            delivery,
            SnsDelivery::SubscriptionConfirmation { ref token, .. } if token == "2336412f37"
        ));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let body = json!({"Type": "Telegram", "TopicArn": "arn"});
        assert!(decode_notification(body.to_string().as_bytes()).is_err());
    }
}
