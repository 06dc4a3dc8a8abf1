pub mod adapter;
pub mod client;
pub mod notification;

#[cfg(feature = "sns")]
pub mod aws;

pub use adapter::SnsBrokerAdapter;
pub use client::{NotificationClient, PublishRequest, PublishResponse, SnsProtocol, SnsTopicAdmin};
pub use notification::{decode_notification, SnsDelivery};

#[cfg(feature = "sns")]
pub use aws::AwsSnsClient;
