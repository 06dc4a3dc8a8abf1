pub mod broker;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod topics;

pub mod kafka;
pub mod memory;
pub mod sns;

pub use broker::{
    build_adapter, Ack, AggregateConsumer, BrokerAdapter, ConsumerConfig, Lifecycle,
    PushEndpoint, SendOptions, SubscriptionHandle, SubscriptionState,
};
pub use config::{Backend, Config, RunConfig};
pub use dispatch::{handler_fn, MessageHandler, WireMessage};
pub use envelope::{Envelope, EnvelopeData, EnvelopeFactory, EnvelopeOptions, SpecVersion};
pub use error::{Error, Result};
