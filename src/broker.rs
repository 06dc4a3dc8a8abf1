//! The adapter contract every backend satisfies.
//!
//! ```rust,no_run
//! use broker_adapter::{build_adapter, handler_fn, Config, ConsumerConfig, SendOptions};
//! use broker_adapter::envelope::{EnvelopeFactory, EnvelopeOptions};
//! use serde_json::json;
//!
//! # async fn run() -> broker_adapter::Result<()> {
//! let config = Config::from_file("broker-adapter.toml")?;
//! let mut adapter = build_adapter(&config).await?;
//! adapter.init().await?;
//!
//! let factory = EnvelopeFactory::from_config(&config.events);
//! let envelope = factory.create("user", "UserCreated", "/users", &json!({"email": "a@b.com"}), EnvelopeOptions::default())?;
//! adapter.send_message("user", &[envelope], SendOptions::default()).await?;
//!
//! let handle = adapter
//!     .add_consumer(ConsumerConfig::new().aggregate("user", handler_fn(|_| async { Ok(()) })))
//!     .await?;
//! handle.stop().await?;
//! adapter.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{Backend, Config, ConsumerSettings, RunConfig};
use crate::dispatch::{MessageHandler, Router, WireMessage};
use crate::envelope::Envelope;
use crate::sns::SnsProtocol;
use crate::topics::TopicRegistry;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

/// Adapter lifecycle: `Constructed -> Initialising -> Initialised -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Initialising,
    Initialised,
    Closed,
}

impl Lifecycle {
    pub fn ensure_initialised(&self) -> Result<()> {
        match self {
            Lifecycle::Initialised => Ok(()),
            _ => Err(Error::NotInitialised),
        }
    }

    /// Moves to `Initialising`. Returns `false` when the adapter is already
    /// initialised and there is nothing to do.
    pub(crate) fn begin_init(&mut self) -> Result<bool> {
        match self {
            Lifecycle::Initialised => {
                warn!("Broker adapter already initialised, ignoring init");
                Ok(false)
            }
            Lifecycle::Closed => Err(Error::Config(
                "broker adapter has been disconnected".to_string(),
            )),
            Lifecycle::Constructed | Lifecycle::Initialising => {
                *self = Lifecycle::Initialising;
                Ok(true)
            }
        }
    }

    pub(crate) fn finish_init<T>(&mut self, result: &Result<T>) {
        *self = if result.is_ok() {
            Lifecycle::Initialised
        } else {
            Lifecycle::Constructed
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Key applied to every envelope of one call
    pub partition_key: Option<String>,
}

impl SendOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(key.into()),
        }
    }
}

/// Acknowledgement for one published envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub event_id: Uuid,
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub message_id: Option<String>,
    pub sequence_number: Option<String>,
}

impl Ack {
    pub(crate) fn positioned(envelope: &Envelope, topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            event_id: envelope.id(),
            topic: topic.to_string(),
            partition: Some(partition),
            offset: Some(offset),
            message_id: None,
            sequence_number: None,
        }
    }
}

#[derive(Clone)]
pub struct AggregateConsumer {
    pub handler: Arc<dyn MessageHandler>,
    pub from_beginning: bool,
}

impl fmt::Debug for AggregateConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateConsumer")
            .field("from_beginning", &self.from_beginning)
            .finish_non_exhaustive()
    }
}

/// Where a push backend delivers notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEndpoint {
    pub endpoint: String,
    pub protocol: SnsProtocol,
    pub attributes: BTreeMap<String, String>,
}

impl PushEndpoint {
    pub fn new(protocol: SnsProtocol, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            protocol,
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// One consumer registration.
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    pub aggregates: BTreeMap<String, AggregateConsumer>,
    pub use_batches: bool,
    pub run: RunConfig,
    pub group_id: Option<String>,
    pub push_endpoint: Option<PushEndpoint>,
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the `[consumer]` section of the configuration.
    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self {
            use_batches: settings.use_batches,
            run: settings.run.clone(),
            group_id: settings.group_id.clone(),
            ..Self::default()
        }
    }

    pub fn aggregate(self, aggregate: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.with_aggregate(aggregate, handler, false)
    }

    pub fn aggregate_from_beginning(
        self,
        aggregate: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.with_aggregate(aggregate, handler, true)
    }

    fn with_aggregate(
        mut self,
        aggregate: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        from_beginning: bool,
    ) -> Self {
        self.aggregates.insert(
            aggregate.into(),
            AggregateConsumer {
                handler,
                from_beginning,
            },
        );
        self
    }

    pub fn use_batches(mut self, use_batches: bool) -> Self {
        self.use_batches = use_batches;
        self
    }

    pub fn run(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn push_endpoint(mut self, endpoint: PushEndpoint) -> Self {
        self.push_endpoint = Some(endpoint);
        self
    }

    /// True when any aggregate asks to start from the earliest offset.
    pub fn from_beginning(&self) -> bool {
        self.aggregates.values().any(|a| a.from_beginning)
    }

    /// Resolves every aggregate's topic and routes it to its handler.
    pub(crate) fn router(&self, registry: &TopicRegistry) -> Result<Router> {
        let mut router = Router::new();
        for (aggregate, consumer) in &self.aggregates {
            let topic = registry.resolve(aggregate)?;
            router.route(topic, consumer.handler.clone());
        }
        Ok(router)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribing,
    Running,
    Stopped,
    Failed,
}

/// A running consumer registration.
///
/// Dropping the handle leaves the consumer running until the adapter
/// disconnects.
pub struct SubscriptionHandle {
    topics: Vec<String>,
    cancel: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<()>,
    push_router: Option<Router>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topics", &self.topics)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Routes a pushed notification to the registered handler.
    pub async fn dispatch(&self, message: &WireMessage) -> Result<()> {
        let router = self.push_router.as_ref().ok_or_else(|| {
            Error::invalid_message("subscription does not accept pushed messages")
        })?;
        if self.state() != SubscriptionState::Running {
            return Err(Error::SubscriptionFailure {
                topics: self.topics.clone(),
                reason: "subscription is not running".to_string(),
            });
        }
        router.dispatch(message).await
    }

    /// Waits until the subscription reaches `Stopped` or `Failed`.
    pub async fn finished(&mut self) -> SubscriptionState {
        let _ = self
            .state
            .wait_for(|s| matches!(s, SubscriptionState::Stopped | SubscriptionState::Failed))
            .await;
        self.state()
    }

    /// Stops at the next message boundary and releases the backend
    /// subscription before returning.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.map_err(|e| Error::SubscriptionFailure {
            topics: self.topics.clone(),
            reason: e.to_string(),
        })?;
        info!(topics = ?self.topics, "Subscription stopped");
        Ok(())
    }
}

/// Subscription tasks spawned by one adapter.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Subscriptions {
    /// Spawns a consumer task. The task receives a token cancelled by
    /// [`SubscriptionHandle::stop`] or by [`Subscriptions::shutdown`] and
    /// reports its state through the sender.
    pub(crate) fn spawn<F, Fut>(
        &self,
        topics: Vec<String>,
        push_router: Option<Router>,
        task: F,
    ) -> SubscriptionHandle
    where
        F: FnOnce(CancellationToken, watch::Sender<SubscriptionState>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Running);
        let task = self.tasks.spawn(task(cancel.clone(), state_tx));

        SubscriptionHandle {
            topics,
            cancel,
            state: state_rx,
            task,
            push_router,
        }
    }

    /// Cancels every subscription and waits for their tasks.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Common capability set of every backend.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn backend(&self) -> Backend;

    fn state(&self) -> Lifecycle;

    fn registry(&self) -> &TopicRegistry;

    /// Connects and provisions or resolves topics. Calling it again on an
    /// initialised adapter is a no-op.
    async fn init(&mut self) -> Result<()>;

    async fn add_consumer(&self, config: ConsumerConfig) -> Result<SubscriptionHandle>;

    async fn send_message(
        &self,
        aggregate: &str,
        envelopes: &[Envelope],
        options: SendOptions,
    ) -> Result<Vec<Ack>>;

    /// Flushes producers and cancels every subscription.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Builds the adapter selected by `config.backend`. Nothing connects until
/// [`BrokerAdapter::init`].
pub async fn build_adapter(config: &Config) -> Result<Box<dyn BrokerAdapter>> {
    config.validate()?;

    match config.backend {
        Backend::Kafka => Ok(Box::new(crate::kafka::KafkaBrokerAdapter::new(config)?)),
        Backend::Sns => build_sns_adapter(config).await,
        Backend::Memory => Ok(Box::new(crate::memory::InMemoryBrokerAdapter::new(
            config,
            crate::memory::InMemoryBroker::new(),
        ))),
    }
}

#[cfg(feature = "sns")]
async fn build_sns_adapter(config: &Config) -> Result<Box<dyn BrokerAdapter>> {
    Ok(Box::new(crate::sns::SnsBrokerAdapter::from_config(config).await?))
}

#[cfg(not(feature = "sns"))]
async fn build_sns_adapter(_config: &Config) -> Result<Box<dyn BrokerAdapter>> {
    Err(Error::Config(
        "backend 'sns' requires the 'sns' feature".to_string(),
    ))
}
