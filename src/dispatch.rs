//! Backend-agnostic message routing and the batch loop.
//!
//! Pull backends fetch messages, group them by partition and hand each
//! partition's messages to [`dispatch_partition`]. Backend specifics such as
//! offset storage and liveness reach the loop through [`BatchControl`].
//!
//! A handler error leaves its message unresolved. The rest of the batch is
//! abandoned and the returned [`BatchStop::Fault`] tells the backend which
//! offset to rewind to.

use crate::envelope::Envelope;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

/// A message as read from a backend, before envelope decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Topic name, or topic ARN for SNS
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp_ms: Option<i64>,
}

impl WireMessage {
    pub fn envelope(&self) -> Result<Envelope> {
        Envelope::from_slice(&self.payload)
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_deref()
            .and_then(|key| std::str::from_utf8(key).ok())
    }
}

/// Application code invoked for every consumed message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &WireMessage) -> anyhow::Result<()>;
}

pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(WireMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &WireMessage) -> anyhow::Result<()> {
        (self.0)(message.clone()).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// ```rust
/// use broker_adapter::handler_fn;
///
/// let handler = handler_fn(|message| async move {
///     let envelope = message.envelope()?;
///     println!("received {}", envelope.event_type());
///     Ok::<(), anyhow::Error>(())
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(WireMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Maps topics (or ARNs) to handlers.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("topics", &self.topics())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.routes.insert(topic.into(), handler);
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Invokes the handler registered for the message's topic.
    pub async fn dispatch(&self, message: &WireMessage) -> Result<()> {
        let handler = self.routes.get(&message.topic).ok_or_else(|| {
            Error::invalid_message(format!("no handler registered for topic '{}'", message.topic))
        })?;

        handler
            .handle(message)
            .await
            .map_err(|e| Error::HandlerFault {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                source: e.into(),
            })
    }
}

/// Per-partition capabilities a backend gives the dispatch loop.
#[async_trait]
pub trait BatchControl: Send + Sync {
    /// False once the subscription is stopping or the partition was revoked.
    fn is_running(&self) -> bool;

    /// True when a rebalance happened after this batch was fetched.
    fn is_stale(&self) -> bool;

    /// Marks the message as processed so its offset can be committed.
    async fn resolve_offset(&self, message: &WireMessage) -> Result<()>;

    /// Keeps the consumer's group membership alive during long batches.
    async fn heartbeat(&self) -> Result<()>;
}

/// Why a batch ended before its last message.
#[derive(Debug)]
pub enum BatchStop {
    NotRunning,
    Stale,
    /// The handler failed at `offset`. Nothing from `offset` on was resolved.
    Fault { offset: i64, error: Error },
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Messages handled and resolved
    pub processed: usize,
    pub stop: Option<BatchStop>,
}

impl BatchOutcome {
    /// Offset the partition must be rewound to, if a handler faulted.
    pub fn rewind_to(&self) -> Option<i64> {
        match &self.stop {
            Some(BatchStop::Fault { offset, .. }) => Some(*offset),
            _ => None,
        }
    }
}

/// Runs a batch strictly in order: liveness checks, handler, offset
/// resolution and heartbeat for every message.
pub async fn dispatch_batch(
    router: &Router,
    messages: &[WireMessage],
    control: &dyn BatchControl,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();

    for message in messages {
        if !control.is_running() {
            outcome.stop = Some(BatchStop::NotRunning);
            break;
        }
        if control.is_stale() {
            outcome.stop = Some(BatchStop::Stale);
            break;
        }

        match router.dispatch(message).await {
            Ok(()) => {}
            Err(error @ Error::HandlerFault { .. }) => {
                log_fault(&error);
                outcome.stop = Some(BatchStop::Fault {
                    offset: message.offset,
                    error,
                });
                break;
            }
            Err(e) => return Err(e),
        }

        control.resolve_offset(message).await?;
        control.heartbeat().await?;
        outcome.processed += 1;
    }

    debug!(
        processed = outcome.processed,
        total = messages.len(),
        "Batch dispatched"
    );
    Ok(outcome)
}

/// Handles one message and resolves its offset on success.
pub async fn dispatch_message(
    router: &Router,
    message: &WireMessage,
    control: &dyn BatchControl,
) -> Result<()> {
    router.dispatch(message).await?;
    control.resolve_offset(message).await
}

/// Runs one partition's messages in batch or per-message mode.
pub async fn dispatch_partition(
    router: &Router,
    messages: &[WireMessage],
    control: &dyn BatchControl,
    use_batches: bool,
) -> Result<BatchOutcome> {
    if use_batches {
        return dispatch_batch(router, messages, control).await;
    }

    let mut outcome = BatchOutcome::default();
    for message in messages {
        if !control.is_running() {
            outcome.stop = Some(BatchStop::NotRunning);
            break;
        }
        match dispatch_message(router, message, control).await {
            Ok(()) => outcome.processed += 1,
            Err(error @ Error::HandlerFault { .. }) => {
                log_fault(&error);
                outcome.stop = Some(BatchStop::Fault {
                    offset: message.offset,
                    error,
                });
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(outcome)
}

fn log_fault(error: &Error) {
    error!(
        classification = error.classification(),
        "{}; message left unresolved for redelivery", error
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        resolved: Mutex<Vec<i64>>,
        heartbeats: AtomicUsize,
        stopped: AtomicBool,
        stale_after: Option<usize>,
    }

    #[async_trait]
    impl BatchControl for RecordingControl {
        fn is_running(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }

        fn is_stale(&self) -> bool {
            self.stale_after
                .map_or(false, |n| self.resolved.lock().unwrap().len() >= n)
        }

        async fn resolve_offset(&self, message: &WireMessage) -> Result<()> {
            self.resolved.lock().unwrap().push(message.offset);
            Ok(())
        }

        async fn heartbeat(&self) -> Result<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn messages(count: i64) -> Vec<WireMessage> {
        (0..count)
            .map(|offset| WireMessage {
                topic: "events.identity.user".to_string(),
                partition: 0,
                offset,
                key: None,
                payload: format!("{{\"n\":{}}}", offset).into_bytes(),
                timestamp_ms: None,
            })
            .collect()
    }

    fn router_failing_at(fail_offset: i64, seen: Arc<Mutex<Vec<i64>>>) -> Router {
        let mut router = Router::new();
        router.route(
            "events.identity.user",
            handler_fn(move |message| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(message.offset);
                    if message.offset == fail_offset {
                        anyhow::bail!("cannot handle offset {}", message.offset);
                    }
                    Ok(())
                }
            }),
        );
        router
    }

    #[tokio::test]
    async fn test_batch_resolves_every_message_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = router_failing_at(-1, seen.clone());
        let control = RecordingControl::default();

        let outcome = dispatch_batch(&router, &messages(5), &control).await.unwrap();

        assert_eq!(outcome.processed, 5);
        assert!(outcome.stop.is_none());
        assert_eq!(*control.resolved.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(control.heartbeats.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_handler_fault_leaves_message_unresolved() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = router_failing_at(3, seen.clone());
        let control = RecordingControl::default();

        let outcome = dispatch_batch(&router, &messages(6), &control).await.unwrap();

        assert_eq!(outcome.processed, 3);
        assert_eq!(*control.resolved.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(outcome.rewind_to(), Some(3));
        match outcome.stop {
            Some(BatchStop::Fault { error, .. }) => {
                assert_eq!(error.classification(), "handler");
            }
            other => panic!("unexpected stop: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_stops_when_not_running() {
        let router = router_failing_at(-1, Arc::new(Mutex::new(Vec::new())));
        let control = RecordingControl::default();
        control.stopped.store(true, Ordering::SeqCst);

        let outcome = dispatch_batch(&router, &messages(3), &control).await.unwrap();

        assert_eq!(outcome.processed, 0);
        assert!(matches!(outcome.stop, Some(BatchStop::NotRunning)));
        assert!(control.resolved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_stops_when_stale() {
        let router = router_failing_at(-1, Arc::new(Mutex::new(Vec::new())));
        let control = RecordingControl {
            stale_after: Some(2),
            ..RecordingControl::default()
        };

        let outcome = dispatch_batch(&router, &messages(5), &control).await.unwrap();

        assert_eq!(outcome.processed, 2);
        assert!(matches!(outcome.stop, Some(BatchStop::Stale)));
        assert_eq!(outcome.rewind_to(), None);
    }

    #[tokio::test]
    async fn test_per_message_mode_skips_heartbeat() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = router_failing_at(2, seen);
        let control = RecordingControl::default();

        let outcome = dispatch_partition(&router, &messages(4), &control, false)
            .await
            .unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.rewind_to(), Some(2));
        assert_eq!(control.heartbeats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrouted_topic_is_invalid_message() {
        let router = Router::new();
        let message = messages(1).remove(0);

        let err = router.dispatch(&message).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
    }

    #[tokio::test]
    async fn test_unrouted_topic_fails_both_modes_without_rewind() {
        let router = Router::new();
        let batch = messages(2);

        for use_batches in [true, false] {
            let control = RecordingControl::default();
            let err = dispatch_partition(&router, &batch, &control, use_batches)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidMessage { .. }));
            assert!(control.resolved.lock().unwrap().is_empty());
        }
    }
}
