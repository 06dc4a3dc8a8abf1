mod common;

use broker_adapter::memory::{InMemoryBroker, InMemoryBrokerAdapter};
use broker_adapter::topics::ResolutionStrategy;
use broker_adapter::{
    handler_fn, BrokerAdapter, ConsumerConfig, Error, Lifecycle, SendOptions, SubscriptionState,
};
use common::{event, memory_config, wait_until, Collector};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn initialised(topics: &[(&str, &str)]) -> InMemoryBrokerAdapter {
    let mut adapter = InMemoryBrokerAdapter::new(&memory_config(topics), InMemoryBroker::new());
    adapter.init().await.unwrap();
    adapter
}

#[tokio::test]
async fn test_publish_and_consume_from_beginning() {
    let mut adapter = initialised(&[("user", "events.identity.user")]).await;

    let envelope = event("user", "UserCreated", json!({"email": "a@b.com"}));
    let acks = adapter
        .send_message("user", &[envelope.clone()], SendOptions::default())
        .await
        .unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].event_id, envelope.id());
    assert_eq!(acks[0].topic, "events.identity.user");
    assert_eq!(acks[0].offset, Some(0));

    let collector = Collector::default();
    let handle = adapter
        .add_consumer(ConsumerConfig::new().aggregate_from_beginning("user", collector.handler()))
        .await
        .unwrap();
    assert_eq!(handle.topics(), ["events.identity.user".to_string()]);

    assert!(wait_until(TIMEOUT, || collector.len() == 1).await);
    // Give a duplicate the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = collector.envelopes();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id(), envelope.id());
    assert_eq!(received[0].event_type(), "user.UserCreated");
    assert_eq!(received[0].data_as::<serde_json::Value>().unwrap(), json!({"email": "a@b.com"}));

    handle.stop().await.unwrap();
    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_consumer_without_from_beginning_skips_history() {
    let adapter = initialised(&[("order", "events.sales.order")]).await;
    adapter
        .send_message("order", &[event("order", "OrderPlaced", json!({"n": 0}))], SendOptions::default())
        .await
        .unwrap();

    let collector = Collector::default();
    let handle = adapter
        .add_consumer(ConsumerConfig::new().aggregate("order", collector.handler()))
        .await
        .unwrap();

    adapter
        .send_message("order", &[event("order", "OrderPlaced", json!({"n": 1}))], SendOptions::default())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || collector.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = collector.envelopes();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data_as::<serde_json::Value>().unwrap(), json!({"n": 1}));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_same_key_preserves_order() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events.sales.order", 4);
    let mut adapter = InMemoryBrokerAdapter::new(
        &memory_config(&[("order", "events.sales.order")]),
        broker,
    );
    adapter.init().await.unwrap();

    let envelopes: Vec<_> = (0..10)
        .map(|i| event("order", "OrderUpdated", json!({"seq": i})))
        .collect();
    for envelope in &envelopes {
        adapter
            .send_message("order", std::slice::from_ref(envelope), SendOptions::with_key("order-42"))
            .await
            .unwrap();
    }

    let collector = Collector::default();
    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate_from_beginning("order", collector.handler())
                .use_batches(true),
        )
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || collector.len() == 10).await);
    let messages = collector.messages();
    let partition = messages[0].partition;
    assert!(messages.iter().all(|m| m.partition == partition));
    assert!(messages.iter().all(|m| m.key_str() == Some("order-42")));

    let ids: Vec<_> = collector.envelopes().iter().map(|e| e.id()).collect();
    let expected: Vec<_> = envelopes.iter().map(|e| e.id()).collect();
    assert_eq!(ids, expected);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_aggregate_publishes_nothing() {
    let adapter = initialised(&[("user", "events.identity.user")]).await;

    let err = adapter
        .send_message("invoice", &[event("invoice", "InvoiceSent", json!({}))], SendOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::UnknownAggregate { aggregate } => assert_eq!(aggregate, "invoice"),
        other => panic!("expected UnknownAggregate, got {:?}", other),
    }
    for topic in adapter.broker().topics() {
        assert_eq!(adapter.broker().end_offset(&topic, 0), 0);
    }
}

#[tokio::test]
async fn test_provisioning_creates_only_missing_topics() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events.identity.user", 1);

    let mut adapter = InMemoryBrokerAdapter::new(
        &memory_config(&[("user", "events.identity.user"), ("order", "events.sales.order")]),
        broker.clone(),
    );
    adapter.init().await.unwrap();

    assert_eq!(broker.creation_count(), 1);
    assert_eq!(
        broker.topics(),
        vec!["events.identity.user".to_string(), "events.sales.order".to_string()]
    );
    assert_eq!(adapter.registry().resolution("user"), Some(ResolutionStrategy::Listed));
    assert_eq!(adapter.registry().resolution("order"), Some(ResolutionStrategy::Provisioned));
}

#[tokio::test]
async fn test_provisioning_failure_reports_topic() {
    let broker = InMemoryBroker::new();
    broker.reject_topic("events.sales.order");

    let mut adapter = InMemoryBrokerAdapter::new(
        &memory_config(&[("user", "events.identity.user"), ("order", "events.sales.order")]),
        broker,
    );
    let err = adapter.init().await.unwrap_err();

    match err {
        Error::ProvisioningFailure { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].topic, "events.sales.order");
        }
        other => panic!("expected ProvisioningFailure, got {:?}", other),
    }
    assert_eq!(adapter.state(), Lifecycle::Constructed);
}

#[tokio::test]
async fn test_operations_before_init_fail() {
    let adapter = InMemoryBrokerAdapter::new(
        &memory_config(&[("user", "events.identity.user")]),
        InMemoryBroker::new(),
    );

    let err = adapter
        .send_message("user", &[event("user", "UserCreated", json!({}))], SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotInitialised));

    let err = adapter
        .add_consumer(ConsumerConfig::new().aggregate("user", Collector::default().handler()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotInitialised));
    assert!(adapter.broker().topics().is_empty());
}

#[tokio::test]
async fn test_second_init_is_a_no_op() {
    let broker = InMemoryBroker::new();
    let mut adapter = InMemoryBrokerAdapter::new(
        &memory_config(&[("user", "events.identity.user")]),
        broker.clone(),
    );

    adapter.init().await.unwrap();
    adapter.init().await.unwrap();

    assert_eq!(adapter.state(), Lifecycle::Initialised);
    assert_eq!(broker.creation_count(), 1);
}

#[tokio::test]
async fn test_batch_fault_redelivers_from_failed_message() {
    let adapter = initialised(&[("order", "events.sales.order")]).await;
    let envelopes: Vec<_> = (0..3)
        .map(|i| event("order", "OrderPlaced", json!({"seq": i})))
        .collect();
    adapter
        .send_message("order", &envelopes, SendOptions::default())
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = {
        let seen = seen.clone();
        let attempts = attempts.clone();
        handler_fn(move |message| {
            let seen = seen.clone();
            let attempts = attempts.clone();
            async move {
                if message.offset == 1 && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                seen.lock().unwrap().push(message.offset);
                Ok(())
            }
        })
    };

    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate_from_beginning("order", handler)
                .use_batches(true)
                .group_id("billing"),
        )
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || seen.lock().unwrap().len() == 3).await);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(wait_until(TIMEOUT, || {
        adapter.broker().committed("billing", "events.sales.order", 0) == Some(3)
    })
    .await);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_resumes_from_committed_offset() {
    let adapter = initialised(&[("user", "events.identity.user")]).await;
    adapter
        .send_message("user", &[event("user", "UserCreated", json!({"n": 0}))], SendOptions::default())
        .await
        .unwrap();

    let first = Collector::default();
    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate_from_beginning("user", first.handler())
                .group_id("audit"),
        )
        .await
        .unwrap();
    assert!(wait_until(TIMEOUT, || first.len() == 1).await);
    handle.stop().await.unwrap();

    adapter
        .send_message("user", &[event("user", "UserRenamed", json!({"n": 1}))], SendOptions::default())
        .await
        .unwrap();

    let second = Collector::default();
    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate_from_beginning("user", second.handler())
                .group_id("audit"),
        )
        .await
        .unwrap();
    assert!(wait_until(TIMEOUT, || second.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(second.len(), 1);
    assert_eq!(second.envelopes()[0].event_type(), "user.UserRenamed");
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_message_fault_redelivers_from_failed_message() {
    let adapter = initialised(&[("order", "events.sales.order")]).await;
    let envelopes: Vec<_> = (0..3)
        .map(|i| event("order", "OrderPlaced", json!({"seq": i})))
        .collect();
    adapter
        .send_message("order", &envelopes, SendOptions::default())
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = {
        let seen = seen.clone();
        let attempts = attempts.clone();
        handler_fn(move |message| {
            let seen = seen.clone();
            let attempts = attempts.clone();
            async move {
                if message.offset == 2 && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                seen.lock().unwrap().push(message.offset);
                Ok(())
            }
        })
    };

    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate_from_beginning("order", handler)
                .use_batches(false)
                .group_id("shipping"),
        )
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || seen.lock().unwrap().len() == 3).await);
    // Only the failed message was delivered again
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(wait_until(TIMEOUT, || {
        adapter.broker().committed("shipping", "events.sales.order", 0) == Some(3)
    })
    .await);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_registrations_sharing_default_group_each_receive_their_topic() {
    let adapter = initialised(&[("user", "events.identity.user"), ("order", "events.sales.order")]).await;
    adapter
        .send_message("user", &[event("user", "UserCreated", json!({}))], SendOptions::default())
        .await
        .unwrap();
    adapter
        .send_message("order", &[event("order", "OrderPlaced", json!({}))], SendOptions::default())
        .await
        .unwrap();

    let users = Collector::default();
    let orders = Collector::default();
    let user_handle = adapter
        .add_consumer(ConsumerConfig::new().aggregate_from_beginning("user", users.handler()))
        .await
        .unwrap();
    let order_handle = adapter
        .add_consumer(ConsumerConfig::new().aggregate_from_beginning("order", orders.handler()))
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || users.len() == 1 && orders.len() == 1).await);
    assert_eq!(users.envelopes()[0].event_type(), "user.UserCreated");
    assert_eq!(orders.envelopes()[0].event_type(), "order.OrderPlaced");

    user_handle.stop().await.unwrap();
    order_handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_group_membership() {
    let adapter = initialised(&[("user", "events.identity.user")]).await;
    let broker = adapter.broker().clone();
    let before = broker.generation("mailer");

    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate("user", Collector::default().handler())
                .group_id("mailer"),
        )
        .await
        .unwrap();
    assert_eq!(handle.state(), SubscriptionState::Running);
    assert_eq!(broker.generation("mailer"), before + 1);

    handle.stop().await.unwrap();
    assert_eq!(broker.generation("mailer"), before + 2);

    let handle = adapter
        .add_consumer(
            ConsumerConfig::new()
                .aggregate("user", Collector::default().handler())
                .group_id("mailer"),
        )
        .await
        .unwrap();
    assert_eq!(broker.generation("mailer"), before + 3);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_pull_subscription_rejects_pushed_messages() {
    let adapter = initialised(&[("user", "events.identity.user")]).await;
    adapter
        .send_message("user", &[event("user", "UserCreated", json!({}))], SendOptions::default())
        .await
        .unwrap();
    let message = adapter.broker().read("events.identity.user", 0, 0, 1).remove(0);

    let handle = adapter
        .add_consumer(ConsumerConfig::new().aggregate("user", Collector::default().handler()))
        .await
        .unwrap();

    assert!(matches!(
        handle.dispatch(&message).await,
        Err(Error::InvalidMessage { .. })
    ));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_stops_consumers_and_closes() {
    let mut adapter = initialised(&[("user", "events.identity.user")]).await;
    let mut handle = adapter
        .add_consumer(ConsumerConfig::new().aggregate("user", Collector::default().handler()))
        .await
        .unwrap();

    adapter.disconnect().await.unwrap();
    assert_eq!(handle.finished().await, SubscriptionState::Stopped);
    assert_eq!(adapter.state(), Lifecycle::Closed);

    // Idempotent
    adapter.disconnect().await.unwrap();

    let err = adapter
        .send_message("user", &[event("user", "UserCreated", json!({}))], SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotInitialised));
    assert!(matches!(adapter.init().await, Err(Error::Config(_))));
}
