//! Relay consumer lifecycle tests.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use booking_relay_core::event_bus::BrokerError;
use booking_relay_core::sink::{KeyBuilder, KeyToken, SinkError};
use booking_relay_runtime::{MessageProcessor, RelayConsumer, RelayError};
use booking_relay_testing::{InMemoryBlobSink, InMemoryBroker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn processor(sink: &InMemoryBlobSink) -> Arc<MessageProcessor> {
    Arc::new(MessageProcessor::new(
        Arc::new(sink.clone()),
        KeyBuilder::new("bookings", KeyToken::MessageId),
    ))
}

fn consumer(
    broker: &InMemoryBroker,
    sink: &InMemoryBlobSink,
    shutdown: broadcast::Receiver<()>,
) -> RelayConsumer {
    RelayConsumer::builder()
        .name("test-relay")
        .broker(Arc::new(broker.clone()))
        .processor(processor(sink))
        .shutdown(shutdown)
        .batch_size(4)
        .max_wait(Duration::from_millis(20))
        .max_concurrency(3)
        .retry_delay(Duration::from_millis(10))
        .build()
        .expect("complete builder")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn processes_until_shutdown_then_closes_broker() {
    let broker = InMemoryBroker::topic();
    let sink = InMemoryBlobSink::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    for i in 0..10 {
        broker.send_raw(format!(r#"{{"n":{i}}}"#).into_bytes(), Some("BookingCreated"));
    }
    broker.send_raw(Vec::new(), None);

    let handle = consumer(&broker, &sink, shutdown_rx).spawn();

    wait_for(|| sink.len() == 10 && broker.dead_letters().len() == 1).await;
    assert!(sink.container_ready());
    assert!(broker.is_subscribed());

    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("stops in time")
        .expect("task did not panic");

    assert_eq!(result, Ok(()));
    assert!(broker.is_closed());
    assert_eq!(broker.acknowledged().len(), 10);
    assert_eq!(broker.outstanding(), 0);
}

#[tokio::test]
async fn subscribe_failure_is_fatal() {
    let broker = InMemoryBroker::topic();
    broker.fail_subscribe_with(BrokerError::Unauthorized("bad key".into()));
    let sink = InMemoryBlobSink::new();
    let (_tx, rx) = broadcast::channel(1);

    let result = consumer(&broker, &sink, rx).run().await;

    assert_eq!(
        result,
        Err(RelayError::Subscribe(BrokerError::Unauthorized("bad key".into())))
    );
}

#[tokio::test]
async fn missing_container_is_fatal() {
    let broker = InMemoryBroker::topic();
    let sink = InMemoryBlobSink::new();
    sink.fail_ensure_with(SinkError::Configuration("no such account".into()));
    let (_tx, rx) = broadcast::channel(1);

    let result = consumer(&broker, &sink, rx).run().await;

    assert!(matches!(result, Err(RelayError::Sink(SinkError::Configuration(_)))));
    assert!(!broker.is_subscribed());
}

#[tokio::test]
async fn transient_receive_errors_are_retried() {
    let broker = InMemoryBroker::topic();
    broker.fail_next_receives([
        BrokerError::Transport("timeout".into()),
        BrokerError::Transport("timeout".into()),
    ]);
    broker.send_raw(br#"{"ok":true}"#.to_vec(), None);
    let sink = InMemoryBlobSink::new();
    let (shutdown_tx, rx) = broadcast::channel(1);

    let handle = consumer(&broker, &sink, rx).spawn();
    wait_for(|| sink.len() == 1).await;

    shutdown_tx.send(()).unwrap();
    assert_eq!(handle.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn fatal_receive_error_stops_the_consumer() {
    let broker = InMemoryBroker::topic();
    broker.fail_next_receives([BrokerError::Unauthorized("revoked".into())]);
    let sink = InMemoryBlobSink::new();
    let (_tx, rx) = broadcast::channel(1);

    let result = consumer(&broker, &sink, rx).run().await;

    assert_eq!(
        result,
        Err(RelayError::Broker(BrokerError::Unauthorized("revoked".into())))
    );
    assert!(broker.is_closed());
}

#[tokio::test]
async fn builder_requires_broker() {
    let (_tx, rx) = broadcast::channel(1);
    let result = RelayConsumer::builder()
        .processor(processor(&InMemoryBlobSink::new()))
        .shutdown(rx)
        .build();

    assert!(matches!(result, Err(RelayError::MissingField("broker"))));
}

#[tokio::test]
async fn shutdown_drains_in_flight_batch() {
    let broker = InMemoryBroker::topic();
    let sink = InMemoryBlobSink::new().with_delay(Duration::from_millis(300));
    let (shutdown_tx, rx) = broadcast::channel(1);
    for i in 0..3 {
        broker.send_raw(format!(r#"{{"n":{i}}}"#).into_bytes(), None);
    }

    let started = std::time::Instant::now();
    let handle = consumer(&broker, &sink, rx).spawn();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.write_count(), 0, "writes still in flight");
    shutdown_tx.send(()).unwrap();

    assert_eq!(handle.await.unwrap(), Ok(()));
    // Three delayed writes ran side by side, not one after another.
    assert!(started.elapsed() < Duration::from_millis(800));
    assert_eq!(sink.write_count(), 3);
    assert_eq!(broker.acknowledged().len(), 3);
    assert_eq!(broker.outstanding(), 0);
    assert!(broker.is_closed());
}
