//! End-to-end tests of the relay pipeline against in-memory doubles.
//!
//! booking write → dispatcher → broker → processor → sink → acknowledge

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use booking_relay_core::booking::{Booking, NewBooking};
use booking_relay_core::envelope::EnvelopeBuilder;
use booking_relay_core::event_bus::{DeadLetterReason, MessageBroker, ReceivedMessage};
use booking_relay_core::sink::{KeyBuilder, KeyToken, SinkError};
use booking_relay_runtime::{EventDispatcher, MessageProcessor, ProcessingOutcome};
use booking_relay_testing::{Call, CallLog, InMemoryBlobSink, InMemoryBroker, test_clock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(50);

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    log: CallLog,
    broker: InMemoryBroker,
    sink: InMemoryBlobSink,
    processor: MessageProcessor,
}

impl Harness {
    fn new(broker: InMemoryBroker, sink: InMemoryBlobSink, token: KeyToken) -> Self {
        let log = CallLog::new();
        let broker = broker.with_log(log.clone());
        let sink = sink.with_log(log.clone());
        let keys = KeyBuilder::new("bookings", token).include_subject(true);
        let processor = MessageProcessor::new(Arc::new(sink.clone()), keys)
            .with_clock(Arc::new(test_clock()));
        Self {
            log,
            broker,
            sink,
            processor,
        }
    }

    fn topic() -> Self {
        Self::new(InMemoryBroker::topic(), InMemoryBlobSink::new(), KeyToken::MessageId)
    }

    async fn receive_one(&self) -> ReceivedMessage {
        let mut batch = self.broker.receive_batch(1, WAIT).await.expect("receive");
        assert_eq!(batch.len(), 1, "expected one message");
        batch.remove(0)
    }

    async fn process_next(&self) -> ProcessingOutcome {
        let message = self.receive_one().await;
        self.processor.process(&self.broker, message).await
    }

    async fn publish_created(&self, customer: &str, seller: &str) -> String {
        let mut booking = Booking::create(new_booking(customer, seller)).expect("valid booking");
        let dispatcher = EventDispatcher::new(
            Arc::new(self.broker.clone()),
            EnvelopeBuilder::new("booking-api"),
        );
        let results = dispatcher.dispatch_committed(booking.take_events()).await;
        match &results[..] {
            [booking_relay_runtime::DispatchResult::Published { event_id, .. }] => {
                event_id.to_string()
            },
            other => panic!("unexpected dispatch results: {other:?}"),
        }
    }
}

fn new_booking(customer: &str, seller: &str) -> NewBooking {
    let start: DateTime<Utc> = "2026-02-01T14:00:00Z".parse().unwrap();
    NewBooking {
        customer_id: customer.into(),
        seller_id: seller.into(),
        product_id: "P1".into(),
        location: Some("Lisbon".into()),
        start_time: start,
        end_time: start + chrono::Duration::days(3),
        number_of_guests: 2,
        room_type: Some("double".into()),
        notes: None,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn created_booking_is_stored_then_acknowledged() {
    let h = Harness::topic();
    let event_id = h.publish_created("C1", "S1").await;

    let outcome = h.process_next().await;

    let expected_key = format!("bookings/BookingCreated/2026/01/01/{event_id}.json");
    assert_eq!(
        outcome,
        ProcessingOutcome::Completed {
            key: booking_relay_core::sink::RecordKey::new(expected_key.clone())
        }
    );

    let record = h.sink.get_json(&expected_key).expect("record stored");
    assert_eq!(record["eventBody"]["eventType"], "BookingCreated");
    assert_eq!(record["eventBody"]["payload"]["booking"]["customerId"], "C1");
    assert_eq!(record["eventBody"]["payload"]["booking"]["sellerId"], "S1");
    assert_eq!(record["subject"], "BookingCreated");
    assert_eq!(record["messageId"], event_id);
    assert_eq!(record["timestamp"], "2026-01-01T00:00:00Z");

    assert_eq!(h.broker.acknowledged(), vec![event_id.clone()]);
    let write = h.log.position(|c| matches!(c, Call::SinkWrite(_))).unwrap();
    let ack = h.log.position(|c| matches!(c, Call::Acknowledged(_))).unwrap();
    assert!(write < ack, "acknowledgment must follow the write");
}

#[tokio::test]
async fn empty_body_is_dead_lettered_without_write() {
    let h = Harness::topic();
    let id = h.broker.send_raw(Vec::new(), Some("BookingCreated"));

    let outcome = h.process_next().await;

    match outcome {
        ProcessingOutcome::DeadLettered {
            reason,
            description,
        } => {
            assert_eq!(reason, DeadLetterReason::InvalidMessage);
            assert!(description.starts_with("ValidationError:"));
        },
        other => panic!("expected dead-letter, got {other:?}"),
    }
    assert!(h.sink.is_empty());
    assert_eq!(h.log.count(|c| matches!(c, Call::SinkWrite(_) | Call::SinkWriteFailed(_))), 0);

    let dead = h.broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, id);
    assert_eq!(dead[0].reason, DeadLetterReason::InvalidMessage);
}

#[tokio::test]
async fn malformed_json_is_dead_lettered_without_write() {
    let h = Harness::topic();
    h.broker.send_raw(b"{\"eventType\": ".to_vec(), None);

    let outcome = h.process_next().await;

    assert!(matches!(
        outcome,
        ProcessingOutcome::DeadLettered {
            reason: DeadLetterReason::InvalidMessage,
            ..
        }
    ));
    assert!(h.sink.is_empty());
    assert!(h.broker.acknowledged().is_empty());
}

#[tokio::test]
async fn transient_sink_failures_resolve_on_redelivery() {
    let h = Harness::topic();
    h.sink.fail_next([
        SinkError::Io("connection reset".into()),
        SinkError::Io("connection reset".into()),
    ]);
    let event_id = h.publish_created("C1", "S1").await;

    assert_eq!(h.process_next().await, ProcessingOutcome::RetryScheduled);
    assert_eq!(h.process_next().await, ProcessingOutcome::RetryScheduled);
    assert!(matches!(h.process_next().await, ProcessingOutcome::Completed { .. }));

    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.sink.write_count(), 1);
    assert_eq!(h.broker.acknowledged(), vec![event_id]);
    assert_eq!(h.log.count(|c| matches!(c, Call::Abandoned(_))), 2);

    let key = h.sink.keys().remove(0);
    assert_eq!(h.sink.get_json(&key).unwrap()["deliveryCount"], 3);
}

#[tokio::test]
async fn failed_write_is_never_acknowledged() {
    let h = Harness::topic();
    h.sink.fail_next([SinkError::Io("disk full".into())]);
    h.publish_created("C1", "S1").await;

    h.process_next().await;

    assert_eq!(h.log.count(|c| matches!(c, Call::Acknowledged(_))), 0);
    assert_eq!(h.broker.outstanding(), 1);
}

#[tokio::test]
async fn rejected_write_is_dead_lettered_as_processing_error() {
    let h = Harness::topic();
    h.sink.fail_next([SinkError::Rejected {
        key: "k".into(),
        reason: "blob too large".into(),
    }]);
    h.publish_created("C1", "S1").await;

    let outcome = h.process_next().await;

    match outcome {
        ProcessingOutcome::DeadLettered {
            reason,
            description,
        } => {
            assert_eq!(reason, DeadLetterReason::ProcessingError);
            assert!(description.starts_with("SinkWriteError: "));
            assert!(description.contains("blob too large"));
        },
        other => panic!("expected dead-letter, got {other:?}"),
    }
}

#[tokio::test]
async fn redelivery_with_message_id_key_overwrites() {
    let h = Harness::topic();
    h.publish_created("C1", "S1").await;

    let first = h.receive_one().await;
    h.processor.process(&h.broker, first.clone()).await;
    // Simulated duplicate delivery of the same message.
    let again = h.processor.process(&h.broker, first).await;

    assert!(matches!(again, ProcessingOutcome::Completed { .. }));
    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.sink.write_count(), 2);
}

#[tokio::test]
async fn random_keys_never_overwrite() {
    let h = Harness::new(InMemoryBroker::stream(), InMemoryBlobSink::new(), KeyToken::Random);
    h.broker.send_raw(br#"{"eventType":"BookingPaid"}"#.to_vec(), None);
    h.broker.send_raw(br#"{"eventType":"BookingPaid"}"#.to_vec(), None);

    h.process_next().await;
    h.process_next().await;

    let keys = h.sink.keys();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    for key in &keys {
        assert!(key.starts_with("bookings/2026/01/01/00-00-00-"));
        let record = h.sink.get_json(key).unwrap();
        assert_eq!(record["partitionId"], 0);
        assert!(record["offset"].is_i64());
        assert_eq!(record["eventBody"]["eventType"], "BookingPaid");
    }
}

#[tokio::test]
async fn lost_lock_on_acknowledge_is_tolerated() {
    let h = Harness::new(
        InMemoryBroker::topic().with_lock_duration(Duration::from_millis(10)),
        InMemoryBlobSink::new().with_delay(Duration::from_millis(40)),
        KeyToken::MessageId,
    );
    h.publish_created("C1", "S1").await;

    let outcome = h.process_next().await;

    assert!(matches!(outcome, ProcessingOutcome::Completed { .. }));
    assert_eq!(h.sink.len(), 1);
    assert!(h.broker.acknowledged().is_empty());

    // The broker reclaims the message and hands it out again.
    let redelivered = h.receive_one().await;
    assert_eq!(redelivered.delivery_count, 2);
}

#[tokio::test]
async fn broker_dead_letters_after_max_deliveries() {
    let h = Harness::new(
        InMemoryBroker::topic().with_max_delivery_count(2),
        InMemoryBlobSink::new(),
        KeyToken::MessageId,
    );
    h.sink.fail_next([SinkError::Io("a".into()), SinkError::Io("b".into())]);
    let event_id = h.publish_created("C1", "S1").await;

    h.process_next().await;
    h.process_next().await;
    assert!(h.broker.receive_batch(1, WAIT).await.unwrap().is_empty());

    let dead = h.broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, event_id);
    assert_eq!(dead[0].reason, DeadLetterReason::MaxDeliveryCountExceeded);
    assert!(h.sink.is_empty());
}
