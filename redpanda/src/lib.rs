//! Redpanda transport for the booking event relay.
//!
//! Implements both ends of the relay transport over the Kafka protocol with
//! rdkafka:
//!
//! - [`RedpandaPublisher`]: [`Publisher`](booking_relay_core::event_bus::Publisher),
//!   one record per envelope, keyed by correlation id
//! - [`RedpandaBroker`]: [`MessageBroker`](booking_relay_core::event_bus::MessageBroker),
//!   a consumer group member with manual commits
//!
//! Works against Redpanda, Apache Kafka or any other Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - An offset is committed only after every lower offset of its partition was
//!   acknowledged or dead-lettered
//! - If the process crashes before commit, records are redelivered
//! - Abandoned records are re-read by seeking the partition back
//! - Records read more than the configured maximum are written to a
//!   dead-letter topic with the reason in headers
//!
//! # Example
//!
//! ```no_run
//! use booking_relay_redpanda::{RedpandaBroker, RedpandaPublisher};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = RedpandaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .topic("booking-events")
//!     .build()?;
//!
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .topic("booking-events")
//!     .consumer_group("booking-relay")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod broker;
mod error;
mod publisher;
pub mod tracker;

pub use broker::{
    DEFAULT_MAX_DELIVERY_COUNT, RedpandaBroker, RedpandaBrokerBuilder, dead_letter_headers,
};
pub use publisher::{RedpandaPublisher, RedpandaPublisherBuilder};

/// Default timeout for produce and metadata calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default largest envelope accepted by the publisher (Kafka's default limit).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use booking_relay_core::envelope::EnvelopeBuilder;
    use booking_relay_core::event::{BookingEvent, BookingSnapshot};
    use booking_relay_core::event_bus::{PublishError, Publisher};

    #[test]
    fn transports_are_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaPublisher>();
        assert_sync::<RedpandaPublisher>();
        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn publisher_builder_requires_topic() {
        let result = RedpandaPublisher::builder().brokers("localhost:9092").build();
        assert!(matches!(result, Err(PublishError::Connection(_))));
    }

    #[tokio::test]
    async fn oversized_envelope_is_rejected_before_sending() {
        // No broker is contacted: the size check runs first.
        let publisher = RedpandaPublisher::builder()
            .brokers("localhost:1")
            .topic("booking-events")
            .max_message_bytes(64)
            .build()
            .expect("producer config is valid");
        let envelope = EnvelopeBuilder::new("booking-api")
            .build(&BookingEvent::Created(BookingSnapshot::example("C1", "S1")))
            .expect("encodes");

        let err = publisher.publish(&envelope).await.expect_err("too large");
        assert!(matches!(err, PublishError::PayloadTooLarge { limit: 64, .. }));
    }
}
