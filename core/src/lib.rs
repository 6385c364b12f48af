//! # Booking Relay Core
//!
//! Core traits and types for the booking event relay.
//!
//! The relay carries booking lifecycle events from the write path to durable
//! object storage:
//!
//! ```text
//! booking write ─► domain event ─► envelope ─► publisher ─► broker
//!                                                              │
//!      sink ◄─ processor (validate → store → acknowledge) ◄────┘
//!                      └─► dead-letter on invalid input
//! ```
//!
//! ## Core Concepts
//!
//! - **Booking** ([`booking`]): aggregate whose state changes raise events
//! - **BookingEvent** ([`event`]): closed set of lifecycle events
//! - **Envelope** ([`envelope`]): one event wrapped for one publish attempt
//! - **Publisher / `MessageBroker`** ([`event_bus`]): pluggable transport
//! - **`BlobSink` / `StoredRecord`** ([`sink`]): durable, append-only output
//! - **`FailureClass`** ([`policy`]): retryable vs. terminal vs. fatal
//! - **Environment** ([`environment`]): injected clock
//!
//! ## Guarantees
//!
//! - At-least-once delivery; duplicates are allowed, missing records are not
//! - Acknowledgment strictly after the sink confirmed the write
//! - Malformed messages are dead-lettered, never stored
//! - Publishing happens after the write commit and never rolls it back. When
//!   the broker is unavailable a committed change can produce no event at all;
//!   that is a known limitation of best-effort publishing.

pub mod booking;
pub mod envelope;
pub mod event;
pub mod event_bus;
pub mod policy;
pub mod sink;

/// Environment traits injected into relay components.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use booking_relay_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use booking::{Booking, BookingError, NewBooking};
pub use envelope::{EncodingError, Envelope, EnvelopeBuilder};
pub use event::{BookingEvent, BookingSnapshot, BookingStatus, Event};
pub use event_bus::{
    Ack, BrokerError, DeadLetter, DeadLetterReason, DeliveryMetadata, LockToken, MessageBroker,
    PublishError, Publisher, ReceivedMessage,
};
pub use policy::{Classify, FailureClass};
pub use sink::{BlobSink, KeyBuilder, KeyToken, RecordKey, SinkError, StoredRecord};
