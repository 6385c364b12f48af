//! Message transport abstraction.
//!
//! Two traits describe the two ends of the relay:
//!
//! - [`Publisher`]: the producer side, one envelope per call.
//! - [`MessageBroker`]: the consumer side, with the capability set
//!   `{subscribe, receive-batch, acknowledge, abandon, dead-letter, close}`.
//!
//! Backends plug in behind these traits. A stream backend (partitioned log with
//! offsets) and a topic backend (subscriptions with message locks) expose the
//! same interface; which one runs is a deployment decision.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   commit    ┌──────────────┐
//! │ Write path  │────────────►│  Dispatcher  │
//! └─────────────┘             └──────┬───────┘
//!                                    │ publish(envelope)
//!                                    ▼
//!                             ┌──────────────┐
//!                             │    Broker    │◄─── at-least-once
//!                             └──────┬───────┘
//!                                    │ receive_batch
//!                                    ▼
//!                             ┌──────────────┐    put     ┌────────┐
//!                             │  Processor   │───────────►│  Sink  │
//!                             └──────┬───────┘            └────────┘
//!                                    │ acknowledge | abandon | dead_letter
//!                                    ▼
//!                                 Broker
//! ```
//!
//! # Delivery semantics
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **Acknowledge after write**: the processor acknowledges only once the sink
//!   confirmed the write
//! - **No ordering**: two events for the same booking may arrive in any order
//! - **Lock loss is benign**: acknowledging a message whose lease already
//!   expired returns [`BrokerError::LockLost`]; the redelivered copy will be
//!   stored again under the same or a fresh key

use crate::envelope::{EncodingError, Envelope};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Boxed future returned by transport and sink traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors returned by [`Publisher::publish`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Broker unreachable or timed out; retrying with a fresh envelope may succeed
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials rejected; never retried
    #[error("authorization error: {0}")]
    Auth(String),

    /// Message exceeds the broker limit; never retried
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Encoded size
        size: usize,
        /// Broker limit
        limit: usize,
    },

    /// Envelope could not be encoded; never retried
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl PublishError {
    /// Whether the whole publish may be retried with a fresh envelope.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Broker confirmation of a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// Envelope id that was accepted
    pub event_id: Uuid,
    /// Partition the message landed in (stream transports)
    pub partition: Option<i32>,
    /// Offset or sequence assigned by the broker
    pub offset: Option<i64>,
}

/// Producer side of the transport.
///
/// Implementations perform one network call per [`publish`](Publisher::publish)
/// and never retry internally; retry decisions belong to the caller.
pub trait Publisher: Send + Sync {
    /// Send one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] describing whether a retry makes sense.
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Ack, PublishError>>;
}

/// Errors returned by [`MessageBroker`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Network or transport failure; the operation may succeed later
    #[error("transport error: {0}")]
    Transport(String),

    /// The message lease expired or was reassigned before settlement
    #[error("message lock lost for {message_id}")]
    LockLost {
        /// Message whose lock was lost
        message_id: String,
    },

    /// Credentials rejected
    #[error("authorization error: {0}")]
    Unauthorized(String),

    /// Broker or subscription misconfigured
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The broker was closed
    #[error("broker closed")]
    Closed,
}

/// Transport-specific delivery information copied into stored records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMetadata {
    /// Partitioned log transport
    Stream {
        /// Partition the message was read from
        partition_id: i32,
        /// Offset within the partition
        offset: i64,
        /// Broker sequence number, when distinct from the offset
        sequence_number: Option<i64>,
    },
    /// Topic/subscription transport
    Topic {
        /// Routing subject (event type)
        subject: Option<String>,
        /// Correlation id set by the producer
        correlation_id: Option<String>,
    },
}

impl DeliveryMetadata {
    /// The subject, if this transport carries one.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Topic { subject, .. } => subject.as_deref(),
            Self::Stream { .. } => None,
        }
    }
}

/// Opaque settlement handle issued by the broker for one delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a backend-specific token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a message.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// Broker-assigned message id, stable across redeliveries
    pub message_id: String,
    /// Raw body
    pub body: Vec<u8>,
    /// Declared content type, if any
    pub content_type: Option<String>,
    /// 1 on first delivery
    pub delivery_count: u32,
    /// When the broker accepted the message
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Transport metadata
    pub metadata: DeliveryMetadata,
    /// Settlement handle for this delivery
    pub lock_token: LockToken,
}

/// Why a message was dead-lettered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// The message failed structural validation
    InvalidMessage,
    /// Processing failed with a non-retryable error
    ProcessingError,
    /// The broker gave up after too many deliveries
    MaxDeliveryCountExceeded,
}

impl DeadLetterReason {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "InvalidMessage",
            Self::ProcessingError => "ProcessingError",
            Self::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InvalidMessage" => Some(Self::InvalidMessage),
            "ProcessingError" => Some(Self::ProcessingError),
            "MaxDeliveryCountExceeded" => Some(Self::MaxDeliveryCountExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dead-letter request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Classified reason
    pub reason: DeadLetterReason,
    /// `<ErrorKind>: <message>` of the originating error
    pub description: String,
}

impl DeadLetter {
    /// Create a dead-letter request.
    #[must_use]
    pub fn new(reason: DeadLetterReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }
}

/// Consumer side of the transport.
///
/// Every delivery handed out by [`receive_batch`](MessageBroker::receive_batch)
/// must eventually be settled exactly once by `acknowledge`, `abandon` or
/// `dead_letter`, or left to expire.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the processor can hold `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Attach to the configured subscription or consumer group.
    ///
    /// # Errors
    ///
    /// Startup failures (bad credentials, missing topic) are fatal.
    fn subscribe(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Receive up to `max_messages`, waiting at most `max_wait` for the first.
    ///
    /// An empty batch means nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] on transport failure.
    fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<ReceivedMessage>, BrokerError>>;

    /// Mark a delivery as durably handled.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::LockLost`] if the lease expired first.
    fn acknowledge<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Release a delivery for redelivery without counting it as handled.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::LockLost`] if the lease expired first.
    fn abandon<'a>(&'a self, message: &'a ReceivedMessage)
    -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Move a delivery to the dead-letter channel. Terminal.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::LockLost`] if the lease expired first.
    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        entry: DeadLetter,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Stop the subscription. No further messages are handed out.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the backend fails to detach cleanly.
    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>>;
}
