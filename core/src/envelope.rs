//! Transport envelopes for domain events.
//!
//! An [`Envelope`] wraps exactly one event for a single publish attempt. The
//! `event_id` identifies the attempt, not the logical event: retrying a publish
//! means building a new envelope, which carries a new id.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "eventType": "BookingCreated",
//!   "eventId": "9b2f...",
//!   "timestamp": "2026-01-01T00:00:00Z",
//!   "source": "booking-api",
//!   "correlationId": "<booking id>",
//!   "subject": "BookingCreated",
//!   "contentType": "application/json",
//!   "payload": { "eventType": "BookingCreated", "booking": { ... } }
//! }
//! ```

use crate::environment::{Clock, SystemClock};
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Content type of every envelope and stored record.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Source name used when none is configured.
pub const DEFAULT_SOURCE: &str = "booking-api";

/// The event could not be serialized.
///
/// Encoding is deterministic, so retrying reproduces the failure. The producer
/// logs and drops the event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to encode {event_type}: {reason}")]
pub struct EncodingError {
    /// Event type that failed to encode
    pub event_type: String,
    /// Serializer message
    pub reason: String,
}

/// A domain event wrapped for transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Concrete event name (e.g. `BookingCreated`)
    pub event_type: String,
    /// Unique per publish attempt
    pub event_id: Uuid,
    /// Envelope build time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Producing service
    pub source: String,
    /// Aggregate identifier shared by related events
    pub correlation_id: String,
    /// Routing subject for topic transports
    pub subject: String,
    /// Encoding of `payload`
    pub content_type: String,
    /// Serialized event body
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// The serialized event body as UTF-8 JSON text.
    #[must_use]
    pub fn payload(&self) -> &str {
        self.payload.get()
    }

    /// Encode the whole envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        serde_json::to_vec(self).map_err(|e| EncodingError {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode an envelope previously produced by [`Envelope::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `bytes` is not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ type: {}, id: {}, size: {} bytes }}",
            self.event_type,
            self.event_id,
            self.payload.get().len()
        )
    }
}

/// Builds envelopes for a producing service.
///
/// # Example
///
/// ```
/// use booking_relay_core::envelope::EnvelopeBuilder;
/// use booking_relay_core::event::{BookingEvent, BookingSnapshot};
///
/// let builder = EnvelopeBuilder::new("booking-api");
/// let event = BookingEvent::Created(BookingSnapshot::example("C1", "S1"));
/// let first = builder.build(&event).unwrap();
/// let second = builder.build(&event).unwrap();
/// assert_ne!(first.event_id, second.event_id);
/// ```
#[derive(Clone)]
pub struct EnvelopeBuilder {
    source: String,
    clock: Arc<dyn Clock>,
}

impl EnvelopeBuilder {
    /// Create a builder stamping envelopes with `source` and the system clock.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    /// Create a builder with an explicit clock.
    #[must_use]
    pub fn with_clock(source: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source: source.into(),
            clock,
        }
    }

    /// The configured source name.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap `event` in a fresh envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError`] if the event cannot be serialized.
    pub fn build<E: Event + Serialize>(&self, event: &E) -> Result<Envelope, EncodingError> {
        let event_type = event.event_type();
        let payload = serde_json::to_string(event)
            .and_then(RawValue::from_string)
            .map_err(|e| EncodingError {
                event_type: event_type.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Envelope {
            event_type: event_type.to_string(),
            event_id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            source: self.source.clone(),
            correlation_id: event.correlation_id(),
            subject: event_type.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            payload,
        })
    }
}

impl Default for EnvelopeBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE)
    }
}

impl fmt::Debug for EnvelopeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeBuilder")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
