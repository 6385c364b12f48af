//! Per-message processing state machine.
//!
//! ```text
//! Received ─► Validating ─┬─► Processing ─┬─► Completed   (acknowledge)
//!                         │               └─► Failed      (abandon | dead-letter)
//!                         └─► Rejected                    (dead-letter InvalidMessage)
//! ```
//!
//! Each message runs through its own instance of the machine. The processor
//! acknowledges only after the sink confirmed the write, so the allowed
//! failure mode is a duplicate record, never a missing one.

use crate::metrics::RelayMetrics;
use booking_relay_core::environment::{Clock, SystemClock};
use booking_relay_core::event_bus::{
    BrokerError, DeadLetter, DeadLetterReason, MessageBroker, ReceivedMessage,
};
use booking_relay_core::policy::{Classify, FailureClass};
use booking_relay_core::sink::{
    BlobSink, EventBody, KeyBuilder, RecordBody, RecordKey, SinkError, StoredRecord,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Structural problems with a message body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Body is empty or whitespace
    #[error("message body is empty")]
    EmptyBody,

    /// Body does not parse under its declared encoding
    #[error("body is not valid {content_type}: {reason}")]
    Malformed {
        /// Declared or assumed content type
        content_type: String,
        /// Parser message
        reason: String,
    },

    /// Declared content type is not one the relay stores
    #[error("unsupported content type {0}")]
    UnsupportedContentType(String),
}

impl Classify for ValidationError {
    fn classify(&self) -> FailureClass {
        FailureClass::Terminal
    }

    fn kind(&self) -> &'static str {
        "ValidationError"
    }
}

/// Failures after validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The record body could not be serialized
    #[error("failed to serialize record: {0}")]
    Serialization(String),

    /// The sink refused or failed the write
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl Classify for ProcessingError {
    fn classify(&self) -> FailureClass {
        match self {
            Self::Serialization(_) => FailureClass::Terminal,
            Self::Sink(e) => e.classify(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "SerializationError",
            Self::Sink(e) => e.kind(),
        }
    }
}

/// States of the per-message machine, used as the `state` log field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingState {
    /// Delivered by the broker
    Received,
    /// Structural check in progress
    Validating,
    /// Writing to the sink
    Processing,
    /// Stored and acknowledged
    Completed,
    /// Failed validation; dead-lettered
    Rejected,
    /// Failed after validation
    Failed,
}

impl ProcessingState {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "Received",
            Self::Validating => "Validating",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the processor decided for one message.
///
/// The outcome reflects the decision. A settlement call that fails afterwards
/// is logged and counted, and redelivery is left to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Record stored under `key`; acknowledgment requested
    Completed {
        /// Key of the stored record
        key: RecordKey,
    },
    /// Message moved to the dead-letter channel
    DeadLettered {
        /// Classified reason
        reason: DeadLetterReason,
        /// `<ErrorKind>: <message>`
        description: String,
    },
    /// Message released for broker redelivery
    RetryScheduled,
}

/// Validates, stores and settles received messages.
///
/// Cheap to share: hold it in an `Arc` and call [`process`](Self::process)
/// from as many tasks as the broker delivers to.
pub struct MessageProcessor {
    sink: Arc<dyn BlobSink>,
    keys: KeyBuilder,
    clock: Arc<dyn Clock>,
}

impl MessageProcessor {
    /// Create a processor writing to `sink` under keys from `keys`.
    #[must_use]
    pub fn new(sink: Arc<dyn BlobSink>, keys: KeyBuilder) -> Self {
        Self {
            sink,
            keys,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for receipt timestamps and date paths.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Key strategy in use.
    #[must_use]
    pub const fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Create the sink container if missing.
    ///
    /// # Errors
    ///
    /// Returns the [`SinkError`]; at startup this is fatal.
    pub async fn ensure_ready(&self) -> Result<(), SinkError> {
        self.sink.ensure_container().await
    }

    /// Run one message through the state machine and settle it with `broker`.
    ///
    /// Never returns an error: every failure ends in an outcome.
    pub async fn process(
        &self,
        broker: &dyn MessageBroker,
        message: ReceivedMessage,
    ) -> ProcessingOutcome {
        let started = Instant::now();
        RelayMetrics::record_received();
        info!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            state = %ProcessingState::Received,
            "Message received"
        );

        debug!(message_id = %message.message_id, state = %ProcessingState::Validating, "Validating message");
        let body = match validate(&message) {
            Ok(body) => {
                debug!(message_id = %message.message_id, state = "Validated", "Message passed validation");
                body
            },
            Err(err) => {
                warn!(
                    message_id = %message.message_id,
                    state = %ProcessingState::Rejected,
                    reason = DeadLetterReason::InvalidMessage.as_str(),
                    error = %err,
                    "Message failed validation"
                );
                let entry = DeadLetter::new(DeadLetterReason::InvalidMessage, err.describe());
                return self.dead_letter(broker, &message, entry).await;
            },
        };

        debug!(message_id = %message.message_id, state = %ProcessingState::Processing, "Storing message");
        match self.store(&message, body).await {
            Ok(key) => self.complete(broker, &message, key, started).await,
            Err(err) => self.fail(broker, &message, &err).await,
        }
    }

    async fn store(
        &self,
        message: &ReceivedMessage,
        body: EventBody,
    ) -> Result<RecordKey, ProcessingError> {
        let received_at = self.clock.now();
        let key = self.keys.build(message, received_at);
        let record_body = RecordBody::capture(message, body, received_at);
        let record = StoredRecord {
            key,
            body: serde_json::to_vec(&record_body)
                .map_err(|e| ProcessingError::Serialization(e.to_string()))?,
            content_type: CONTENT_TYPE_JSON,
        };

        let started = Instant::now();
        let written = self.sink.put(&record).await;
        RelayMetrics::record_sink_write(started.elapsed(), written.is_ok());
        written?;

        info!(message_id = %message.message_id, key = %record.key, "Record stored");
        Ok(record.key)
    }

    async fn complete(
        &self,
        broker: &dyn MessageBroker,
        message: &ReceivedMessage,
        key: RecordKey,
        started: Instant,
    ) -> ProcessingOutcome {
        match broker.acknowledge(message).await {
            Ok(()) => {
                RelayMetrics::record_completed(started.elapsed());
                info!(
                    message_id = %message.message_id,
                    key = %key,
                    state = %ProcessingState::Completed,
                    "Message completed"
                );
            },
            Err(err) => settlement_failed(message, "acknowledge", &err),
        }
        ProcessingOutcome::Completed { key }
    }

    async fn fail(
        &self,
        broker: &dyn MessageBroker,
        message: &ReceivedMessage,
        err: &ProcessingError,
    ) -> ProcessingOutcome {
        let class = err.classify();
        warn!(
            message_id = %message.message_id,
            state = %ProcessingState::Failed,
            class = class.as_str(),
            kind = err.kind(),
            error = %err,
            "Message processing failed"
        );

        match class {
            FailureClass::Terminal => {
                let entry = DeadLetter::new(DeadLetterReason::ProcessingError, err.describe());
                self.dead_letter(broker, message, entry).await
            },
            FailureClass::Retryable | FailureClass::Fatal => {
                if class == FailureClass::Fatal {
                    error!(
                        message_id = %message.message_id,
                        error = %err,
                        "Sink configuration failure while processing; leaving message for redelivery"
                    );
                }
                if let Err(e) = broker.abandon(message).await {
                    settlement_failed(message, "abandon", &e);
                }
                RelayMetrics::record_retry();
                ProcessingOutcome::RetryScheduled
            },
        }
    }

    async fn dead_letter(
        &self,
        broker: &dyn MessageBroker,
        message: &ReceivedMessage,
        entry: DeadLetter,
    ) -> ProcessingOutcome {
        let DeadLetter {
            reason,
            description,
        } = entry.clone();
        match broker.dead_letter(message, entry).await {
            Ok(()) => {
                RelayMetrics::record_dead_lettered(reason);
                info!(
                    message_id = %message.message_id,
                    reason = reason.as_str(),
                    description = %description,
                    "Message dead-lettered"
                );
            },
            Err(err) => settlement_failed(message, "dead-letter", &err),
        }
        ProcessingOutcome::DeadLettered {
            reason,
            description,
        }
    }
}

impl fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Structural check of a message body under its declared content type.
///
/// No content type means JSON. `text/*` bodies must be UTF-8 and are stored
/// verbatim; JSON bodies are embedded as parsed values.
///
/// # Errors
///
/// Returns the [`ValidationError`] that makes the message invalid.
pub fn validate(message: &ReceivedMessage) -> Result<EventBody, ValidationError> {
    if message.body.iter().all(u8::is_ascii_whitespace) {
        return Err(ValidationError::EmptyBody);
    }

    let content_type = message
        .content_type
        .as_deref()
        .map_or(CONTENT_TYPE_JSON, |ct| ct.split(';').next().unwrap_or(ct).trim())
        .to_ascii_lowercase();

    if content_type == CONTENT_TYPE_JSON || content_type.ends_with("+json") {
        serde_json::from_slice(&message.body)
            .map(EventBody::Json)
            .map_err(|e| ValidationError::Malformed {
                content_type: content_type.clone(),
                reason: e.to_string(),
            })
    } else if content_type.starts_with("text/") {
        String::from_utf8(message.body.clone())
            .map(EventBody::Text)
            .map_err(|e| ValidationError::Malformed {
                content_type: content_type.clone(),
                reason: e.to_string(),
            })
    } else {
        Err(ValidationError::UnsupportedContentType(content_type))
    }
}

fn settlement_failed(message: &ReceivedMessage, operation: &'static str, err: &BrokerError) {
    if matches!(err, BrokerError::LockLost { .. }) {
        RelayMetrics::record_ack_race();
        warn!(
            message_id = %message.message_id,
            operation,
            kind = err.kind(),
            "Message lock lost before settlement; broker will redeliver"
        );
    } else {
        error!(
            message_id = %message.message_id,
            operation,
            kind = err.kind(),
            error = %err,
            "Settlement failed; broker will redeliver"
        );
    }
}
