//! Durable sink for relayed events.
//!
//! The sink is append-only object storage. Each successfully processed message
//! produces one [`StoredRecord`] under a key of the form
//! `<prefix>[/<subject>]/<yyyy>/<MM>/<dd>/<token>.json`.
//!
//! Keys are built by [`KeyBuilder`]. With [`KeyToken::MessageId`] a redelivered
//! message maps to the same key and overwrites its earlier copy; with
//! [`KeyToken::Random`] every attempt lands under a distinct key.

use crate::event_bus::{BoxFuture, DeliveryMetadata, ReceivedMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by [`BlobSink`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// I/O or network failure; the write may succeed on redelivery
    #[error("sink I/O error: {0}")]
    Io(String),

    /// The sink refused the key or body; retrying cannot help
    #[error("sink rejected record {key}: {reason}")]
    Rejected {
        /// Key that was refused
        key: String,
        /// Reason given by the sink
        reason: String,
    },

    /// Credentials rejected or container missing
    #[error("sink configuration error: {0}")]
    Configuration(String),
}

/// Storage key of a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(String);

impl RecordKey {
    /// Wrap an already well-formed key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a path-like string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniqueness token placed in the last key segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyToken {
    /// Broker message id; redelivery overwrites
    MessageId,
    /// Fresh UUID per attempt; redelivery duplicates
    Random,
}

/// Builds deterministic, collision-resistant record keys.
///
/// # Example
///
/// ```
/// use booking_relay_core::sink::{KeyBuilder, KeyToken};
///
/// let keys = KeyBuilder::new("bookings", KeyToken::MessageId).include_subject(true);
/// assert_eq!(keys.prefix(), "bookings");
/// ```
#[derive(Clone, Debug)]
pub struct KeyBuilder {
    prefix: String,
    token: KeyToken,
    include_subject: bool,
}

impl KeyBuilder {
    /// Create a key builder rooted at `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>, token: KeyToken) -> Self {
        let prefix = prefix
            .into()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(sanitize_segment)
            .collect::<Vec<_>>()
            .join("/");
        Self {
            prefix,
            token,
            include_subject: false,
        }
    }

    /// Insert the message subject (if any) after the prefix.
    #[must_use]
    pub const fn include_subject(mut self, include: bool) -> Self {
        self.include_subject = include;
        self
    }

    /// Sanitized prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Configured token strategy.
    #[must_use]
    pub const fn token(&self) -> KeyToken {
        self.token
    }

    /// Key for `message` received at `received_at`.
    #[must_use]
    pub fn build(&self, message: &ReceivedMessage, received_at: DateTime<Utc>) -> RecordKey {
        let mut key = String::with_capacity(96);
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push('/');
        }
        if self.include_subject {
            if let Some(subject) = message.metadata.subject().filter(|s| !s.is_empty()) {
                key.push_str(&sanitize_segment(subject));
                key.push('/');
            }
        }
        key.push_str(&received_at.format("%Y/%m/%d").to_string());
        key.push('/');
        match self.token {
            KeyToken::MessageId => key.push_str(&message_id_segment(&message.message_id)),
            KeyToken::Random => {
                key.push_str(&received_at.format("%H-%M-%S").to_string());
                key.push('-');
                key.push_str(&Uuid::new_v4().to_string());
            },
        }
        key.push_str(".json");
        RecordKey(key)
    }
}

/// Key segment for a message id.
///
/// Ids that are already safe are used as-is. Anything sanitization had to
/// change gets a digest of the raw id appended, so `order:42` and `order/42`
/// stay distinct.
fn message_id_segment(id: &str) -> String {
    let cleaned = sanitize_segment(id);
    if cleaned == id {
        return cleaned;
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{cleaned}-{}", &digest[..16])
}

/// Replace everything outside `[A-Za-z0-9._-]` with `-` and neutralize `.`/`..`.
#[must_use]
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "-".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

/// Original message body as stored.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventBody {
    /// Parsed JSON body, embedded as-is
    Json(serde_json::Value),
    /// Body kept verbatim as text
    Text(String),
}

/// Transport metadata captured at receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CaptureMetadata {
    /// Stream transport position
    #[serde(rename_all = "camelCase")]
    Stream {
        /// Partition
        partition_id: i32,
        /// Offset within the partition
        offset: i64,
        /// Broker sequence number
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence_number: Option<i64>,
    },
    /// Topic transport routing
    #[serde(rename_all = "camelCase")]
    Topic {
        /// Subject
        #[serde(skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        /// Correlation id
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl From<&DeliveryMetadata> for CaptureMetadata {
    fn from(metadata: &DeliveryMetadata) -> Self {
        match metadata {
            DeliveryMetadata::Stream {
                partition_id,
                offset,
                sequence_number,
            } => Self::Stream {
                partition_id: *partition_id,
                offset: *offset,
                sequence_number: *sequence_number,
            },
            DeliveryMetadata::Topic {
                subject,
                correlation_id,
            } => Self::Topic {
                subject: subject.clone(),
                correlation_id: correlation_id.clone(),
            },
        }
    }
}

/// JSON body of a stored record.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordBody {
    /// Wall-clock receipt time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Broker message id
    pub message_id: String,
    /// Delivery attempt that produced this record
    pub delivery_count: u32,
    /// When the broker accepted the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_time: Option<DateTime<Utc>>,
    /// Original payload
    pub event_body: EventBody,
    /// Transport metadata
    #[serde(flatten)]
    pub transport: CaptureMetadata,
}

impl RecordBody {
    /// Capture `message` received at `received_at` with its parsed body.
    #[must_use]
    pub fn capture(
        message: &ReceivedMessage,
        event_body: EventBody,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: received_at,
            message_id: message.message_id.clone(),
            delivery_count: message.delivery_count,
            enqueued_time: message.enqueued_at,
            event_body,
            transport: CaptureMetadata::from(&message.metadata),
        }
    }
}

/// The durable artifact written per processed message. Never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    /// Storage key
    pub key: RecordKey,
    /// Serialized [`RecordBody`]
    pub body: Vec<u8>,
    /// Always `application/json`
    pub content_type: &'static str,
}

/// Append-only blob storage.
///
/// Implementations are shared across concurrent message handlers; every write
/// targets its own key, so no locking is required beyond what the backend does.
pub trait BlobSink: Send + Sync {
    /// Create the target container if it does not exist.
    ///
    /// # Errors
    ///
    /// Failures here are startup configuration errors.
    fn ensure_container(&self) -> BoxFuture<'_, Result<(), SinkError>>;

    /// Durably write `record`. Returns only after the write is confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the write could not be confirmed.
    fn put<'a>(&'a self, record: &'a StoredRecord) -> BoxFuture<'a, Result<(), SinkError>>;
}
