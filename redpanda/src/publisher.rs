//! Producer side: one envelope per Kafka record.

use crate::error::publish_error;
use crate::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_TIMEOUT};
use booking_relay_core::envelope::Envelope;
use booking_relay_core::event_bus::{Ack, BoxFuture, PublishError, Publisher};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Publishes envelopes to a Redpanda (or any Kafka-compatible) topic.
///
/// The record key is the envelope's correlation id, so every event of one
/// booking lands in the same partition. The envelope JSON is the record value;
/// content type, subject and event id travel as headers too.
///
/// # Example
///
/// ```no_run
/// use booking_relay_redpanda::RedpandaPublisher;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = RedpandaPublisher::builder()
///     .brokers("localhost:9092")
///     .topic("booking-events")
///     .producer_acks("all")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
    max_message_bytes: usize,
}

impl RedpandaPublisher {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaPublisherBuilder {
        RedpandaPublisherBuilder::default()
    }

    /// Topic records are written to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Publisher for RedpandaPublisher {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Ack, PublishError>> {
        Box::pin(async move {
            let payload = envelope.to_bytes()?;
            let size = payload.len();
            if size > self.max_message_bytes {
                return Err(PublishError::PayloadTooLarge {
                    size,
                    limit: self.max_message_bytes,
                });
            }

            let event_id = envelope.event_id.to_string();
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: "content-type",
                    value: Some(envelope.content_type.as_str()),
                })
                .insert(Header {
                    key: "subject",
                    value: Some(envelope.subject.as_str()),
                })
                .insert(Header {
                    key: "event-id",
                    value: Some(event_id.as_str()),
                });

            let record = FutureRecord::to(&self.topic)
                .payload(&payload)
                .key(envelope.correlation_id.as_bytes())
                .headers(headers);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        event_type = %envelope.event_type,
                        event_id = %envelope.event_id,
                        "Envelope published"
                    );
                    Ok(Ack {
                        event_id: envelope.event_id,
                        partition: Some(partition),
                        offset: Some(offset),
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %self.topic,
                        event_id = %envelope.event_id,
                        error = %kafka_error,
                        "Publish failed"
                    );
                    Err(publish_error(&kafka_error, size, self.max_message_bytes))
                },
            }
        })
    }
}

/// Builder for [`RedpandaPublisher`].
#[derive(Default)]
pub struct RedpandaPublisherBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    max_message_bytes: Option<usize>,
}

impl RedpandaPublisherBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Destination topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// `acks` setting: `"0"`, `"1"` or `"all"` (default `"all"`).
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// `compression.type` (default `"none"`).
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout for one publish.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Largest encoded envelope accepted before sending.
    #[must_use]
    pub const fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = Some(bytes);
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Connection`] if brokers or topic are missing or
    /// the client rejects its configuration.
    pub fn build(self) -> Result<RedpandaPublisher, PublishError> {
        let brokers = self
            .brokers
            .ok_or_else(|| PublishError::Connection("brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| PublishError::Connection("topic not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let max_message_bytes = self.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| PublishError::Connection(format!("failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            acks,
            compression,
            "RedpandaPublisher created"
        );

        Ok(RedpandaPublisher {
            producer,
            topic,
            timeout,
            max_message_bytes,
        })
    }
}
