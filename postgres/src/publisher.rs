//! Topic publisher: one row per subscription.

use crate::error::publish_error;
use booking_relay_core::envelope::Envelope;
use booking_relay_core::event_bus::{Ack, BoxFuture, PublishError, Publisher};
use sqlx::PgPool;

/// Largest accepted message body, matching common topic broker limits.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Publishes envelopes to a topic stored in PostgreSQL.
///
/// A publish copies the message into every subscription registered for the
/// topic in a single statement, so either all subscriptions see it or none.
/// Publishing to a topic without subscriptions succeeds and stores nothing.
#[derive(Clone, Debug)]
pub struct PostgresPublisher {
    pool: PgPool,
    topic: String,
    max_message_bytes: usize,
}

impl PostgresPublisher {
    /// Publisher for `topic`.
    #[must_use]
    pub fn new(pool: PgPool, topic: impl Into<String>) -> Self {
        Self {
            pool,
            topic: topic.into(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Override the body size limit.
    #[must_use]
    pub const fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }
}

impl Publisher for PostgresPublisher {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Ack, PublishError>> {
        Box::pin(async move {
            let body = envelope.to_bytes()?;
            if body.len() > self.max_message_bytes {
                return Err(PublishError::PayloadTooLarge {
                    size: body.len(),
                    limit: self.max_message_bytes,
                });
            }

            let fanned_out = sqlx::query(
                r"
                INSERT INTO relay_messages
                    (message_id, topic, subscription, body, content_type, subject, correlation_id)
                SELECT $1, s.topic, s.subscription, $3, $4, $5, $6
                FROM relay_subscriptions s
                WHERE s.topic = $2
                ON CONFLICT (topic, subscription, message_id) DO NOTHING
                ",
            )
            .bind(envelope.event_id.to_string())
            .bind(&self.topic)
            .bind(&body)
            .bind(&envelope.content_type)
            .bind(&envelope.subject)
            .bind(&envelope.correlation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| publish_error(&e))?
            .rows_affected();

            tracing::debug!(
                topic = %self.topic,
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                subscriptions = fanned_out,
                "Envelope published"
            );

            Ok(Ack {
                event_id: envelope.event_id,
                partition: None,
                offset: None,
            })
        })
    }
}
