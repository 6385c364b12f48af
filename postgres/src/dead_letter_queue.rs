//! Dead-letter queue management.
//!
//! Messages settle into `dead_letters` either because the processor gave up
//! on them (`InvalidMessage`, `ProcessingError`) or because the subscription
//! exceeded its delivery cap (`MaxDeliveryCountExceeded`). This module is the
//! operator's side: inspect entries, resolve or discard them, and resubmit a
//! message to its subscription once the cause is fixed.

use booking_relay_core::event_bus::DeadLetterReason;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Errors from dead-letter queue operations.
#[derive(Error, Debug)]
pub enum DeadLetterQueueError {
    /// The query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No entry with this id
    #[error("dead-letter entry {0} not found")]
    NotFound(i64),

    /// The stored row holds a value this version does not know
    #[error("invalid dead-letter row: {0}")]
    InvalidRow(String),
}

/// Status of a dead-lettered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Awaiting investigation
    Pending,
    /// Fixed or resubmitted
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl DeadLetterStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::InvalidRow`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, DeadLetterQueueError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterQueueError::InvalidRow(format!(
                "unknown status: {s}"
            ))),
        }
    }
}

/// An entry in the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    /// Entry id
    pub id: i64,
    /// Original broker message id
    pub message_id: String,
    /// Topic the message was published to
    pub topic: String,
    /// Subscription that gave up on it
    pub subscription: String,
    /// Raw body
    pub body: Vec<u8>,
    /// Declared content type
    pub content_type: Option<String>,
    /// Routing subject
    pub subject: Option<String>,
    /// Correlation id set by the producer
    pub correlation_id: Option<String>,
    /// When the message was originally enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries before dead-lettering
    pub delivery_count: i32,
    /// Why it was dead-lettered
    pub reason: DeadLetterReason,
    /// `<ErrorKind>: <message>` of the originating error
    pub description: String,
    /// When it was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
    /// Current status
    pub status: DeadLetterStatus,
    /// When it was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL` dead-letter queue.
///
/// # Example
///
/// ```no_run
/// use booking_relay_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{} {}: {}", entry.id, entry.reason, entry.description);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r"
    SELECT
        id, message_id, topic, subscription, body, content_type, subject,
        correlation_id, enqueued_at, delivery_count, reason, description,
        dead_lettered_at, status, resolved_at, resolved_by, resolution_notes
    FROM dead_letters
";

impl DeadLetterQueue {
    /// Queue over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError`] if the query fails.
    pub async fn list_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetteredMessage>, DeadLetterQueueError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetteredMessage>, DeadLetterQueueError> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = $1 ORDER BY dead_lettered_at, id LIMIT $2");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::NotFound`] if there is no such entry.
    pub async fn get_by_id(&self, id: i64) -> Result<DeadLetteredMessage, DeadLetterQueueError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DeadLetterQueueError::NotFound(id))?;

        Self::row_to_entry(&row)
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::NotFound`] if there is no such entry.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterQueueError> {
        let updated = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                resolved_at = now(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DeadLetterQueueError::NotFound(id));
        }
        tracing::info!(dlq_id = id, resolved_by, "Dead letter marked as resolved");
        metrics::counter!("relay_dead_letters_resolved_total").increment(1);
        Ok(())
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::NotFound`] if there is no such entry.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterQueueError> {
        let updated = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                resolved_at = now(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DeadLetterQueueError::NotFound(id));
        }
        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        metrics::counter!("relay_dead_letters_discarded_total").increment(1);
        Ok(())
    }

    /// Put a pending entry back on its subscription with a fresh delivery
    /// count, and mark the entry resolved.
    ///
    /// Both happen in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::NotFound`] if there is no pending entry
    /// with this id.
    pub async fn resubmit(&self, id: i64, resolved_by: &str) -> Result<(), DeadLetterQueueError> {
        let mut tx = self.pool.begin().await?;

        let resolved = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                resolved_at = now(),
                resolved_by = $1,
                resolution_notes = 'resubmitted'
            WHERE id = $2 AND status = 'pending'
            RETURNING message_id, topic, subscription, body, content_type, subject,
                      correlation_id, enqueued_at
            ",
        )
        .bind(resolved_by)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DeadLetterQueueError::NotFound(id))?;

        let message_id: String = resolved.try_get("message_id")?;
        sqlx::query(
            r"
            INSERT INTO relay_messages
                (message_id, topic, subscription, body, content_type, subject,
                 correlation_id, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (topic, subscription, message_id) DO NOTHING
            ",
        )
        .bind(&message_id)
        .bind(resolved.try_get::<String, _>("topic")?)
        .bind(resolved.try_get::<String, _>("subscription")?)
        .bind(resolved.try_get::<Vec<u8>, _>("body")?)
        .bind(resolved.try_get::<Option<String>, _>("content_type")?)
        .bind(resolved.try_get::<Option<String>, _>("subject")?)
        .bind(resolved.try_get::<Option<String>, _>("correlation_id")?)
        .bind(resolved.try_get::<DateTime<Utc>, _>("enqueued_at")?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(dlq_id = id, message_id = %message_id, resolved_by, "Dead letter resubmitted");
        metrics::counter!("relay_dead_letters_resubmitted_total").increment(1);
        Ok(())
    }

    /// Number of pending entries, for monitoring.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterQueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetteredMessage, DeadLetterQueueError> {
        let reason: String = row.try_get("reason")?;
        let reason = DeadLetterReason::parse(&reason)
            .ok_or_else(|| DeadLetterQueueError::InvalidRow(format!("unknown reason: {reason}")))?;
        let status: String = row.try_get("status")?;

        Ok(DeadLetteredMessage {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            topic: row.try_get("topic")?,
            subscription: row.try_get("subscription")?,
            body: row.try_get("body")?,
            content_type: row.try_get("content_type")?,
            subject: row.try_get("subject")?,
            correlation_id: row.try_get("correlation_id")?,
            enqueued_at: row.try_get("enqueued_at")?,
            delivery_count: row.try_get("delivery_count")?,
            reason,
            description: row.try_get("description")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            status: DeadLetterStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            resolution_notes: row.try_get("resolution_notes")?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Discarded,
        ] {
            let parsed = DeadLetterStatus::parse(status.as_str()).expect("known status");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn unknown_status_is_invalid_row() {
        assert!(matches!(
            DeadLetterStatus::parse("processing"),
            Err(DeadLetterQueueError::InvalidRow(_))
        ));
    }
}
