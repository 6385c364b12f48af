//! Topic subscription with lease-based message locks.
//!
//! Receiving a message leases it: the row gets a fresh lock token and a
//! `locked_until` deadline, and its delivery count goes up. Until the lease
//! expires no other receiver sees the row. Settlement is checked against the
//! token and the deadline, so a handler whose lease ran out gets
//! [`BrokerError::LockLost`] and the row is handed out again.
//!
//! Rows whose delivery count reached the maximum are moved to `dead_letters`
//! with reason `MaxDeliveryCountExceeded` before the next receive.

use crate::error::broker_error;
use booking_relay_core::event_bus::{
    BoxFuture, BrokerError, DeadLetter, DeadLetterReason, DeliveryMetadata, LockToken,
    MessageBroker, ReceivedMessage,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Default lease length.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// Default redelivery cap.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(FromRow)]
struct LeasedRow {
    id: i64,
    message_id: String,
    body: Vec<u8>,
    content_type: Option<String>,
    subject: Option<String>,
    correlation_id: Option<String>,
    enqueued_at: DateTime<Utc>,
    delivery_count: i32,
    lock_token: Uuid,
}

impl LeasedRow {
    fn into_message(self) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id,
            body: self.body,
            content_type: self.content_type,
            delivery_count: u32::try_from(self.delivery_count).unwrap_or(0),
            enqueued_at: Some(self.enqueued_at),
            metadata: DeliveryMetadata::Topic {
                subject: self.subject,
                correlation_id: self.correlation_id,
            },
            lock_token: Lease::new(self.id, self.lock_token).token(),
        }
    }
}

/// Row id and lease id, encoded in the [`LockToken`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Lease {
    row: i64,
    token: Uuid,
}

impl Lease {
    const fn new(row: i64, token: Uuid) -> Self {
        Self { row, token }
    }

    fn token(self) -> LockToken {
        LockToken::new(format!("{}:{}", self.row, self.token))
    }

    fn parse(token: &LockToken) -> Option<Self> {
        let (row, uuid) = token.as_str().split_once(':')?;
        Some(Self {
            row: row.parse().ok()?,
            token: uuid.parse().ok()?,
        })
    }
}

/// A subscription on a PostgreSQL-backed topic.
///
/// # Example
///
/// ```no_run
/// use booking_relay_postgres::PostgresSubscription;
/// use std::time::Duration;
///
/// # fn example(pool: sqlx::PgPool) {
/// let subscription = PostgresSubscription::new(pool, "booking-events", "relay")
///     .with_lock_duration(Duration::from_secs(60))
///     .with_max_delivery_count(5);
/// # }
/// ```
#[derive(Debug)]
pub struct PostgresSubscription {
    pool: PgPool,
    topic: String,
    subscription: String,
    lock_duration: Duration,
    max_delivery_count: u32,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl PostgresSubscription {
    /// Subscription `subscription` on `topic`.
    #[must_use]
    pub fn new(pool: PgPool, topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            pool,
            topic: topic.into(),
            subscription: subscription.into(),
            lock_duration: DEFAULT_LOCK_DURATION,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            closed: AtomicBool::new(false),
        }
    }

    /// Lease length per delivery.
    #[must_use]
    pub const fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    /// Deliveries allowed before a row is dead-lettered.
    #[must_use]
    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count.max(1);
        self
    }

    /// Pause between polls while waiting for messages.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn max_deliveries(&self) -> i32 {
        i32::try_from(self.max_delivery_count).unwrap_or(i32::MAX)
    }

    fn lease(message: &ReceivedMessage) -> Result<Lease, BrokerError> {
        Lease::parse(&message.lock_token).ok_or_else(|| lock_lost(message))
    }

    /// Move exhausted rows to the dead-letter table.
    async fn expire_exhausted(&self) -> Result<u64, BrokerError> {
        let moved = sqlx::query(
            r"
            WITH exhausted AS (
                DELETE FROM relay_messages
                WHERE id IN (
                    SELECT id FROM relay_messages
                    WHERE topic = $1 AND subscription = $2
                      AND delivery_count >= $3
                      AND (locked_until IS NULL OR locked_until < now())
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING message_id, topic, subscription, body, content_type, subject,
                          correlation_id, enqueued_at, delivery_count
            )
            INSERT INTO dead_letters
                (message_id, topic, subscription, body, content_type, subject,
                 correlation_id, enqueued_at, delivery_count, reason, description)
            SELECT message_id, topic, subscription, body, content_type, subject,
                   correlation_id, enqueued_at, delivery_count, $4,
                   'delivery count ' || delivery_count || ' reached maximum of ' || $3
            FROM exhausted
            ",
        )
        .bind(&self.topic)
        .bind(&self.subscription)
        .bind(self.max_deliveries())
        .bind(DeadLetterReason::MaxDeliveryCountExceeded.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error(&e))?
        .rows_affected();

        if moved > 0 {
            tracing::warn!(
                topic = %self.topic,
                subscription = %self.subscription,
                count = moved,
                "Messages exceeded max delivery count; dead-lettered"
            );
        }
        Ok(moved)
    }

    async fn try_receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.expire_exhausted().await?;

        let mut rows: Vec<LeasedRow> = sqlx::query_as(
            r"
            UPDATE relay_messages m
            SET delivery_count = m.delivery_count + 1,
                locked_until = now() + $4 * interval '1 millisecond',
                lock_token = $6
            WHERE m.id IN (
                SELECT id FROM relay_messages
                WHERE topic = $1 AND subscription = $2
                  AND delivery_count < $3
                  AND (locked_until IS NULL OR locked_until < now())
                ORDER BY id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING m.id, m.message_id, m.body, m.content_type, m.subject,
                      m.correlation_id, m.enqueued_at, m.delivery_count, m.lock_token
            ",
        )
        .bind(&self.topic)
        .bind(&self.subscription)
        .bind(self.max_deliveries())
        .bind(self.lock_duration.as_secs_f64() * 1000.0)
        .bind(i64::try_from(max_messages).unwrap_or(i64::MAX))
        // One lease id per batch; tokens stay unique through the row id.
        .bind(Uuid::new_v4())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| broker_error(&e))?;

        rows.sort_by_key(|r| r.id);
        Ok(rows.into_iter().map(LeasedRow::into_message).collect())
    }
}

fn lock_lost(message: &ReceivedMessage) -> BrokerError {
    BrokerError::LockLost {
        message_id: message.message_id.clone(),
    }
}

impl MessageBroker for PostgresSubscription {
    fn subscribe(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO relay_subscriptions (topic, subscription)
                VALUES ($1, $2)
                ON CONFLICT (topic, subscription) DO NOTHING
                ",
            )
            .bind(&self.topic)
            .bind(&self.subscription)
            .execute(&self.pool)
            .await
            .map_err(|e| broker_error(&e))?;

            tracing::info!(
                topic = %self.topic,
                subscription = %self.subscription,
                lock_duration_ms = u64::try_from(self.lock_duration.as_millis()).unwrap_or(u64::MAX),
                max_delivery_count = self.max_delivery_count,
                "Subscribed"
            );
            Ok(())
        })
    }

    fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<ReceivedMessage>, BrokerError>> {
        Box::pin(async move {
            let deadline = Instant::now() + max_wait;
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(BrokerError::Closed);
                }
                let batch = self.try_receive(max_messages.max(1)).await?;
                let now = Instant::now();
                if !batch.is_empty() || now >= deadline {
                    return Ok(batch);
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        })
    }

    fn acknowledge<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let lease = Self::lease(message)?;
            let deleted = sqlx::query(
                r"
                DELETE FROM relay_messages
                WHERE id = $1 AND lock_token = $2 AND locked_until > now()
                ",
            )
            .bind(lease.row)
            .bind(lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| broker_error(&e))?
            .rows_affected();

            if deleted == 0 {
                return Err(lock_lost(message));
            }
            Ok(())
        })
    }

    fn abandon<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let lease = Self::lease(message)?;
            let released = sqlx::query(
                r"
                UPDATE relay_messages
                SET locked_until = NULL, lock_token = NULL
                WHERE id = $1 AND lock_token = $2 AND locked_until > now()
                ",
            )
            .bind(lease.row)
            .bind(lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| broker_error(&e))?
            .rows_affected();

            if released == 0 {
                return Err(lock_lost(message));
            }
            Ok(())
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        entry: DeadLetter,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let lease = Self::lease(message)?;
            let moved = sqlx::query(
                r"
                WITH settled AS (
                    DELETE FROM relay_messages
                    WHERE id = $1 AND lock_token = $2 AND locked_until > now()
                    RETURNING message_id, topic, subscription, body, content_type, subject,
                              correlation_id, enqueued_at, delivery_count
                )
                INSERT INTO dead_letters
                    (message_id, topic, subscription, body, content_type, subject,
                     correlation_id, enqueued_at, delivery_count, reason, description)
                SELECT message_id, topic, subscription, body, content_type, subject,
                       correlation_id, enqueued_at, delivery_count, $3, $4
                FROM settled
                ",
            )
            .bind(lease.row)
            .bind(lease.token)
            .bind(entry.reason.as_str())
            .bind(&entry.description)
            .execute(&self.pool)
            .await
            .map_err(|e| broker_error(&e))?
            .rows_affected();

            if moved == 0 {
                return Err(lock_lost(message));
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                tracing::info!(
                    topic = %self.topic,
                    subscription = %self.subscription,
                    "Subscription closed"
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_token_roundtrip() {
        let lease = Lease::new(42, Uuid::new_v4());
        assert_eq!(Lease::parse(&lease.token()), Some(lease));
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        for raw in ["", "42", "x:00000000-0000-0000-0000-000000000000", "42:not-a-uuid"] {
            assert_eq!(Lease::parse(&LockToken::new(raw)), None, "{raw}");
        }
    }
}
