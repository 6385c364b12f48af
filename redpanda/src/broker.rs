//! Consumer side: a consumer group member exposing the relay broker interface.
//!
//! Kafka has no per-message locks, so settlement is layered on top of offsets:
//!
//! - **acknowledge / dead-letter** settle the offset and commit the highest
//!   contiguous settled point ([`OffsetTracker`])
//! - **abandon** keeps the offset outstanding and seeks the partition back to
//!   it, so it is read again
//! - **delivery counting** is kept in memory per offset; an offset read more
//!   than `max_delivery_count` times is published to the dead-letter topic
//!   instead of being handed out
//!
//! Delivery counts reset when the process restarts or the partition moves to
//! another group member. Settling a delivery after its partition was
//! reassigned yields [`BrokerError::LockLost`].

use crate::DEFAULT_TIMEOUT;
use crate::error::{broker_error, settle_error};
use crate::tracker::{Admission, OffsetTracker};
use booking_relay_core::event_bus::{
    BoxFuture, BrokerError, DeadLetter, DeadLetterReason, DeliveryMetadata, LockToken,
    MessageBroker, ReceivedMessage,
};
use chrono::{DateTime, Utc};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default redelivery cap before an offset is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// How long to keep filling a batch once the first message arrived.
const BATCH_LINGER: Duration = Duration::from_millis(10);

/// Header names on dead-lettered records.
pub mod dead_letter_headers {
    /// [`DeadLetterReason`](booking_relay_core::event_bus::DeadLetterReason) wire name
    pub const REASON: &str = "dead-letter-reason";
    /// `<ErrorKind>: <message>`
    pub const DESCRIPTION: &str = "dead-letter-description";
    /// Topic the record was read from
    pub const SOURCE_TOPIC: &str = "source-topic";
    /// Partition the record was read from
    pub const SOURCE_PARTITION: &str = "source-partition";
    /// Offset the record was read from
    pub const SOURCE_OFFSET: &str = "source-offset";
    /// Deliveries before dead-lettering
    pub const DELIVERY_COUNT: &str = "delivery-count";
}

/// Position of one delivery, encoded in its [`LockToken`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Delivery {
    partition: i32,
    offset: i64,
    count: u32,
}

impl Delivery {
    fn token(self) -> LockToken {
        LockToken::new(format!("{}:{}:{}", self.partition, self.offset, self.count))
    }

    fn parse(token: &LockToken) -> Option<Self> {
        let mut parts = token.as_str().splitn(3, ':');
        Some(Self {
            partition: parts.next()?.parse().ok()?,
            offset: parts.next()?.parse().ok()?,
            count: parts.next()?.parse().ok()?,
        })
    }
}

/// Forgets tracked offsets of partitions taken away by a rebalance.
///
/// Another member may commit past them while they are gone, so nothing the
/// tracker knew about those partitions holds when they come back.
struct RebalanceContext {
    topic: String,
    tracker: Arc<Mutex<OffsetTracker>>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(list) = rebalance {
            let partitions: Vec<i32> = list
                .elements_for_topic(&self.topic)
                .iter()
                .map(|e| e.partition())
                .collect();
            if partitions.is_empty() {
                return;
            }
            lock_tracker(&self.tracker).revoke(&partitions);
            tracing::info!(topic = %self.topic, ?partitions, "Partitions revoked");
        }
    }
}

fn lock_tracker(tracker: &Mutex<OffsetTracker>) -> MutexGuard<'_, OffsetTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned copy of the fields read from a Kafka record.
struct Record {
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
    content_type: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl Record {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        let content_type = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key.eq_ignore_ascii_case("content-type"))
                .and_then(|h| h.value)
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_string)
        });
        Self {
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            content_type,
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        }
    }
}

/// Redpanda consumer group member implementing [`MessageBroker`].
///
/// # Example
///
/// ```no_run
/// use booking_relay_redpanda::RedpandaBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092")
///     .topic("booking-events")
///     .consumer_group("booking-relay")
///     .max_delivery_count(5)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    dead_letter_producer: FutureProducer,
    topic: String,
    dead_letter_topic: String,
    timeout: Duration,
    max_delivery_count: u32,
    tracker: Arc<Mutex<OffsetTracker>>,
    subscribed: AtomicBool,
    closed: AtomicBool,
}

impl RedpandaBroker {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Topic consumed from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic dead-lettered records are written to.
    #[must_use]
    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    fn tracker(&self) -> MutexGuard<'_, OffsetTracker> {
        lock_tracker(&self.tracker)
    }

    fn message_id(&self, partition: i32, offset: i64) -> String {
        format!("{}-{partition}-{offset}", self.topic)
    }

    fn delivery(message: &ReceivedMessage) -> Result<Delivery, BrokerError> {
        Delivery::parse(&message.lock_token).ok_or_else(|| lock_lost(message))
    }

    fn to_received(&self, record: Record, delivery: Delivery) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id(record.partition, record.offset),
            body: record.payload,
            content_type: record.content_type,
            delivery_count: delivery.count,
            enqueued_at: record.timestamp,
            metadata: DeliveryMetadata::Stream {
                partition_id: record.partition,
                offset: record.offset,
                sequence_number: None,
            },
            lock_token: delivery.token(),
        }
    }

    fn commit(&self, partition: i32, next_offset: i64, message_id: &str) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(next_offset))
            .map_err(|e| broker_error(&e))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| settle_error(&e, message_id))?;
        tracing::trace!(partition, offset = next_offset, "Offset committed");
        Ok(())
    }

    fn settle(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let d = Self::delivery(message)?;
        let next = self
            .tracker()
            .settle(d.partition, d.offset, d.count)
            .map_err(|_| lock_lost(message))?;
        if let Some(next) = next {
            self.commit(d.partition, next, &message.message_id)?;
        }
        Ok(())
    }

    fn release(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let d = Self::delivery(message)?;
        let seek_to = self
            .tracker()
            .release(d.partition, d.offset, d.count)
            .map_err(|_| lock_lost(message))?;
        // A zero timeout makes the seek asynchronous.
        self.consumer
            .seek(
                &self.topic,
                d.partition,
                Offset::Offset(seek_to),
                Timeout::After(Duration::ZERO),
            )
            .map_err(|e| settle_error(&e, &message.message_id))
    }

    async fn publish_dead_letter(
        &self,
        message: &ReceivedMessage,
        delivery: Delivery,
        entry: &DeadLetter,
    ) -> Result<(), BrokerError> {
        let partition = delivery.partition.to_string();
        let offset = delivery.offset.to_string();
        let count = delivery.count.to_string();
        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: dead_letter_headers::REASON,
                value: Some(entry.reason.as_str()),
            })
            .insert(Header {
                key: dead_letter_headers::DESCRIPTION,
                value: Some(entry.description.as_str()),
            })
            .insert(Header {
                key: dead_letter_headers::SOURCE_TOPIC,
                value: Some(self.topic.as_str()),
            })
            .insert(Header {
                key: dead_letter_headers::SOURCE_PARTITION,
                value: Some(partition.as_str()),
            })
            .insert(Header {
                key: dead_letter_headers::SOURCE_OFFSET,
                value: Some(offset.as_str()),
            })
            .insert(Header {
                key: dead_letter_headers::DELIVERY_COUNT,
                value: Some(count.as_str()),
            });
        if let Some(content_type) = &message.content_type {
            headers = headers.insert(Header {
                key: "content-type",
                value: Some(content_type.as_str()),
            });
        }

        let record = FutureRecord::to(&self.dead_letter_topic)
            .payload(&message.body)
            .key(message.message_id.as_bytes())
            .headers(headers);

        self.dead_letter_producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| broker_error(&e))
    }

    /// Dead-letter an offset the tracker reported as exhausted.
    async fn exhaust(&self, record: Record, delivery: Delivery) {
        let message = self.to_received(record, delivery);
        let entry = DeadLetter::new(
            DeadLetterReason::MaxDeliveryCountExceeded,
            format!(
                "delivery count {} exceeds maximum of {}",
                delivery.count, self.max_delivery_count
            ),
        );
        match self.dead_letter(&message, entry).await {
            Ok(()) => tracing::warn!(
                message_id = %message.message_id,
                delivery_count = delivery.count,
                "Message exceeded max delivery count; dead-lettered"
            ),
            Err(error) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %error,
                    "Failed to dead-letter exhausted message; releasing for redelivery"
                );
                if let Err(error) = self.release(&message) {
                    tracing::error!(message_id = %message.message_id, error = %error, "Release failed");
                }
            },
        }
    }
}

fn lock_lost(message: &ReceivedMessage) -> BrokerError {
    BrokerError::LockLost {
        message_id: message.message_id.clone(),
    }
}

impl MessageBroker for RedpandaBroker {
    fn subscribe(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let consumer = Arc::clone(&self.consumer);
            let topic = self.topic.clone();
            let timeout = self.timeout;
            // Metadata fetch blocks; it doubles as the connectivity and ACL check.
            let partitions = tokio::task::spawn_blocking(move || {
                let metadata = consumer.fetch_metadata(Some(&topic), Timeout::After(timeout))?;
                Ok::<_, KafkaError>(metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == topic)
                    .map(|t| match t.error() {
                        Some(err) => Err(format!("{err:?}")),
                        None => Ok(t.partitions().len()),
                    }))
            })
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| broker_error(&e))?;

            let partitions = match partitions {
                None => {
                    return Err(BrokerError::Configuration(format!(
                        "topic {} not found",
                        self.topic
                    )));
                },
                Some(Err(err)) => {
                    return Err(BrokerError::Configuration(format!(
                        "topic {} unavailable: {err}",
                        self.topic
                    )));
                },
                Some(Ok(0)) => {
                    return Err(BrokerError::Configuration(format!(
                        "topic {} has no partitions",
                        self.topic
                    )));
                },
                Some(Ok(n)) => n,
            };

            self.consumer
                .subscribe(&[self.topic.as_str()])
                .map_err(|e| broker_error(&e))?;
            self.subscribed.store(true, Ordering::Release);

            tracing::info!(
                topic = %self.topic,
                partitions,
                dead_letter_topic = %self.dead_letter_topic,
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
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }
            if !self.subscribed.load(Ordering::Acquire) {
                return Err(BrokerError::Configuration(
                    "receive called before subscribe".to_string(),
                ));
            }

            let deadline = Instant::now() + max_wait;
            let mut batch = Vec::with_capacity(max_messages);

            while batch.len() < max_messages {
                let wait = if batch.is_empty() {
                    deadline.saturating_duration_since(Instant::now())
                } else {
                    BATCH_LINGER
                };

                let record = match tokio::time::timeout(wait, self.consumer.recv()).await {
                    Err(_) => break,
                    Ok(Ok(message)) => Record::from_message(&message),
                    Ok(Err(e)) if batch.is_empty() => return Err(broker_error(&e)),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Receive failed mid-batch; returning partial batch");
                        break;
                    },
                };

                let admission = self.tracker().admit(record.partition, record.offset);
                match admission {
                    Admission::Skip => {
                        tracing::trace!(
                            partition = record.partition,
                            offset = record.offset,
                            "Skipping settled or in-flight offset"
                        );
                    },
                    Admission::Deliver { delivery_count } => {
                        let delivery = Delivery {
                            partition: record.partition,
                            offset: record.offset,
                            count: delivery_count,
                        };
                        batch.push(self.to_received(record, delivery));
                    },
                    Admission::Exhausted { delivery_count } => {
                        let delivery = Delivery {
                            partition: record.partition,
                            offset: record.offset,
                            count: delivery_count,
                        };
                        self.exhaust(record, delivery).await;
                    },
                }
            }

            Ok(batch)
        })
    }

    fn acknowledge<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move { self.settle(message) })
    }

    fn abandon<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move { self.release(message) })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        entry: DeadLetter,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let d = Self::delivery(message)?;
            if !self.tracker().is_live(d.partition, d.offset, d.count) {
                return Err(lock_lost(message));
            }
            self.publish_dead_letter(message, d, &entry).await?;
            self.settle(message)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) && self.subscribed.load(Ordering::Acquire) {
                self.consumer.unsubscribe();
                tracing::info!(topic = %self.topic, "Unsubscribed");
            }
            Ok(())
        })
    }
}

/// Builder for [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    dead_letter_topic: Option<String>,
    auto_offset_reset: Option<String>,
    max_delivery_count: Option<u32>,
    timeout: Option<Duration>,
}

impl RedpandaBrokerBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic to consume.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Consumer group id. Relay instances sharing it split the partitions.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Dead-letter topic (default `<topic>.dead-letter`).
    #[must_use]
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Where a new group starts reading (default `"earliest"`).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Deliveries allowed before dead-lettering.
    #[must_use]
    pub const fn max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = Some(count);
        self
    }

    /// Timeout for metadata and dead-letter produce calls.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Create the consumer and dead-letter producer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Configuration`] if a required setting is missing
    /// or the client rejects its configuration.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::Configuration("brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| BrokerError::Configuration("topic not configured".to_string()))?;
        let group = self.consumer_group.ok_or_else(|| {
            BrokerError::Configuration("consumer group not configured".to_string())
        })?;
        let dead_letter_topic = self
            .dead_letter_topic
            .unwrap_or_else(|| format!("{topic}.dead-letter"));
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let max_delivery_count = self
            .max_delivery_count
            .unwrap_or(DEFAULT_MAX_DELIVERY_COUNT)
            .max(1);

        let tracker = Arc::new(Mutex::new(OffsetTracker::new(max_delivery_count)));
        let context = RebalanceContext {
            topic: topic.clone(),
            tracker: Arc::clone(&tracker),
        };
        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| BrokerError::Configuration(format!("failed to create consumer: {e}")))?;

        let dead_letter_producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| {
                BrokerError::Configuration(format!("failed to create dead-letter producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            group = %group,
            dead_letter_topic = %dead_letter_topic,
            max_delivery_count,
            "RedpandaBroker created"
        );

        Ok(RedpandaBroker {
            consumer: Arc::new(consumer),
            dead_letter_producer,
            topic,
            dead_letter_topic,
            timeout,
            max_delivery_count,
            tracker,
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_token_roundtrip() {
        let d = Delivery {
            partition: 3,
            offset: 1_024,
            count: 2,
        };
        assert_eq!(d.token().as_str(), "3:1024:2");
        assert_eq!(Delivery::parse(&d.token()), Some(d));
    }

    #[test]
    fn foreign_lock_tokens_do_not_parse() {
        for raw in ["", "3:1024", "a:b:c", "3:1024:x", "00000000-0000-0000-0000-000000000000"] {
            assert_eq!(Delivery::parse(&LockToken::new(raw)), None, "{raw}");
        }
    }

    #[test]
    fn builder_requires_consumer_group() {
        let result = RedpandaBroker::builder()
            .brokers("localhost:9092")
            .topic("booking-events")
            .build();
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }
}
