//! In-memory broker with lease semantics.
//!
//! [`InMemoryBroker`] behaves like a single-subscription topic (or a
//! single-partition stream): published messages wait until received, a
//! receive hands out a time-limited lease, and only the current lease holder
//! can settle the message. Unsettled messages become visible again when their
//! lease expires, with an incremented delivery count. Once a message has been
//! delivered `max_delivery_count` times without settlement the broker moves it
//! to its own dead-letter list with reason `MaxDeliveryCountExceeded`.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::call_log::{Call, CallLog};
use booking_relay_core::envelope::Envelope;
use booking_relay_core::event_bus::{
    Ack, BoxFuture, BrokerError, DeadLetter, DeadLetterReason, DeliveryMetadata, LockToken,
    MessageBroker, PublishError, Publisher, ReceivedMessage,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Which transport flavor the broker imitates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Partitioned log; messages carry partition and offset
    Stream,
    /// Topic subscription; messages carry subject and correlation id
    Topic,
}

/// A message the broker gave up on or that was dead-lettered by a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Broker message id
    pub message_id: String,
    /// Original body
    pub body: Vec<u8>,
    /// Why it was dead-lettered
    pub reason: DeadLetterReason,
    /// Error description
    pub description: String,
    /// Deliveries before dead-lettering
    pub delivery_count: u32,
}

#[derive(Debug)]
struct Lease {
    token: String,
    until: Instant,
}

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: Vec<u8>,
    content_type: Option<String>,
    subject: Option<String>,
    correlation_id: Option<String>,
    enqueued_at: DateTime<Utc>,
    sequence: i64,
    delivery_count: u32,
    lease: Option<Lease>,
}

impl StoredMessage {
    fn is_available(&self, now: Instant) -> bool {
        self.lease.as_ref().is_none_or(|lease| lease.until <= now)
    }

    fn holds(&self, token: &LockToken, now: Instant) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.token == token.as_str() && lease.until > now)
    }
}

#[derive(Debug, Default)]
struct State {
    messages: VecDeque<StoredMessage>,
    next_sequence: i64,
    acknowledged: Vec<String>,
    dead_letters: Vec<DeadLetterEntry>,
    subscribed: bool,
    closed: bool,
    subscribe_failure: Option<BrokerError>,
    receive_failures: VecDeque<BrokerError>,
    publish_failures: VecDeque<PublishError>,
}

/// Lease-based in-memory broker.
///
/// Clones share state, so a test can keep one handle for assertions and hand
/// another to the consumer.
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    transport: Transport,
    lock_duration: Duration,
    max_delivery_count: u32,
    state: Arc<Mutex<State>>,
    log: Option<CallLog>,
}

impl InMemoryBroker {
    /// Create a broker imitating `transport`.
    ///
    /// Defaults: 30 s lock duration, 10 deliveries.
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            state: Arc::new(Mutex::new(State::default())),
            log: None,
        }
    }

    /// Topic/subscription flavor.
    #[must_use]
    pub fn topic() -> Self {
        Self::new(Transport::Topic)
    }

    /// Partitioned-stream flavor.
    #[must_use]
    pub fn stream() -> Self {
        Self::new(Transport::Stream)
    }

    /// Set the lease length.
    #[must_use]
    pub const fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Set the delivery cap after which the broker dead-letters on its own.
    #[must_use]
    pub const fn with_max_delivery_count(mut self, max: u32) -> Self {
        self.max_delivery_count = max;
        self
    }

    /// Record settlements into `log`.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Enqueue a raw body, bypassing envelope encoding. Returns the message id.
    pub fn send_raw(&self, body: impl Into<Vec<u8>>, subject: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        self.enqueue(id.clone(), body.into(), None, subject.map(str::to_string), None);
        id
    }

    /// Make the next `subscribe` fail with `error`.
    pub fn fail_subscribe_with(&self, error: BrokerError) {
        self.state.lock().unwrap().subscribe_failure = Some(error);
    }

    /// Make the next receive calls fail, one error per call.
    pub fn fail_next_receives(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.state.lock().unwrap().receive_failures.extend(errors);
    }

    /// Make the next publish calls fail, one error per call.
    pub fn fail_next_publishes(&self, errors: impl IntoIterator<Item = PublishError>) {
        self.state.lock().unwrap().publish_failures.extend(errors);
    }

    /// Expire every outstanding lease immediately.
    pub fn expire_locks(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        for lease in state.messages.iter_mut().filter_map(|m| m.lease.as_mut()) {
            lease.until = now;
        }
    }

    /// Message ids acknowledged so far, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<String> {
        self.state.lock().unwrap().acknowledged.clone()
    }

    /// Dead-lettered messages, in order.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().unwrap().dead_letters.clone()
    }

    /// Messages not yet settled, leased or not.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// Whether `subscribe` succeeded.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.state.lock().unwrap().subscribed
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn record(&self, call: Call) {
        if let Some(log) = &self.log {
            log.record(call);
        }
    }

    fn enqueue(
        &self,
        id: String,
        body: Vec<u8>,
        content_type: Option<String>,
        subject: Option<String>,
        correlation_id: Option<String>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.messages.push_back(StoredMessage {
            id,
            body,
            content_type,
            subject,
            correlation_id,
            enqueued_at: Utc::now(),
            sequence,
            delivery_count: 0,
            lease: None,
        });
        sequence
    }

    fn metadata(&self, message: &StoredMessage) -> DeliveryMetadata {
        match self.transport {
            Transport::Stream => DeliveryMetadata::Stream {
                partition_id: 0,
                offset: message.sequence,
                sequence_number: Some(message.sequence),
            },
            Transport::Topic => DeliveryMetadata::Topic {
                subject: message.subject.clone(),
                correlation_id: message.correlation_id.clone(),
            },
        }
    }

    fn try_receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(error) = state.receive_failures.pop_front() {
            return Err(error);
        }

        let max_delivery_count = self.max_delivery_count;
        let (exhausted, remaining): (Vec<_>, Vec<_>) = state
            .messages
            .drain(..)
            .partition(|m| m.is_available(now) && m.delivery_count >= max_delivery_count);
        state.messages = remaining.into();
        for message in exhausted {
            self.record(Call::DeadLettered(
                message.id.clone(),
                DeadLetterReason::MaxDeliveryCountExceeded,
            ));
            state.dead_letters.push(DeadLetterEntry {
                message_id: message.id,
                body: message.body,
                reason: DeadLetterReason::MaxDeliveryCountExceeded,
                description: format!("delivered {} times", message.delivery_count),
                delivery_count: message.delivery_count,
            });
        }

        let lease_until = now + self.lock_duration;
        let mut batch = Vec::new();
        for message in state.messages.iter_mut() {
            if batch.len() >= max_messages {
                break;
            }
            if !message.is_available(now) {
                continue;
            }
            let token = Uuid::new_v4().to_string();
            message.delivery_count += 1;
            message.lease = Some(Lease {
                token: token.clone(),
                until: lease_until,
            });
            batch.push(ReceivedMessage {
                message_id: message.id.clone(),
                body: message.body.clone(),
                content_type: message.content_type.clone(),
                delivery_count: message.delivery_count,
                enqueued_at: Some(message.enqueued_at),
                metadata: self.metadata(message),
                lock_token: LockToken::new(token),
            });
        }
        Ok(batch)
    }

    /// Remove the message if `token` still holds its lease.
    fn take_leased(&self, message: &ReceivedMessage) -> Result<StoredMessage, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let position = state
            .messages
            .iter()
            .position(|m| m.id == message.message_id && m.holds(&message.lock_token, now))
            .ok_or_else(|| BrokerError::LockLost {
                message_id: message.message_id.clone(),
            })?;
        state
            .messages
            .remove(position)
            .ok_or_else(|| BrokerError::LockLost {
                message_id: message.message_id.clone(),
            })
    }
}

impl Publisher for InMemoryBroker {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Ack, PublishError>> {
        Box::pin(async move {
            if let Some(error) = self.state.lock().unwrap().publish_failures.pop_front() {
                return Err(error);
            }
            let body = envelope.to_bytes()?;
            let sequence = self.enqueue(
                envelope.event_id.to_string(),
                body,
                Some(envelope.content_type.clone()),
                Some(envelope.subject.clone()),
                Some(envelope.correlation_id.clone()),
            );
            self.record(Call::Published(envelope.event_id.to_string()));
            Ok(Ack {
                event_id: envelope.event_id,
                partition: (self.transport == Transport::Stream).then_some(0),
                offset: Some(sequence),
            })
        })
    }
}

impl MessageBroker for InMemoryBroker {
    fn subscribe(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.subscribe_failure.take() {
                return Err(error);
            }
            state.subscribed = true;
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
                let batch = self.try_receive(max_messages)?;
                if !batch.is_empty() || Instant::now() >= deadline {
                    return Ok(batch);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
    }

    fn acknowledge<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let stored = self.take_leased(message)?;
            self.state.lock().unwrap().acknowledged.push(stored.id.clone());
            self.record(Call::Acknowledged(stored.id));
            Ok(())
        })
    }

    fn abandon<'a>(
        &'a self,
        message: &'a ReceivedMessage,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            let stored = state
                .messages
                .iter_mut()
                .find(|m| m.id == message.message_id && m.holds(&message.lock_token, now))
                .ok_or_else(|| BrokerError::LockLost {
                    message_id: message.message_id.clone(),
                })?;
            stored.lease = None;
            drop(state);
            self.record(Call::Abandoned(message.message_id.clone()));
            Ok(())
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        entry: DeadLetter,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let stored = self.take_leased(message)?;
            self.record(Call::DeadLettered(stored.id.clone(), entry.reason));
            self.state.lock().unwrap().dead_letters.push(DeadLetterEntry {
                message_id: stored.id,
                body: stored.body,
                reason: entry.reason,
                description: entry.description,
                delivery_count: stored.delivery_count,
            });
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.state.lock().unwrap().closed = true;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn receive_leases_and_acknowledge_removes() {
        let broker = InMemoryBroker::topic();
        let id = broker.send_raw(b"{}".to_vec(), Some("BookingCreated"));

        let batch = broker.receive_batch(10, WAIT).await.expect("receive");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivery_count, 1);
        assert_eq!(batch[0].metadata.subject(), Some("BookingCreated"));

        // Leased messages are invisible to other receivers.
        assert!(broker.receive_batch(10, WAIT).await.expect("receive").is_empty());

        broker.acknowledge(&batch[0]).await.expect("ack");
        assert_eq!(broker.acknowledged(), vec![id]);
        assert_eq!(broker.outstanding(), 0);
    }

    #[tokio::test]
    async fn abandon_redelivers_with_higher_count() {
        let broker = InMemoryBroker::topic();
        broker.send_raw(b"{}".to_vec(), None);

        let first = broker.receive_batch(1, WAIT).await.expect("receive");
        broker.abandon(&first[0]).await.expect("abandon");

        let second = broker.receive_batch(1, WAIT).await.expect("receive");
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn expired_lease_rejects_settlement() {
        let broker = InMemoryBroker::topic();
        broker.send_raw(b"{}".to_vec(), None);

        let batch = broker.receive_batch(1, WAIT).await.expect("receive");
        broker.expire_locks();

        let err = broker.acknowledge(&batch[0]).await.expect_err("lock lost");
        assert!(matches!(err, BrokerError::LockLost { .. }));
        assert_eq!(broker.outstanding(), 1);
    }

    #[tokio::test]
    async fn stale_token_cannot_settle_redelivered_copy() {
        let broker = InMemoryBroker::topic();
        broker.send_raw(b"{}".to_vec(), None);

        let stale = broker.receive_batch(1, WAIT).await.expect("receive");
        broker.expire_locks();
        let fresh = broker.receive_batch(1, WAIT).await.expect("receive");

        assert!(broker.acknowledge(&stale[0]).await.is_err());
        broker.acknowledge(&fresh[0]).await.expect("fresh ack");
    }

    #[tokio::test]
    async fn broker_dead_letters_after_max_deliveries() {
        let broker = InMemoryBroker::topic().with_max_delivery_count(2);
        let id = broker.send_raw(b"{}".to_vec(), None);

        for _ in 0..2 {
            let batch = broker.receive_batch(1, WAIT).await.expect("receive");
            broker.abandon(&batch[0]).await.expect("abandon");
        }
        assert!(broker.receive_batch(1, WAIT).await.expect("receive").is_empty());

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].reason, DeadLetterReason::MaxDeliveryCountExceeded);
    }

    #[tokio::test]
    async fn stream_flavor_reports_offsets() {
        let broker = InMemoryBroker::stream();
        broker.send_raw(b"a".to_vec(), None);
        broker.send_raw(b"b".to_vec(), None);

        let batch = broker.receive_batch(10, WAIT).await.expect("receive");
        let offsets: Vec<_> = batch
            .iter()
            .map(|m| match m.metadata {
                DeliveryMetadata::Stream { offset, .. } => offset,
                DeliveryMetadata::Topic { .. } => -1,
            })
            .collect();
        assert_eq!(offsets, vec![0, 1]);
    }

    #[tokio::test]
    async fn closed_broker_refuses_receive() {
        let broker = InMemoryBroker::topic();
        broker.close().await.expect("close");
        assert_eq!(
            broker.receive_batch(1, WAIT).await.expect_err("closed"),
            BrokerError::Closed
        );
    }
}
