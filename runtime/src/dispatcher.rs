//! Producer-side dispatch of committed booking events.
//!
//! After the write path commits a booking change it hands the drained events
//! to [`EventDispatcher::dispatch_committed`]. Each event is first routed to
//! the in-process [`BookingEventHandler`]s, then wrapped in an envelope and
//! published.
//!
//! Publishing never fails the caller. Every event yields a [`DispatchResult`];
//! when the broker stays unreachable a committed change produces no event.
//! That is the known limitation of best-effort, at-least-once publishing.

use crate::metrics::PublishMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use booking_relay_core::envelope::EnvelopeBuilder;
use booking_relay_core::event::{BookingEvent, BookingSnapshot, Event};
use booking_relay_core::event_bus::{PublishError, Publisher};
use booking_relay_core::policy::Classify;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// In-process reaction to booking events.
///
/// Every method defaults to doing nothing, so a handler overrides only the
/// variants it cares about.
pub trait BookingEventHandler: Send + Sync {
    /// A booking was created.
    fn on_created(&self, _booking: &BookingSnapshot) {}

    /// A pending booking was confirmed.
    fn on_confirmed(&self, _booking: &BookingSnapshot) {}

    /// A booking was cancelled.
    fn on_cancelled(&self, _booking: &BookingSnapshot) {}

    /// A booking was paid.
    fn on_paid(&self, _booking: &BookingSnapshot) {}

    /// A booking's notes changed.
    fn on_note_changed(&self, _booking: &BookingSnapshot) {}
}

/// Handler that logs every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingHandler;

impl BookingEventHandler for LoggingHandler {
    fn on_created(&self, booking: &BookingSnapshot) {
        info!(
            booking_id = %booking.booking_id,
            customer_id = %booking.customer_id,
            seller_id = %booking.seller_id,
            "Booking created"
        );
    }

    fn on_confirmed(&self, booking: &BookingSnapshot) {
        info!(booking_id = %booking.booking_id, "Booking confirmed");
    }

    fn on_cancelled(&self, booking: &BookingSnapshot) {
        info!(booking_id = %booking.booking_id, "Booking cancelled");
    }

    fn on_paid(&self, booking: &BookingSnapshot) {
        info!(booking_id = %booking.booking_id, amount_paid = ?booking.amount_paid, "Booking paid");
    }

    fn on_note_changed(&self, booking: &BookingSnapshot) {
        info!(booking_id = %booking.booking_id, "Booking notes changed");
    }
}

/// Route `event` to the matching handler method.
pub fn route(handler: &dyn BookingEventHandler, event: &BookingEvent) {
    match event {
        BookingEvent::Created(b) => handler.on_created(b),
        BookingEvent::Confirmed(b) => handler.on_confirmed(b),
        BookingEvent::Cancelled(b) => handler.on_cancelled(b),
        BookingEvent::Paid(b) => handler.on_paid(b),
        BookingEvent::NoteChanged(b) => handler.on_note_changed(b),
    }
}

/// Outcome of dispatching one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// The broker accepted an envelope for the event
    Published {
        /// Event type
        event_type: &'static str,
        /// Id of the envelope that was accepted
        event_id: Uuid,
        /// Publish attempts made
        attempts: u32,
    },
    /// A non-retryable error; the event was logged and dropped
    Dropped {
        /// Event type
        event_type: &'static str,
        /// The error
        error: PublishError,
    },
    /// Transient errors until attempts ran out
    Failed {
        /// Event type
        event_type: &'static str,
        /// The last error
        error: PublishError,
        /// Publish attempts made
        attempts: u32,
    },
}

impl DispatchResult {
    /// Whether the event reached the broker.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

/// Publishes committed booking events.
pub struct EventDispatcher {
    publisher: Arc<dyn Publisher>,
    envelopes: EnvelopeBuilder,
    handlers: Vec<Arc<dyn BookingEventHandler>>,
    retry: RetryPolicy,
}

impl EventDispatcher {
    /// Create a dispatcher with no local handlers and the default retry policy.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, envelopes: EnvelopeBuilder) -> Self {
        Self {
            publisher,
            envelopes,
            handlers: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Add an in-process handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn BookingEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Replace the retry policy for transient publish failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Dispatch events whose state change is already committed.
    ///
    /// Returns one result per event, in order.
    pub async fn dispatch_committed(&self, events: Vec<BookingEvent>) -> Vec<DispatchResult> {
        let mut results = Vec::with_capacity(events.len());
        for event in &events {
            for handler in &self.handlers {
                route(handler.as_ref(), event);
            }
            results.push(self.publish(event).await);
        }
        results
    }

    async fn publish(&self, event: &BookingEvent) -> DispatchResult {
        let event_type = event.event_type();
        let envelopes = &self.envelopes;
        let publisher = self.publisher.as_ref();
        let started = Instant::now();

        // A fresh envelope per attempt: the event id identifies one publish.
        let retried = retry_with_predicate(
            &self.retry,
            || async move {
                let envelope = envelopes.build(event)?;
                publisher.publish(&envelope).await
            },
            PublishError::is_transient,
        )
        .await;

        match retried.result {
            Ok(ack) => {
                PublishMetrics::record_published(started.elapsed());
                info!(
                    event_type,
                    event_id = %ack.event_id,
                    correlation_id = %event.correlation_id(),
                    attempts = retried.attempts,
                    "Event published"
                );
                DispatchResult::Published {
                    event_type,
                    event_id: ack.event_id,
                    attempts: retried.attempts,
                }
            },
            Err(error) if error.is_transient() => {
                PublishMetrics::record_dropped("ConnectionError");
                error!(
                    event_type,
                    correlation_id = %event.correlation_id(),
                    attempts = retried.attempts,
                    error = %error,
                    "Broker unreachable, event not published"
                );
                DispatchResult::Failed {
                    event_type,
                    error,
                    attempts: retried.attempts,
                }
            },
            Err(error) => {
                PublishMetrics::record_dropped(error.kind());
                warn!(
                    event_type,
                    correlation_id = %event.correlation_id(),
                    class = error.classify().as_str(),
                    error = %error,
                    "Event dropped"
                );
                DispatchResult::Dropped { event_type, error }
            },
        }
    }
}
