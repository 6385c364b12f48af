//! Publisher that replays a script of outcomes.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use booking_relay_core::envelope::Envelope;
use booking_relay_core::event_bus::{Ack, BoxFuture, PublishError, Publisher};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Publisher returning scripted failures, then success.
///
/// Every attempt is recorded, successful or not, so tests can check that a
/// retry used a fresh envelope.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPublisher {
    script: Arc<Mutex<VecDeque<PublishError>>>,
    attempts: Arc<Mutex<Vec<Envelope>>>,
    accepted: Arc<Mutex<Vec<Envelope>>>,
}

impl ScriptedPublisher {
    /// Publisher that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher that fails with `errors` in order, then succeeds.
    #[must_use]
    pub fn failing(errors: impl IntoIterator<Item = PublishError>) -> Self {
        let publisher = Self::default();
        publisher.script.lock().unwrap().extend(errors);
        publisher
    }

    /// Every envelope passed to `publish`.
    #[must_use]
    pub fn attempts(&self) -> Vec<Envelope> {
        self.attempts.lock().unwrap().clone()
    }

    /// Envelopes that were accepted.
    #[must_use]
    pub fn accepted(&self) -> Vec<Envelope> {
        self.accepted.lock().unwrap().clone()
    }
}

impl Publisher for ScriptedPublisher {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Ack, PublishError>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(envelope.clone());
            if let Some(error) = self.script.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.accepted.lock().unwrap().push(envelope.clone());
            Ok(Ack {
                event_id: envelope.event_id,
                partition: None,
                offset: None,
            })
        })
    }
}
