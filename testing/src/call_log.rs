//! Ordered log of broker and sink calls shared between test doubles.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use booking_relay_core::event_bus::DeadLetterReason;
use std::sync::{Arc, Mutex};

/// One observable call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// Envelope accepted by a publisher (event id)
    Published(String),
    /// Record written to a sink (key)
    SinkWrite(String),
    /// Sink write attempt that failed (key)
    SinkWriteFailed(String),
    /// Message acknowledged (message id)
    Acknowledged(String),
    /// Message released for redelivery (message id)
    Abandoned(String),
    /// Message dead-lettered (message id, reason)
    DeadLettered(String, DeadLetterReason),
}

/// Shared, append-only call log.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call.
    pub fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// Copy of all calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Index of the first call matching `predicate`.
    #[must_use]
    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(predicate)
    }

    /// Number of calls matching `predicate`.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }
}
