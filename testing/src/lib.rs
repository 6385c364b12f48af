//! # Booking Relay Testing
//!
//! Testing utilities for the booking event relay.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a lease-based broker implementing both `Publisher` and
//!   `MessageBroker`, with redelivery and a dead-letter list
//! - [`InMemoryBlobSink`]: a sink with fault injection
//! - [`ScriptedPublisher`]: a publisher that fails on cue
//! - [`CallLog`]: a shared, ordered log of broker and sink calls, used to
//!   assert that acknowledgment never precedes the write
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! let log = CallLog::new();
//! let broker = InMemoryBroker::topic().with_log(log.clone());
//! let sink = InMemoryBlobSink::new().with_log(log.clone());
//!
//! // ... run the processor ...
//!
//! assert!(log.position(|c| matches!(c, Call::SinkWrite(_)))
//!     < log.position(|c| matches!(c, Call::Acknowledged(_))));
//! ```

pub mod broker;
pub mod call_log;
pub mod publisher;
pub mod sink;

/// Mock implementations of Environment traits
pub mod mocks {
    use booking_relay_core::environment::Clock;
    use chrono::{DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use booking_relay_testing::mocks::FixedClock;
    /// use booking_relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2026-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_767_225_600, 0).unwrap_or_default())
    }
}

pub use broker::{DeadLetterEntry, InMemoryBroker, Transport};
pub use call_log::{Call, CallLog};
pub use mocks::{FixedClock, test_clock};
pub use publisher::ScriptedPublisher;
pub use sink::InMemoryBlobSink;

#[cfg(test)]
mod tests {
    use super::*;
    use booking_relay_core::environment::Clock;
    use chrono::Datelike;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.year(), 2026);
    }
}
