//! Failure classification.
//!
//! Every error that can reach the processor or the dispatcher is classified
//! into one of three classes, which decides what happens to the message:
//!
//! | class | consumer side | producer side |
//! |---|---|---|
//! | [`FailureClass::Retryable`] | do not acknowledge; broker redelivers | retry with a fresh envelope |
//! | [`FailureClass::Terminal`] | dead-letter immediately | log and drop |
//! | [`FailureClass::Fatal`] | at startup: processor refuses to start | log and drop |
//!
//! Redelivery is capped by the broker's own maximum delivery count. This
//! module keeps no retry counter.

use crate::envelope::EncodingError;
use crate::event_bus::{BrokerError, PublishError};
use crate::sink::SinkError;

/// How a failure should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Transient; redelivery or retry may succeed
    Retryable,
    /// Deterministic; retrying reproduces the failure
    Terminal,
    /// Authorization or configuration; surfaced to process supervision
    Fatal,
}

impl FailureClass {
    /// Lowercase name for structured logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
            Self::Fatal => "fatal",
        }
    }
}

/// Classification of an error.
pub trait Classify {
    /// The class deciding retry vs. dead-letter.
    fn classify(&self) -> FailureClass;

    /// Error class name used in dead-letter descriptions and logs.
    fn kind(&self) -> &'static str;

    /// `<kind>: <message>` as written to dead-letter descriptions.
    fn describe(&self) -> String
    where
        Self: std::fmt::Display,
    {
        format!("{}: {self}", self.kind())
    }
}

impl Classify for SinkError {
    fn classify(&self) -> FailureClass {
        match self {
            Self::Io(_) => FailureClass::Retryable,
            Self::Rejected { .. } => FailureClass::Terminal,
            Self::Configuration(_) => FailureClass::Fatal,
        }
    }

    fn kind(&self) -> &'static str {
        "SinkWriteError"
    }
}

impl Classify for BrokerError {
    fn classify(&self) -> FailureClass {
        match self {
            Self::Transport(_) | Self::LockLost { .. } => FailureClass::Retryable,
            Self::Unauthorized(_) | Self::Configuration(_) | Self::Closed => FailureClass::Fatal,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::LockLost { .. } => "AcknowledgmentRaceError",
            Self::Unauthorized(_) | Self::Configuration(_) => "StartupConfigurationError",
            Self::Transport(_) | Self::Closed => "BrokerError",
        }
    }
}

impl Classify for PublishError {
    fn classify(&self) -> FailureClass {
        match self {
            Self::Connection(_) => FailureClass::Retryable,
            Self::PayloadTooLarge { .. } | Self::Encoding(_) => FailureClass::Terminal,
            Self::Auth(_) => FailureClass::Fatal,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "EncodingError",
            Self::Connection(_) | Self::Auth(_) | Self::PayloadTooLarge { .. } => "PublishError",
        }
    }
}

impl Classify for EncodingError {
    fn classify(&self) -> FailureClass {
        FailureClass::Terminal
    }

    fn kind(&self) -> &'static str {
        "EncodingError"
    }
}
