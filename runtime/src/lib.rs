//! # Booking Relay Runtime
//!
//! Runtime pieces of the booking event relay.
//!
//! ## Core Components
//!
//! - **`MessageProcessor`** ([`processor`]): validate → store → settle, one
//!   state machine per message
//! - **`RelayConsumer`** ([`consumer`]): receive loop with bounded concurrency
//!   and graceful shutdown
//! - **`EventDispatcher`** ([`dispatcher`]): producer side, routes committed
//!   events to local handlers and publishes them
//! - **`FileSystemBlobSink`** ([`sink`]): atomic file writes
//!
//! ## Example
//!
//! ```ignore
//! use booking_relay_runtime::{MessageProcessor, RelayConsumer};
//!
//! let processor = Arc::new(MessageProcessor::new(sink, keys));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!
//! let handle = RelayConsumer::builder()
//!     .broker(broker)
//!     .processor(processor)
//!     .shutdown(shutdown_rx)
//!     .build()?
//!     .spawn();
//!
//! // ...
//! let _ = shutdown_tx.send(());
//! handle.await??;
//! ```

pub mod consumer;
pub mod dispatcher;
/// Prometheus metrics for observability
pub mod metrics;
pub mod processor;
/// Retry logic with exponential backoff
pub mod retry;
pub mod sink;

pub use consumer::{RelayConsumer, RelayConsumerBuilder, RelayError};
pub use dispatcher::{BookingEventHandler, DispatchResult, EventDispatcher, LoggingHandler};
pub use processor::{
    MessageProcessor, ProcessingError, ProcessingOutcome, ProcessingState, ValidationError,
};
pub use retry::RetryPolicy;
pub use sink::FileSystemBlobSink;
