//! Long-running relay consumer.
//!
//! `RelayConsumer` owns the receive loop: it attaches to the broker, pulls
//! batches, and hands each message to the [`MessageProcessor`] with bounded
//! concurrency. Per-message failures stay inside the processor; only startup
//! and fatal broker errors end the loop.
//!
//! ```text
//! ensure_container ─► subscribe ─► loop {
//!                                    select! {
//!                                        shutdown      => break
//!                                        receive_batch => process concurrently
//!                                    }
//!                                  } ─► close
//! ```
//!
//! # Shutdown
//!
//! The shutdown signal is observed between batches. A batch that was already
//! received finishes processing, so no message is dropped after being read
//! and before being settled.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = RelayConsumer::builder()
//!     .name("booking-relay")
//!     .broker(broker)
//!     .processor(processor)
//!     .shutdown(shutdown_rx)
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use crate::processor::MessageProcessor;
use booking_relay_core::event_bus::{BrokerError, MessageBroker};
use booking_relay_core::policy::{Classify, FailureClass};
use booking_relay_core::sink::SinkError;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Errors that stop the consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The sink container could not be prepared
    #[error("sink unavailable at startup: {0}")]
    Sink(SinkError),

    /// Subscribing to the broker failed
    #[error("failed to subscribe: {0}")]
    Subscribe(BrokerError),

    /// The broker failed with a non-retryable error while running
    #[error("broker failed: {0}")]
    Broker(BrokerError),

    /// The builder was missing a required part
    #[error("consumer misconfigured: {0} is required")]
    MissingField(&'static str),
}

impl Classify for RelayError {
    fn classify(&self) -> FailureClass {
        FailureClass::Fatal
    }

    fn kind(&self) -> &'static str {
        "StartupConfigurationError"
    }
}

/// Relay consumer.
///
/// # Configuration
///
/// - `batch_size`: messages requested per receive (default: 16)
/// - `max_wait`: how long one receive waits for the first message (default: 1s)
/// - `max_concurrency`: messages processed at once (default: 8)
/// - `retry_delay`: pause after a transient receive error (default: 5s)
pub struct RelayConsumer {
    name: String,
    broker: Arc<dyn MessageBroker>,
    processor: Arc<MessageProcessor>,
    shutdown: broadcast::Receiver<()>,
    batch_size: usize,
    max_wait: Duration,
    max_concurrency: usize,
    retry_delay: Duration,
}

impl RelayConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> RelayConsumerBuilder {
        RelayConsumerBuilder::default()
    }

    /// Consumer name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task resolves when shutdown completes or a fatal error occurs.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), RelayError>> {
        tokio::spawn(self.run())
    }

    /// Run the consumer until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] when startup fails or the broker fails fatally.
    pub async fn run(mut self) -> Result<(), RelayError> {
        info!(consumer = %self.name, "Relay consumer starting");

        self.processor.ensure_ready().await.map_err(|e| {
            error!(consumer = %self.name, error = %e, "Sink container unavailable");
            RelayError::Sink(e)
        })?;
        self.broker.subscribe().await.map_err(|e| {
            error!(consumer = %self.name, error = %e, "Failed to subscribe");
            RelayError::Subscribe(e)
        })?;
        info!(
            consumer = %self.name,
            batch_size = self.batch_size,
            max_concurrency = self.max_concurrency,
            "Relay consumer subscribed"
        );

        let result = self.receive_loop().await;

        if let Err(e) = self.broker.close().await {
            warn!(consumer = %self.name, error = %e, "Broker did not close cleanly");
        }
        info!(consumer = %self.name, "Relay consumer stopped");
        result
    }

    async fn receive_loop(&mut self) -> Result<(), RelayError> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Relay consumer received shutdown signal");
                    return Ok(());
                }
                received = self.broker.receive_batch(self.batch_size, self.max_wait) => received,
            };

            match received {
                Ok(batch) if batch.is_empty() => {},
                Ok(batch) => {
                    debug!(consumer = %self.name, count = batch.len(), "Processing batch");
                    let processor = &self.processor;
                    let broker = self.broker.as_ref();
                    futures::stream::iter(batch)
                        .for_each_concurrent(self.max_concurrency, |message| async move {
                            processor.process(broker, message).await;
                        })
                        .await;
                },
                Err(e) if e.classify() == FailureClass::Retryable => {
                    warn!(
                        consumer = %self.name,
                        error = %e,
                        "Receive failed, retrying in {:?}",
                        self.retry_delay
                    );
                    tokio::select! {
                        _ = self.shutdown.recv() => return Ok(()),
                        () = tokio::time::sleep(self.retry_delay) => {},
                    }
                },
                Err(e) => {
                    error!(consumer = %self.name, error = %e, kind = e.kind(), "Broker failed");
                    return Err(RelayError::Broker(e));
                },
            }
        }
    }
}

/// Builder for [`RelayConsumer`].
#[derive(Default)]
pub struct RelayConsumerBuilder {
    name: Option<String>,
    broker: Option<Arc<dyn MessageBroker>>,
    processor: Option<Arc<MessageProcessor>>,
    shutdown: Option<broadcast::Receiver<()>>,
    batch_size: Option<usize>,
    max_wait: Option<Duration>,
    max_concurrency: Option<usize>,
    retry_delay: Option<Duration>,
}

impl RelayConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set broker.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set processor.
    #[must_use]
    pub fn processor(mut self, processor: Arc<MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Messages requested per receive. Zero is treated as one.
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Longest wait for the first message of a batch.
    #[must_use]
    pub const fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }

    /// Messages processed at once. Zero is treated as one.
    #[must_use]
    pub const fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Pause after a transient receive error.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MissingField`] if broker, processor or shutdown
    /// was not set.
    pub fn build(self) -> Result<RelayConsumer, RelayError> {
        Ok(RelayConsumer {
            name: self.name.unwrap_or_else(|| "booking-relay".to_string()),
            broker: self.broker.ok_or(RelayError::MissingField("broker"))?,
            processor: self.processor.ok_or(RelayError::MissingField("processor"))?,
            shutdown: self.shutdown.ok_or(RelayError::MissingField("shutdown"))?,
            batch_size: self.batch_size.unwrap_or(16).max(1),
            max_wait: self.max_wait.unwrap_or(Duration::from_secs(1)),
            max_concurrency: self.max_concurrency.unwrap_or(8).max(1),
            retry_delay: self.retry_delay.unwrap_or(Duration::from_secs(5)),
        })
    }
}
