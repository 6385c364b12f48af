//! Prometheus metrics for the relay.
//!
//! Recorders are zero-sized structs with associated functions; they record
//! through the global `metrics` recorder, so nothing is collected until a
//! recorder is installed (see [`MetricsServer`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use booking_relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use booking_relay_core::event_bus::DeadLetterReason;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder installed earlier (as in tests) is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    // `ExporterError` does not implement `Debug`, so it cannot be logged as a field.
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "relay_messages_received_total",
        "Messages handed to the processor"
    );
    describe_counter!(
        "relay_messages_completed_total",
        "Messages stored and acknowledged"
    );
    describe_counter!(
        "relay_messages_dead_lettered_total",
        "Messages dead-lettered by the processor, by reason"
    );
    describe_counter!(
        "relay_messages_retried_total",
        "Messages abandoned for broker redelivery"
    );
    describe_counter!(
        "relay_acknowledgment_races_total",
        "Settlements rejected because the message lock was lost"
    );
    describe_histogram!(
        "relay_message_duration_seconds",
        "Time from receipt to settlement"
    );
    describe_counter!("relay_sink_writes_total", "Sink writes, by outcome");
    describe_histogram!("relay_sink_write_duration_seconds", "Time taken to write one record");
    describe_counter!("relay_events_published_total", "Envelopes accepted by the broker");
    describe_counter!(
        "relay_events_dropped_total",
        "Events dropped by the dispatcher, by error kind"
    );
    describe_histogram!("relay_publish_duration_seconds", "Time taken to publish one event");
    describe_counter!("relay_retry_attempts_total", "Producer retry attempts");
    describe_counter!("relay_retry_successes_total", "Producer operations that succeeded after retry");
    describe_counter!("relay_retry_exhausted_total", "Producer operations that ran out of attempts");
}

/// Consumer-side recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// A message entered the processor.
    pub fn record_received() {
        counter!("relay_messages_received_total").increment(1);
    }

    /// A message was stored and acknowledged.
    pub fn record_completed(duration: Duration) {
        counter!("relay_messages_completed_total").increment(1);
        histogram!("relay_message_duration_seconds").record(duration.as_secs_f64());
    }

    /// A message was dead-lettered.
    pub fn record_dead_lettered(reason: DeadLetterReason) {
        counter!("relay_messages_dead_lettered_total", "reason" => reason.as_str()).increment(1);
    }

    /// A message was abandoned for redelivery.
    pub fn record_retry() {
        counter!("relay_messages_retried_total").increment(1);
    }

    /// A settlement call hit a lost lock.
    pub fn record_ack_race() {
        counter!("relay_acknowledgment_races_total").increment(1);
    }

    /// A sink write finished.
    pub fn record_sink_write(duration: Duration, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        counter!("relay_sink_writes_total", "outcome" => outcome).increment(1);
        histogram!("relay_sink_write_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Producer-side recorder.
pub struct PublishMetrics;

impl PublishMetrics {
    /// An event was published.
    pub fn record_published(duration: Duration) {
        counter!("relay_events_published_total").increment(1);
        histogram!("relay_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// An event was dropped.
    pub fn record_dropped(kind: &'static str) {
        counter!("relay_events_dropped_total", "kind" => kind).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("relay_retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("relay_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("relay_retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_and_renders_relay_metrics() {
        let addr = "127.0.0.1:0".parse().expect("valid addr");
        let mut server = MetricsServer::new(addr);
        assert!(server.render().is_none());

        server.start().expect("start");

        RelayMetrics::record_received();
        RelayMetrics::record_dead_lettered(DeadLetterReason::InvalidMessage);
        PublishMetrics::record_published(Duration::from_millis(3));

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("relay_messages_received_total"));
            assert!(rendered.contains("reason=\"InvalidMessage\""));
            assert!(rendered.contains("relay_events_published_total"));
        }
    }
}
