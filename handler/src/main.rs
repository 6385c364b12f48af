//! Booking event relay service.
//!
//! Receives booking envelopes from the configured broker, stores each one as a
//! JSON record and settles the message. Runs until Ctrl+C or SIGTERM, then
//! drains in-flight messages before exiting.
//!
//! # Usage
//!
//! ```bash
//! KAFKA_TOPIC=booking-events KAFKA_CONSUMER_GROUP=relay \
//!   cargo run -p booking-handler
//!
//! RELAY_BACKEND=topic DATABASE_URL=postgres://localhost/relay \
//!   RELAY_TOPIC=booking-events RELAY_SUBSCRIPTION=relay SINK_KIND=postgres \
//!   cargo run -p booking-handler
//! ```

mod config;

use anyhow::Context;
use booking_relay_core::event_bus::MessageBroker;
use booking_relay_core::sink::{BlobSink, KeyBuilder};
use booking_relay_postgres::{PostgresBlobSink, PostgresSubscription, migrate};
use booking_relay_redpanda::RedpandaBroker;
use booking_relay_runtime::metrics::MetricsServer;
use booking_relay_runtime::{FileSystemBlobSink, MessageProcessor, RelayConsumer};
use config::{BackendConfig, Config, SinkConfig};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booking_handler=info,booking_relay_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        container = %config.container,
        batch_size = config.batch_size,
        max_concurrency = config.max_concurrency,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("failed to start metrics exporter")?;
        info!(%addr, "Metrics exporter listening");
    }

    let pool = match config.database_url() {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to PostgreSQL")?;
            migrate(&pool).await.context("failed to create relay tables")?;
            Some(pool)
        },
        None => None,
    };

    let broker = build_broker(&config, pool.as_ref())?;
    let sink = build_sink(&config, pool.as_ref())?;
    let processor = Arc::new(MessageProcessor::new(
        sink,
        KeyBuilder::new(config.key_prefix.clone(), config.key_token).include_subject(true),
    ));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let consumer = RelayConsumer::builder()
        .name("booking-handler")
        .broker(broker)
        .processor(processor)
        .shutdown(shutdown_rx)
        .batch_size(config.batch_size)
        .max_wait(config.max_wait)
        .max_concurrency(config.max_concurrency)
        .build()?;
    let mut handle = consumer.spawn();

    tokio::select! {
        result = &mut handle => {
            // The consumer only stops on its own when it fails.
            return result
                .context("relay task panicked")?
                .context("relay stopped");
        }
        () = shutdown_signal() => {}
    }

    info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(config.shutdown_timeout, handle).await {
        Ok(Ok(Ok(()))) => info!("Relay stopped"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Relay stopped with an error"),
        Ok(Err(e)) => warn!(error = %e, "Relay task failed"),
        Err(_) => warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Relay shutdown timed out; unsettled messages will be redelivered"
        ),
    }
    Ok(())
}

fn build_broker(config: &Config, pool: Option<&PgPool>) -> anyhow::Result<Arc<dyn MessageBroker>> {
    match &config.backend {
        BackendConfig::Stream {
            brokers,
            topic,
            consumer_group,
            dead_letter_topic,
        } => {
            let mut builder = RedpandaBroker::builder()
                .brokers(brokers.clone())
                .topic(topic.clone())
                .consumer_group(consumer_group.clone())
                .max_delivery_count(config.max_delivery_count);
            if let Some(dead_letter_topic) = dead_letter_topic {
                builder = builder.dead_letter_topic(dead_letter_topic.clone());
            }
            let broker = builder.build().context("failed to create Kafka consumer")?;
            info!(
                %brokers,
                %topic,
                %consumer_group,
                dead_letter_topic = broker.dead_letter_topic(),
                "Using stream backend"
            );
            Ok(Arc::new(broker))
        },
        BackendConfig::Topic {
            topic,
            subscription,
            lock_duration,
            ..
        } => {
            let pool = pool.context("topic backend needs a database")?;
            info!(%topic, %subscription, "Using topic backend");
            Ok(Arc::new(
                PostgresSubscription::new(pool.clone(), topic.clone(), subscription.clone())
                    .with_lock_duration(*lock_duration)
                    .with_max_delivery_count(config.max_delivery_count),
            ))
        },
    }
}

fn build_sink(config: &Config, pool: Option<&PgPool>) -> anyhow::Result<Arc<dyn BlobSink>> {
    match &config.sink {
        SinkConfig::Filesystem { root } => {
            info!(root = %root.display(), container = %config.container, "Using filesystem sink");
            Ok(Arc::new(FileSystemBlobSink::new(root.clone(), &config.container)))
        },
        SinkConfig::Postgres { .. } => {
            let pool = pool.context("postgres sink needs a database")?;
            info!(container = %config.container, "Using PostgreSQL sink");
            Ok(Arc::new(PostgresBlobSink::new(pool.clone(), config.container.clone())))
        },
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
