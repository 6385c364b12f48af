//! `PostgreSQL` topic backend for the booking event relay.
//!
//! Provides a topic/subscription transport and a blob sink on top of sqlx:
//!
//! - [`PostgresPublisher`]: fans each envelope out to every subscription of
//!   its topic
//! - [`PostgresSubscription`]: [`MessageBroker`](booking_relay_core::event_bus::MessageBroker)
//!   with lease-locked receive (`FOR UPDATE SKIP LOCKED`), so several relay
//!   instances can share one subscription
//! - [`DeadLetterQueue`]: inspect, resolve, discard and resubmit dead letters
//! - [`PostgresBlobSink`]: records as JSONB rows with upsert semantics
//!
//! Run [`migrate`] once at startup to create the tables.
//!
//! # Example
//!
//! ```no_run
//! use booking_relay_postgres::{PostgresPublisher, PostgresSubscription, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/relay").await?;
//! migrate(&pool).await?;
//!
//! let publisher = PostgresPublisher::new(pool.clone(), "booking-events");
//! let subscription = PostgresSubscription::new(pool, "booking-events", "relay");
//! # Ok(())
//! # }
//! ```

mod error;

pub mod dead_letter_queue;
pub mod publisher;
pub mod schema;
pub mod sink;
pub mod subscription;

pub use dead_letter_queue::{
    DeadLetterQueue, DeadLetterQueueError, DeadLetterStatus, DeadLetteredMessage,
};
pub use publisher::PostgresPublisher;
pub use schema::migrate;
pub use sink::PostgresBlobSink;
pub use subscription::PostgresSubscription;
