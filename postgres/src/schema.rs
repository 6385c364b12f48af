//! Database schema for the topic backend, the dead-letter queue and the sink.
//!
//! Every statement is idempotent; [`migrate`] can run on every startup.

use sqlx::PgPool;

/// DDL applied by [`migrate`], in order.
pub const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS relay_subscriptions (
        topic TEXT NOT NULL,
        subscription TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (topic, subscription)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS relay_messages (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        subscription TEXT NOT NULL,
        body BYTEA NOT NULL,
        content_type TEXT,
        subject TEXT,
        correlation_id TEXT,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        delivery_count INTEGER NOT NULL DEFAULT 0,
        locked_until TIMESTAMPTZ,
        lock_token UUID,
        UNIQUE (topic, subscription, message_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_relay_messages_queue
        ON relay_messages (topic, subscription, id)
    ",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        subscription TEXT NOT NULL,
        body BYTEA NOT NULL,
        content_type TEXT,
        subject TEXT,
        correlation_id TEXT,
        enqueued_at TIMESTAMPTZ NOT NULL,
        delivery_count INTEGER NOT NULL,
        reason TEXT NOT NULL,
        description TEXT NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        status TEXT NOT NULL DEFAULT 'pending',
        resolved_at TIMESTAMPTZ,
        resolved_by TEXT,
        resolution_notes TEXT
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_dead_letters_status
        ON dead_letters (status, dead_lettered_at)
    ",
    STORED_RECORDS,
];

/// Sink table; also applied by the sink's `ensure_container`.
pub(crate) const STORED_RECORDS: &str = r"
    CREATE TABLE IF NOT EXISTS stored_records (
        container TEXT NOT NULL,
        key TEXT NOT NULL,
        body JSONB NOT NULL,
        content_type TEXT NOT NULL,
        stored_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (container, key)
    )
    ";

/// Create all tables and indexes if missing.
///
/// # Errors
///
/// Returns the first failing statement's error.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = MIGRATIONS.len(), "Relay schema migrated");
    Ok(())
}
