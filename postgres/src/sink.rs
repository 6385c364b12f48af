//! PostgreSQL blob sink.
//!
//! Records are rows of `stored_records` keyed by `(container, key)`. A write
//! is a single upsert, so a redelivered message stored under the same key
//! replaces its earlier copy.

use crate::error::sink_error;
use crate::schema::STORED_RECORDS;
use booking_relay_core::event_bus::BoxFuture;
use booking_relay_core::sink::{BlobSink, SinkError, StoredRecord};
use sqlx::PgPool;

/// Blob sink storing JSON records in PostgreSQL.
#[derive(Clone, Debug)]
pub struct PostgresBlobSink {
    pool: PgPool,
    container: String,
}

impl PostgresBlobSink {
    /// Sink writing into `container`.
    #[must_use]
    pub fn new(pool: PgPool, container: impl Into<String>) -> Self {
        Self {
            pool,
            container: container.into(),
        }
    }

    /// Container name.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Read a stored record back.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SinkError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT body FROM stored_records WHERE container = $1 AND key = $2")
                .bind(&self.container)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| sink_error(&e, key))?;
        Ok(row.map(|(body,)| body))
    }

    /// Keys stored in this container, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the query fails.
    pub async fn keys(&self) -> Result<Vec<String>, SinkError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM stored_records WHERE container = $1 ORDER BY key")
                .bind(&self.container)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| sink_error(&e, ""))?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

impl BlobSink for PostgresBlobSink {
    fn ensure_container(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            sqlx::query(STORED_RECORDS)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    SinkError::Configuration(format!(
                        "cannot prepare container {}: {e}",
                        self.container
                    ))
                })?;
            Ok(())
        })
    }

    fn put<'a>(&'a self, record: &'a StoredRecord) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let key = record.key.as_str();
            let body: serde_json::Value =
                serde_json::from_slice(&record.body).map_err(|e| SinkError::Rejected {
                    key: key.to_string(),
                    reason: format!("body is not JSON: {e}"),
                })?;

            sqlx::query(
                r"
                INSERT INTO stored_records (container, key, body, content_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (container, key)
                DO UPDATE SET body = EXCLUDED.body,
                              content_type = EXCLUDED.content_type,
                              stored_at = now()
                ",
            )
            .bind(&self.container)
            .bind(key)
            .bind(&body)
            .bind(record.content_type)
            .execute(&self.pool)
            .await
            .map_err(|e| sink_error(&e, key))?;

            tracing::debug!(container = %self.container, key, "Record written");
            Ok(())
        })
    }
}
