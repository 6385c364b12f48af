//! In-memory blob sink with fault injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::call_log::{Call, CallLog};
use booking_relay_core::event_bus::BoxFuture;
use booking_relay_core::sink::{BlobSink, SinkError, StoredRecord};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<String, Vec<u8>>,
    writes: usize,
    failures: VecDeque<SinkError>,
    ensure_failure: Option<SinkError>,
    container_ready: bool,
}

/// Blob sink keeping records in memory.
///
/// Clones share the same store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBlobSink {
    state: Arc<Mutex<State>>,
    delay: Option<Duration>,
    log: Option<CallLog>,
}

impl InMemoryBlobSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record writes into `log`.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Sleep this long before each write completes.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next writes, one error per write.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SinkError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    /// Make `ensure_container` fail with `error`.
    pub fn fail_ensure_with(&self, error: SinkError) {
        self.state.lock().unwrap().ensure_failure = Some(error);
    }

    /// Body stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().records.get(key).cloned()
    }

    /// Body stored under `key`, parsed as JSON.
    #[must_use]
    pub fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        self.get(key)
            .and_then(|body| serde_json::from_slice(&body).ok())
    }

    /// Stored keys in lexical order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().records.keys().cloned().collect()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    /// Whether nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful writes, counting overwrites.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Whether `ensure_container` succeeded.
    #[must_use]
    pub fn container_ready(&self) -> bool {
        self.state.lock().unwrap().container_ready
    }

    fn record(&self, call: Call) {
        if let Some(log) = &self.log {
            log.record(call);
        }
    }
}

impl BlobSink for InMemoryBlobSink {
    fn ensure_container(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.ensure_failure.take() {
                return Err(error);
            }
            state.container_ready = true;
            Ok(())
        })
    }

    fn put<'a>(&'a self, record: &'a StoredRecord) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let key = record.key.as_str().to_string();
            let failure = self.state.lock().unwrap().failures.pop_front();
            if let Some(error) = failure {
                self.record(Call::SinkWriteFailed(key));
                return Err(error);
            }
            {
                let mut state = self.state.lock().unwrap();
                state.records.insert(key.clone(), record.body.clone());
                state.writes += 1;
            }
            self.record(Call::SinkWrite(key));
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use booking_relay_core::sink::RecordKey;

    fn record(key: &str) -> StoredRecord {
        StoredRecord {
            key: RecordKey::new(key),
            body: br#"{"ok":true}"#.to_vec(),
            content_type: "application/json",
        }
    }

    #[tokio::test]
    async fn overwrite_keeps_one_key() {
        let sink = InMemoryBlobSink::new();
        sink.put(&record("a.json")).await.expect("put");
        sink.put(&record("a.json")).await.expect("put");

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.write_count(), 2);
        assert_eq!(sink.get_json("a.json").expect("stored")["ok"], true);
    }

    #[tokio::test]
    async fn injected_failure_stores_nothing() {
        let log = CallLog::new();
        let sink = InMemoryBlobSink::new().with_log(log.clone());
        sink.fail_next([SinkError::Io("disk".into())]);

        assert!(sink.put(&record("a.json")).await.is_err());
        assert!(sink.is_empty());
        assert_eq!(log.calls(), vec![Call::SinkWriteFailed("a.json".into())]);

        sink.put(&record("a.json")).await.expect("second put");
        assert_eq!(sink.len(), 1);
    }
}
