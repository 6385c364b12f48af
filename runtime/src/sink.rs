//! Filesystem blob sink.
//!
//! Records live under `<root>/<container>/<key>`. A write goes to a temporary
//! file in the target directory, is fsynced, then renamed over the final
//! name, so readers never observe a partial record and a rewrite under the
//! same key replaces the old record atomically.

use booking_relay_core::event_bus::BoxFuture;
use booking_relay_core::sink::{BlobSink, SinkError, StoredRecord, sanitize_segment};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Blob sink on a local or mounted filesystem.
#[derive(Clone, Debug)]
pub struct FileSystemBlobSink {
    container: PathBuf,
}

impl FileSystemBlobSink {
    /// Sink writing into `root/container`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            container: root.into().join(sanitize_segment(container)),
        }
    }

    /// Directory holding the records.
    #[must_use]
    pub fn container_path(&self) -> &Path {
        &self.container
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SinkError> {
        let mut path = self.container.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(SinkError::Rejected {
                    key: key.to_string(),
                    reason: "key segments must be non-empty and not relative".to_string(),
                });
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn write_atomically(&self, path: &Path, body: &[u8]) -> io::Result<()> {
        let dir = path.parent().unwrap_or(&self.container);
        fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(body).await?;
            file.sync_all().await?;
            fs::rename(&tmp, path).await
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        written
    }
}

impl BlobSink for FileSystemBlobSink {
    fn ensure_container(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            fs::create_dir_all(&self.container).await.map_err(|e| {
                SinkError::Configuration(format!(
                    "cannot create container {}: {e}",
                    self.container.display()
                ))
            })
        })
    }

    fn put<'a>(&'a self, record: &'a StoredRecord) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let path = self.path_for(record.key.as_str())?;
            self.write_atomically(&path, &record.body)
                .await
                .map_err(|e| SinkError::Io(format!("{}: {e}", path.display())))?;
            debug!(key = %record.key, path = %path.display(), "Record written");
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use booking_relay_core::sink::RecordKey;

    fn record(key: &str, body: &str) -> StoredRecord {
        StoredRecord {
            key: RecordKey::new(key),
            body: body.as_bytes().to_vec(),
            content_type: "application/json",
        }
    }

    #[tokio::test]
    async fn writes_under_container_and_overwrites() {
        let root = tempfile::tempdir().expect("tempdir");
        let sink = FileSystemBlobSink::new(root.path(), "booking-events");
        sink.ensure_container().await.expect("container");

        let key = "bookings/BookingCreated/2026/01/01/m-1.json";
        sink.put(&record(key, r#"{"v":1}"#)).await.expect("first");
        sink.put(&record(key, r#"{"v":2}"#)).await.expect("second");

        let path = root.path().join("booking-events").join(key);
        assert_eq!(std::fs::read_to_string(path).expect("read"), r#"{"v":2}"#);

        let dir = root
            .path()
            .join("booking-events/bookings/BookingCreated/2026/01/01");
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .expect("dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn relative_segments_are_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let sink = FileSystemBlobSink::new(root.path(), "c");

        let err = sink
            .put(&record("bookings/../escape.json", "{}"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, SinkError::Rejected { .. }));
    }

    #[tokio::test]
    async fn unusable_root_is_a_configuration_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let file = root.path().join("not-a-dir");
        std::fs::write(&file, b"x").expect("file");

        let sink = FileSystemBlobSink::new(&file, "c");
        let err = sink.ensure_container().await.expect_err("cannot create");
        assert!(matches!(err, SinkError::Configuration(_)));
    }
}
