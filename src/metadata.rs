//! Writes metadata records next to the downloaded artifacts.
//!
//! Each [`CrawlerData`] record becomes `{blog_dir}/{filename}` holding the
//! post snapshot as pretty JSON. Records are overwritten, since a record only
//! reaches the queue when it is new or a rescan was forced.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::control::RunControl;
use crate::download::{is_disk_full, sanitize_filename};
use crate::progress::{NullProgress, ProgressEvent, ProgressSink};
use crate::queue::{CrawlerData, QueueReceiver};

/// Failures writing one record.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Writing the file failed.
    #[error("I/O error writing metadata {path}: {source}")]
    Io {
        /// Record path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The snapshot could not be serialized.
    #[error("JSON serialization error for {path}: {source}")]
    Serialize {
        /// Record path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl MetadataError {
    fn is_disk_full(&self) -> bool {
        matches!(self, Self::Io { source, .. } if is_disk_full(source))
    }
}

/// Counts of a finished writer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataSummary {
    pub written: usize,
    pub failed: usize,
}

/// Consumer of the metadata queue for one blog.
pub struct MetadataWriter {
    blog: String,
    blog_dir: PathBuf,
    control: RunControl,
    progress: Arc<dyn ProgressSink>,
}

impl MetadataWriter {
    #[must_use]
    pub fn new(blog: impl Into<String>, blog_dir: impl Into<PathBuf>, control: RunControl) -> Self {
        Self {
            blog: blog.into(),
            blog_dir: blog_dir.into(),
            control,
            progress: Arc::new(NullProgress),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Writes records until the queue is drained or the run is cancelled.
    ///
    /// Individual failures are logged and counted; a full disk stops every run.
    #[instrument(skip(self, records), fields(blog = %self.blog))]
    pub async fn run<P>(self, mut records: QueueReceiver<CrawlerData<P>>) -> MetadataSummary
    where
        P: Serialize + Send + 'static,
    {
        let mut summary = MetadataSummary::default();
        loop {
            let record = match records.receive(self.control.cancel_token()).await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "metadata writer cancelled");
                    break;
                }
            };
            let path = self.blog_dir.join(sanitize_filename(&record.filename));
            let result = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || write_record(&path, &record.post)).await
            };
            match result {
                Ok(Ok(())) => summary.written += 1,
                Ok(Err(e)) => {
                    summary.failed += 1;
                    if e.is_disk_full() {
                        error!(error = %e, "disk full, stopping all runs");
                        self.progress
                            .report(ProgressEvent::error(&self.blog, format!("Disk full: {e}")));
                        self.control.stop_all();
                        break;
                    }
                    warn!(error = %e, "metadata record not written");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(path = %path.display(), error = %e, "metadata write task failed");
                }
            }
        }
        debug!(written = summary.written, failed = summary.failed, "metadata writer finished");
        summary
    }
}

/// Writes one record; a partial file is removed on failure.
///
/// # Errors
///
/// Returns [`MetadataError`] on IO or serialization failure.
pub fn write_record<P: Serialize>(path: &Path, post: &P) -> Result<(), MetadataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| MetadataError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = fs::File::create(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let write_result = {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, post).and_then(|()| {
            std::io::Write::flush(&mut writer).map_err(serde_json::Error::io)
        })
    };
    if let Err(source) = write_result {
        let _ = fs::remove_file(path);
        if source.is_io() {
            return Err(MetadataError::Io {
                path: path.to_path_buf(),
                source: source.into(),
            });
        }
        return Err(MetadataError::Serialize {
            path: path.to_path_buf(),
            source,
        });
    }
    debug!(path = %path.display(), "metadata record written");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::queue::bounded;

    #[tokio::test]
    async fn test_writes_each_record_as_pretty_json() {
        let dir = TempDir::new().unwrap();
        let (queue, rx) = bounded("metadata", 8);
        queue
            .add(CrawlerData::new("tumblr_x.json", json!({"id": "1"})))
            .await
            .unwrap();
        queue
            .add(CrawlerData::new("2.json", json!({"id": "2"})))
            .await
            .unwrap();
        queue.complete_adding();

        let writer = MetadataWriter::new("b", dir.path(), RunControl::new());
        let summary = writer.run(rx).await;

        assert_eq!(summary.written, 2);
        let body = std::fs::read_to_string(dir.path().join("tumblr_x.json")).unwrap();
        assert!(body.contains("\n  \"id\": \"1\""));
        assert!(dir.path().join("2.json").exists());
    }

    #[tokio::test]
    async fn test_cancelled_writer_stops() {
        let dir = TempDir::new().unwrap();
        let (_queue, rx) = bounded::<CrawlerData<serde_json::Value>>("metadata", 8);
        let control = RunControl::new();
        control.cancel_run();

        let summary = MetadataWriter::new("b", dir.path(), control).run(rx).await;
        assert_eq!(summary, MetadataSummary::default());
    }

    #[test]
    fn test_write_record_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("a.json");
        write_record(&path, &json!({"a": 1})).unwrap();
        assert!(path.exists());
    }
}
