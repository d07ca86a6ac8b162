//! Append-only writers for per-kind text files.
//!
//! Text artifacts (quotes, links, rendered meta, URL lists) are appended to one
//! file per kind. Every path gets a single buffered writer that lives for the
//! whole run; the map is guarded by one async lock so concurrent item tasks
//! never interleave partial lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::error::DownloadError;

/// Shared set of open text files.
#[derive(Debug, Default)]
pub struct TextSink {
    writers: Mutex<HashMap<PathBuf, BufWriter<File>>>,
}

impl TextSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `line` plus a newline to `path`, opening the file on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the file cannot be opened or written.
    pub async fn append(&self, path: &Path, line: &str) -> Result<(), DownloadError> {
        let mut writers = self.writers.lock().await;
        if !writers.contains_key(path) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DownloadError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            debug!(path = %path.display(), "opened text file");
            writers.insert(path.to_path_buf(), BufWriter::new(file));
        }
        let Some(writer) = writers.get_mut(path) else {
            return Ok(());
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        Ok(())
    }

    /// Number of files currently open.
    pub async fn open_files(&self) -> usize {
        self.writers.lock().await.len()
    }

    /// Flushes and closes every writer. Failures are logged.
    #[instrument(skip(self))]
    pub async fn close_all(&self) {
        let mut writers = self.writers.lock().await;
        for (path, mut writer) in writers.drain() {
            if let Err(e) = writer.shutdown().await {
                warn!(path = %path.display(), error = %e, "failed to flush text file");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_append_creates_and_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blog").join("quotes.txt");
        let sink = TextSink::new();

        sink.append(&path, "first").await.unwrap();
        sink.append(&path, "second").await.unwrap();
        assert_eq!(sink.open_files().await, 1);
        sink.close_all().await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
        assert_eq!(sink.open_files().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_lines_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("texts.txt");
        let sink = Arc::new(TextSink::new());

        let mut handles = Vec::new();
        for i in 0..20 {
            let sink = Arc::clone(&sink);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                sink.append(&path, &format!("line-{i:02}-{}", "x".repeat(200)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        sink.close_all().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 20);
        assert!(lines.iter().all(|l| l.starts_with("line-") && l.len() == 208));
    }

    #[tokio::test]
    async fn test_append_into_missing_root_fails_with_io() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let sink = TextSink::new();

        let err = sink
            .append(&blocker.join("nested.txt"), "line")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Io { .. }));
    }
}
