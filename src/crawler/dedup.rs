//! Per-run ledger of metadata records and media URLs already handled.
//!
//! Metadata records are keyed by file name. The set is seeded from the
//! `*.json` files already in the blog directory, so a re-crawl does not write
//! the same record twice. The membership check and the enqueue happen under
//! one lock: two posts that map to the same record name enqueue it once.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::blog::Blog;
use crate::queue::{CrawlerData, MetadataQueue, QueueError};

#[derive(Debug, Default)]
pub struct DedupLedger {
    enabled: bool,
    force_rescan: bool,
    records: Mutex<HashSet<String>>,
    media: StdMutex<HashSet<String>>,
}

impl DedupLedger {
    /// `enabled == false` drops every record; `force_rescan` bypasses membership.
    #[must_use]
    pub fn new(enabled: bool, force_rescan: bool) -> Self {
        Self {
            enabled,
            force_rescan,
            ..Self::default()
        }
    }

    /// Ledger configured from `dump_crawler_data` and `force_rescan`.
    #[must_use]
    pub fn from_blog(blog: &Blog) -> Self {
        Self::new(blog.dump_crawler_data, blog.force_rescan)
    }

    /// Whether metadata records are written at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Adds the `*.json` file names found in `dir`; a missing directory adds nothing.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the directory exists but cannot be listed.
    #[instrument(skip(self, dir), fields(dir = %dir.display()))]
    pub async fn seed_from_dir(&self, dir: &Path) -> std::io::Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut records = self.records.lock().await;
        let before = records.len();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Path::new(&name)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            {
                records.insert(name);
            }
        }
        let added = records.len() - before;
        debug!(added, "seeded metadata ledger");
        Ok(added)
    }

    /// Enqueues `record` unless its file name was already seen.
    ///
    /// Returns whether the record was enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the queue no longer accepts items.
    pub async fn offer<P>(
        &self,
        record: CrawlerData<P>,
        queue: &MetadataQueue<P>,
    ) -> Result<bool, QueueError> {
        if !self.enabled {
            return Ok(false);
        }
        let mut records = self.records.lock().await;
        if !self.force_rescan && records.contains(&record.filename) {
            return Ok(false);
        }
        let filename = record.filename.clone();
        queue.add(record).await?;
        records.insert(filename);
        Ok(true)
    }

    /// Whether a record name is known.
    pub async fn contains(&self, filename: &str) -> bool {
        self.records.lock().await.contains(filename)
    }

    /// Notes a media URL; false when it was already seen this run.
    pub fn record_media(&self, url: &str) -> bool {
        self.media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string())
    }
}
