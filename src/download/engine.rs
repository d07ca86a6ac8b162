//! Concurrent consumer of the post queue.
//!
//! The [`Downloader`] drains a [`PostQueue`](crate::queue::PostQueue) for one
//! blog. Each item runs in its own task holding a general permit and, for
//! videos, a video permit acquired first. Items already known to the
//! [`FileDatabase`] are skipped; everything else is fetched through an
//! [`ArtifactWriter`] or appended to a text file through the [`TextSink`].
//!
//! # Failure model
//!
//! - HTTP 400-599 (after retries for 408/429/5xx): partial file removed, soft failure
//! - disk full: reported, global stop fired, run aborted with [`EngineError::DiskFull`]
//! - file locked by another process: treated as success
//! - cancellation: silent unwind, `drained` is false

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::ArtifactWriter;
use super::constants::FILE_DB_SAVE_INTERVAL;
use super::error::DownloadError;
use super::filename::is_default_template;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::text_sink::TextSink;
use crate::blog::{Blog, BlogStats};
use crate::control::RunControl;
use crate::file_db::{FileDatabase, FileDbError};
use crate::progress::{NullProgress, ProgressEvent, ProgressSink};
use crate::queue::{DownloadItem, ItemPayload, QueueError, QueueReceiver};

/// Default total connections shared by all active blogs.
pub const DEFAULT_CONCURRENT_CONNECTIONS: usize = 32;

/// Default total video connections shared by all active blogs.
pub const DEFAULT_CONCURRENT_VIDEO_CONNECTIONS: usize = 4;

/// Error type for downloader runs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The target volume ran out of space; every run was stopped.
    #[error("disk full while writing {path}")]
    DiskFull {
        /// File that could not be written.
        path: String,
    },

    /// The final file database flush failed.
    #[error(transparent)]
    FileDatabase(#[from] FileDbError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Connection limits and timing for one downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Total connections across all active blogs.
    pub concurrent_connections: usize,
    /// Total video connections across all active blogs.
    pub concurrent_video_connections: usize,
    /// Blogs downloading at the same time.
    pub active_blogs: usize,
    /// Retry policy for transient fetch failures.
    pub retry_policy: RetryPolicy,
    /// File database flush period.
    pub save_interval: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrent_connections: DEFAULT_CONCURRENT_CONNECTIONS,
            concurrent_video_connections: DEFAULT_CONCURRENT_VIDEO_CONNECTIONS,
            active_blogs: 1,
            retry_policy: RetryPolicy::default(),
            save_interval: FILE_DB_SAVE_INTERVAL,
        }
    }
}

/// Splits a global connection budget across active blogs, never below one.
#[must_use]
pub fn permits_per_blog(total: usize, active_blogs: usize) -> usize {
    (total / active_blogs.max(1)).max(1)
}

/// Counters for one downloader run.
#[derive(Debug, Default)]
pub struct DownloadStats {
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl DownloadStats {
    /// Items written to disk (or listed in URL-list mode).
    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Items found already present.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Items that failed softly.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts made.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }
}

/// Result of a downloader run that was not aborted.
#[derive(Debug)]
pub struct DownloadSummary {
    /// True when the queue was closed and fully drained without cancellation.
    pub drained: bool,
    /// Per-outcome counters.
    pub stats: DownloadStats,
}

enum ItemOutcome {
    Downloaded,
    Skipped,
    Failed,
    Cancelled,
    DiskFull(DownloadError),
}

struct Shared {
    blog: Arc<Blog>,
    blog_dir: PathBuf,
    writer: Arc<dyn ArtifactWriter>,
    files: Arc<FileDatabase>,
    blog_stats: Arc<BlogStats>,
    text_sink: Arc<TextSink>,
    progress: Arc<dyn ProgressSink>,
    control: RunControl,
    retry_policy: RetryPolicy,
    run_stats: DownloadStats,
    disk_full: OnceLock<String>,
    present_files: OnceCell<HashSet<String>>,
}

/// Queue consumer for one blog.
pub struct Downloader {
    blog: Arc<Blog>,
    blog_dir: PathBuf,
    writer: Arc<dyn ArtifactWriter>,
    files: Arc<FileDatabase>,
    blog_stats: Arc<BlogStats>,
    text_sink: Arc<TextSink>,
    progress: Arc<dyn ProgressSink>,
    control: RunControl,
    retry_policy: RetryPolicy,
    general: Arc<Semaphore>,
    video: Arc<Semaphore>,
    save_interval: Duration,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("blog", &self.blog.name)
            .field("blog_dir", &self.blog_dir)
            .field("general_permits", &self.general.available_permits())
            .field("video_permits", &self.video.available_permits())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Creates a downloader writing into `blog_dir`.
    #[must_use]
    pub fn new(
        blog: Arc<Blog>,
        blog_dir: PathBuf,
        writer: Arc<dyn ArtifactWriter>,
        files: Arc<FileDatabase>,
        blog_stats: Arc<BlogStats>,
        control: RunControl,
        config: &DownloaderConfig,
    ) -> Self {
        let general = permits_per_blog(config.concurrent_connections, config.active_blogs);
        let video = permits_per_blog(config.concurrent_video_connections, config.active_blogs);
        debug!(
            blog = %blog.name,
            general,
            video,
            max_retries = config.retry_policy.max_attempts(),
            "creating downloader"
        );
        Self {
            blog,
            blog_dir,
            writer,
            files,
            blog_stats,
            text_sink: Arc::new(TextSink::new()),
            progress: Arc::new(NullProgress),
            control,
            retry_policy: config.retry_policy.clone(),
            general: Arc::new(Semaphore::new(general)),
            video: Arc::new(Semaphore::new(video)),
            save_interval: config.save_interval,
        }
    }

    /// Routes user-visible events to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Uses an externally owned text sink.
    #[must_use]
    pub fn with_text_sink(mut self, text_sink: Arc<TextSink>) -> Self {
        self.text_sink = text_sink;
        self
    }

    /// Drains `items` until the queue is closed, the run is cancelled or the
    /// disk fills up.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DiskFull`] when the run was aborted for lack of
    /// space, and [`EngineError::FileDatabase`] when the final flush fails.
    #[instrument(skip(self, items), fields(blog = %self.blog.name))]
    pub async fn run(
        self,
        mut items: QueueReceiver<DownloadItem>,
    ) -> Result<DownloadSummary, EngineError> {
        let Self {
            blog,
            blog_dir,
            writer,
            files,
            blog_stats,
            text_sink,
            progress,
            control,
            retry_policy,
            general,
            video,
            save_interval,
        } = self;
        let cancel = control.cancel_token().clone();
        let shared = Arc::new(Shared {
            blog,
            blog_dir,
            writer,
            files,
            blog_stats,
            text_sink,
            progress,
            control,
            retry_policy,
            run_stats: DownloadStats::default(),
            disk_full: OnceLock::new(),
            present_files: OnceCell::new(),
        });
        let (saver, stop_saver) = spawn_periodic_save(Arc::clone(&shared.files), save_interval, {
            let shared = Arc::clone(&shared);
            move || shared.report_progress()
        });
        let mut tasks = JoinSet::new();
        let mut drained = false;

        info!("downloader started");

        loop {
            let item = match items.receive(&cancel).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    drained = true;
                    break;
                }
                Err(QueueError::Cancelled { .. } | QueueError::Completed { .. }) => break,
            };

            let video_permit = if item.kind.is_video() {
                match acquire(&video, &cancel).await? {
                    Some(permit) => Some(permit),
                    None => break,
                }
            } else {
                None
            };
            let Some(general_permit) = acquire(&general, &cancel).await? else {
                break;
            };
            if !shared.control.checkpoint().await {
                break;
            }

            let shared = Arc::clone(&shared);
            tasks.spawn(async move {
                let _permits = (video_permit, general_permit);
                let outcome = shared.process(&item).await;
                shared.record(&item, outcome);
            });

            while let Some(result) = tasks.try_join_next() {
                log_join_error(result);
            }
        }

        debug!(pending = tasks.len(), "waiting for item tasks");
        while let Some(result) = tasks.join_next().await {
            log_join_error(result);
        }

        stop_saver.cancel();
        if let Err(e) = saver.await {
            warn!(error = %e, "file database save task panicked");
        }
        shared.text_sink.close_all().await;
        shared.report_progress();
        let save_result = shared.files.save().await;

        if let Some(path) = shared.disk_full.get() {
            return Err(EngineError::DiskFull { path: path.clone() });
        }
        save_result?;

        let drained = drained && !cancel.is_cancelled();
        let stats = shared.run_stats_snapshot();
        info!(
            drained,
            downloaded = stats.downloaded(),
            skipped = stats.skipped(),
            failed = stats.failed(),
            retried = stats.retried(),
            "downloader finished"
        );
        Ok(DownloadSummary { drained, stats })
    }
}

impl Shared {
    /// Reports the download count when it moved since the last report.
    fn report_progress(&self) {
        if !self.blog_stats.take_progress_changed() {
            return;
        }
        self.progress.report(ProgressEvent::status(
            &self.blog.name,
            format!(
                "{} of {} downloaded",
                self.blog_stats.total_downloaded(),
                self.blog_stats.unique_count()
            ),
        ));
    }

    fn run_stats_snapshot(&self) -> DownloadStats {
        let stats = DownloadStats::default();
        stats
            .downloaded
            .store(self.run_stats.downloaded(), Ordering::SeqCst);
        stats.skipped.store(self.run_stats.skipped(), Ordering::SeqCst);
        stats.failed.store(self.run_stats.failed(), Ordering::SeqCst);
        stats.retried.store(self.run_stats.retried(), Ordering::SeqCst);
        stats
    }

    async fn process(&self, item: &DownloadItem) -> ItemOutcome {
        match &item.payload {
            ItemPayload::Remote { url, .. } => self.process_binary(item, url).await,
            ItemPayload::Text { body } => self.process_text(item, body).await,
        }
    }

    fn record(&self, item: &DownloadItem, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Downloaded => {
                self.run_stats.downloaded.fetch_add(1, Ordering::SeqCst);
                self.blog_stats.record_downloaded(item.kind);
            }
            ItemOutcome::Skipped => {
                self.run_stats.skipped.fetch_add(1, Ordering::SeqCst);
                self.progress.report(ProgressEvent::Skipped {
                    blog: self.blog.name.clone(),
                    file: item.filename.clone(),
                });
            }
            ItemOutcome::Failed => {
                self.run_stats.failed.fetch_add(1, Ordering::SeqCst);
            }
            ItemOutcome::Cancelled => {}
            ItemOutcome::DiskFull(error) => {
                let path = match &error {
                    DownloadError::Io { path, .. } => path.display().to_string(),
                    other => other.to_string(),
                };
                if self.disk_full.set(path).is_ok() {
                    warn!(error = %error, "disk full, stopping all downloads");
                    self.progress.report(ProgressEvent::error(
                        &self.blog.name,
                        "Not enough disk space, all downloads stopped",
                    ));
                    self.control.stop_all();
                }
            }
        }
    }

    #[instrument(skip(self, item), fields(kind = %item.kind, file = %item.filename))]
    async fn process_binary(&self, item: &DownloadItem, url: &str) -> ItemOutcome {
        let url_name = item.filename_url().unwrap_or_default();
        let original_name = item.filename_original_url();

        let known_by_original = original_name
            .as_deref()
            .is_some_and(|original| self.files.contains(original, true));
        if known_by_original || self.files.contains(&url_name, false) {
            if !known_by_original {
                if let Some(original) = original_name.as_deref() {
                    self.files.update_original_link(&url_name, original);
                }
            }
            debug!("already downloaded");
            return ItemOutcome::Skipped;
        }

        if self.blog.check_directory_for_files {
            if self.blog_dir.join(&url_name).exists() || self.blog_dir.join(&item.filename).exists()
            {
                self.files
                    .add(&url_name, original_name.as_deref(), &item.filename);
                return ItemOutcome::Skipped;
            }
        } else if self.link_restored(&url_name).await {
            self.files
                .add(&url_name, original_name.as_deref(), &item.filename);
            return ItemOutcome::Skipped;
        }

        self.progress.report(ProgressEvent::Downloading {
            blog: self.blog.name.clone(),
            file: item.filename.clone(),
        });

        if self.blog.download_url_list {
            let list = self.blog_dir.join(item.kind.text_file_name());
            return match self.text_sink.append(&list, url).await {
                Ok(()) => {
                    self.files
                        .add(&url_name, original_name.as_deref(), &item.filename);
                    ItemOutcome::Downloaded
                }
                Err(e) => self.io_failure(e),
            };
        }

        let path = self.blog_dir.join(&item.filename);
        match self.fetch_with_retry(url, &path).await {
            Ok(bytes) => {
                debug!(bytes, "artifact written");
                set_file_date(&path, item.timestamp).await;
                self.files
                    .add(&url_name, original_name.as_deref(), &item.filename);
                ItemOutcome::Downloaded
            }
            Err(e) if e.is_file_locked() => {
                debug!(error = %e, "file in use by another process, treating as done");
                self.files
                    .add(&url_name, original_name.as_deref(), &item.filename);
                ItemOutcome::Downloaded
            }
            Err(e) if e.is_disk_full() => ItemOutcome::DiskFull(e),
            Err(DownloadError::Cancelled { .. }) => ItemOutcome::Cancelled,
            Err(e) => {
                if e.is_http_error() {
                    remove_partial(&path).await;
                }
                warn!(url, error = %e, "download failed");
                self.progress.report(ProgressEvent::error(
                    &self.blog.name,
                    format!("Error downloading {}: {e}", item.filename),
                ));
                ItemOutcome::Failed
            }
        }
    }

    async fn process_text(&self, item: &DownloadItem, body: &str) -> ItemOutcome {
        let file_name = item.kind.text_file_name();
        if !self.files.claim(&item.post_id, file_name) {
            return ItemOutcome::Skipped;
        }
        let path = self.blog_dir.join(file_name);
        match self.text_sink.append(&path, body).await {
            Ok(()) => {
                self.files.add(&item.post_id, None, file_name);
                ItemOutcome::Downloaded
            }
            Err(e) => {
                self.files.release(&item.post_id);
                self.io_failure(e)
            }
        }
    }

    fn io_failure(&self, error: DownloadError) -> ItemOutcome {
        if error.is_disk_full() {
            return ItemOutcome::DiskFull(error);
        }
        warn!(error = %error, "writing text artifact failed");
        self.progress
            .report(ProgressEvent::error(&self.blog.name, error.to_string()));
        ItemOutcome::Failed
    }

    /// Force-rescan repair: a `%f` file already in the blog directory under
    /// its URL name counts as downloaded.
    async fn link_restored(&self, url_name: &str) -> bool {
        if !self.blog.force_rescan || !is_default_template(&self.blog.filename_template) {
            return false;
        }
        let present = self
            .present_files
            .get_or_init(|| scan_directory(&self.blog_dir))
            .await;
        present.contains(&url_name.to_lowercase())
    }

    async fn fetch_with_retry(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let cancel = self.control.cancel_token();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.writer.fetch_to_path(url, path, cancel).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };
            let failure = classify_error(&error);
            if failure == FailureType::DiskFull || failure == FailureType::Cancelled {
                return Err(error);
            }
            match self.retry_policy.should_retry(failure, attempt) {
                RetryDecision::Retry { delay, attempt: next } => {
                    debug!(url, attempt = next, delay_ms = delay.as_millis(), error = %error, "retrying download");
                    self.run_stats.retried.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, %reason, "not retrying download");
                    return Err(error);
                }
            }
        }
    }
}

async fn acquire(
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(None),
        permit = Arc::clone(semaphore).acquire_owned() => {
            permit.map(Some).map_err(|_| EngineError::SemaphoreClosed)
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        warn!(error = %e, "download task panicked");
    }
}

/// Flushes a dirty ledger and runs `on_tick` every `interval`.
fn spawn_periodic_save(
    files: Arc<FileDatabase>,
    interval: Duration,
    on_tick: impl Fn() + Send + 'static,
) -> (JoinHandle<()>, CancellationToken) {
    let stop = CancellationToken::new();
    let handle = tokio::spawn({
        let stop = stop.clone();
        async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        on_tick();
                        if files.is_dirty() {
                            if let Err(e) = files.save().await {
                                warn!(error = %e, "periodic file database save failed");
                            }
                        }
                    }
                }
            }
        }
    });
    (handle, stop)
}

/// Lower-cased names of the non-metadata files directly inside `dir`.
async fn scan_directory(dir: &Path) -> HashSet<String> {
    let mut names = HashSet::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.ends_with(".json") {
            names.insert(name);
        }
    }
    debug!(dir = %dir.display(), files = names.len(), "scanned blog directory");
    names
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
    }
}

/// Sets the file's modification time to the post date.
async fn set_file_date(path: &Path, timestamp: i64) {
    let Ok(secs) = u64::try_from(timestamp) else {
        return;
    };
    if secs == 0 {
        return;
    }
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(modified))
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "could not set file date"),
        Err(e) => debug!(error = %e, "file date task failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::queue::{ArtifactKind, bounded};

    #[derive(Default)]
    struct FakeWriter {
        calls: Mutex<Vec<String>>,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl ArtifactWriter for FakeWriter {
        async fn fetch_to_path(
            &self,
            url: &str,
            path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<u64, DownloadError> {
            self.calls.lock().unwrap().push(url.to_string());
            if let Some(status) = self.fail_with {
                tokio::fs::write(path, b"partial").await.unwrap();
                return Err(DownloadError::http_status(url, status));
            }
            tokio::fs::write(path, b"data").await.unwrap();
            Ok(4)
        }
    }

    fn downloader(
        blog: Blog,
        dir: &Path,
        writer: Arc<FakeWriter>,
        files: Arc<FileDatabase>,
    ) -> (Downloader, Arc<BlogStats>) {
        let stats = Arc::new(BlogStats::new());
        let config = DownloaderConfig {
            retry_policy: RetryPolicy::none(),
            ..DownloaderConfig::default()
        };
        let downloader = Downloader::new(
            Arc::new(blog),
            dir.to_path_buf(),
            writer,
            files,
            Arc::clone(&stats),
            RunControl::new(),
            &config,
        );
        (downloader, stats)
    }

    fn photo(name: &str) -> DownloadItem {
        DownloadItem::binary(
            ArtifactKind::Photo,
            format!("https://media.example/{name}"),
            None,
            "1",
            1_600_000_000,
            name,
        )
    }

    // ==================== Permit Tests ====================

    #[test]
    fn test_permits_per_blog_never_zero() {
        assert_eq!(permits_per_blog(32, 1), 32);
        assert_eq!(permits_per_blog(32, 3), 10);
        assert_eq!(permits_per_blog(2, 5), 1);
        assert_eq!(permits_per_blog(4, 0), 4);
    }

    // ==================== Binary Item Tests ====================

    #[tokio::test]
    async fn test_downloads_and_records_binary_item() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        let (downloader, stats) =
            downloader(Blog::new("b"), dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue.add(photo("a.jpg")).await.unwrap();
        queue.complete_adding();

        let summary = downloader.run(rx).await.unwrap();
        assert!(summary.drained);
        assert_eq!(summary.stats.downloaded(), 1);
        assert_eq!(stats.downloaded(ArtifactKind::Photo), 1);
        assert!(files.contains("a.jpg", false));
        assert!(dir.path().join("a.jpg").exists());
    }

    #[tokio::test]
    async fn test_known_file_is_skipped_without_fetch() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        files.add("a.jpg", None, "a.jpg");
        let (downloader, _) =
            downloader(Blog::new("b"), dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue.add(photo("a.jpg")).await.unwrap();
        queue.complete_adding();

        let summary = downloader.run(rx).await.unwrap();
        assert_eq!(summary.stats.skipped(), 1);
        assert!(writer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hit_by_filename_repairs_original_link() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        files.add("a_1280.jpg", None, "a_1280.jpg");
        let (downloader, _) =
            downloader(Blog::new("b"), dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let item = DownloadItem::binary(
            ArtifactKind::Photo,
            "https://media.example/a_1280.jpg",
            Some("https://media.example/a_raw.jpg".to_string()),
            "1",
            0,
            "a_1280.jpg",
        );
        let (queue, rx) = bounded("posts", 8);
        queue.add(item).await.unwrap();
        queue.complete_adding();

        downloader.run(rx).await.unwrap();
        assert!(files.contains("a_raw.jpg", true));
        assert!(writer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_file_on_disk_counts_when_checking_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"old").unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        let mut blog = Blog::new("b");
        blog.check_directory_for_files = true;
        let (downloader, _) = downloader(blog, dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue.add(photo("a.jpg")).await.unwrap();
        queue.complete_adding();

        let summary = downloader.run(rx).await.unwrap();
        assert_eq!(summary.stats.skipped(), 1);
        assert!(files.contains("a.jpg", false));
        assert!(writer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_rescan_restores_link_case_insensitively() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("A.JPG"), b"old").unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        let mut blog = Blog::new("b");
        blog.force_rescan = true;
        let (downloader, _) = downloader(blog, dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue.add(photo("a.jpg")).await.unwrap();
        queue.complete_adding();

        downloader.run(rx).await.unwrap();
        assert!(files.contains("a.jpg", false));
        assert!(writer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_error_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter {
            fail_with: Some(404),
            ..FakeWriter::default()
        });
        let files = Arc::new(FileDatabase::in_memory());
        let (downloader, _) =
            downloader(Blog::new("b"), dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue.add(photo("gone.jpg")).await.unwrap();
        queue.complete_adding();

        let summary = downloader.run(rx).await.unwrap();
        assert!(summary.drained);
        assert_eq!(summary.stats.failed(), 1);
        assert!(!dir.path().join("gone.jpg").exists());
        assert!(!files.contains("gone.jpg", false));
    }

    #[tokio::test]
    async fn test_url_list_mode_appends_instead_of_fetching() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        let mut blog = Blog::new("b");
        blog.download_url_list = true;
        let (downloader, _) = downloader(blog, dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue.add(photo("a.jpg")).await.unwrap();
        queue.complete_adding();

        downloader.run(rx).await.unwrap();
        let list = std::fs::read_to_string(dir.path().join("images.txt")).unwrap();
        assert_eq!(list, "https://media.example/a.jpg\n");
        assert!(writer.calls.lock().unwrap().is_empty());
    }

    // ==================== Text Item Tests ====================

    #[tokio::test]
    async fn test_text_item_appended_once_per_post() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        let (downloader, stats) =
            downloader(Blog::new("b"), dir.path(), Arc::clone(&writer), Arc::clone(&files));

        let (queue, rx) = bounded("posts", 8);
        queue
            .add(DownloadItem::text(ArtifactKind::Quote, "to be", "7", 0))
            .await
            .unwrap();
        queue
            .add(DownloadItem::text(ArtifactKind::Quote, "to be", "7", 0))
            .await
            .unwrap();
        queue.complete_adding();

        downloader.run(rx).await.unwrap();
        let quotes = std::fs::read_to_string(dir.path().join("quotes.txt")).unwrap();
        assert_eq!(quotes.lines().count(), 1);
        assert_eq!(stats.downloaded(ArtifactKind::Quote), 1);
        assert!(files.contains("7", false));
    }

    // ==================== Periodic Save Tests ====================

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_periodic_save_flushes_only_after_interval() {
        tokio::time::pause();
        let files = Arc::new(FileDatabase::in_memory());
        let ticks = Arc::new(AtomicUsize::new(0));
        let (saver, stop) = spawn_periodic_save(Arc::clone(&files), Duration::from_secs(120), {
            let ticks = Arc::clone(&ticks);
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        });

        files.add("a.jpg", None, "a.jpg");
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(files.is_dirty(), "saved before the interval elapsed");

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert!(!files.is_dirty());

        // Clean between ticks: nothing to flush, and later changes wait for
        // the next tick.
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        files.add("b.jpg", None, "b.jpg");
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(files.is_dirty());
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(!files.is_dirty());

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        stop.cancel();
        saver.await.unwrap();
    }

    #[derive(Default)]
    struct StatusLog(Mutex<Vec<String>>);

    impl ProgressSink for StatusLog {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::Status { message, .. } = event {
                self.0.lock().unwrap().push(message);
            }
        }
    }

    #[tokio::test]
    async fn test_progress_reported_when_downloads_changed() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let log = Arc::new(StatusLog::default());
        let (downloader, stats) = downloader(
            Blog::new("b"),
            dir.path(),
            writer,
            Arc::new(FileDatabase::in_memory()),
        );
        let downloader = downloader.with_progress(log.clone());

        let (queue, rx) = bounded("posts", 8);
        stats.record_queued(ArtifactKind::Photo);
        stats.record_queued(ArtifactKind::Photo);
        queue.add(photo("a.jpg")).await.unwrap();
        queue.add(photo("b.jpg")).await.unwrap();
        queue.complete_adding();
        downloader.run(rx).await.unwrap();

        assert_eq!(*log.0.lock().unwrap(), vec!["2 of 2 downloaded".to_string()]);
        assert!(!stats.take_progress_changed());
    }

    // ==================== Cancellation Tests ====================

    #[tokio::test]
    async fn test_cancelled_run_is_not_drained() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FakeWriter::default());
        let files = Arc::new(FileDatabase::in_memory());
        let stats = Arc::new(BlogStats::new());
        let control = RunControl::new();
        let downloader = Downloader::new(
            Arc::new(Blog::new("b")),
            dir.path().to_path_buf(),
            writer,
            files,
            stats,
            control.clone(),
            &DownloaderConfig::default(),
        );

        let (_queue, rx) = bounded::<DownloadItem>("posts", 8);
        control.cancel_run();
        let summary = downloader.run(rx).await.unwrap();
        assert!(!summary.drained);
    }
}
