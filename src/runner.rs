//! End-to-end blog runs.
//!
//! [`BlogRunner`] drives one or more blogs through the whole pipeline:
//!
//! 1. load the persisted [`Blog`] and apply per-run overrides
//! 2. probe the blog and refresh its title and description
//! 3. crawl, download and write metadata concurrently
//! 4. merge statistics and move the cursor when the run fully succeeded
//! 5. save the blog document
//!
//! Everything a run needs from the outside world comes in through two values
//! built once at startup: the immutable [`Settings`] and the
//! [`RuntimeEnvironment`] holding the shared HTTP session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::cookie::Jar;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::auth::{CookieRefresher, FileCookieRefresher, NoCookieRefresh, RefreshError};
use crate::blog::{Blog, BlogError, BlogStats};
use crate::control::{PauseToken, RunControl};
use crate::crawler::api::DEFAULT_API_BASE;
use crate::crawler::{
    ClassifierOptions, CrawlError, CrawlReport, CrawlerDeps, DEFAULT_CONCURRENT_SCANS,
    DedupLedger, HttpPageFetcher, PageFetcher, PlainTextExtractor, PostClassifier,
};
use crate::download::{
    ArtifactWriter, ClientOptions, DownloaderConfig, Downloader, EndpointClass, EngineError,
    HttpClient, RateLimiter,
    constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS},
};
use crate::file_db::{FileDatabase, FileDbError};
use crate::metadata::MetadataWriter;
use crate::progress::{NullProgress, ProgressEvent, ProgressSink};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, bounded};
use crate::registry::{CrawlerRegistry, RegistryError};

/// Default number of blogs crawled at the same time.
pub const DEFAULT_CONCURRENT_BLOGS: usize = 2;

/// Default `svc` requests per minute when rate limiting is on.
pub const DEFAULT_SVC_REQUESTS_PER_MINUTE: u32 = 90;

/// Errors that prevent a blog run from starting or finishing its bookkeeping.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Loading or saving the blog document failed.
    #[error(transparent)]
    Blog(#[from] BlogError),

    /// The file database could not be opened.
    #[error(transparent)]
    FileDatabase(#[from] FileDbError),

    /// No crawler is registered for the blog's type.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The cookie file could not be loaded at startup.
    #[error("cannot load cookies: {0}")]
    Cookies(#[from] RefreshError),

    /// The HTTP client could not be built.
    #[error("cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The blog directory could not be created.
    #[error("cannot create {path}: {source}")]
    Io {
        /// Directory path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Process-wide settings, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory; each blog downloads into `{download_root}/{blog}`.
    pub download_root: PathBuf,
    /// Directory holding blog documents and file databases.
    pub index_dir: PathBuf,
    /// Base URL of the remote API.
    pub api_base: Url,
    /// Netscape cookie export of a logged-in session.
    pub cookie_file: Option<PathBuf>,
    /// Blogs processed at the same time.
    pub concurrent_blogs: usize,
    /// Page walkers per blog.
    pub concurrent_scans: usize,
    /// Connection budget, retry policy and flush period of the downloaders.
    pub downloader: DownloaderConfig,
    /// Preferred renditions.
    pub classifier: ClassifierOptions,
    /// Requests per minute against `svc` endpoints; `None` disables pacing.
    pub svc_requests_per_minute: Option<u32>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Capacity of the per-run queues.
    pub queue_capacity: usize,
}

impl Settings {
    /// Defaults rooted at `download_root`, with the index in `{download_root}/index`.
    #[must_use]
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        let download_root = download_root.into();
        let index_dir = download_root.join("index");
        Self {
            download_root,
            index_dir,
            api_base: default_api_base(),
            cookie_file: None,
            concurrent_blogs: DEFAULT_CONCURRENT_BLOGS,
            concurrent_scans: DEFAULT_CONCURRENT_SCANS,
            downloader: DownloaderConfig::default(),
            classifier: ClassifierOptions::default(),
            svc_requests_per_minute: Some(DEFAULT_SVC_REQUESTS_PER_MINUTE),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[allow(clippy::expect_used)]
fn default_api_base() -> Url {
    Url::parse(DEFAULT_API_BASE).expect("default API base is a valid URL")
}

/// Per-run overrides of the persisted blog options.
///
/// `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlogOverrides {
    pub blog_type: Option<String>,
    pub page_size: Option<u32>,
    pub download_pages: Option<String>,
    pub download_from: Option<String>,
    pub download_to: Option<String>,
    pub tags: Option<String>,
    pub filename_template: Option<String>,
    pub download_reblogged_posts: Option<bool>,
    pub dump_crawler_data: Option<bool>,
    pub force_rescan: Option<bool>,
    pub check_directory_for_files: Option<bool>,
    pub download_url_list: Option<bool>,
}

impl BlogOverrides {
    /// Writes every set override into `blog`.
    ///
    /// The runner applies overrides to a per-run copy, never to the stored
    /// document.
    pub fn apply(&self, blog: &mut Blog) {
        fn set<T: Clone>(target: &mut T, value: Option<&T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        set(&mut blog.blog_type, self.blog_type.as_ref());
        set(&mut blog.page_size, self.page_size.as_ref());
        set(&mut blog.download_pages, self.download_pages.as_ref());
        set(&mut blog.download_from, self.download_from.as_ref());
        set(&mut blog.download_to, self.download_to.as_ref());
        set(&mut blog.tags, self.tags.as_ref());
        set(&mut blog.filename_template, self.filename_template.as_ref());
        set(
            &mut blog.download_reblogged_posts,
            self.download_reblogged_posts.as_ref(),
        );
        set(&mut blog.dump_crawler_data, self.dump_crawler_data.as_ref());
        set(&mut blog.force_rescan, self.force_rescan.as_ref());
        set(
            &mut blog.check_directory_for_files,
            self.check_directory_for_files.as_ref(),
        );
        set(&mut blog.download_url_list, self.download_url_list.as_ref());
    }
}

/// Facts computed once at startup and shared by every run.
pub struct RuntimeEnvironment {
    fetcher: Arc<dyn PageFetcher>,
    writer: Arc<dyn ArtifactWriter>,
    refresher: Arc<dyn CookieRefresher>,
    registry: CrawlerRegistry,
    progress: Arc<dyn ProgressSink>,
    global: CancellationToken,
    pause: PauseToken,
}

impl std::fmt::Debug for RuntimeEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEnvironment")
            .field("blog_types", &self.registry.blog_types())
            .field("stopped", &self.global.is_cancelled())
            .field("paused", &self.pause.is_paused())
            .finish_non_exhaustive()
    }
}

impl RuntimeEnvironment {
    /// Environment over explicit collaborators.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        writer: Arc<dyn ArtifactWriter>,
        refresher: Arc<dyn CookieRefresher>,
    ) -> Self {
        Self {
            fetcher,
            writer,
            refresher,
            registry: CrawlerRegistry::with_defaults(),
            progress: Arc::new(NullProgress),
            global: CancellationToken::new(),
            pause: PauseToken::new(),
        }
    }

    /// Builds the shared HTTP session from `settings`.
    ///
    /// The cookie file, when configured, is loaded once here and reloaded by
    /// the crawler after an unauthorized answer.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Cookies`] when the cookie file is unusable and
    /// [`RunnerError::Client`] when the HTTP client cannot be built.
    #[instrument(skip(settings), fields(api_base = %settings.api_base))]
    pub fn connect(settings: &Settings) -> Result<Self, RunnerError> {
        let jar = Arc::new(Jar::default());
        let refresher: Arc<dyn CookieRefresher> = match &settings.cookie_file {
            Some(path) => {
                let refresher = FileCookieRefresher::new(path, Arc::clone(&jar));
                let cookies = refresher.load()?;
                info!(cookies, path = %path.display(), "session cookies loaded");
                Arc::new(refresher)
            }
            None => {
                warn!("no cookie file configured, hidden blogs will not be reachable");
                Arc::new(NoCookieRefresh)
            }
        };

        let client = HttpClient::build(ClientOptions {
            connect_timeout: settings.connect_timeout,
            read_timeout: settings.read_timeout,
            cookie_jar: Some(jar),
        })?;

        let rate_limiter = match settings.svc_requests_per_minute {
            Some(max) => RateLimiter::new().with_quota(EndpointClass::Svc, true, max),
            None => RateLimiter::disabled(),
        };
        let fetcher = HttpPageFetcher::new(
            client.inner().clone(),
            settings.api_base.clone(),
            Arc::new(rate_limiter),
        );

        Ok(Self::new(Arc::new(fetcher), Arc::new(client), refresher))
    }

    /// Routes user-visible events to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Replaces the crawler registry.
    #[must_use]
    pub fn with_registry(mut self, registry: CrawlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Global stop token; cancelling it ends every run.
    #[must_use]
    pub fn stop_token(&self) -> &CancellationToken {
        &self.global
    }

    /// Pause flag shared by every run.
    #[must_use]
    pub fn pause_token(&self) -> &PauseToken {
        &self.pause
    }
}

/// How a blog run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Crawled and downloaded completely; the cursor may have moved.
    Completed,
    /// Something failed part-way; the cursor stayed put.
    Incomplete,
    /// Stopped by the user or a global stop.
    Cancelled,
    /// The blog did not answer the online probe.
    Offline,
    /// The session was rejected.
    NotLoggedIn,
}

/// Result of one blog run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogOutcome {
    pub blog: String,
    pub status: RunStatus,
    /// Cursor stored after the run.
    pub last_id: u64,
    /// Artifacts written in this run.
    pub downloaded: u64,
    /// Artifacts skipped as duplicates in this run.
    pub duplicates: u64,
}

/// Runs blogs against one [`RuntimeEnvironment`].
#[derive(Debug, Clone)]
pub struct BlogRunner {
    settings: Arc<Settings>,
    env: Arc<RuntimeEnvironment>,
}

impl BlogRunner {
    #[must_use]
    pub fn new(settings: Settings, env: RuntimeEnvironment) -> Self {
        Self {
            settings: Arc::new(settings),
            env: Arc::new(env),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn environment(&self) -> &RuntimeEnvironment {
        &self.env
    }

    /// Runs every blog in `names`, at most `concurrent_blogs` at a time.
    ///
    /// The connection budget is split evenly across the blogs running at the
    /// same time. A failure in one blog does not stop the others; a global
    /// stop (user request or full disk) cancels the remaining ones.
    #[instrument(skip(self, names, overrides), fields(blogs = names.len()))]
    pub async fn run_all(
        &self,
        names: &[String],
        overrides: &BlogOverrides,
    ) -> Vec<(String, Result<BlogOutcome, RunnerError>)> {
        let concurrent = self.settings.concurrent_blogs.max(1);
        let active_blogs = concurrent.min(names.len()).max(1);
        stream::iter(names)
            .map(|name| async move {
                let result = self.run_blog_with(name, overrides, active_blogs).await;
                if let Err(e) = &result {
                    error!(blog = %name, error = %e, "blog run failed");
                    self.env
                        .progress
                        .report(ProgressEvent::error(name.as_str(), e.to_string()));
                }
                (name.clone(), result)
            })
            .buffer_unordered(concurrent)
            .collect()
            .await
    }

    /// Runs a single blog with the whole connection budget.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the blog document, file database or blog
    /// directory cannot be used, or no crawler exists for the blog type.
    pub async fn run_blog(
        &self,
        name: &str,
        overrides: &BlogOverrides,
    ) -> Result<BlogOutcome, RunnerError> {
        self.run_blog_with(name, overrides, 1).await
    }

    #[instrument(skip(self, overrides), fields(blog = %name))]
    async fn run_blog_with(
        &self,
        name: &str,
        overrides: &BlogOverrides,
        active_blogs: usize,
    ) -> Result<BlogOutcome, RunnerError> {
        let settings = &*self.settings;
        let env = &*self.env;

        let mut blog = Blog::load_or_new(&settings.index_dir, name).await?;
        // Overrides only shape this run; the stored document keeps its options.
        let mut run_view = blog.clone();
        overrides.apply(&mut run_view);
        if env.global.is_cancelled() {
            debug!("stop requested before start");
            return Ok(outcome(&blog, RunStatus::Cancelled, &BlogStats::new()));
        }

        let blog_dir = run_view.download_location(&settings.download_root);
        tokio::fs::create_dir_all(&blog_dir)
            .await
            .map_err(|source| RunnerError::Io {
                path: blog_dir.clone(),
                source,
            })?;
        let files = Arc::new(
            FileDatabase::open(&Blog::files_db_path(&settings.index_dir, &blog.name)).await?,
        );

        let control = RunControl::child_of(&env.global, env.pause.clone());
        let stats = Arc::new(BlogStats::new());
        let snapshot = Arc::new(run_view);
        let dedup = Arc::new(DedupLedger::from_blog(&snapshot));
        let (post_queue, post_rx) = bounded("posts", settings.queue_capacity);
        let (metadata_queue, metadata_rx) = bounded("metadata", settings.queue_capacity);
        let classifier = PostClassifier::new(
            Arc::clone(&snapshot),
            Arc::new(PlainTextExtractor),
            settings.classifier,
        );

        let crawler = env.registry.create(
            &snapshot.blog_type,
            CrawlerDeps {
                blog: Arc::clone(&snapshot),
                fetcher: Arc::clone(&env.fetcher),
                refresher: Arc::clone(&env.refresher),
                classifier: Arc::new(classifier),
                post_queue,
                metadata_queue,
                dedup: Arc::clone(&dedup),
                stats: Arc::clone(&stats),
                control: control.clone(),
                progress: Arc::clone(&env.progress),
                concurrent_scans: settings.concurrent_scans,
            },
        )?;

        blog.online = crawler.is_blog_online().await;
        if !blog.online {
            info!("blog is offline");
            env.progress
                .report(ProgressEvent::status(&blog.name, "Blog is offline"));
            blog.save(&settings.index_dir).await?;
            return Ok(outcome(&blog, RunStatus::Offline, &stats));
        }

        match crawler.update_meta_information().await {
            Ok(Some(meta)) => {
                blog.title = meta.title;
                blog.description = meta.description;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "blog information not updated"),
        }

        if let Err(e) = dedup.seed_from_dir(&blog_dir).await {
            warn!(error = %e, "cannot list existing metadata records");
        }

        let downloader_config = DownloaderConfig {
            active_blogs,
            ..settings.downloader.clone()
        };
        let downloader = Downloader::new(
            Arc::clone(&snapshot),
            blog_dir.clone(),
            Arc::clone(&env.writer),
            files,
            Arc::clone(&stats),
            control.clone(),
            &downloader_config,
        )
        .with_progress(Arc::clone(&env.progress));
        let metadata = MetadataWriter::new(&blog.name, &blog_dir, control.clone())
            .with_progress(Arc::clone(&env.progress));

        let (crawled, downloaded, written) = tokio::join!(
            crawler.crawl(),
            downloader.run(post_rx),
            metadata.run(metadata_rx),
        );
        debug!(
            written = written.written,
            failed = written.failed,
            "metadata records processed"
        );

        let drained = match downloaded {
            Ok(summary) => summary.drained,
            Err(EngineError::DiskFull { path }) => {
                error!(path = %path, "download aborted, disk full");
                false
            }
            Err(e) => {
                error!(error = %e, "download run failed");
                false
            }
        };

        let status = finish_run(&mut blog, crawled, drained, &stats, control.is_cancelled());
        blog.save(&settings.index_dir).await?;
        info!(
            status = ?status,
            last_id = blog.last_id,
            downloaded = stats.total_downloaded(),
            "blog run finished"
        );
        Ok(outcome(&blog, status, &stats))
    }
}

/// Folds the crawl outcome into the blog document.
fn finish_run(
    blog: &mut Blog,
    crawled: Result<CrawlReport, CrawlError>,
    drained: bool,
    stats: &BlogStats,
    cancelled: bool,
) -> RunStatus {
    let incremental = blog.last_id > 0;
    let report = match crawled {
        Ok(report) => report,
        Err(CrawlError::NotLoggedIn { .. }) => {
            blog.online = false;
            blog.apply_stats(stats, true);
            return RunStatus::NotLoggedIn;
        }
        Err(e) => {
            error!(error = %e, "crawl failed");
            blog.apply_stats(stats, true);
            return if cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Incomplete
            };
        }
    };

    // A stop that lands after the crawl report was built still keeps the cursor.
    let cancelled = cancelled || report.cancelled;
    let next = if cancelled {
        blog.last_id
    } else {
        report.next_cursor(blog.last_id, drained)
    };
    if next != blog.last_id {
        debug!(from = blog.last_id, to = next, "advancing cursor");
    }
    blog.last_id = next;
    blog.apply_stats(stats, incremental);
    if let Some(latest) = report.latest_post {
        blog.latest_post = Some(latest);
    }

    if !cancelled {
        blog.last_complete_crawl = Some(Utc::now());
    }
    if cancelled {
        RunStatus::Cancelled
    } else if report.incomplete || !drained {
        RunStatus::Incomplete
    } else {
        RunStatus::Completed
    }
}

fn outcome(blog: &Blog, status: RunStatus, stats: &BlogStats) -> BlogOutcome {
    BlogOutcome {
        blog: blog.name.clone(),
        status,
        last_id: blog.last_id,
        downloaded: stats.total_downloaded(),
        duplicates: crate::queue::ArtifactKind::ALL
            .iter()
            .map(|kind| stats.duplicates(*kind))
            .sum(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::crawler::CrawlPhase;
    use crate::queue::ArtifactKind;

    fn report(highest_id: u64, incomplete: bool, cancelled: bool) -> CrawlReport {
        CrawlReport {
            highest_id,
            latest_post: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            incomplete,
            cancelled,
            pages_crawled: 2,
            phase: CrawlPhase::Completed,
        }
    }

    // ==================== Cursor Tests ====================

    #[test]
    fn test_completed_run_advances_cursor() {
        let mut blog = Blog::new("b");
        blog.last_id = 100;
        let status = finish_run(&mut blog, Ok(report(250, false, false)), true, &BlogStats::new(), false);
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(blog.last_id, 250);
        assert!(blog.last_complete_crawl.is_some());
        assert!(blog.latest_post.is_some());
    }

    #[test]
    fn test_incomplete_run_keeps_cursor() {
        let mut blog = Blog::new("b");
        blog.last_id = 100;
        let status = finish_run(&mut blog, Ok(report(250, true, false)), true, &BlogStats::new(), false);
        assert_eq!(status, RunStatus::Incomplete);
        assert_eq!(blog.last_id, 100);
    }

    #[test]
    fn test_undrained_downloads_keep_cursor() {
        let mut blog = Blog::new("b");
        let status = finish_run(&mut blog, Ok(report(250, false, false)), false, &BlogStats::new(), false);
        assert_eq!(status, RunStatus::Incomplete);
        assert_eq!(blog.last_id, 0);
    }

    #[test]
    fn test_cancelled_run_keeps_cursor_and_crawl_date() {
        let mut blog = Blog::new("b");
        let status = finish_run(&mut blog, Ok(report(250, false, false)), true, &BlogStats::new(), true);
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(blog.last_id, 0);
        assert!(blog.last_complete_crawl.is_none());
    }

    #[test]
    fn test_stop_after_crawl_report_keeps_cursor() {
        let mut blog = Blog::new("b");
        blog.last_id = 100;
        let status = finish_run(&mut blog, Ok(report(250, false, false)), true, &BlogStats::new(), true);
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(blog.last_id, 100);
    }

    #[test]
    fn test_not_logged_in_marks_offline() {
        let mut blog = Blog::new("b");
        blog.online = true;
        let crawled = Err(CrawlError::NotLoggedIn { blog: "b".into() });
        let status = finish_run(&mut blog, crawled, true, &BlogStats::new(), false);
        assert_eq!(status, RunStatus::NotLoggedIn);
        assert!(!blog.online);
    }

    #[test]
    fn test_full_crawl_replaces_total_count() {
        let mut blog = Blog::new("b");
        blog.total_count = 40;
        let stats = BlogStats::new();
        stats.record_queued(ArtifactKind::Photo);
        stats.record_queued(ArtifactKind::Video);
        finish_run(&mut blog, Ok(report(10, false, false)), true, &stats, false);
        assert_eq!(blog.total_count, 2);
    }

    // ==================== Settings Tests ====================

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::new("/data");
        assert_eq!(settings.index_dir, PathBuf::from("/data/index"));
        assert_eq!(settings.api_base.as_str(), "https://www.tumblr.com/");
        assert_eq!(settings.concurrent_scans, DEFAULT_CONCURRENT_SCANS);
    }

    #[test]
    fn test_overrides_only_touch_set_fields() {
        let mut blog = Blog::new("b");
        blog.tags = "cats".into();
        blog.page_size = 50;
        let overrides = BlogOverrides {
            page_size: Some(20),
            force_rescan: Some(true),
            ..BlogOverrides::default()
        };
        overrides.apply(&mut blog);
        assert_eq!(blog.page_size, 20);
        assert!(blog.force_rescan);
        assert_eq!(blog.tags, "cats");
    }
}
