//! Page-walking crawler for one blog.
//!
//! A crawl moves through the phases of [`CrawlPhase`]:
//!
//! 1. **Checking login**: one probe page; a rejected session ends the run
//!    with both output queues completed and empty.
//! 2. **Discovering the highest id**: the newest non-pinned post becomes the
//!    candidate cursor.
//! 3. **Scanning pages**: `concurrent_scans` walkers each start at their own
//!    page and advance by the walker count, so together they cover the whole
//!    timeline. A walker stops on an empty page, at the stored cursor, or
//!    after a single page when explicit pages were requested.
//! 4. **Draining**: all walkers are awaited and both queues are completed,
//!    whatever the walkers' outcome.
//!
//! Walker failures never abort the crawl; they flag it incomplete, which
//! keeps the stored cursor where it was.

pub mod api;
pub mod classify;
pub mod dedup;
pub mod embedded;
mod error;
pub mod fetcher;
pub mod filter;
pub mod state;
pub mod text;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::CookieRefresher;
use crate::blog::{Blog, BlogStats};
use crate::control::RunControl;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::queue::{MetadataQueue, PostQueue, QueueError};

pub use api::{PageResponse, Post};
pub use classify::{Classification, ClassifierOptions, ImageSize, ItemClassifier, PostClassifier};
pub use dedup::DedupLedger;
pub use error::CrawlError;
pub use fetcher::{FetchError, HttpPageFetcher, PageFetcher, PageRequest};
pub use filter::{PostFilter, parse_page_list};
pub use state::{CrawlPhase, CrawlState};
pub use text::{PlainTextExtractor, TextExtractor};

/// Walkers started when nothing else is configured.
pub const DEFAULT_CONCURRENT_SCANS: usize = 4;

/// Collaborators of one crawl.
pub struct CrawlerDeps {
    pub blog: Arc<Blog>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub refresher: Arc<dyn CookieRefresher>,
    pub classifier: Arc<dyn ItemClassifier>,
    pub post_queue: Arc<PostQueue>,
    pub metadata_queue: Arc<MetadataQueue<Post>>,
    pub dedup: Arc<DedupLedger>,
    pub stats: Arc<BlogStats>,
    pub control: RunControl,
    pub progress: Arc<dyn ProgressSink>,
    /// Number of page walkers; zero is treated as one.
    pub concurrent_scans: usize,
}

/// Title and description shown on the blog's page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogMeta {
    pub title: String,
    pub description: String,
}

/// Outcome of [`Crawler::crawl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    /// Newest post id seen by discovery or the walkers.
    pub highest_id: u64,
    /// Date of the newest non-pinned post.
    pub latest_post: Option<DateTime<Utc>>,
    /// A walker failed part-way.
    pub incomplete: bool,
    /// The run was stopped.
    pub cancelled: bool,
    pub pages_crawled: usize,
    pub phase: CrawlPhase,
}

impl CrawlReport {
    /// Cursor to persist after the run.
    ///
    /// Advances only when the crawl was neither cancelled nor incomplete and
    /// the downloader processed its whole queue; never moves backwards.
    #[must_use]
    pub fn next_cursor(&self, current: u64, downloads_drained: bool) -> u64 {
        if !self.cancelled && !self.incomplete && downloads_drained {
            current.max(self.highest_id)
        } else {
            current
        }
    }
}

/// Crawler for one blog run.
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<Inner>,
}

struct Inner {
    blog: Arc<Blog>,
    fetcher: Arc<dyn PageFetcher>,
    refresher: Arc<dyn CookieRefresher>,
    classifier: Arc<dyn ItemClassifier>,
    post_queue: Arc<PostQueue>,
    metadata_queue: Arc<MetadataQueue<Post>>,
    dedup: Arc<DedupLedger>,
    stats: Arc<BlogStats>,
    control: RunControl,
    progress: Arc<dyn ProgressSink>,
    concurrent_scans: usize,
    filter: PostFilter,
    state: CrawlState,
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("blog", &self.inner.blog.name)
            .field("concurrent_scans", &self.inner.concurrent_scans)
            .field("phase", &self.inner.state.phase())
            .finish_non_exhaustive()
    }
}

impl Crawler {
    #[must_use]
    pub fn new(deps: CrawlerDeps) -> Self {
        let filter = PostFilter::from_blog(&deps.blog);
        Self {
            inner: Arc::new(Inner {
                blog: deps.blog,
                fetcher: deps.fetcher,
                refresher: deps.refresher,
                classifier: deps.classifier,
                post_queue: deps.post_queue,
                metadata_queue: deps.metadata_queue,
                dedup: deps.dedup,
                stats: deps.stats,
                control: deps.control,
                progress: deps.progress,
                concurrent_scans: deps.concurrent_scans.max(1),
                filter,
                state: CrawlState::new(),
            }),
        }
    }

    /// Blog snapshot this crawler works on.
    #[must_use]
    pub fn blog(&self) -> &Blog {
        &self.inner.blog
    }

    /// Run-scoped state.
    #[must_use]
    pub fn state(&self) -> &CrawlState {
        &self.inner.state
    }

    /// Refreshes the form key and probes the newest post.
    ///
    /// Service-unavailable and rate-limit answers count as online; not-found,
    /// timeouts and other failures as offline. Cancellation keeps the stored
    /// status.
    #[instrument(skip(self), fields(blog = %self.inner.blog.name))]
    pub async fn is_blog_online(&self) -> bool {
        let inner = &self.inner;
        let cancel = inner.control.cancel_token();
        if let Err(e) = inner.fetcher.refresh_form_key(&inner.blog.name, cancel).await {
            if e.is_cancelled() {
                return inner.blog.online;
            }
            warn!(error = %e, "form key refresh failed");
        }

        let probe = PageRequest {
            blog: inner.blog.name.clone(),
            limit: 1,
            offset: 0,
        };
        match inner.fetcher.fetch_page(&probe, cancel).await {
            Ok(_) => true,
            Err(FetchError::Cancelled { .. }) => inner.blog.online,
            Err(FetchError::ServiceUnavailable { .. } | FetchError::RateLimited { .. }) => {
                debug!("blog answered but is throttled, treating as online");
                true
            }
            Err(FetchError::NotFound { .. }) => {
                info!("blog not found");
                false
            }
            Err(e @ FetchError::Timeout { .. }) => {
                inner.report_error(format!("Timeout while checking online status: {e}"));
                false
            }
            Err(e) => {
                warn!(error = %e, "online check failed");
                false
            }
        }
    }

    /// Reads the blog title and description from the newest post.
    ///
    /// Returns `Ok(None)` when cancelled or when the page carries no post.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Fetch`] when the page request fails.
    #[instrument(skip(self), fields(blog = %self.inner.blog.name))]
    pub async fn update_meta_information(&self) -> Result<Option<BlogMeta>, CrawlError> {
        let inner = &self.inner;
        let cancel = inner.control.cancel_token();
        match inner.fetcher.refresh_form_key(&inner.blog.name, cancel).await {
            Err(e) if e.is_cancelled() => return Ok(None),
            Err(e) => warn!(error = %e, "form key refresh failed"),
            Ok(()) => {}
        }

        let request = PageRequest {
            blog: inner.blog.name.clone(),
            limit: 1,
            offset: 0,
        };
        let page = match inner.fetcher.fetch_page(&request, cancel).await {
            Ok(page) => page,
            Err(e) if e.is_cancelled() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if page.meta.status != 0 && page.meta.status != 200 {
            debug!(status = page.meta.status, msg = %page.meta.msg, "meta status not OK");
            return Ok(None);
        }
        Ok(page.posts().first().map(|post| BlogMeta {
            title: post.blog.title.clone(),
            description: post.blog.description.clone(),
        }))
    }

    /// Runs the crawl to completion.
    ///
    /// Both output queues are completed before this returns, on every path.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::NotLoggedIn`] when the login probe is rejected.
    #[instrument(skip(self), fields(blog = %self.inner.blog.name))]
    pub async fn crawl(&self) -> Result<CrawlReport, CrawlError> {
        let inner = &self.inner;

        inner.state.enter(CrawlPhase::CheckingLogin);
        if !inner.check_login().await {
            error!("user not logged in");
            inner.report_error("User not logged in");
            inner.complete_queues();
            inner.state.mark_incomplete();
            inner.state.finish();
            return Err(CrawlError::NotLoggedIn {
                blog: inner.blog.name.clone(),
            });
        }

        inner.state.enter(CrawlPhase::DiscoveringHighestId);
        let (highest_id, latest_post) = inner.discover_highest_id().await;
        inner.state.observe_highest_id(highest_id);

        inner.state.enter(CrawlPhase::ScanningPages);
        Arc::clone(inner).scan_pages().await;

        inner.complete_queues();
        let phase = inner.state.finish();
        let report = CrawlReport {
            highest_id: inner.state.highest_id(),
            latest_post,
            incomplete: inner.state.is_incomplete(),
            cancelled: inner.control.is_cancelled(),
            pages_crawled: inner.state.pages_crawled(),
            phase,
        };
        info!(
            highest_id = report.highest_id,
            pages = report.pages_crawled,
            incomplete = report.incomplete,
            cancelled = report.cancelled,
            unique = inner.stats.unique_count(),
            "crawl finished"
        );
        inner.progress.report(ProgressEvent::status(
            &inner.blog.name,
            format!("{} unique items found", inner.stats.unique_count()),
        ));
        Ok(report)
    }
}

impl Inner {
    fn report_error(&self, message: impl Into<String>) {
        self.progress
            .report(ProgressEvent::error(&self.blog.name, message));
    }

    fn complete_queues(&self) {
        self.post_queue.complete_adding();
        self.metadata_queue.complete_adding();
    }

    /// One page at offset `page_size`; cancellation counts as logged in.
    async fn check_login(&self) -> bool {
        let probe = PageRequest::page(&self.blog.name, self.blog.page_size(), 1);
        match self
            .fetcher
            .fetch_page(&probe, self.control.cancel_token())
            .await
        {
            Ok(_) | Err(FetchError::Cancelled { .. }) => true,
            Err(
                e @ (FetchError::Unauthorized { .. }
                | FetchError::ServiceUnavailable { .. }
                | FetchError::NotFound { .. }),
            ) => {
                warn!(error = %e, "login probe rejected");
                false
            }
            Err(e @ FetchError::Timeout { .. }) => {
                self.report_error(format!("Timeout while checking login: {e}"));
                false
            }
            Err(e) => {
                debug!(error = %e, "login probe failed, continuing");
                true
            }
        }
    }

    /// Falls back to the stored cursor on any failure.
    async fn discover_highest_id(&self) -> (u64, Option<DateTime<Utc>>) {
        let request = PageRequest {
            blog: self.blog.name.clone(),
            limit: 1,
            offset: 0,
        };
        match self
            .fetcher
            .fetch_page(&request, self.control.cancel_token())
            .await
        {
            Ok(page) => {
                let newest = page.first_unpinned();
                let latest = newest.and_then(|p| DateTime::from_timestamp(p.timestamp, 0));
                let id = page.highest_post_id();
                debug!(highest_id = id, "discovered newest post");
                (id, latest)
            }
            Err(e) => {
                if e.is_unauthorized() {
                    self.refresh_session().await;
                } else if !e.is_cancelled() {
                    warn!(error = %e, "highest id discovery failed, keeping stored cursor");
                }
                (self.blog.last_id, None)
            }
        }
    }

    async fn refresh_session(&self) {
        match self.refresher.refresh().await {
            Ok(cookies) => info!(cookies, "session refreshed"),
            Err(e) => warn!(error = %e, "session refresh failed"),
        }
    }

    async fn scan_pages(self: Arc<Self>) {
        let cancel = self.control.cancel_token().clone();
        let single_page = !self.blog.download_pages.trim().is_empty();
        let walkers = self.concurrent_scans;
        let pages: Vec<u64> = if single_page {
            parse_page_list(&self.blog.download_pages)
        } else {
            (0..walkers as u64).collect()
        };
        let stride = walkers as u64;

        let semaphore = Arc::new(Semaphore::new(walkers));
        let mut tasks = JoinSet::new();
        for page in pages {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                this.walk(page, stride, single_page).await;
            });
        }

        self.state.enter(CrawlPhase::Draining);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "page walker panicked");
                self.state.mark_incomplete();
            }
        }
    }

    #[instrument(skip(self), fields(blog = %self.blog.name))]
    async fn walk(&self, mut page: u64, stride: u64, single_page: bool) {
        let page_size = self.blog.page_size();
        loop {
            let request = PageRequest::page(&self.blog.name, page_size, page);
            let response = match self.fetch_with_reauth(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.walker_failed(page, &e);
                    return;
                }
            };
            if !self.process_page(&response).await {
                return;
            }
            let pages = self.state.page_crawled();
            self.progress.report(ProgressEvent::PagesCrawled {
                blog: self.blog.name.clone(),
                pages,
            });
            if single_page || response.posts().is_empty() {
                return;
            }
            page += stride;
        }
    }

    /// A 401 gets one session refresh and one retry of the same page.
    async fn fetch_with_reauth(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
        let cancel = self.control.cancel_token();
        match self.fetcher.fetch_page(request, cancel).await {
            Err(e) if e.is_unauthorized() => {
                warn!(offset = request.offset, "page rejected as unauthorized");
                self.report_error(format!("Auth error (trying to continue): {e}"));
                self.refresh_session().await;
                self.fetcher.fetch_page(request, cancel).await
            }
            other => other,
        }
    }

    fn walker_failed(&self, page: u64, error: &FetchError) {
        if error.is_cancelled() {
            debug!(page, "walker cancelled");
            return;
        }
        self.state.mark_incomplete();
        match error {
            FetchError::RateLimited { .. } => {
                warn!(page, error = %error, "rate limit hit, crawl incomplete");
                self.report_error(format!("Rate limit exceeded, crawl incomplete: {error}"));
            }
            FetchError::Timeout { .. } => {
                warn!(page, error = %error, "timeout, crawl incomplete");
                self.report_error(format!("Timeout while crawling: {error}"));
            }
            _ => {
                error!(page, error = %error, "page walker failed");
                self.report_error(format!("Crawling failed: {error}"));
            }
        }
    }

    /// Returns false when the walker should stop.
    async fn process_page(&self, page: &PageResponse) -> bool {
        if !self.control.checkpoint().await {
            return false;
        }
        let last_id = self.blog.last_id;
        let Some(newest) = page.first_unpinned() else {
            debug!("page without unpinned posts");
            return false;
        };
        let newest_id = newest.numeric_id().unwrap_or_default();
        if last_id > 0 && newest_id <= last_id {
            debug!(newest_id, last_id, "reached stored cursor");
            return false;
        }

        for post in page.posts() {
            if !self.control.checkpoint().await {
                return false;
            }
            let id = post.numeric_id();
            if last_id > 0 && id.is_some_and(|id| id <= last_id) {
                continue;
            }
            if let Some(id) = id.filter(|_| !post.is_pinned) {
                self.state.observe_highest_id(id);
            }
            if !self.filter.accepts(post) {
                continue;
            }
            if let Err(e) = self.dispatch(post).await {
                warn!(post_id = %post.id, error = %e, "output queue closed, stopping walker");
                self.state.mark_incomplete();
                return false;
            }
        }
        true
    }

    async fn dispatch(&self, post: &Post) -> Result<(), QueueError> {
        let classification = self.classifier.classify(post);
        for item in classification.items {
            self.stats.record_queued(item.kind);
            if let Some(url) = item.url() {
                if !self.dedup.record_media(url) {
                    self.stats.record_duplicate(item.kind);
                    continue;
                }
            }
            self.post_queue.add(item).await?;
        }
        for record in classification.metadata {
            self.dedup.offer(record, &self.metadata_queue).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::api::{Meta, PageBody};
    use super::*;
    use crate::auth::RefreshError;
    use crate::progress::NullProgress;
    use crate::queue::{ArtifactKind, CrawlerData, DownloadItem, QueueReceiver, bounded};

    // ==================== Fakes ====================

    #[derive(Default)]
    struct FakeFetcher {
        posts: Vec<Post>,
        calls: Mutex<Vec<PageRequest>>,
        /// Offset -> number of 401 answers still to give.
        unauthorized: Mutex<HashMap<u64, usize>>,
        reject_all: bool,
    }

    impl FakeFetcher {
        fn with_ids(ids: impl IntoIterator<Item = u64>) -> Self {
            Self {
                posts: ids
                    .into_iter()
                    .map(|id| Post {
                        id: id.to_string(),
                        post_type: "text".to_string(),
                        ..Post::default()
                    })
                    .collect(),
                ..Self::default()
            }
        }

        fn calls_at(&self, offset: u64, limit: u32) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.offset == offset && r.limit == limit)
                .count()
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch_page(
            &self,
            request: &PageRequest,
            _cancel: &CancellationToken,
        ) -> Result<PageResponse, FetchError> {
            self.calls.lock().unwrap().push(request.clone());
            let url = format!("fake://{}/{}", request.limit, request.offset);
            if self.reject_all {
                return Err(FetchError::Unauthorized { url });
            }
            if let Some(remaining) = self.unauthorized.lock().unwrap().get_mut(&request.offset) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Unauthorized { url });
                }
            }
            let posts = self
                .posts
                .iter()
                .skip(request.offset as usize)
                .take(request.limit as usize)
                .cloned()
                .collect();
            Ok(PageResponse {
                meta: Meta {
                    status: 200,
                    msg: "OK".to_string(),
                },
                response: PageBody { posts },
            })
        }

        async fn refresh_form_key(
            &self,
            _blog: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), FetchError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CookieRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<usize, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    /// One text item and one `{id}.json` record per post.
    struct OnePerPost;

    impl ItemClassifier for OnePerPost {
        fn classify(&self, post: &Post) -> Classification {
            Classification {
                items: vec![DownloadItem::text(
                    ArtifactKind::Text,
                    post.id.clone(),
                    &post.id,
                    post.timestamp,
                )],
                metadata: vec![CrawlerData::new(format!("{}.json", post.id), post.clone())],
            }
        }
    }

    struct Harness {
        crawler: Crawler,
        items: QueueReceiver<crate::queue::DownloadItem>,
        records: QueueReceiver<CrawlerData<Post>>,
        fetcher: Arc<FakeFetcher>,
        refresher: Arc<CountingRefresher>,
        control: RunControl,
    }

    fn harness(blog: Blog, fetcher: FakeFetcher, scans: usize) -> Harness {
        let (post_queue, items) = bounded("posts", 1024);
        let (metadata_queue, records) = bounded("metadata", 1024);
        let fetcher = Arc::new(fetcher);
        let refresher = Arc::new(CountingRefresher::default());
        let control = RunControl::new();
        let crawler = Crawler::new(CrawlerDeps {
            dedup: Arc::new(DedupLedger::new(true, blog.force_rescan)),
            blog: Arc::new(blog),
            fetcher: Arc::clone(&fetcher) as Arc<dyn PageFetcher>,
            refresher: Arc::clone(&refresher) as Arc<dyn CookieRefresher>,
            classifier: Arc::new(OnePerPost),
            post_queue,
            metadata_queue,
            stats: Arc::new(BlogStats::new()),
            control: control.clone(),
            progress: Arc::new(NullProgress),
            concurrent_scans: scans,
        });
        Harness {
            crawler,
            items,
            records,
            fetcher,
            refresher,
            control,
        }
    }

    async fn drain_ids(rx: &mut QueueReceiver<crate::queue::DownloadItem>) -> Vec<u64> {
        let cancel = CancellationToken::new();
        let mut ids = Vec::new();
        while let Some(item) = rx.receive(&cancel).await.unwrap() {
            ids.push(item.post_id.parse().unwrap());
        }
        ids.sort_unstable();
        ids
    }

    fn blog(last_id: u64, page_size: u32) -> Blog {
        let mut blog = Blog::new("someblog");
        blog.last_id = last_id;
        blog.page_size = page_size;
        blog
    }

    // ==================== Cursor Boundary Tests ====================

    #[tokio::test]
    async fn test_two_pages_stop_at_stored_cursor() {
        for scans in [1, 2, 3] {
            let fetcher = FakeFetcher::with_ids((51..=150).rev());
            let mut h = harness(blog(100, 50), fetcher, scans);

            let report = h.crawler.crawl().await.unwrap();
            let ids = drain_ids(&mut h.items).await;

            assert_eq!(ids, (101..=150).collect::<Vec<_>>(), "scans = {scans}");
            assert_eq!(report.highest_id, 150);
            assert_eq!(report.pages_crawled, 1);
            assert!(!report.incomplete);
            assert_eq!(report.phase, CrawlPhase::Completed);
        }
    }

    #[tokio::test]
    async fn test_page_at_cursor_enqueues_nothing() {
        let mut h = harness(blog(150, 50), FakeFetcher::with_ids((101..=150).rev()), 1);
        let report = h.crawler.crawl().await.unwrap();
        assert!(drain_ids(&mut h.items).await.is_empty());
        assert_eq!(report.next_cursor(150, true), 150);
    }

    #[tokio::test]
    async fn test_page_one_above_cursor_enqueues_exactly_that_post() {
        let mut h = harness(blog(150, 50), FakeFetcher::with_ids((102..=151).rev()), 1);
        let report = h.crawler.crawl().await.unwrap();
        assert_eq!(drain_ids(&mut h.items).await, vec![151]);
        assert_eq!(report.next_cursor(150, true), 151);
    }

    #[tokio::test]
    async fn test_full_crawl_without_cursor() {
        let mut h = harness(blog(0, 10), FakeFetcher::with_ids((1..=35).rev()), 2);
        let report = h.crawler.crawl().await.unwrap();
        assert_eq!(drain_ids(&mut h.items).await, (1..=35).collect::<Vec<_>>());
        assert_eq!(report.pages_crawled, 4);
        assert_eq!(report.highest_id, 35);
    }

    // ==================== Re-authentication Tests ====================

    #[tokio::test]
    async fn test_unauthorized_page_refreshes_once_and_retries() {
        let fetcher = FakeFetcher::with_ids((1..=250).rev());
        fetcher.unauthorized.lock().unwrap().insert(100, 1);
        let mut h = harness(blog(0, 50), fetcher, 1);

        let report = h.crawler.crawl().await.unwrap();
        assert_eq!(drain_ids(&mut h.items).await.len(), 250);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.fetcher.calls_at(100, 50), 2);
        assert!(!report.incomplete);
    }

    #[tokio::test]
    async fn test_second_unauthorized_marks_incomplete() {
        let fetcher = FakeFetcher::with_ids((1..=250).rev());
        fetcher.unauthorized.lock().unwrap().insert(100, usize::MAX);
        let mut h = harness(blog(0, 50), fetcher, 1);

        let report = h.crawler.crawl().await.unwrap();
        assert_eq!(drain_ids(&mut h.items).await.len(), 100);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.fetcher.calls_at(100, 50), 2);
        assert!(report.incomplete);
        assert_eq!(report.phase, CrawlPhase::IncompleteCompleted);
        assert_eq!(report.next_cursor(0, true), 0);
    }

    #[tokio::test]
    async fn test_not_logged_in_completes_queues_empty() {
        let fetcher = FakeFetcher {
            reject_all: true,
            ..FakeFetcher::with_ids([3, 2, 1])
        };
        let mut h = harness(blog(0, 50), fetcher, 2);

        let err = h.crawler.crawl().await.unwrap_err();
        assert!(err.is_not_logged_in());
        assert!(drain_ids(&mut h.items).await.is_empty());
        let cancel = CancellationToken::new();
        assert!(h.records.receive(&cancel).await.unwrap().is_none());
        assert_eq!(h.fetcher.calls.lock().unwrap().len(), 1);
    }

    // ==================== Scheduling Tests ====================

    #[tokio::test]
    async fn test_explicit_pages_fetch_single_pages() {
        let mut b = blog(0, 10);
        b.download_pages = "2".to_string();
        let mut h = harness(b, FakeFetcher::with_ids((1..=50).rev()), 4);

        h.crawler.crawl().await.unwrap();
        assert_eq!(drain_ids(&mut h.items).await, (31..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancelled_run_still_completes_queues() {
        let mut h = harness(blog(0, 10), FakeFetcher::with_ids((1..=50).rev()), 2);
        h.control.cancel_run();

        let report = h.crawler.crawl().await.unwrap();
        assert!(report.cancelled);
        assert!(drain_ids(&mut h.items).await.is_empty());
        assert_eq!(report.next_cursor(7, true), 7);
    }

    #[tokio::test]
    async fn test_metadata_records_follow_accepted_posts() {
        let mut h = harness(blog(0, 10), FakeFetcher::with_ids([2, 1]), 1);
        h.crawler.crawl().await.unwrap();

        let cancel = CancellationToken::new();
        let mut names = Vec::new();
        while let Some(record) = h.records.receive(&cancel).await.unwrap() {
            names.push(record.filename);
        }
        names.sort();
        assert_eq!(names, vec!["1.json", "2.json"]);
    }

    #[test]
    fn test_next_cursor_requires_drained_downloads() {
        let report = CrawlReport {
            highest_id: 500,
            latest_post: None,
            incomplete: false,
            cancelled: false,
            pages_crawled: 3,
            phase: CrawlPhase::Completed,
        };
        assert_eq!(report.next_cursor(100, true), 500);
        assert_eq!(report.next_cursor(100, false), 100);
        assert_eq!(report.next_cursor(900, true), 900);
    }
}
