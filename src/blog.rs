//! The persisted blog document and its run-time statistics.
//!
//! A [`Blog`] is the long-lived root of everything known about one blog:
//! crawl options, the `last_id` cursor and cumulative counters. It is stored
//! as pretty JSON at `{index_dir}/{name}.blog.json`.
//!
//! During a run the crawler and downloader only read an `Arc<Blog>` snapshot
//! and record their counts into a shared [`BlogStats`]; the runner merges the
//! stats back with [`Blog::apply_stats`] once the run is over.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::download::DEFAULT_FILENAME_TEMPLATE;
use crate::queue::ArtifactKind;

/// Page size used when the stored one is out of range.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Inclusive range of accepted page sizes.
pub const PAGE_SIZE_RANGE: std::ops::RangeInclusive<u32> = 1..=100;

/// Default blog type served by the registry.
pub const HIDDEN_BLOG_TYPE: &str = "tumblr_hidden";

const BLOG_FILE_SUFFIX: &str = ".blog.json";

/// Errors raised while loading or saving a blog document.
#[derive(Debug, Error)]
pub enum BlogError {
    /// Reading or writing the document failed.
    #[error("IO error on blog file {path}: {source}")]
    Io {
        /// Document path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON for a blog.
    #[error("invalid blog file {path}: {source}")]
    Parse {
        /// Document path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The blog name cannot be used as a file name.
    #[error("invalid blog name '{name}'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
}

impl BlogError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One crawled blog and its crawl options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Blog {
    /// Blog name (the subdomain / tumblelog name).
    pub name: String,
    /// Registry key selecting the crawler implementation.
    pub blog_type: String,
    /// Title scraped from the remote meta information.
    pub title: String,
    /// Description scraped from the remote meta information.
    pub description: String,
    /// Result of the last online check.
    pub online: bool,

    /// Highest post id fully processed by a successful run; 0 means never.
    pub last_id: u64,
    /// End of the last run that was not cancelled.
    pub last_complete_crawl: Option<DateTime<Utc>>,
    /// Date of the newest non-pinned post seen.
    pub latest_post: Option<DateTime<Utc>>,

    /// Posts per page request, valid in 1..=100.
    pub page_size: u32,
    /// Explicit pages to crawl (`"1-3,7"`); empty crawls everything.
    pub download_pages: String,
    /// Lower date bound, `yyyyMMdd`, inclusive.
    pub download_from: String,
    /// Upper date bound, `yyyyMMdd`, inclusive.
    pub download_to: String,
    /// Comma-separated tag filter; empty accepts every post.
    pub tags: String,
    /// File name template for binary artifacts.
    pub filename_template: String,

    pub download_photo: bool,
    pub download_video: bool,
    pub download_video_thumbnail: bool,
    pub download_audio: bool,
    pub download_text: bool,
    pub download_quote: bool,
    pub download_link: bool,
    pub download_conversation: bool,
    pub download_answer: bool,
    pub create_photo_meta: bool,
    pub create_video_meta: bool,
    pub create_audio_meta: bool,
    pub download_imgur: bool,
    pub download_gfycat: bool,
    pub download_webmshare: bool,
    pub download_uguu: bool,
    pub download_catbox: bool,
    pub download_reblogged_posts: bool,
    pub skip_gif: bool,
    pub regex_photos: bool,
    pub regex_videos: bool,
    /// Emit one metadata record per photo set instead of per photo.
    pub group_photo_sets: bool,
    /// Write raw post JSON next to the artifacts.
    pub dump_crawler_data: bool,
    /// Re-queue metadata records and repair links even when already known.
    pub force_rescan: bool,
    /// Treat files already present in the blog directory as downloaded.
    pub check_directory_for_files: bool,
    /// Append binary URLs to text files instead of fetching them.
    pub download_url_list: bool,

    /// Unique artifacts discovered, cumulative across incremental runs.
    pub total_count: u64,
    /// Artifacts persisted, cumulative.
    pub downloaded_items: u64,
    /// Artifacts persisted per kind, cumulative.
    pub downloaded: BTreeMap<ArtifactKind, u64>,
    /// Duplicate URLs dropped per kind during the last full crawl.
    pub duplicates: BTreeMap<ArtifactKind, u64>,
}

impl Default for Blog {
    fn default() -> Self {
        Self {
            name: String::new(),
            blog_type: HIDDEN_BLOG_TYPE.to_string(),
            title: String::new(),
            description: String::new(),
            online: false,
            last_id: 0,
            last_complete_crawl: None,
            latest_post: None,
            page_size: DEFAULT_PAGE_SIZE,
            download_pages: String::new(),
            download_from: String::new(),
            download_to: String::new(),
            tags: String::new(),
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            download_photo: true,
            download_video: true,
            download_video_thumbnail: false,
            download_audio: true,
            download_text: true,
            download_quote: true,
            download_link: true,
            download_conversation: true,
            download_answer: true,
            create_photo_meta: false,
            create_video_meta: false,
            create_audio_meta: false,
            download_imgur: false,
            download_gfycat: false,
            download_webmshare: false,
            download_uguu: false,
            download_catbox: false,
            download_reblogged_posts: true,
            skip_gif: false,
            regex_photos: false,
            regex_videos: false,
            group_photo_sets: false,
            dump_crawler_data: false,
            force_rescan: false,
            check_directory_for_files: false,
            download_url_list: false,
            total_count: 0,
            downloaded_items: 0,
            downloaded: BTreeMap::new(),
            duplicates: BTreeMap::new(),
        }
    }
}

impl Blog {
    /// Creates a blog with default options.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Page size clamped to the accepted range; out-of-range values become 100.
    #[must_use]
    pub fn page_size(&self) -> u32 {
        if PAGE_SIZE_RANGE.contains(&self.page_size) {
            self.page_size
        } else {
            DEFAULT_PAGE_SIZE
        }
    }

    /// Parsed tag filter, lower-cased, empties dropped.
    #[must_use]
    pub fn tag_filter(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Directory that holds this blog's artifacts.
    #[must_use]
    pub fn download_location(&self, download_root: &Path) -> PathBuf {
        download_root.join(&self.name)
    }

    /// Path of the persisted document inside `index_dir`.
    #[must_use]
    pub fn document_path(index_dir: &Path, name: &str) -> PathBuf {
        index_dir.join(format!("{name}{BLOG_FILE_SUFFIX}"))
    }

    /// Path of the blog's file database inside `index_dir`.
    #[must_use]
    pub fn files_db_path(index_dir: &Path, name: &str) -> PathBuf {
        index_dir.join(format!("{name}.files.db"))
    }

    /// Loads `name` from `index_dir`, or returns a fresh blog when absent.
    ///
    /// # Errors
    ///
    /// Returns [`BlogError`] when the name is unusable, the file cannot be
    /// read, or the JSON is invalid.
    #[instrument(skip(index_dir))]
    pub async fn load_or_new(index_dir: &Path, name: &str) -> Result<Self, BlogError> {
        validate_name(name)?;
        let path = Self::document_path(index_dir, name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no stored blog, starting fresh");
                return Ok(Self::new(name));
            }
            Err(e) => return Err(BlogError::io(path, e)),
        };
        let mut blog: Self =
            serde_json::from_str(&raw).map_err(|source| BlogError::Parse {
                path: path.clone(),
                source,
            })?;
        if blog.name != name {
            warn!(stored = %blog.name, requested = name, "blog file name mismatch, using requested name");
            blog.name = name.to_string();
        }
        Ok(blog)
    }

    /// Writes the document to `index_dir` through a temporary file and rename.
    ///
    /// # Errors
    ///
    /// Returns [`BlogError::Io`] when the directory or file cannot be written.
    #[instrument(skip(self, index_dir), fields(blog = %self.name))]
    pub async fn save(&self, index_dir: &Path) -> Result<(), BlogError> {
        validate_name(&self.name)?;
        tokio::fs::create_dir_all(index_dir)
            .await
            .map_err(|e| BlogError::io(index_dir, e))?;

        let path = Self::document_path(index_dir, &self.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self).map_err(|source| BlogError::Parse {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| BlogError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BlogError::io(&path, e))?;
        debug!(path = %path.display(), "blog saved");
        Ok(())
    }

    /// Merges a finished run's statistics.
    ///
    /// A full crawl (`incremental == false`) replaces `total_count` and the
    /// duplicate counters; an incremental one adds to them.
    pub fn apply_stats(&mut self, stats: &BlogStats, incremental: bool) {
        let unique = stats.unique_count();
        if incremental {
            self.total_count += unique;
        } else {
            self.total_count = unique;
            self.duplicates.clear();
        }
        for kind in ArtifactKind::ALL {
            let downloaded = stats.downloaded(kind);
            if downloaded > 0 {
                *self.downloaded.entry(kind).or_default() += downloaded;
                self.downloaded_items += downloaded;
            }
            let duplicates = stats.duplicates(kind);
            if duplicates > 0 {
                *self.duplicates.entry(kind).or_default() += duplicates;
            }
        }
    }
}

fn validate_name(name: &str) -> Result<(), BlogError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':'])
        && !name.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(BlogError::InvalidName {
            name: name.to_string(),
        })
    }
}

const KINDS: usize = ArtifactKind::ALL.len();

/// Counters shared by the crawler and downloader during one run.
#[derive(Debug)]
pub struct BlogStats {
    queued: [AtomicU64; KINDS],
    duplicates: [AtomicU64; KINDS],
    downloaded: [AtomicU64; KINDS],
    progress_changed: AtomicBool,
}

impl Default for BlogStats {
    fn default() -> Self {
        Self {
            queued: std::array::from_fn(|_| AtomicU64::new(0)),
            duplicates: std::array::from_fn(|_| AtomicU64::new(0)),
            downloaded: std::array::from_fn(|_| AtomicU64::new(0)),
            progress_changed: AtomicBool::new(false),
        }
    }
}

impl BlogStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an artifact handed to the post queue.
    pub fn record_queued(&self, kind: ArtifactKind) {
        self.queued[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an artifact whose URL was already seen in this run.
    pub fn record_duplicate(&self, kind: ArtifactKind) {
        self.duplicates[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a persisted artifact and flags the progress as changed.
    pub fn record_downloaded(&self, kind: ArtifactKind) {
        self.downloaded[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.progress_changed.store(true, Ordering::Release);
    }

    /// Artifacts queued for `kind`, duplicates included.
    #[must_use]
    pub fn queued(&self, kind: ArtifactKind) -> u64 {
        self.queued[kind.index()].load(Ordering::Relaxed)
    }

    /// Duplicates dropped for `kind`.
    #[must_use]
    pub fn duplicates(&self, kind: ArtifactKind) -> u64 {
        self.duplicates[kind.index()].load(Ordering::Relaxed)
    }

    /// Artifacts persisted for `kind`.
    #[must_use]
    pub fn downloaded(&self, kind: ArtifactKind) -> u64 {
        self.downloaded[kind.index()].load(Ordering::Relaxed)
    }

    /// Sum of persisted artifacts across kinds.
    #[must_use]
    pub fn total_downloaded(&self) -> u64 {
        ArtifactKind::ALL.iter().map(|k| self.downloaded(*k)).sum()
    }

    /// Queued artifacts minus duplicates.
    #[must_use]
    pub fn unique_count(&self) -> u64 {
        ArtifactKind::ALL
            .iter()
            .map(|k| self.queued(*k).saturating_sub(self.duplicates(*k)))
            .sum()
    }

    /// Returns and clears the progress-changed flag.
    pub fn take_progress_changed(&self) -> bool {
        self.progress_changed.swap(false, Ordering::AcqRel)
    }
}
