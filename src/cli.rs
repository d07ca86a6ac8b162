//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use blogcrawl_core::crawler::{ClassifierOptions, ImageSize};
use blogcrawl_core::download::{
    DEFAULT_CONCURRENT_CONNECTIONS, DEFAULT_CONCURRENT_VIDEO_CONNECTIONS, DEFAULT_MAX_RETRIES,
    RetryPolicy,
};
use blogcrawl_core::{BlogOverrides, Settings};
use clap::Parser;
use url::Url;

use crate::app_config::FileConfig;

/// Default download root when neither the CLI nor the config file sets one.
pub const DEFAULT_DOWNLOAD_ROOT: &str = "./blogs";

/// Mirror the media and text of hidden blogs.
///
/// Each run crawls the blog's post timeline, downloads every artifact that
/// earlier runs have not, and remembers the newest post so the next run only
/// looks at what is new.
#[derive(Parser, Debug)]
#[command(name = "blogcrawl")]
#[command(author, version, about)]
pub struct Args {
    /// Blogs to crawl
    #[arg(required = true, value_name = "BLOG")]
    pub blogs: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/blogcrawl/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory that receives one sub-directory per blog
    #[arg(short = 'o', long, value_name = "DIR")]
    pub download_root: Option<PathBuf>,

    /// Directory for blog documents and file databases (default: <DOWNLOAD_ROOT>/index)
    #[arg(long, value_name = "DIR")]
    pub index_dir: Option<PathBuf>,

    /// Netscape-format cookie export of a logged-in session
    #[arg(long, value_name = "PATH")]
    pub cookies: Option<PathBuf>,

    /// Base URL of the remote service
    #[arg(long, value_name = "URL", hide = true)]
    pub api_base: Option<Url>,

    /// Blogs processed at the same time (1-16)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub concurrent_blogs: Option<u8>,

    /// Page walkers per blog (1-32)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrent_scans: Option<u8>,

    /// Total download connections, shared across blogs (1-200)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=200))]
    pub connections: Option<u16>,

    /// Total video connections, shared across blogs (1-64)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub video_connections: Option<u16>,

    /// Maximum attempts for transient download failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Page requests per minute (0 disables pacing)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(0..=6000))]
    pub limit_svc: Option<u32>,

    /// Photo width to download, or "best"
    #[arg(long, value_name = "WIDTH|best")]
    pub image_size: Option<ImageSize>,

    /// Video rendition height (480 or 1080)
    #[arg(long, value_parser = ["480", "1080"])]
    pub video_size: Option<String>,

    /// Posts per page (1-100)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub page_size: Option<u32>,

    /// Only crawl these pages, e.g. "1-3,7"
    #[arg(long, value_name = "LIST")]
    pub pages: Option<String>,

    /// Only posts on or after this day (YYYYMMDD)
    #[arg(long, value_name = "YYYYMMDD")]
    pub from: Option<String>,

    /// Only posts on or before this day (YYYYMMDD)
    #[arg(long, value_name = "YYYYMMDD")]
    pub to: Option<String>,

    /// Only posts carrying one of these comma-separated tags
    #[arg(long, value_name = "TAGS")]
    pub tags: Option<String>,

    /// File name template (%f original name, %b blog, %i post id, %d date, %x index)
    #[arg(long, value_name = "TEMPLATE")]
    pub template: Option<String>,

    /// Skip reblogged posts
    #[arg(long)]
    pub skip_reblogs: bool,

    /// Write a JSON snapshot next to each post's artifacts
    #[arg(long)]
    pub dump_crawler_data: bool,

    /// Crawl the whole timeline and rewrite existing metadata records
    #[arg(long)]
    pub force_rescan: bool,

    /// Skip artifacts whose file already exists in the blog directory
    #[arg(long)]
    pub check_directory: bool,

    /// Write media URLs to text files instead of downloading them
    #[arg(long)]
    pub url_list: bool,
}

impl Args {
    /// Process settings: flags first, then the config file, then defaults.
    pub fn settings(&self, file: Option<&FileConfig>) -> Result<Settings> {
        let file = file.cloned().unwrap_or_default();
        let download_root = self
            .download_root
            .clone()
            .or(file.download_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
        let mut settings = Settings::new(download_root);

        if let Some(index_dir) = self.index_dir.clone().or(file.index_dir) {
            settings.index_dir = index_dir;
        }
        settings.cookie_file = self.cookies.clone().or(file.cookie_file);
        if let Some(api_base) = &self.api_base {
            settings.api_base = api_base.clone();
        }
        if let Some(n) = self.concurrent_blogs.or(file.concurrent_blogs) {
            settings.concurrent_blogs = usize::from(n);
        }
        if let Some(n) = self.concurrent_scans.or(file.concurrent_scans) {
            settings.concurrent_scans = usize::from(n);
        }

        settings.downloader.concurrent_connections = self
            .connections
            .or(file.connections)
            .map_or(DEFAULT_CONCURRENT_CONNECTIONS, usize::from);
        settings.downloader.concurrent_video_connections = self
            .video_connections
            .or(file.video_connections)
            .map_or(DEFAULT_CONCURRENT_VIDEO_CONNECTIONS, usize::from);
        let max_retries = self
            .max_retries
            .or(file.max_retries)
            .map_or(DEFAULT_MAX_RETRIES, u32::from);
        settings.downloader.retry_policy = if max_retries == 0 {
            RetryPolicy::none()
        } else {
            RetryPolicy::with_max_attempts(max_retries)
        };

        match self.limit_svc.or(file.svc_requests_per_minute) {
            Some(0) => settings.svc_requests_per_minute = None,
            Some(n) => settings.svc_requests_per_minute = Some(n),
            None => {}
        }

        let video_size = match &self.video_size {
            Some(raw) => Some(raw.parse::<u32>().context("invalid --video-size")?),
            None => file.video_size,
        };
        let defaults = ClassifierOptions::default();
        settings.classifier = ClassifierOptions {
            image_size: self.image_size.or(file.image_size).unwrap_or(defaults.image_size),
            video_size: video_size.unwrap_or(defaults.video_size),
        };

        if let Some(secs) = file.connect_timeout_secs {
            settings.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.read_timeout_secs {
            settings.read_timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }

    /// Per-blog overrides carried by the flags.
    #[must_use]
    pub fn overrides(&self) -> BlogOverrides {
        let flag = |set: bool| set.then_some(true);
        BlogOverrides {
            blog_type: None,
            page_size: self.page_size,
            download_pages: self.pages.clone(),
            download_from: self.from.clone(),
            download_to: self.to.clone(),
            tags: self.tags.clone(),
            filename_template: self.template.clone(),
            download_reblogged_posts: self.skip_reblogs.then_some(false),
            dump_crawler_data: flag(self.dump_crawler_data),
            force_rescan: flag(self.force_rescan),
            check_directory_for_files: flag(self.check_directory),
            download_url_list: flag(self.url_list),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_requires_a_blog() {
        let err = Args::try_parse_from(["blogcrawl"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        assert_eq!(parse(&["blogcrawl", "-v", "a"]).verbose, 1);
        assert_eq!(parse(&["blogcrawl", "-vv", "a"]).verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["blogcrawl", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_scans_out_of_range_rejected() {
        let err = Args::try_parse_from(["blogcrawl", "--concurrent-scans", "0", "a"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_video_size_restricted() {
        assert!(Args::try_parse_from(["blogcrawl", "--video-size", "720", "a"]).is_err());
    }

    // ==================== Settings Tests ====================

    #[test]
    fn test_settings_defaults() {
        let settings = parse(&["blogcrawl", "a"]).settings(None).unwrap();
        assert_eq!(settings.download_root, PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
        assert_eq!(
            settings.downloader.concurrent_connections,
            DEFAULT_CONCURRENT_CONNECTIONS
        );
        assert!(settings.svc_requests_per_minute.is_some());
        assert!(settings.cookie_file.is_none());
    }

    #[test]
    fn test_flags_override_config_file() {
        let file = FileConfig {
            download_root: Some(PathBuf::from("/cfg")),
            connections: Some(8),
            concurrent_scans: Some(2),
            ..FileConfig::default()
        };
        let args = parse(&["blogcrawl", "-c", "12", "--limit-svc", "0", "a"]);
        let settings = args.settings(Some(&file)).unwrap();
        assert_eq!(settings.download_root, PathBuf::from("/cfg"));
        assert_eq!(settings.index_dir, PathBuf::from("/cfg/index"));
        assert_eq!(settings.downloader.concurrent_connections, 12);
        assert_eq!(settings.concurrent_scans, 2);
        assert!(settings.svc_requests_per_minute.is_none());
    }

    #[test]
    fn test_image_and_video_size() {
        let args = parse(&["blogcrawl", "--image-size", "best", "--video-size", "480", "a"]);
        let settings = args.settings(None).unwrap();
        assert_eq!(settings.classifier.image_size, ImageSize::Best);
        assert_eq!(settings.classifier.video_size, 480);
    }

    #[test]
    fn test_overrides_from_flags() {
        let args = parse(&[
            "blogcrawl",
            "--tags",
            "cats,dogs",
            "--force-rescan",
            "--skip-reblogs",
            "--pages",
            "1-2",
            "a",
            "b",
        ]);
        assert_eq!(args.blogs, vec!["a", "b"]);
        let overrides = args.overrides();
        assert_eq!(overrides.tags.as_deref(), Some("cats,dogs"));
        assert_eq!(overrides.force_rescan, Some(true));
        assert_eq!(overrides.download_reblogged_posts, Some(false));
        assert_eq!(overrides.download_pages.as_deref(), Some("1-2"));
        assert_eq!(overrides.dump_crawler_data, None);
    }
}
