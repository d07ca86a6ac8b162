//! Post filters and explicit page lists.

use chrono::NaiveDate;
use tracing::warn;

use super::api::Post;
use crate::blog::Blog;

/// Per-post gates derived from the blog options.
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    blog_name: String,
    from: Option<i64>,
    to: Option<i64>,
    tags: Vec<String>,
    allow_reblogs: bool,
}

impl PostFilter {
    /// Builds the filter; unparsable date bounds are ignored with a warning.
    #[must_use]
    pub fn from_blog(blog: &Blog) -> Self {
        Self {
            blog_name: blog.name.clone(),
            from: parse_day(&blog.download_from, "download_from"),
            to: parse_day(&blog.download_to, "download_to")
                .map(|start| start + i64::from(SECONDS_PER_DAY)),
            tags: blog.tag_filter(),
            allow_reblogs: blog.download_reblogged_posts,
        }
    }

    /// All gates at once.
    #[must_use]
    pub fn accepts(&self, post: &Post) -> bool {
        self.within_time_span(post) && self.matches_tags(post) && self.reblog_allowed(post)
    }

    /// `from <= timestamp < to + 1 day`.
    #[must_use]
    pub fn within_time_span(&self, post: &Post) -> bool {
        self.from.is_none_or(|from| post.timestamp >= from)
            && self.to.is_none_or(|to| post.timestamp < to)
    }

    /// Any post tag equals a filter tag, ignoring case; empty filter passes.
    #[must_use]
    pub fn matches_tags(&self, post: &Post) -> bool {
        self.tags.is_empty()
            || post
                .tags
                .iter()
                .any(|tag| self.tags.contains(&tag.to_lowercase()))
    }

    /// Reblogs pass when enabled, and reblogs of the blog itself always pass.
    #[must_use]
    pub fn reblog_allowed(&self, post: &Post) -> bool {
        self.allow_reblogs
            || post
                .reblogged_from()
                .is_none_or(|origin| origin == self.blog_name)
    }
}

const SECONDS_PER_DAY: u32 = 86_400;

fn parse_day(value: &str, field: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match NaiveDate::parse_from_str(value, "%Y%m%d") {
        Ok(day) => day.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp()),
        Err(e) => {
            warn!(field, value, error = %e, "ignoring unparsable date bound");
            None
        }
    }
}

/// Parses `"1-3,7"` into zero-based page numbers `[0, 1, 2, 6]`.
///
/// Order is kept, duplicates and invalid parts are dropped.
#[must_use]
pub fn parse_page_list(list: &str) -> Vec<u64> {
    let mut pages = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let range = match part.split_once('-') {
            Some((start, end)) => start.trim().parse::<u64>().ok().zip(end.trim().parse().ok()),
            None => part.parse::<u64>().ok().map(|n| (n, n)),
        };
        match range {
            Some((start, end)) if start >= 1 && start <= end => {
                for page in start..=end {
                    if !pages.contains(&(page - 1)) {
                        pages.push(page - 1);
                    }
                }
            }
            _ => warn!(part, "ignoring invalid page range"),
        }
    }
    pages
}
