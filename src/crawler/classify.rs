//! Turns a post into download items and metadata records.
//!
//! [`PostClassifier`] applies the blog's content toggles:
//! - photo posts yield one photo per set member, at the configured width;
//! - video posts yield the video file and optionally its thumbnail;
//! - audio posts yield the audio file;
//! - text-like posts yield one rendered text item;
//! - trail content is searched for inline tumblr media and, when enabled,
//!   for generic media URLs and third-party hosts.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::api::{Photo, Post};
use super::embedded::find_embedded_media;
use super::text::TextExtractor;
use crate::blog::Blog;
use crate::download::{FilenameContext, build_file_name, is_default_template, url_file_name};
use crate::queue::{ArtifactKind, CrawlerData, DownloadItem};

#[allow(clippy::expect_used)]
static INLINE_PHOTO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[a-z0-9]+\.media\.tumblr\.com/[^\s"'<>]+?\.(?:jpe?g|png|pnj|gif|webp)"#)
        .expect("inline photo regex is valid")
});

#[allow(clippy::expect_used)]
static INLINE_VIDEO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://(?:v[a-z]*\.media\.tumblr\.com|vtt?\.tumblr\.com)/tumblr_[A-Za-z0-9_]+\.mp4"#)
        .expect("inline video regex is valid")
});

#[allow(clippy::expect_used)]
static GENERIC_PHOTO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+?\.(?:jpe?g|png|gif|webp)"#)
        .expect("generic photo regex is valid")
});

#[allow(clippy::expect_used)]
static GENERIC_VIDEO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+?\.(?:mp4|webm|mov)"#).expect("generic video regex is valid")
});

/// Photo width to pick from a post's alternative sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    /// The first (largest) alternative.
    Best,
    /// The alternative with exactly this width, else the first.
    Width(u32),
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::Width(1280)
    }
}

impl std::str::FromStr for ImageSize {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("best") {
            Ok(Self::Best)
        } else {
            s.trim().parse().map(Self::Width)
        }
    }
}

/// Process-wide classification settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierOptions {
    pub image_size: ImageSize,
    /// `480` selects the `_480` rendition of video files.
    pub video_size: u32,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            image_size: ImageSize::default(),
            video_size: 1080,
        }
    }
}

/// Items and metadata derived from one post.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub items: Vec<DownloadItem>,
    pub metadata: Vec<CrawlerData<Post>>,
}

impl Classification {
    /// True when the post produced nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.metadata.is_empty()
    }
}

/// Maps a post to artifacts.
pub trait ItemClassifier: Send + Sync {
    /// Classifies `post`; never fails, unusable parts are skipped.
    fn classify(&self, post: &Post) -> Classification;
}

/// Default classifier driven by the blog's toggles.
pub struct PostClassifier {
    blog: Arc<Blog>,
    text: Arc<dyn TextExtractor>,
    options: ClassifierOptions,
}

impl std::fmt::Debug for PostClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostClassifier")
            .field("blog", &self.blog.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PostClassifier {
    #[must_use]
    pub fn new(blog: Arc<Blog>, text: Arc<dyn TextExtractor>, options: ClassifierOptions) -> Self {
        Self {
            blog,
            text,
            options,
        }
    }
}

impl ItemClassifier for PostClassifier {
    fn classify(&self, post: &Post) -> Classification {
        let mut out = Collector::new(&self.blog, post);
        let inline = post.inline_text();

        self.photos(post, &inline, &mut out);
        self.videos(post, &inline, &mut out);
        self.audio(post, &mut out);
        self.text_items(post, &mut out);

        for media in find_embedded_media(&self.blog, &inline) {
            out.binary(media.kind, &media.url, None);
        }
        out.finish()
    }
}

impl PostClassifier {
    fn photos(&self, post: &Post, inline: &str, out: &mut Collector<'_>) {
        let blog = &self.blog;
        if !blog.download_photo {
            return;
        }
        if post.post_type == "photo" {
            self.photo_set(post, out);
        }
        for m in INLINE_PHOTO_PATTERN.find_iter(inline) {
            self.inline_photo(m.as_str(), out);
        }
        if blog.regex_photos {
            for m in GENERIC_PHOTO_PATTERN.find_iter(inline) {
                self.inline_photo(m.as_str(), out);
            }
        }
    }

    fn inline_photo(&self, url: &str, out: &mut Collector<'_>) {
        if self.blog.skip_gif && is_gif(url) {
            return;
        }
        if out.binary(ArtifactKind::Photo, url, None) {
            out.metadata(json_name(url));
        }
    }

    fn photo_set(&self, post: &Post, out: &mut Collector<'_>) {
        let numbered = !post
            .photos
            .first()
            .and_then(|p| p.alt_sizes.first())
            .is_some_and(|size| url_file_name(&size.url).starts_with("tumblr_"));
        let default_template = is_default_template(&self.blog.filename_template);

        let mut index: u32 = 1;
        let mut json_saved = false;
        for photo in &post.photos {
            let Some(url) = self.pick_size(photo) else {
                continue;
            };
            if self.blog.skip_gif && is_gif(url) {
                continue;
            }
            let slot = numbered.then_some(index);
            out.binary(ArtifactKind::Photo, url, slot);
            let per_photo = !self.blog.group_photo_sets && !(default_template && !numbered);
            if !json_saved || per_photo {
                json_saved = true;
                out.metadata(json_name(url));
            }
            if numbered {
                index += 1;
            }
        }
    }

    fn pick_size<'p>(&self, photo: &'p Photo) -> Option<&'p str> {
        let first = photo
            .alt_sizes
            .first()
            .or(photo.original_size.as_ref())
            .map(|s| s.url.as_str())
            .filter(|u| !u.is_empty());
        match self.options.image_size {
            ImageSize::Best => first,
            ImageSize::Width(width) => photo
                .alt_sizes
                .iter()
                .find(|s| s.width == width && !s.url.is_empty())
                .map(|s| s.url.as_str())
                .or(first),
        }
    }

    fn videos(&self, post: &Post, inline: &str, out: &mut Collector<'_>) {
        let blog = &self.blog;
        if !blog.download_video && !blog.download_video_thumbnail {
            return;
        }
        if post.post_type == "video" && !post.video_url.is_empty() {
            let video_url = self.video_rendition(&post.video_url);
            if blog.download_video {
                out.binary(ArtifactKind::Video, &video_url, None);
                out.metadata(json_name(&video_url));
            }
            if blog.download_video_thumbnail && !post.thumbnail_url.is_empty() {
                out.binary(ArtifactKind::Photo, &post.thumbnail_url, None);
                if !blog.download_video {
                    out.metadata(json_name(&video_url));
                }
            }
        }
        if !blog.download_video {
            return;
        }
        for m in INLINE_VIDEO_PATTERN.find_iter(inline) {
            let url = self.video_rendition(m.as_str());
            if out.binary(ArtifactKind::Video, &url, None) {
                out.metadata(json_name(&url));
            }
        }
        if blog.regex_videos {
            for m in GENERIC_VIDEO_PATTERN.find_iter(inline) {
                out.binary(ArtifactKind::Video, m.as_str(), None);
            }
        }
    }

    fn video_rendition(&self, url: &str) -> String {
        if self.options.video_size == 480 && !url.contains("_480") {
            url.replace(".mp4", "_480.mp4")
        } else {
            url.to_string()
        }
    }

    fn audio(&self, post: &Post, out: &mut Collector<'_>) {
        if !self.blog.download_audio || post.post_type != "audio" || post.audio_url.is_empty() {
            return;
        }
        let url = if post.audio_url.ends_with(".mp3") {
            post.audio_url.clone()
        } else {
            format!("{}.mp3", post.audio_url)
        };
        out.binary(ArtifactKind::Audio, &url, None);
        out.metadata(json_name(&url));
    }

    fn text_items(&self, post: &Post, out: &mut Collector<'_>) {
        let blog = &self.blog;
        let kinds = [
            (ArtifactKind::Text, "text", blog.download_text),
            (ArtifactKind::Quote, "quote", blog.download_quote),
            (ArtifactKind::Link, "link", blog.download_link),
            (ArtifactKind::Conversation, "chat", blog.download_conversation),
            (ArtifactKind::Answer, "answer", blog.download_answer),
            (ArtifactKind::PhotoMeta, "photo", blog.create_photo_meta),
            (ArtifactKind::VideoMeta, "video", blog.create_video_meta),
            (ArtifactKind::AudioMeta, "audio", blog.create_audio_meta),
        ];
        for (kind, post_type, enabled) in kinds {
            if enabled && post.post_type == post_type {
                let body = self.text.render(kind, post);
                out.items
                    .push(DownloadItem::text(kind, body, &post.id, post.timestamp));
                out.metadata(format!("{}.json", post.id));
            }
        }
    }
}

/// Accumulates one post's results, dropping repeated URLs and record names.
struct Collector<'a> {
    blog: &'a Blog,
    post: &'a Post,
    items: Vec<DownloadItem>,
    metadata: Vec<CrawlerData<Post>>,
    seen_urls: HashSet<String>,
    seen_records: HashSet<String>,
}

impl<'a> Collector<'a> {
    fn new(blog: &'a Blog, post: &'a Post) -> Self {
        Self {
            blog,
            post,
            items: Vec::new(),
            metadata: Vec::new(),
            seen_urls: HashSet::new(),
            seen_records: HashSet::new(),
        }
    }

    /// Adds a binary item; false when the URL was already added for this post.
    fn binary(&mut self, kind: ArtifactKind, url: &str, index: Option<u32>) -> bool {
        if !self.seen_urls.insert(url.to_string()) {
            return false;
        }
        let post = self.post;
        let ctx = FilenameContext {
            blog: &self.blog.name,
            post_id: &post.id,
            timestamp: post.timestamp,
            slug: &post.slug,
            tags: &post.tags,
            reblogged_from: &post.reblogged_from_name,
        };
        let filename = build_file_name(&self.blog.filename_template, url, &ctx, index);
        self.items.push(DownloadItem::binary(
            kind,
            url,
            None,
            &post.id,
            post.timestamp,
            filename,
        ));
        true
    }

    fn metadata(&mut self, filename: String) {
        if self.seen_records.insert(filename.clone()) {
            self.metadata
                .push(CrawlerData::new(filename, self.post.clone()));
        }
    }

    fn finish(self) -> Classification {
        Classification {
            items: self.items,
            metadata: self.metadata,
        }
    }
}

fn is_gif(url: &str) -> bool {
    url_file_name(url).to_ascii_lowercase().ends_with(".gif")
}

/// Metadata record name for a media URL: its file name with a `.json` extension.
#[must_use]
pub fn json_name(url: &str) -> String {
    let name = url_file_name(url);
    Path::new(&name)
        .with_extension("json")
        .to_string_lossy()
        .into_owned()
}
