//! Text rendering of posts for the per-kind text files.

use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;

use super::api::Post;
use crate::queue::ArtifactKind;

#[allow(clippy::expect_used)]
static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("html tag regex is valid"));

#[allow(clippy::expect_used)]
static BREAK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(br|/p|/div|/li|/h[1-6])\s*/?>").expect("line break regex is valid")
});

/// Renders a post into the body appended to a text file.
pub trait TextExtractor: Send + Sync {
    /// Renders `post` for `kind`; only text kinds are ever passed.
    fn render(&self, kind: ArtifactKind, post: &Post) -> String;
}

/// Plain-text renderer: a header line per post, HTML stripped.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn render(&self, kind: ArtifactKind, post: &Post) -> String {
        let mut out = header(post);
        match kind {
            ArtifactKind::Text => {
                push_field(&mut out, "Title", &post.title);
                push_field(&mut out, "Body", &strip_html(&post.body));
            }
            ArtifactKind::Quote => {
                push_field(&mut out, "Quote", &strip_html(&post.text));
                push_field(&mut out, "Source", &strip_html(&post.source));
            }
            ArtifactKind::Link => {
                push_field(&mut out, "Link", &post.url);
                push_field(&mut out, "Title", &post.title);
                push_field(&mut out, "Description", &strip_html(&post.description));
            }
            ArtifactKind::Conversation => {
                push_field(&mut out, "Title", &post.title);
                for line in &post.dialogue {
                    let _ = writeln!(out, "{}: {}", line.label.trim_end_matches(':'), line.phrase);
                }
            }
            ArtifactKind::Answer => {
                push_field(&mut out, "Asker", &post.asking_name);
                push_field(&mut out, "Question", &strip_html(&post.question));
                push_field(&mut out, "Answer", &strip_html(&post.answer));
            }
            ArtifactKind::PhotoMeta => {
                for (index, photo) in post.photos.iter().enumerate() {
                    let url = photo
                        .original_size
                        .as_ref()
                        .or_else(|| photo.alt_sizes.first())
                        .map_or("", |size| size.url.as_str());
                    let _ = writeln!(out, "Photo {}: {url}", index + 1);
                    push_field(&mut out, "Photo caption", &strip_html(&photo.caption));
                }
                push_field(&mut out, "Caption", &strip_html(&post.caption));
            }
            ArtifactKind::VideoMeta => {
                push_field(&mut out, "Video", &post.video_url);
                push_field(&mut out, "Caption", &strip_html(&post.caption));
            }
            ArtifactKind::AudioMeta => {
                push_field(&mut out, "Audio", &post.audio_url);
                push_field(&mut out, "Artist", &post.artist);
                push_field(&mut out, "Album", &post.album);
                push_field(&mut out, "Track", &post.track_name);
                push_field(&mut out, "Caption", &strip_html(&post.caption));
            }
            ArtifactKind::Photo | ArtifactKind::Video | ArtifactKind::Audio => {}
        }
        out
    }
}

fn header(post: &Post) -> String {
    let date = DateTime::from_timestamp(post.timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| post.date.clone());
    let mut out = format!("Post ID: {}, Date: {date}\n", post.id);
    push_field(&mut out, "Post URL", &post.post_url);
    push_field(&mut out, "Slug", &post.slug);
    push_field(&mut out, "Reblog name", &post.reblogged_from_name);
    if !post.tags.is_empty() {
        let _ = writeln!(out, "Tags: {}", post.tags.join(", "));
    }
    out
}

fn push_field(out: &mut String, label: &str, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        let _ = writeln!(out, "{label}: {value}");
    }
}

/// Drops HTML tags, turning block ends into line breaks, and decodes the
/// common entities.
#[must_use]
pub fn strip_html(html: &str) -> String {
    let with_breaks = BREAK_PATTERN.replace_all(html, "\n");
    let text = TAG_PATTERN.replace_all(&with_breaks, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
