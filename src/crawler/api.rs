//! Typed, lenient view of the dashboard JSON endpoint.
//!
//! Only the fields the crawler reads are modelled. Every field defaults when
//! missing or `null`, and post ids are accepted as numbers or strings, so a
//! partially malformed post degrades to empty values instead of failing the
//! whole page.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

/// Default API host.
pub const DEFAULT_API_BASE: &str = "https://www.tumblr.com";

#[allow(clippy::expect_used)]
static FORM_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"id="tumblr_form_key"\s+content="([^"]+)""#).expect("form key regex is valid")
});

#[allow(clippy::expect_used)]
static FORM_KEY_REVERSED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"content="([^"]+)"\s+id="tumblr_form_key""#).expect("form key regex is valid")
});

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }
    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(n)) => n.to_string(),
        Some(RawId::Text(s)) => s,
        None => String::new(),
    })
}

/// Whole page response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageResponse {
    /// Status envelope.
    #[serde(deserialize_with = "null_as_default")]
    pub meta: Meta,
    /// Payload.
    #[serde(deserialize_with = "null_as_default")]
    pub response: PageBody,
}

/// Status envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    /// HTTP-like status code.
    pub status: u16,
    /// Status message.
    #[serde(deserialize_with = "null_as_default")]
    pub msg: String,
}

/// Payload holding the posts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageBody {
    /// Posts, newest first.
    #[serde(deserialize_with = "null_as_default")]
    pub posts: Vec<Post>,
}

/// Blog descriptor embedded in each post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlogInfo {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
}

/// One rendition of a photo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AltSize {
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// One photo of a photo post, renditions largest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Photo {
    #[serde(deserialize_with = "null_as_default")]
    pub caption: String,
    #[serde(deserialize_with = "null_as_default")]
    pub alt_sizes: Vec<AltSize>,
    pub original_size: Option<AltSize>,
}

/// One line of a chat post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dialogue {
    #[serde(deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub phrase: String,
}

/// One entry of the reblog trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailEntry {
    #[serde(deserialize_with = "null_as_default")]
    pub content_raw: String,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
}

/// One post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    /// Numeric post id as text.
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    /// `photo`, `video`, `audio`, `text`, `quote`, `link`, `chat`, `answer`.
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub post_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub blog_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub blog: BlogInfo,
    #[serde(deserialize_with = "null_as_default")]
    pub post_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub slug: String,
    /// Unix seconds.
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_pinned: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub reblogged_from_name: String,

    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(deserialize_with = "null_as_default")]
    pub caption: String,

    #[serde(deserialize_with = "null_as_default")]
    pub photos: Vec<Photo>,

    #[serde(deserialize_with = "null_as_default")]
    pub video_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnail_url: String,

    #[serde(deserialize_with = "null_as_default")]
    pub audio_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub artist: String,
    #[serde(deserialize_with = "null_as_default")]
    pub album: String,
    #[serde(deserialize_with = "null_as_default")]
    pub track_name: String,

    /// Quote text.
    #[serde(deserialize_with = "null_as_default")]
    pub text: String,
    /// Quote source.
    #[serde(deserialize_with = "null_as_default")]
    pub source: String,

    /// Link target.
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,

    #[serde(deserialize_with = "null_as_default")]
    pub dialogue: Vec<Dialogue>,

    #[serde(deserialize_with = "null_as_default")]
    pub asking_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub question: String,
    #[serde(deserialize_with = "null_as_default")]
    pub answer: String,

    #[serde(deserialize_with = "null_as_default")]
    pub trail: Vec<TrailEntry>,
}

impl Post {
    /// Numeric id; `None` when the id is not a number.
    #[must_use]
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.parse().ok()
    }

    /// Raw trail content joined by spaces; searched for inline media.
    #[must_use]
    pub fn inline_text(&self) -> String {
        self.trail
            .iter()
            .map(|t| t.content_raw.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reblog origin, `None` for original posts.
    #[must_use]
    pub fn reblogged_from(&self) -> Option<&str> {
        Some(self.reblogged_from_name.as_str()).filter(|n| !n.is_empty())
    }
}

impl PageResponse {
    /// Posts of the page.
    #[must_use]
    pub fn posts(&self) -> &[Post] {
        &self.response.posts
    }

    /// Newest post that is not pinned to the top of the blog.
    #[must_use]
    pub fn first_unpinned(&self) -> Option<&Post> {
        self.response.posts.iter().find(|p| !p.is_pinned)
    }

    /// Id of the newest non-pinned post; 0 when absent or not numeric.
    #[must_use]
    pub fn highest_post_id(&self) -> u64 {
        self.first_unpinned()
            .and_then(Post::numeric_id)
            .unwrap_or_default()
    }
}

/// Decodes a page body.
///
/// # Errors
///
/// Returns the JSON error when the body is not a JSON object of the expected
/// overall shape.
pub fn decode_page(body: &str) -> Result<PageResponse, serde_json::Error> {
    serde_json::from_str(body)
}

/// Builds the paginated endpoint URL.
#[must_use]
pub fn page_url(api_base: &Url, blog: &str, limit: u32, offset: u64) -> String {
    let base = api_base.as_str().trim_end_matches('/');
    format!(
        "{base}/svc/indash_blog?tumblelog_name_or_id={}&post_id=&limit={limit}&offset={offset}&should_bypass_safemode=true",
        urlencoding::encode(blog)
    )
}

/// Dashboard page of `blog`; used as referer and for form-key discovery.
#[must_use]
pub fn dashboard_url(api_base: &Url, blog: &str) -> String {
    let base = api_base.as_str().trim_end_matches('/');
    format!("{base}/dashboard/blog/{}", urlencoding::encode(blog))
}

/// Extracts the `tumblr_form_key` meta tag content from an HTML document.
#[must_use]
pub fn extract_form_key(html: &str) -> Option<String> {
    FORM_KEY_PATTERN
        .captures(html)
        .or_else(|| FORM_KEY_REVERSED_PATTERN.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_lenient_page() {
        let body = r#"{
            "meta": {"status": 200, "msg": "OK"},
            "response": {"posts": [
                {"id": 123, "type": "photo", "is_pinned": true, "tags": null},
                {"id": "122", "type": "text", "body": null, "reblogged_from_name": null,
                 "trail": [{"content_raw": "<p>a</p>"}, {"content_raw": "<p>b</p>"}]}
            ]}
        }"#;
        let page = decode_page(body).unwrap();
        assert_eq!(page.meta.status, 200);
        assert_eq!(page.posts().len(), 2);
        assert_eq!(page.posts()[0].id, "123");
        assert!(page.posts()[0].tags.is_empty());
        assert_eq!(page.highest_post_id(), 122);
        assert_eq!(page.posts()[1].inline_text(), "<p>a</p> <p>b</p>");
        assert_eq!(page.posts()[1].reblogged_from(), None);
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(decode_page("<html>").is_err());
    }

    #[test]
    fn test_empty_page_has_no_highest_id() {
        let page = decode_page(r#"{"response": {"posts": []}}"#).unwrap();
        assert_eq!(page.highest_post_id(), 0);
        assert!(page.first_unpinned().is_none());
    }

    #[test]
    fn test_page_url_format() {
        let base = Url::parse("https://www.tumblr.com/").unwrap();
        assert_eq!(
            page_url(&base, "some blog", 50, 100),
            "https://www.tumblr.com/svc/indash_blog?tumblelog_name_or_id=some%20blog&post_id=&limit=50&offset=100&should_bypass_safemode=true"
        );
        assert_eq!(
            dashboard_url(&base, "b"),
            "https://www.tumblr.com/dashboard/blog/b"
        );
    }

    #[test]
    fn test_extract_form_key_both_attribute_orders() {
        let html = r#"<meta name="tumblr-form-key" id="tumblr_form_key" content="abc123">"#;
        assert_eq!(extract_form_key(html).as_deref(), Some("abc123"));
        let html = r#"<meta content="xyz" id="tumblr_form_key">"#;
        assert_eq!(extract_form_key(html).as_deref(), Some("xyz"));
        assert_eq!(extract_form_key("<html></html>"), None);
    }
}
