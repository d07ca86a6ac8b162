//! Media hosted on third-party sites and linked from post text.

use std::sync::LazyLock;

use regex::Regex;

use crate::blog::Blog;
use crate::queue::ArtifactKind;

#[allow(clippy::expect_used)]
static IMGUR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://i\.imgur\.com/[A-Za-z0-9]+\.(?:jpe?g|png|gifv?|mp4|webm)")
        .expect("imgur regex is valid")
});

#[allow(clippy::expect_used)]
static GFYCAT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:giant|zippy|fat|thumbs\d*)\.gfycat\.com/[A-Za-z0-9-]+\.(?:mp4|webm|gif)")
        .expect("gfycat regex is valid")
});

#[allow(clippy::expect_used)]
static WEBMSHARE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:www\.)?webmshare\.com/(?:play/)?([A-Za-z0-9]+)")
        .expect("webmshare regex is valid")
});

#[allow(clippy::expect_used)]
static UGUU_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:[a-z0-9]+\.)?uguu\.se/[A-Za-z0-9_-]+\.[A-Za-z0-9]+")
        .expect("uguu regex is valid")
});

#[allow(clippy::expect_used)]
static CATBOX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://files\.catbox\.moe/[A-Za-z0-9]+\.[A-Za-z0-9]+")
        .expect("catbox regex is valid")
});

/// Supported third-party hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedHost {
    Imgur,
    Gfycat,
    Webmshare,
    Uguu,
    Catbox,
}

impl EmbeddedHost {
    /// Every host, in search order.
    pub const ALL: [Self; 5] = [
        Self::Imgur,
        Self::Gfycat,
        Self::Webmshare,
        Self::Uguu,
        Self::Catbox,
    ];

    /// Whether the blog enabled downloads from this host.
    #[must_use]
    pub fn is_enabled(self, blog: &Blog) -> bool {
        match self {
            Self::Imgur => blog.download_imgur,
            Self::Gfycat => blog.download_gfycat,
            Self::Webmshare => blog.download_webmshare,
            Self::Uguu => blog.download_uguu,
            Self::Catbox => blog.download_catbox,
        }
    }

    /// Direct media URLs for this host found in `text`.
    #[must_use]
    pub fn find_urls(self, text: &str) -> Vec<String> {
        match self {
            Self::Webmshare => WEBMSHARE_PATTERN
                .captures_iter(text)
                .filter_map(|c| c.get(1))
                .map(|id| format!("https://s1.webmshare.com/{}.webm", id.as_str()))
                .collect(),
            Self::Imgur => IMGUR_PATTERN
                .find_iter(text)
                .map(|m| {
                    let url = m.as_str();
                    url.strip_suffix(".gifv")
                        .map_or_else(|| url.to_string(), |stem| format!("{stem}.mp4"))
                })
                .collect(),
            Self::Gfycat => collect(&GFYCAT_PATTERN, text),
            Self::Uguu => collect(&UGUU_PATTERN, text),
            Self::Catbox => collect(&CATBOX_PATTERN, text),
        }
    }
}

fn collect(pattern: &Regex, text: &str) -> Vec<String> {
    pattern.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// One media file found on a third-party host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedMedia {
    pub host: EmbeddedHost,
    pub url: String,
    pub kind: ArtifactKind,
}

/// Searches `text` for media on every host the blog enabled.
///
/// Results keep first-seen order; a URL appears once.
#[must_use]
pub fn find_embedded_media(blog: &Blog, text: &str) -> Vec<EmbeddedMedia> {
    let mut found: Vec<EmbeddedMedia> = Vec::new();
    for host in EmbeddedHost::ALL.into_iter().filter(|h| h.is_enabled(blog)) {
        for url in host.find_urls(text) {
            if found.iter().any(|m| m.url == url) {
                continue;
            }
            found.push(EmbeddedMedia {
                host,
                kind: kind_for_url(&url),
                url,
            });
        }
    }
    found
}

/// Artifact kind implied by a media URL's extension; images by default.
#[must_use]
pub fn kind_for_url(url: &str) -> ArtifactKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "webm" | "mov" | "m4v" | "mkv" => ArtifactKind::Video,
        "mp3" | "ogg" | "oga" | "wav" | "flac" | "m4a" | "opus" => ArtifactKind::Audio,
        _ => ArtifactKind::Photo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_hosts() -> Blog {
        let mut blog = Blog::new("b");
        blog.download_imgur = true;
        blog.download_gfycat = true;
        blog.download_webmshare = true;
        blog.download_uguu = true;
        blog.download_catbox = true;
        blog
    }

    #[test]
    fn test_webmshare_rewritten_to_direct_file() {
        let urls = EmbeddedHost::Webmshare.find_urls(r#"<a href="https://webmshare.com/play/abc12">x</a>"#);
        assert_eq!(urls, vec!["https://s1.webmshare.com/abc12.webm"]);
    }

    #[test]
    fn test_imgur_gifv_becomes_mp4() {
        let urls = EmbeddedHost::Imgur.find_urls("see https://i.imgur.com/AbC.gifv and https://i.imgur.com/x1.png");
        assert_eq!(
            urls,
            vec!["https://i.imgur.com/AbC.mp4", "https://i.imgur.com/x1.png"]
        );
    }

    #[test]
    fn test_find_respects_toggles_and_dedups() {
        let text = "https://files.catbox.moe/a1.mp4 https://files.catbox.moe/a1.mp4 \
                    https://a.uguu.se/file_1.mp3 https://giant.gfycat.com/Some-Cat.webm";
        let found = find_embedded_media(&all_hosts(), text);
        assert_eq!(found.len(), 3);
        assert!(found.iter().any(|m| m.host == EmbeddedHost::Uguu && m.kind == ArtifactKind::Audio));
        assert!(found.iter().any(|m| m.host == EmbeddedHost::Catbox && m.kind == ArtifactKind::Video));

        let mut blog = all_hosts();
        blog.download_catbox = false;
        blog.download_uguu = false;
        blog.download_gfycat = false;
        assert!(find_embedded_media(&blog, text).is_empty());
    }

    #[test]
    fn test_kind_for_url() {
        assert_eq!(kind_for_url("https://h/x.WEBM?x=1"), ArtifactKind::Video);
        assert_eq!(kind_for_url("https://h/x.jpg"), ArtifactKind::Photo);
        assert_eq!(kind_for_url("https://h/noext"), ArtifactKind::Photo);
    }
}
