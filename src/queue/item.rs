//! Queue item types: download artifacts and metadata snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::download::url_file_name;

/// Kind of artifact derived from a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Image file.
    Photo,
    /// Video file.
    Video,
    /// Audio file.
    Audio,
    /// Rendered text post.
    Text,
    /// Rendered quote post.
    Quote,
    /// Rendered link post.
    Link,
    /// Rendered chat post.
    Conversation,
    /// Rendered answer post.
    Answer,
    /// Rendered photo post metadata.
    PhotoMeta,
    /// Rendered video post metadata.
    VideoMeta,
    /// Rendered audio post metadata.
    AudioMeta,
}

impl ArtifactKind {
    /// All kinds, in counter order.
    pub const ALL: [Self; 11] = [
        Self::Photo,
        Self::Video,
        Self::Audio,
        Self::Text,
        Self::Quote,
        Self::Link,
        Self::Conversation,
        Self::Answer,
        Self::PhotoMeta,
        Self::VideoMeta,
        Self::AudioMeta,
    ];

    /// Position of this kind in [`ArtifactKind::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns the stable label used in logs and counters.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Quote => "quote",
            Self::Link => "link",
            Self::Conversation => "conversation",
            Self::Answer => "answer",
            Self::PhotoMeta => "photo_meta",
            Self::VideoMeta => "video_meta",
            Self::AudioMeta => "audio_meta",
        }
    }

    /// Returns true for kinds persisted as fetched bytes.
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Photo | Self::Video | Self::Audio)
    }

    /// Returns true for kinds gated by the stricter video connection cap.
    #[must_use]
    pub fn is_video(self) -> bool {
        self == Self::Video
    }

    /// File (inside the blog directory) that text kinds append to.
    ///
    /// Binary kinds use it only in URL-list mode.
    #[must_use]
    pub fn text_file_name(self) -> &'static str {
        match self {
            Self::Photo => "images.txt",
            Self::Video => "videos.txt",
            Self::Audio => "audios.txt",
            Self::Text => "texts.txt",
            Self::Quote => "quotes.txt",
            Self::Link => "links.txt",
            Self::Conversation => "conversations.txt",
            Self::Answer => "answers.txt",
            Self::PhotoMeta => "photo_meta.txt",
            Self::VideoMeta => "video_meta.txt",
            Self::AudioMeta => "audio_meta.txt",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the downloader has to persist for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPayload {
    /// Bytes fetched from a remote URL.
    Remote {
        /// URL the bytes are fetched from.
        url: String,
        /// URL the media was originally posted under, when it differs.
        posted_url: Option<String>,
    },
    /// Text appended to the kind's text file.
    Text {
        /// Rendered body.
        body: String,
    },
}

/// One concrete artifact derived from a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Bytes source or text body.
    pub payload: ItemPayload,
    /// Target file name inside the blog directory (post id for text kinds).
    pub filename: String,
    /// Id of the post this artifact came from.
    pub post_id: String,
    /// Post timestamp in unix seconds (0 when unknown).
    pub timestamp: i64,
}

impl DownloadItem {
    /// Creates a binary artifact.
    #[must_use]
    pub fn binary(
        kind: ArtifactKind,
        url: impl Into<String>,
        posted_url: Option<String>,
        post_id: impl Into<String>,
        timestamp: i64,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload: ItemPayload::Remote {
                url: url.into(),
                posted_url: posted_url.filter(|u| !u.is_empty()),
            },
            filename: filename.into(),
            post_id: post_id.into(),
            timestamp,
        }
    }

    /// Creates a text artifact keyed by its post id.
    #[must_use]
    pub fn text(
        kind: ArtifactKind,
        body: impl Into<String>,
        post_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let post_id = post_id.into();
        Self {
            kind,
            payload: ItemPayload::Text { body: body.into() },
            filename: post_id.clone(),
            post_id,
            timestamp,
        }
    }

    /// Remote URL for binary payloads.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match &self.payload {
            ItemPayload::Remote { url, .. } => Some(url),
            ItemPayload::Text { .. } => None,
        }
    }

    /// Last path segment of the remote URL; the primary file database key.
    #[must_use]
    pub fn filename_url(&self) -> Option<String> {
        self.url().map(url_file_name)
    }

    /// Last path segment of the posted URL; the secondary file database key.
    #[must_use]
    pub fn filename_original_url(&self) -> Option<String> {
        match &self.payload {
            ItemPayload::Remote {
                posted_url: Some(posted),
                ..
            } => Some(url_file_name(posted)),
            _ => None,
        }
    }
}

/// Raw post snapshot written next to the artifacts as `{filename}`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlerData<P> {
    /// Metadata file name (`*.json`).
    pub filename: String,
    /// Snapshot of the classified post.
    pub post: P,
}

impl<P> CrawlerData<P> {
    /// Pairs a post snapshot with its metadata file name.
    #[must_use]
    pub fn new(filename: impl Into<String>, post: P) -> Self {
        Self {
            filename: filename.into(),
            post,
        }
    }
}
