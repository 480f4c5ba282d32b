#![forbid(unsafe_code)]

//! Classifies user-supplied `song` parameters and normalizes them to
//! canonical YouTube watch URLs.
//!
//! Three input shapes are recognized: a bare 11-character video ID, one of
//! the supported YouTube URL forms, or free text that must later be resolved
//! through a search. Everything else in the crate works with the canonical
//! `https://www.youtube.com/watch?v=<id>` form.

use regex::Regex;
use std::sync::LazyLock;

static VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid video id pattern"));

// Scheme and `www.` are both optional in every shape.
static URL_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(https?://)?(www\.)?youtube\.com/watch\?v=[\w-]+",
        r"^(https?://)?youtu\.be/[\w-]+",
        r"^(https?://)?(www\.)?youtube\.com/shorts/[\w-]+",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid url pattern"))
    .collect()
});

static VIDEO_ID_IN_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/shorts/)([A-Za-z0-9_-]{11})")
        .expect("valid extraction pattern")
});

/// How a raw `song` parameter should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SongIdentifier {
    /// A bare 11-character video ID.
    VideoId(String),
    /// A URL matching one of the supported YouTube shapes.
    Url(String),
    /// Free text that needs a search to resolve.
    Query(String),
}

pub fn classify(input: &str) -> SongIdentifier {
    let trimmed = input.trim();
    if is_video_id(trimmed) {
        SongIdentifier::VideoId(trimmed.to_string())
    } else if validate_url(trimmed) {
        SongIdentifier::Url(trimmed.to_string())
    } else {
        SongIdentifier::Query(trimmed.to_string())
    }
}

pub fn is_video_id(value: &str) -> bool {
    VIDEO_ID_RE.is_match(value)
}

/// True only for the watch/short-link/shorts URL shapes; playlists, channel
/// pages and arbitrary youtube.com paths are treated as free text.
pub fn validate_url(value: &str) -> bool {
    URL_SHAPES.iter().any(|shape| shape.is_match(value))
}

/// Pulls the 11-character video ID out of a supported URL. `None` means the
/// URL carries no usable ID, which is fatal for downloads.
pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_IN_URL_RE
        .captures(url)
        .map(|captures| captures[1].to_string())
}

pub fn canonical_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Strips everything outside a conservative allow-list before the query is
/// embedded in a `ytsearch` argument. The argument vector already prevents
/// shell interpretation; this additionally keeps yt-dlp's own query parsing
/// predictable.
pub fn sanitize_query(query: &str) -> String {
    query
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '-' | '\'' | '"' | '.' | ',' | '(' | ')')
        })
        .collect()
}
