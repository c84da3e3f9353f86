//! Content identifiers extracted from TikTok-style URLs.
//!
//! The identifier is the run of digits after a `/video/` or `/photo/` path
//! segment. It is the deduplication key for the logs and for a collection's
//! own source list, so two URLs for the same post compare equal whatever
//! their host variant, leading `@` or trailing slash.

use std::fmt;

use regex::Regex;

static ID_PATTERN: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"/(video|photo)/(\d+)").unwrap());

/// Canonical identifier of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(String);

impl ContentId {
    /// Extract the content identifier from a URL.
    ///
    /// Returns `None` when the URL carries no `/video/<digits>` or
    /// `/photo/<digits>` segment. Such URLs are never deduplicated.
    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.trim().trim_start_matches('@');
        ID_PATTERN
            .captures(url)
            .and_then(|caps| caps.get(2))
            .map(|m| Self(m.as_str().to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shorthand for [`ContentId::from_url`].
#[must_use]
pub fn identify(url: &str) -> Option<ContentId> {
    ContentId::from_url(url)
}

/// Whether two URLs reference the same content.
///
/// URLs without an identifier only match when the strings are identical.
#[must_use]
pub fn same_content(a: &str, b: &str) -> bool {
    match (identify(a), identify(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}

/// Kind of content a URL addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Photo slideshow page. The primary fetcher cannot handle these.
    Photo,
    /// Everything else, treated as a video.
    Video,
}

impl ContentKind {
    #[must_use]
    pub fn of(url: &str) -> Self {
        if url.contains("/photo/") {
            Self::Photo
        } else {
            Self::Video
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id() {
        assert_eq!(
            identify("https://www.tiktok.com/@user/video/7234567890123456789")
                .unwrap()
                .as_str(),
            "7234567890123456789"
        );
    }

    #[test]
    fn test_photo_id() {
        assert_eq!(
            identify("https://www.tiktok.com/@user/photo/123456").unwrap().as_str(),
            "123456"
        );
    }

    #[test]
    fn test_formatting_variants_are_equal() {
        let variants = [
            "https://www.tiktok.com/@cook/video/42",
            "https://tiktok.com/@cook/video/42/",
            "https://m.tiktok.com/@cook/video/42?is_copy_url=1",
            "@https://www.tiktok.com/@cook/video/42",
            "  https://www.tiktok.com/@other/video/42  ",
        ];
        for v in variants {
            assert_eq!(identify(v).unwrap().as_str(), "42", "variant: {v}");
        }
    }

    #[test]
    fn test_no_id() {
        assert_eq!(identify("https://vm.tiktok.com/ZMabc123/"), None);
        assert_eq!(identify("https://www.tiktok.com/@user"), None);
        assert_eq!(identify("https://www.tiktok.com/@user/video/"), None);
        assert_eq!(identify(""), None);
    }

    #[test]
    fn test_same_content() {
        assert!(same_content(
            "https://www.tiktok.com/@a/video/1",
            "https://tiktok.com/@b/video/1/"
        ));
        assert!(!same_content(
            "https://www.tiktok.com/@a/video/1",
            "https://www.tiktok.com/@a/video/2"
        ));
        assert!(same_content("https://vm.tiktok.com/x", "https://vm.tiktok.com/x"));
        assert!(!same_content("https://vm.tiktok.com/x", "https://vm.tiktok.com/y"));
    }

    #[test]
    fn test_content_kind() {
        assert_eq!(
            ContentKind::of("https://www.tiktok.com/@u/photo/9"),
            ContentKind::Photo
        );
        assert_eq!(
            ContentKind::of("https://www.tiktok.com/@u/video/9"),
            ContentKind::Video
        );
        assert_eq!(ContentKind::of("https://vm.tiktok.com/x"), ContentKind::Video);
    }
}
