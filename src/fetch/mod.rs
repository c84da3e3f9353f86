//! External fetchers.
//!
//! The worker pool only sees the [`PrimaryFetcher`] and [`FallbackFetcher`]
//! contracts. The concrete implementations shell out to `yt-dlp` and
//! `gallery-dl` and turn their exit status and stderr into a
//! [`FailureReason`].

pub mod gallerydl;
pub mod ytdlp;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub use gallerydl::GalleryDl;
pub use ytdlp::YtDlp;

/// Classification of a failed fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Content is private, deleted or otherwise permanently unavailable.
    Private,
    RateLimited,
    Network,
    /// Only audio formats exist for this item.
    AudioOnly,
    /// The fetcher produced a file that is not the expected media type.
    WrongFileType,
    /// The network path is being blocked (HTTP 403 from the host).
    Blocked,
    Other,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::RateLimited => "rate limited",
            Self::Network => "network",
            Self::AudioOnly => "audio only",
            Self::WrongFileType => "wrong file type",
            Self::Blocked => "blocked",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fetch attempt failed, with optional tool output for the logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: Option<String>,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FailureReason {
    #[must_use]
    pub fn new(kind: FailureKind) -> Self {
        Self { kind, detail: None }
    }

    #[must_use]
    pub fn with_detail(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    #[must_use]
    pub fn private() -> Self {
        Self::new(FailureKind::Private)
    }

    #[must_use]
    pub fn other(detail: impl Into<String>) -> Self {
        Self::with_detail(FailureKind::Other, detail)
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.kind == FailureKind::Private
    }
}

/// A successful fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
    /// Media file written into the destination folder, when known.
    pub file: Option<PathBuf>,
    /// Average transfer speed reported by the tool, in MiB/s.
    pub speed_mib: Option<f64>,
}

pub type FetchResult = Result<Fetched, FailureReason>;

/// Fast fetcher tried first for every video item.
#[async_trait]
pub trait PrimaryFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch `url` into `dest`, writing exactly one media file on success.
    async fn fetch(&self, url: &str, dest: &Path) -> FetchResult;
}

/// Slower fetcher for photo posts and for items the primary tier gave up on.
#[async_trait]
pub trait FallbackFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch `url` into `dest`.
    ///
    /// With `photos_only`, a URL that is not a photo post fails without an
    /// attempt.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        scope: Option<&str>,
        photos_only: bool,
    ) -> FetchResult;
}

const PRIVATE_MARKERS: &[&str] = &[
    "Video not available",
    "status code 10204",
    "This video is private",
    "Video unavailable",
    "Unable to extract video data",
];

/// Map tool stderr to a failure kind, if it carries a known signal.
#[must_use]
pub fn classify_stderr(stderr: &str) -> Option<FailureKind> {
    if PRIVATE_MARKERS.iter().any(|m| stderr.contains(m)) {
        Some(FailureKind::Private)
    } else if stderr.contains("HTTP Error 403") {
        Some(FailureKind::Blocked)
    } else if stderr.contains("HTTP Error 429") {
        Some(FailureKind::RateLimited)
    } else if stderr.contains("Unable to download webpage") {
        Some(FailureKind::Network)
    } else {
        None
    }
}

/// Last non-empty stderr line, shortened for log output.
#[must_use]
pub fn stderr_summary(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(300).collect())
}

/// Turn a failed run into a reason, falling back to `Other` with the tail
/// of stderr.
#[must_use]
pub fn failure_from_stderr(stderr: &str) -> FailureReason {
    let kind = classify_stderr(stderr).unwrap_or(FailureKind::Other);
    FailureReason {
        kind,
        detail: stderr_summary(stderr),
    }
}

/// Run an external tool to completion and capture its output.
async fn run_tool(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
) -> Result<Output, FailureReason> {
    debug!(program, ?args, "Running external tool");
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    command
        .spawn()
        .map_err(|e| FailureReason::other(format!("failed to spawn {program}: {e}")))?
        .wait_with_output()
        .await
        .map_err(|e| FailureReason::other(format!("failed to wait for {program}: {e}")))
}

/// Check if an external tool can be started.
pub async fn is_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_private_markers() {
        for marker in PRIVATE_MARKERS {
            let stderr = format!("ERROR: [TikTok] 123: {marker}");
            assert_eq!(classify_stderr(&stderr), Some(FailureKind::Private), "{marker}");
        }
    }

    #[test]
    fn test_classify_network_and_blocks() {
        assert_eq!(
            classify_stderr("ERROR: Unable to download webpage: HTTP Error 403: Forbidden"),
            Some(FailureKind::Blocked)
        );
        assert_eq!(
            classify_stderr("ERROR: Unable to download webpage: <urlopen error timed out>"),
            Some(FailureKind::Network)
        );
        assert_eq!(
            classify_stderr("ERROR: HTTP Error 429: Too Many Requests"),
            Some(FailureKind::RateLimited)
        );
        assert_eq!(classify_stderr("ERROR: something odd"), None);
        assert_eq!(classify_stderr(""), None);
    }

    #[test]
    fn test_failure_from_stderr_keeps_last_line() {
        let reason = failure_from_stderr("WARNING: first\nERROR: unsupported URL\n\n");
        assert_eq!(reason.kind, FailureKind::Other);
        assert_eq!(reason.detail.as_deref(), Some("ERROR: unsupported URL"));
        assert_eq!(reason.to_string(), "other: ERROR: unsupported URL");
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(FailureReason::private().to_string(), "private");
        assert!(FailureReason::private().is_private());
    }
}
