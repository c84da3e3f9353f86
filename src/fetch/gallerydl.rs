use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    failure_from_stderr, run_tool, FailureKind, FailureReason, FallbackFetcher, FetchResult,
    Fetched,
};
use crate::content_id::ContentKind;

const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "mp4", "webm", "mkv", "mov", "m4a", "mp3",
];

/// Fallback fetcher backed by gallery-dl.
///
/// Handles photo slideshows, which yt-dlp cannot fetch, and retries videos
/// the primary tier failed on.
#[derive(Debug, Clone)]
pub struct GalleryDl {
    program: String,
}

impl GalleryDl {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(url: &str, dest: &Path) -> Vec<String> {
        vec![
            url.to_string(),
            "--directory".to_string(),
            dest.to_string_lossy().to_string(),
            // Flat layout inside the collection folder
            "--filename".to_string(),
            "{category}_{id}_{num}.{extension}".to_string(),
            "--no-mtime".to_string(),
        ]
    }
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Media files directly inside `dir`. A missing directory has none.
async fn media_files(dir: &Path) -> HashSet<PathBuf> {
    let mut files = HashSet::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Failed to list output folder");
            }
            return files;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if is_media_file(&path) {
            files.insert(path);
        }
    }
    files
}

#[async_trait]
impl FallbackFetcher for GalleryDl {
    fn name(&self) -> &'static str {
        "gallery-dl"
    }

    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        scope: Option<&str>,
        photos_only: bool,
    ) -> FetchResult {
        if photos_only && ContentKind::of(url) != ContentKind::Photo {
            return Err(FailureReason::with_detail(
                FailureKind::WrongFileType,
                "not a photo post",
            ));
        }

        let before = media_files(dest).await;
        debug!(url, collection = scope.unwrap_or("-"), "Running gallery-dl");

        let output = run_tool(&self.program, &Self::args(url, dest), Some(dest)).await?;
        if !output.status.success() {
            return Err(failure_from_stderr(&String::from_utf8_lossy(&output.stderr)));
        }

        let mut written: Vec<PathBuf> = media_files(dest)
            .await
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect();
        written.sort();

        match written.into_iter().next() {
            Some(file) => Ok(Fetched {
                file: Some(file),
                speed_mib: None,
            }),
            None => Err(FailureReason::other("gallery-dl wrote no media files")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file(Path::new("/x/tiktok_1_1.jpg")));
        assert!(is_media_file(Path::new("/x/tiktok_1_1.MP4")));
        assert!(!is_media_file(Path::new("/x/tiktok_1.json")));
        assert!(!is_media_file(Path::new("/x/noext")));
    }

    #[tokio::test]
    async fn test_media_files_lists_only_media() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        let files = media_files(dir.path()).await;
        assert_eq!(files, HashSet::from([dir.path().join("a.jpg")]));
        assert!(media_files(&dir.path().join("missing")).await.is_empty());
    }

    #[tokio::test]
    async fn test_photos_only_rejects_videos_without_running() {
        let fetcher = GalleryDl::new("/nonexistent/gallery-dl-binary");
        let dir = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch("https://www.tiktok.com/@a/video/1", dir.path(), None, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::WrongFileType);
    }

    #[tokio::test]
    async fn test_missing_binary_is_other_failure() {
        let fetcher = GalleryDl::new("/nonexistent/gallery-dl-binary");
        let dir = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch("https://www.tiktok.com/@a/photo/1", dir.path(), Some("Travel"), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Other);
    }
}
