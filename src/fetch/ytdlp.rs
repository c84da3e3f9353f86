use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    classify_stderr, failure_from_stderr, run_tool, FailureKind, FailureReason, FetchResult,
    Fetched, PrimaryFetcher,
};
use crate::content_id::identify;

/// Maximum bytes of the title kept in output file names.
const MAX_TITLE_BYTES: usize = 70;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov"];

/// Primary fetcher backed by yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn format_check_args(url: &str) -> Vec<String> {
        vec!["--list-formats".to_string(), url.to_string()]
    }

    fn download_args(url: &str, dest: &Path) -> Vec<String> {
        vec![
            "--windows-filenames".to_string(),
            "--newline".to_string(),
            "-o".to_string(),
            output_template(url, dest),
            url.to_string(),
        ]
    }
}

/// `<dest>/<uploader> - <title> <id>.<ext>`, with the id omitted for URLs
/// that carry none.
fn output_template(url: &str, dest: &Path) -> String {
    let suffix = identify(url).map(|id| format!(" {id}")).unwrap_or_default();
    dest.join(format!(
        "%(uploader)s - %(title).{MAX_TITLE_BYTES}B{suffix}.%(ext)s"
    ))
    .to_string_lossy()
    .to_string()
}

fn is_audio_only(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("audio only") || lower.contains("no video formats found")
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// What a finished download printed on stdout.
#[derive(Debug, Default, PartialEq)]
struct DownloadReport {
    destination: Option<PathBuf>,
    speed_mib: Option<f64>,
}

/// Parse destination and final speed from yt-dlp stdout.
///
/// Relevant lines:
/// - `[download] Destination: /out/user - title 123.mp4`
/// - `[download] 100% of 4.20MiB in 00:00:02 at 1.95MiB/s`
fn parse_download_output(stdout: &str) -> DownloadReport {
    let mut report = DownloadReport::default();
    for line in stdout.lines() {
        if let Some((_, dest)) = line.split_once("[download] Destination:") {
            report.destination = Some(PathBuf::from(dest.trim()));
        } else if line.contains("[download] 100%") && line.contains(" in ") {
            if let Some(speed) = line
                .split_once(" at ")
                .and_then(|(_, rest)| rest.split("MiB/s").next())
                .and_then(|s| s.trim().parse::<f64>().ok())
            {
                report.speed_mib = Some(speed);
            }
        }
    }
    report
}

#[async_trait]
impl PrimaryFetcher for YtDlp {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch(&self, url: &str, dest: &Path) -> FetchResult {
        // Format pre-check: cheap way to learn about private or blocked items
        let check = run_tool(&self.program, &Self::format_check_args(url), None).await?;
        let stderr = String::from_utf8_lossy(&check.stderr);
        if classify_stderr(&stderr).is_some() {
            return Err(failure_from_stderr(&stderr));
        }
        if !check.stdout.is_empty() && is_audio_only(&stderr) {
            return Err(FailureReason::new(FailureKind::AudioOnly));
        }

        debug!(url, dest = %dest.display(), "Running yt-dlp download");
        let output = run_tool(&self.program, &Self::download_args(url, dest), None).await?;
        if !output.status.success() {
            return Err(failure_from_stderr(&String::from_utf8_lossy(&output.stderr)));
        }

        let report = parse_download_output(&String::from_utf8_lossy(&output.stdout));
        if let Some(file) = &report.destination {
            if !is_video_file(file) {
                if let Err(e) = tokio::fs::remove_file(file).await {
                    warn!(file = %file.display(), error = %e, "Failed to remove non-video download");
                }
                return Err(FailureReason::with_detail(
                    FailureKind::WrongFileType,
                    file.display().to_string(),
                ));
            }
        }

        Ok(Fetched {
            file: report.destination,
            speed_mib: report.speed_mib,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_template() {
        let template = output_template(
            "https://www.tiktok.com/@cook/video/42",
            Path::new("/data/Cooking"),
        );
        assert_eq!(template, "/data/Cooking/%(uploader)s - %(title).70B 42.%(ext)s");

        let template = output_template("https://vm.tiktok.com/ZMabc/", Path::new("/data/x"));
        assert_eq!(template, "/data/x/%(uploader)s - %(title).70B.%(ext)s");
    }

    #[test]
    fn test_parse_download_output() {
        let stdout = "\
[TikTok] Extracting URL: https://www.tiktok.com/@cook/video/42
[download] Destination: /data/Cooking/cook - pasta 42.mp4
[download]  50.0% of 4.20MiB at 1.00MiB/s ETA 00:02
[download] 100% of 4.20MiB in 00:00:02 at 1.95MiB/s
";
        let report = parse_download_output(stdout);
        assert_eq!(
            report.destination,
            Some(PathBuf::from("/data/Cooking/cook - pasta 42.mp4"))
        );
        assert_eq!(report.speed_mib, Some(1.95));
    }

    #[test]
    fn test_parse_download_output_without_speed() {
        let report = parse_download_output("[download] x has already been downloaded\n");
        assert_eq!(report, DownloadReport::default());
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("a.mp4")));
        assert!(is_video_file(Path::new("a.MKV")));
        assert!(!is_video_file(Path::new("a.m4a")));
        assert!(!is_video_file(Path::new("a")));
    }

    #[test]
    fn test_audio_only() {
        assert!(is_audio_only("WARNING: Only audio only formats available"));
        assert!(is_audio_only("ERROR: No video formats found!"));
        assert!(!is_audio_only("ERROR: HTTP Error 429"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_other_failure() {
        let fetcher = YtDlp::new("/nonexistent/yt-dlp-binary");
        let dir = tempfile::tempdir().unwrap();
        let err = fetcher
            .fetch("https://www.tiktok.com/@a/video/1", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Other);
        assert!(err.detail.unwrap().contains("failed to spawn"));
    }
}
