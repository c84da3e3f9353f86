//! End-of-run statistics.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::collection::CollectionReport;
use crate::constants::{ERROR_LOG_PREFIX, SUMMARY_FILE};
use crate::logstore::{LogError, LogStore};
use crate::sync::SyncFailure;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub finished_at: DateTime<Utc>,
    pub input: PathBuf,
    /// Distinct content ids in the success log.
    pub unique_downloaded: usize,
    /// Private entries across all error logs.
    pub private: usize,
    /// Plain entries across all error logs.
    pub failed: usize,
    pub collections: Vec<CollectionReport>,
    pub sync_failures: Vec<SyncFailure>,
}

fn error_logs(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to list error logs");
            return Vec::new();
        }
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(ERROR_LOG_PREFIX))
        .map(|e| e.path())
        .collect();
    logs.sort();
    logs
}

impl RunSummary {
    /// Gather totals from the logs in `input_dir`. Blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the success log cannot be read.
    pub fn collect(
        store: &LogStore,
        input_dir: &Path,
        collections: Vec<CollectionReport>,
        sync_failures: Vec<SyncFailure>,
    ) -> Result<Self, LogError> {
        let unique_downloaded = store.downloaded_ids()?.len();

        let (mut private, mut failed) = (0, 0);
        for log in error_logs(input_dir) {
            for entry in store.error_entries(&log) {
                if entry.private {
                    private += 1;
                } else {
                    failed += 1;
                }
            }
        }

        Ok(Self {
            finished_at: Utc::now(),
            input: input_dir.to_path_buf(),
            unique_downloaded,
            private,
            failed,
            collections,
            sync_failures,
        })
    }

    /// Write the summary as pretty JSON into `dir`. Returns the file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn log(&self) {
        info!(
            unique_downloaded = self.unique_downloaded,
            private = self.private,
            failed = self.failed,
            collections = self.collections.len(),
            sync_failures = self.sync_failures.len(),
            "Run summary"
        );
        for failure in &self.sync_failures {
            warn!(
                folder = %failure.local.display(),
                error = %failure.error,
                "Folder was not archived"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstore::RetryPolicy;

    #[test]
    fn test_collect_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path().join("download_success.log"), RetryPolicy::default());
        store
            .log_success("https://www.tiktok.com/@a/video/1", Some("Cooking"), None)
            .unwrap();
        store
            .log_success("https://www.tiktok.com/@a/video/1", Some("Travel"), None)
            .unwrap();
        store
            .log_success("https://www.tiktok.com/@a/video/2", None, None)
            .unwrap();

        let cooking = dir.path().join("[error log] Cooking.txt");
        let travel = dir.path().join("[error log] Travel.txt");
        store.log_error("https://www.tiktok.com/@a/video/3", &cooking, true).unwrap();
        store.log_error("https://www.tiktok.com/@a/video/4", &cooking, false).unwrap();
        store.log_error("https://www.tiktok.com/@a/video/5", &travel, false).unwrap();

        let summary = RunSummary::collect(&store, dir.path(), Vec::new(), Vec::new()).unwrap();
        assert_eq!(summary.unique_downloaded, 2);
        assert_eq!(summary.private, 1);
        assert_eq!(summary.failed, 2);

        let path = summary.write(dir.path()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["unique_downloaded"], 2);
        assert_eq!(json["failed"], 2);
    }
}
