//! Integration tests for folder archival.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use collection_archiver::sync::{
    sync_folder, ArchiveError, RemoteArchive, SyncQueue, SyncStatus, SyncTask,
};

/// Fails the first `failures` copies, then succeeds. Records the file names
/// present in the folder at copy time.
#[derive(Default)]
struct FlakyArchive {
    failures: usize,
    attempts: AtomicUsize,
    seen: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl RemoteArchive for FlakyArchive {
    async fn copy(
        &self,
        local: &Path,
        remote: &str,
        _include: &[&str],
    ) -> Result<(), ArchiveError> {
        let mut names: Vec<String> = std::fs::read_dir(local)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        self.seen.lock().unwrap().push((remote.to_string(), names));

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ArchiveError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "connection reset".to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, _remote: &str) -> Result<Vec<String>, ArchiveError> {
        Ok(Vec::new())
    }
}

fn folder_with_files(root: &Path, name: &str, files: &[&str]) -> PathBuf {
    let folder = root.join(name);
    std::fs::create_dir(&folder).expect("Failed to create folder");
    for file in files {
        std::fs::write(folder.join(file), b"media").expect("Failed to write file");
    }
    folder
}

fn task(local: &Path) -> SyncTask {
    SyncTask {
        local: local.to_path_buf(),
        namespace: "alice".to_string(),
    }
}

#[tokio::test]
async fn test_folder_survives_repeated_copy_failures() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let folder = folder_with_files(dir.path(), "Cooking", &["1.mp4", "2.mp4"]);
    let archive = FlakyArchive {
        failures: 5,
        ..FlakyArchive::default()
    };

    for _ in 0..5 {
        let status = sync_folder(&archive, "remote:/base", &task(&folder)).await;
        assert!(matches!(status, SyncStatus::Failed(_)));
        assert!(folder.is_dir());
        assert_eq!(std::fs::read_dir(&folder).unwrap().count(), 2);
    }

    let status = sync_folder(&archive, "remote:/base", &task(&folder)).await;
    assert_eq!(status, SyncStatus::Archived);
    assert!(!folder.exists());
    assert_eq!(archive.attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_names_sanitized_before_copy() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let folder = folder_with_files(dir.path(), "Travel", &[".hidden.mp4", "  spaced.mp4"]);
    let archive = FlakyArchive::default();

    let status = sync_folder(&archive, "remote:/base/", &task(&folder)).await;
    assert_eq!(status, SyncStatus::Archived);

    let seen = archive.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(
            "remote:/base/alice/Travel".to_string(),
            vec!["_.hidden.mp4".to_string(), "spaced.mp4".to_string()],
        )]
    );
}

#[tokio::test]
async fn test_empty_and_missing_folders() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let empty = folder_with_files(dir.path(), "Empty", &[]);
    let archive = FlakyArchive::default();

    let status = sync_folder(&archive, "remote:/base", &task(&empty)).await;
    assert_eq!(status, SyncStatus::EmptyRemoved);
    assert!(!empty.exists());

    let status = sync_folder(&archive, "remote:/base", &task(&dir.path().join("Gone"))).await;
    assert_eq!(status, SyncStatus::Missing);
    assert_eq!(archive.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_queue_records_failures_and_drains() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first = folder_with_files(dir.path(), "Cooking", &["1.mp4"]);
    let second = folder_with_files(dir.path(), "Travel", &["2.mp4"]);
    let archive = Arc::new(FlakyArchive {
        failures: 1,
        ..FlakyArchive::default()
    });

    let queue = SyncQueue::new(
        archive.clone(),
        "remote:/base",
        10,
        Duration::from_millis(20),
    );
    queue.start();
    queue.queue_sync(&first, "alice").await;
    queue.queue_sync(&second, "alice").await;
    queue.wait_for_syncs().await;

    // FIFO: the first folder hit the single failure
    let failures = queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].local, first);
    assert!(first.is_dir());
    assert!(!second.exists());

    queue.stop().await;
}

#[tokio::test]
async fn test_copy_logs_targets_namespace() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(dir.path().join("download_success.log"), "x\n").unwrap();
    let archive = Arc::new(FlakyArchive::default());
    let queue = SyncQueue::new(
        archive.clone(),
        "remote:/base",
        10,
        Duration::from_millis(20),
    );

    queue
        .copy_logs(dir.path(), "alice")
        .await
        .expect("Copy failed");
    let seen = archive.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "remote:/base/alice");
}
