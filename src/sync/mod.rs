//! Background archival of finished collection folders.
//!
//! A single consumer copies each queued folder to the remote archive and
//! deletes the local copy only when that copy reported success. A failed
//! copy leaves the folder in place and is recorded for the run summary.

mod rclone;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use rclone::Rclone;

use crate::queue::JobQueue;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("copy failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
}

/// Remote storage that folders are copied into.
#[async_trait]
pub trait RemoteArchive: Send + Sync {
    /// Copy `local` into `remote`. With a non-empty `include`, only files
    /// matching one of the patterns are copied.
    async fn copy(&self, local: &Path, remote: &str, include: &[&str])
        -> Result<(), ArchiveError>;

    /// Entry names directly under `remote`.
    async fn list(&self, remote: &str) -> Result<Vec<String>, ArchiveError>;
}

/// A finished collection folder waiting to be archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub local: PathBuf,
    /// Remote namespace, usually the input directory's name.
    pub namespace: String,
}

/// How a sync task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Copied and deleted locally.
    Archived,
    /// The folder was already gone.
    Missing,
    /// Nothing to copy; the empty folder was removed.
    EmptyRemoved,
    /// Copy or cleanup failed; the folder is still on disk.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub local: PathBuf,
    pub error: String,
}

/// `<remote_base>/<namespace>/<folder name>`.
#[must_use]
pub fn remote_path(remote_base: &str, namespace: &str, local: &Path) -> String {
    let folder = local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}/{namespace}/{folder}", remote_base.trim_end_matches('/'))
}

/// Name a file should be renamed to before upload, if any.
///
/// Leading dots hide files on the destination and leading spaces are
/// stripped by it.
#[must_use]
pub fn sanitized_name(name: &str) -> Option<String> {
    if name.starts_with('.') {
        Some(format!("_{name}"))
    } else if name.starts_with(' ') {
        let trimmed = name.trim_start();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    } else {
        None
    }
}

/// Rename top-level entries of `dir` per [`sanitized_name`]. Returns the
/// number renamed; rename failures are logged and skipped.
pub async fn sanitize_names(dir: &Path) -> std::io::Result<usize> {
    let mut renamed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(new_name) = sanitized_name(&name) else {
            continue;
        };
        let target = dir.join(&new_name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            warn!(
                original = %name,
                sanitized = %new_name,
                "Sanitized name already exists, keeping original"
            );
            continue;
        }
        match tokio::fs::rename(entry.path(), &target).await {
            Ok(()) => {
                debug!(original = %name, sanitized = %new_name, "Renamed file before upload");
                renamed += 1;
            }
            Err(e) => warn!(original = %name, error = %e, "Failed to rename file before upload"),
        }
    }
    Ok(renamed)
}

async fn is_empty_dir(dir: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}

/// Archive one folder. The folder is deleted only after `archive` reported
/// a successful copy of it in this call.
pub async fn sync_folder(
    archive: &dyn RemoteArchive,
    remote_base: &str,
    task: &SyncTask,
) -> SyncStatus {
    let local = &task.local;
    let folder = local.display();

    match tokio::fs::try_exists(local).await {
        Ok(true) => {}
        Ok(false) => {
            info!(folder = %folder, "Skipping missing folder");
            return SyncStatus::Missing;
        }
        Err(e) => return SyncStatus::Failed(format!("cannot stat folder: {e}")),
    }

    match is_empty_dir(local).await {
        Ok(true) => {
            return match tokio::fs::remove_dir_all(local).await {
                Ok(()) => {
                    info!(folder = %folder, "Removed empty folder");
                    SyncStatus::EmptyRemoved
                }
                Err(e) => SyncStatus::Failed(format!("cannot remove empty folder: {e}")),
            };
        }
        Ok(false) => {}
        Err(e) => return SyncStatus::Failed(format!("cannot list folder: {e}")),
    }

    if let Err(e) = sanitize_names(local).await {
        warn!(folder = %folder, error = %e, "Failed to sanitize file names");
    }

    let remote = remote_path(remote_base, &task.namespace, local);
    info!(folder = %folder, remote = %remote, "Copying folder to remote archive");
    if let Err(e) = archive.copy(local, &remote, &[]).await {
        error!(folder = %folder, error = %e, "Copy failed, keeping local folder");
        return SyncStatus::Failed(e.to_string());
    }

    match tokio::fs::remove_dir_all(local).await {
        Ok(()) => {
            info!(folder = %folder, "Archived and removed local folder");
            SyncStatus::Archived
        }
        Err(e) => SyncStatus::Failed(format!("copied but cannot remove local folder: {e}")),
    }
}

struct Shared {
    queue: JobQueue<SyncTask>,
    archive: Arc<dyn RemoteArchive>,
    remote_base: String,
    failures: Mutex<Vec<SyncFailure>>,
    /// Queued or in-flight tasks per local folder.
    pending: Mutex<HashMap<PathBuf, usize>>,
    dequeue_timeout: Duration,
    cancel: CancellationToken,
}

impl Shared {
    fn mark_pending(&self, local: &Path) {
        *self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(local.to_path_buf())
            .or_default() += 1;
    }

    fn mark_finished(&self, local: &Path) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pending.get_mut(local) {
            *count -= 1;
            if *count == 0 {
                pending.remove(local);
            }
        }
    }

    fn record_failure(&self, local: &Path, error: String) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SyncFailure {
                local: local.to_path_buf(),
                error,
            });
    }
}

async fn consumer_loop(shared: Arc<Shared>) {
    while !shared.cancel.is_cancelled() {
        let Some(task) = shared.queue.dequeue(shared.dequeue_timeout).await else {
            continue;
        };
        let status = {
            let shared = Arc::clone(&shared);
            let task = task.clone();
            tokio::spawn(
                async move { sync_folder(shared.archive.as_ref(), &shared.remote_base, &task).await }
                    .in_current_span(),
            )
            .await
            .unwrap_or_else(|e| SyncStatus::Failed(format!("sync task aborted: {e}")))
        };
        if let SyncStatus::Failed(error) = status {
            shared.record_failure(&task.local, error);
        }
        shared.mark_finished(&task.local);
        shared.queue.task_done();
    }
}

/// Single-consumer queue of folders to archive.
pub struct SyncQueue {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("remote_base", &self.shared.remote_base)
            .field("pending", &self.shared.queue.len())
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    #[must_use]
    pub fn new(
        archive: Arc<dyn RemoteArchive>,
        remote_base: impl Into<String>,
        capacity: usize,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: JobQueue::new("sync", capacity),
                archive,
                remote_base: remote_base.into(),
                failures: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                dequeue_timeout,
                cancel: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the consumer. Calling this twice does nothing.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_none() {
            let shared = Arc::clone(&self.shared);
            *handle = Some(tokio::spawn(
                consumer_loop(shared).instrument(info_span!("sync")),
            ));
        }
    }

    #[must_use]
    pub fn remote_base(&self) -> &str {
        &self.shared.remote_base
    }

    #[must_use]
    pub fn archive(&self) -> &Arc<dyn RemoteArchive> {
        &self.shared.archive
    }

    pub async fn queue_sync(&self, local: impl Into<PathBuf>, namespace: impl Into<String>) {
        let task = SyncTask {
            local: local.into(),
            namespace: namespace.into(),
        };
        debug!(folder = %task.local.display(), "Queued folder for archival");
        self.shared.mark_pending(&task.local);
        self.shared.queue.enqueue(task).await;
    }

    /// Wait until every queued folder has been handled.
    pub async fn wait_for_syncs(&self) {
        self.shared.queue.join().await;
    }

    /// Whether `local` is queued for archival or being archived right now.
    #[must_use]
    pub fn is_pending(&self, local: &Path) -> bool {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(local)
    }

    /// Wait until no sync of `local` is queued or running. Returns whether
    /// it had to wait.
    pub async fn wait_for_folder(&self, local: &Path) -> bool {
        if !self.is_pending(local) {
            return false;
        }
        info!(folder = %local.display(), "Waiting for pending archival of folder");
        while self.is_pending(local) {
            self.shared.queue.join().await;
        }
        true
    }

    /// Copy only `*.txt` and `*.log` files of `input_dir` into
    /// `<remote_base>/<namespace>`, leaving existing remote folders alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub async fn copy_logs(&self, input_dir: &Path, namespace: &str) -> Result<(), ArchiveError> {
        let remote = format!(
            "{}/{namespace}",
            self.shared.remote_base.trim_end_matches('/')
        );
        self.shared
            .archive
            .copy(input_dir, &remote, &["*.txt", "*.log"])
            .await
    }

    /// Folders whose archival failed so far.
    #[must_use]
    pub fn failures(&self) -> Vec<SyncFailure> {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the consumer after its current task.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync consumer ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_name() {
        assert_eq!(sanitized_name(".hidden.mp4").as_deref(), Some("_.hidden.mp4"));
        assert_eq!(sanitized_name("  spaced.mp4").as_deref(), Some("spaced.mp4"));
        assert_eq!(sanitized_name("normal.mp4"), None);
        assert_eq!(sanitized_name("   "), None);
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(
            remote_path("gdrive:/TikTok Archives/", "alice", Path::new("/data/alice/Cooking")),
            "gdrive:/TikTok Archives/alice/Cooking"
        );
    }

    #[tokio::test]
    async fn test_sanitize_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".a.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join(" b.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("c.mp4"), b"x").unwrap();

        assert_eq!(sanitize_names(dir.path()).await.unwrap(), 2);
        assert!(dir.path().join("_.a.mp4").exists());
        assert!(dir.path().join("b.mp4").exists());
        assert!(dir.path().join("c.mp4").exists());
    }
}
