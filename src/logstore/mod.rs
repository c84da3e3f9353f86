//! Persistent success and error logs.
//!
//! The success log is shared by every collection of an input directory and
//! holds one line per fetched item, optionally scoped by collection name.
//! Each collection has its own error log. Both files are plain text so they
//! survive crashes and stay readable by operators; lookups go through
//! in-memory indexes that are rebuilt whenever the file changes on disk.
//!
//! All methods are blocking. Async callers should run them on the blocking
//! thread pool.

mod file;
mod index;
mod records;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use file::RetryPolicy;
pub use records::{ErrorEntry, SuccessRecord};

use crate::content_id::{identify, ContentId};
use index::{ErrorIndex, SuccessIndex};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O failed for {} after {attempts} attempt(s): {source}", .path.display())]
    Io {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Lock-guarded success/error log store for one input directory.
#[derive(Debug)]
pub struct LogStore {
    success_path: PathBuf,
    retry: RetryPolicy,
    success_index: RwLock<SuccessIndex>,
    error_indexes: RwLock<HashMap<PathBuf, ErrorIndex>>,
    /// Serializes this process's mutations; the file locks cover other processes.
    write_guard: Mutex<()>,
}

impl LogStore {
    #[must_use]
    pub fn new(success_path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            success_path: success_path.into(),
            retry,
            success_index: RwLock::new(SuccessIndex::default()),
            error_indexes: RwLock::new(HashMap::new()),
            write_guard: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn success_log_path(&self) -> &Path {
        &self.success_path
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.write_guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the content behind `url` has a success record.
    ///
    /// URLs without a content id are never considered downloaded. Read
    /// failures count as "not downloaded" so the pipeline keeps moving.
    pub fn is_downloaded(&self, url: &str, scope: Option<&str>) -> bool {
        let Some(id) = identify(url) else {
            return false;
        };
        let scope = scope.filter(|s| !s.is_empty());

        match self.with_success_index(|index| index.contains(&id, scope)) {
            Ok(found) => found,
            Err(e) => {
                warn!(url, error = %e, "Failed to read success log, treating as not downloaded");
                false
            }
        }
    }

    /// Every distinct content id in the success log.
    ///
    /// # Errors
    ///
    /// Returns an error if the success log cannot be read.
    pub fn downloaded_ids(&self) -> Result<HashSet<ContentId>, LogError> {
        self.with_success_index(SuccessIndex::all_ids)
    }

    fn with_success_index<R>(&self, f: impl FnOnce(&SuccessIndex) -> R) -> Result<R, LogError> {
        let io_err = |source| LogError::Io {
            path: self.success_path.clone(),
            attempts: 1,
            source,
        };
        let current = file::stamp(&self.success_path).map_err(io_err)?;

        {
            let index = self
                .success_index
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if index.is_fresh(current) {
                return Ok(f(&index));
            }
        }

        let mut index = self
            .success_index
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !index.is_fresh(current) {
            debug!(path = %self.success_path.display(), "Rebuilding success index");
            index.rebuild(&self.success_path, current).map_err(io_err)?;
        }
        Ok(f(&index))
    }

    /// Record a successful fetch.
    ///
    /// When `error_log` is given, any entry for the same content in that
    /// log (plain or private) is removed so an item never counts as both
    /// fetched and failed. The success line is durable once appended, so a
    /// failed cleanup is only logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails after all retries.
    pub fn log_success(
        &self,
        url: &str,
        scope: Option<&str>,
        error_log: Option<&Path>,
    ) -> Result<(), LogError> {
        let record = SuccessRecord::new(url, scope);
        {
            let _guard = self.write_lock();
            file::append_line(&self.success_path, &record.to_line(), self.retry)?;
            self.success_index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .invalidate();
        }

        if let Some(error_log) = error_log {
            match self.remove_from_error_log(url, error_log) {
                Ok(0) => {}
                Ok(removed) => {
                    info!(url, removed, "Cleared error entries after successful download");
                }
                Err(e) => warn!(
                    url,
                    path = %error_log.display(),
                    error = %e,
                    "Recorded success but failed to clear error entries"
                ),
            }
        }
        Ok(())
    }

    /// Entries of an error log, through the cache. A missing or unreadable
    /// file yields no entries.
    pub fn error_entries(&self, error_log: &Path) -> Vec<ErrorEntry> {
        match self.load_error_index(error_log) {
            Ok(index) => index.entries,
            Err(e) => {
                warn!(path = %error_log.display(), error = %e, "Failed to read error log");
                Vec::new()
            }
        }
    }

    /// URLs recorded as private in an error log.
    pub fn private_urls(&self, error_log: &Path) -> HashSet<String> {
        self.error_entries(error_log)
            .into_iter()
            .filter(|e| e.private)
            .map(|e| e.url)
            .collect()
    }

    fn load_error_index(&self, error_log: &Path) -> std::io::Result<ErrorIndex> {
        let current = file::stamp(error_log)?;
        {
            let indexes = self
                .error_indexes
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(index) = indexes.get(error_log).filter(|i| i.is_fresh(current)) {
                return Ok(index.clone());
            }
        }
        let index = ErrorIndex::load(error_log, current)?;
        self.error_indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(error_log.to_path_buf(), index.clone());
        Ok(index)
    }

    fn update_error_index(&self, error_log: &Path, f: impl FnOnce(&mut Vec<ErrorEntry>)) {
        let current = file::stamp(error_log).ok().flatten();
        let mut indexes = self
            .error_indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = indexes.get_mut(error_log) {
            f(&mut index.entries);
            index.restamp(current);
        }
    }

    /// Record a failed fetch in `error_log`.
    ///
    /// Entries are deduplicated by content. A private entry is terminal: a
    /// later non-private failure for the same content is not recorded, and a
    /// private failure replaces earlier plain entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails after all retries.
    pub fn log_error(&self, url: &str, error_log: &Path, private: bool) -> Result<(), LogError> {
        let _guard = self.write_lock();
        let existing = self.error_entries(error_log);
        let same: Vec<&ErrorEntry> = existing.iter().filter(|e| e.matches(url)).collect();

        if same.iter().any(|e| e.private) {
            debug!(url, "Already recorded as private");
            return Ok(());
        }
        if !private && !same.is_empty() {
            debug!(url, "Error already recorded");
            return Ok(());
        }
        if private && !same.is_empty() {
            file::remove_lines(error_log, self.retry, |line| {
                ErrorEntry::parse(line).is_some_and(|e| e.matches(url))
            })?;
            self.update_error_index(error_log, |entries| entries.retain(|e| !e.matches(url)));
        }

        let entry = ErrorEntry::new(url, private);
        file::append_line(error_log, &entry.to_line(), self.retry)?;
        self.update_error_index(error_log, |entries| entries.push(entry));
        Ok(())
    }

    /// Remove every entry for `url` from `error_log`, plain or private,
    /// matched by exact URL or by content id. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails after all retries.
    pub fn remove_from_error_log(&self, url: &str, error_log: &Path) -> Result<usize, LogError> {
        let _guard = self.write_lock();
        let removed = file::remove_lines(error_log, self.retry, |line| {
            ErrorEntry::parse(line).is_some_and(|e| e.matches(url))
        })?;
        if removed > 0 {
            self.update_error_index(error_log, |entries| entries.retain(|e| !e.matches(url)));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "https://www.tiktok.com/@cook/video/100";
    const B: &str = "https://www.tiktok.com/@cook/video/200";

    fn store(dir: &Path) -> LogStore {
        LogStore::new(dir.join("download_success.log"), RetryPolicy::default())
    }

    #[test]
    fn test_success_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(!store.is_downloaded(A, Some("Cooking")));
        store.log_success(A, Some("Cooking"), None).unwrap();
        assert!(store.is_downloaded(A, Some("Cooking")));
        store.log_success(A, Some("Cooking"), None).unwrap();
        assert!(store.is_downloaded(A, Some("Cooking")));
        assert!(store.is_downloaded(A, None));
        assert!(!store.is_downloaded(A, Some("Travel")));
    }

    #[test]
    fn test_unidentifiable_url_is_never_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .log_success("https://vm.tiktok.com/ZMabc/", None, None)
            .unwrap();
        assert!(!store.is_downloaded("https://vm.tiktok.com/ZMabc/", None));
    }

    #[test]
    fn test_external_append_invalidates_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.log_success(A, None, None).unwrap();
        assert!(!store.is_downloaded(B, None));

        file::append_line(store.success_log_path(), B, RetryPolicy::default()).unwrap();
        assert!(store.is_downloaded(B, None));
    }

    #[test]
    fn test_log_error_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let log = dir.path().join("[error log] Cooking.txt");

        store.log_error(A, &log, false).unwrap();
        store.log_error(A, &log, false).unwrap();
        store
            .log_error("https://tiktok.com/@cook/video/100/", &log, false)
            .unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), format!("{A}\n"));
    }

    #[test]
    fn test_private_replaces_plain_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let log = dir.path().join("[error log] Cooking.txt");

        store.log_error(A, &log, false).unwrap();
        store.log_error(B, &log, false).unwrap();
        store.log_error(A, &log, true).unwrap();
        store.log_error(A, &log, false).unwrap();

        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            format!("{B}\n{A} (private)\n")
        );
        assert_eq!(store.private_urls(&log), HashSet::from([A.to_string()]));
    }

    #[test]
    fn test_success_removes_error_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let log = dir.path().join("[error log] Cooking.txt");

        store.log_error(A, &log, true).unwrap();
        store.log_error(B, &log, false).unwrap();
        store.log_success(A, Some("Cooking"), Some(&log)).unwrap();

        let entries = store.error_entries(&log);
        assert_eq!(entries, vec![ErrorEntry::new(B, false)]);
        assert!(store.is_downloaded(A, Some("Cooking")));
    }

    #[test]
    fn test_remove_from_error_log_both_variants() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let log = dir.path().join("[error log] Travel.txt");
        std::fs::write(&log, format!("{A}\n{A} (private)\n{B}\n")).unwrap();

        assert_eq!(store.remove_from_error_log(A, &log).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), format!("{B}\n"));
        assert_eq!(store.remove_from_error_log(A, &log).unwrap(), 0);
    }

    #[test]
    fn test_success_survives_failed_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(
            dir.path().join("download_success.log"),
            RetryPolicy {
                attempts: 1,
                delay: std::time::Duration::from_millis(1),
            },
        );
        // A directory where the error log should be makes the cleanup fail
        let error_log = dir.path().join("[error log] Cooking.txt");
        std::fs::create_dir(&error_log).unwrap();

        store.log_success(A, Some("Cooking"), Some(&error_log)).unwrap();
        assert!(store.is_downloaded(A, Some("Cooking")));
        assert!(store.remove_from_error_log(A, &error_log).is_err());
    }

    #[test]
    fn test_two_stores_share_an_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("[error log] Cooking.txt");
        let policy = RetryPolicy {
            attempts: 5,
            delay: std::time::Duration::from_millis(1),
        };
        let first = LogStore::new(dir.path().join("download_success.log"), policy);
        let second = LogStore::new(dir.path().join("download_success.log"), policy);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200 {
                    let url = format!("https://www.tiktok.com/@a/video/{}", 10_000 + i);
                    first.log_error(&url, &log, false).unwrap();
                    first.remove_from_error_log(&url, &log).unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..200 {
                    let url = format!("https://www.tiktok.com/@b/video/{}", 20_000 + i);
                    second.log_error(&url, &log, false).unwrap();
                }
            });
        });

        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 200, "only entries from the second store remain");
        assert!(lines.iter().all(|l| l.contains("/@b/video/")));
    }

    #[test]
    fn test_downloaded_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.log_success(A, Some("Cooking"), None).unwrap();
        store.log_success(A, Some("Travel"), None).unwrap();
        store.log_success(B, None, None).unwrap();
        assert_eq!(store.downloaded_ids().unwrap().len(), 2);
    }
}
