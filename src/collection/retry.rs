//! Second pass over error logs.
//!
//! Plain (non-private) error entries get one more trip through the worker
//! pool. Entries that now succeed drop out of the log via the success
//! path; an error log left empty is deleted.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    dedupe_urls, remove_file_if_exists, Collection, CollectionError, CollectionProcessor,
    CollectionReport, Tally,
};
use crate::logstore::{LogError, LogStore};

/// Remove the entries for `urls` from `error_log`, returning how many lines
/// actually went away.
fn remove_entries(store: &LogStore, error_log: &Path, urls: &[String]) -> Result<usize, LogError> {
    let mut removed = 0;
    for url in urls {
        removed += store.remove_from_error_log(url, error_log)?;
    }
    Ok(removed)
}

impl CollectionProcessor<'_> {
    async fn error_entries(
        &self,
        collection: &Collection,
    ) -> Result<Vec<crate::logstore::ErrorEntry>, CollectionError> {
        let store = Arc::clone(self.pool.store());
        let error_log = collection.error_log.clone();
        Ok(tokio::task::spawn_blocking(move || store.error_entries(&error_log)).await?)
    }

    /// Drop error entries for items the success log already has.
    async fn clear_downloaded(&self, collection: &Collection, urls: Vec<String>) {
        let store = Arc::clone(self.pool.store());
        let error_log = collection.error_log.clone();
        let result =
            tokio::task::spawn_blocking(move || remove_entries(&store, &error_log, &urls)).await;
        match result {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => info!(
                collection = %collection.name,
                count,
                "Cleared error entries already in the success log"
            ),
            Ok(Err(e)) => {
                warn!(collection = %collection.name, error = %e, "Failed to clear error entries");
            }
            Err(e) => {
                warn!(collection = %collection.name, error = %e, "Error log cleanup task failed");
            }
        }
    }

    /// Retry the non-private entries of `collection`'s error log.
    ///
    /// # Errors
    ///
    /// Returns an error if the output folder cannot be created.
    pub async fn retry_errors(
        &self,
        collection: &Collection,
    ) -> Result<CollectionReport, CollectionError> {
        let mut report = CollectionReport::new(&collection.name);
        self.wait_for_pending_sync(collection).await;
        let entries = self.error_entries(collection).await?;
        report.total = entries.len();
        report.skipped_private = entries.iter().filter(|e| e.private).count();

        let urls = dedupe_urls(entries.iter().filter(|e| !e.private).map(|e| e.url.as_str()));
        if urls.is_empty() {
            if entries.is_empty() {
                remove_file_if_exists(&collection.error_log).await;
            }
            return Ok(report);
        }

        let split = self.partition(collection, urls, false).await?;
        report.already_downloaded = split.already_downloaded.len();
        self.clear_downloaded(collection, split.already_downloaded)
            .await;

        if !split.remaining.is_empty() {
            collection.ensure_output_folder().await?;
            info!(
                collection = %collection.name,
                count = split.remaining.len(),
                "Retrying failed downloads"
            );
            let tally = Arc::new(Tally::default());
            self.dispatch(collection, &split.remaining, &tally, &mut report)
                .await;
            self.pool.join().await;
            tally.fill(&mut report);
        }

        if self.error_entries(collection).await?.is_empty() {
            info!(collection = %collection.name, "All errors resolved, removing error log");
            remove_file_if_exists(&collection.error_log).await;
        }

        if report.downloaded == 0 {
            // Only removes the folder when it is empty
            if let Err(e) = tokio::fs::remove_dir(&collection.output_folder).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(
                        folder = %collection.output_folder.display(),
                        error = %e,
                        "Keeping output folder"
                    );
                }
            }
        } else {
            report.sync_queued = self.queue_sync(collection).await;
        }

        info!(
            collection = %collection.name,
            downloaded = report.downloaded,
            private = report.private,
            failed = report.failed,
            "Retry pass complete"
        );
        Ok(report)
    }
}
