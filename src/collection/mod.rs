//! Collection processing.
//!
//! A collection is one source file of URLs. Its name is the file name up to
//! the first `.`, its output folder and error log live next to the source
//! file, and its success records are scoped by name unless it is one of
//! the uncategorized groups.

mod discovery;
mod retry;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use discovery::{discover, namespace_for, with_error_logs};

use crate::constants::{ERROR_LOG_PREFIX, UNCATEGORIZED_NAME};
use crate::content_id::{identify, ContentId, ContentKind};
use crate::logstore::LogStore;
use crate::pool::{DownloadJob, JobCallback, JobOutcome, WorkerPool};
use crate::sync::SyncQueue;

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("invalid collection file name: {}", .0.display())]
    InvalidName(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read collection source {}: {source}", .path.display())]
    ReadSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create output folder {}: {source}", .path.display())]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One collection source file and the paths derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub source: PathBuf,
    pub output_folder: PathBuf,
    pub error_log: PathBuf,
    /// Uncategorized collections log unscoped success records.
    pub uncategorized: bool,
}

impl Collection {
    /// Derive a collection from its source file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file name yields an empty collection name.
    pub fn from_source(source: &Path) -> Result<Self, CollectionError> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| CollectionError::InvalidName(source.to_path_buf()))?;
        let name = file_name.split('.').next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(CollectionError::InvalidName(source.to_path_buf()));
        }

        let dir = source.parent().unwrap_or_else(|| Path::new(""));
        Ok(Self {
            name: name.to_string(),
            source: source.to_path_buf(),
            output_folder: dir.join(name),
            error_log: dir.join(format!("{ERROR_LOG_PREFIX}{file_name}")),
            uncategorized: name.starts_with(UNCATEGORIZED_NAME),
        })
    }

    /// The collection an error log belongs to. The source file need not
    /// exist any more.
    #[must_use]
    pub fn from_error_log(error_log: &Path) -> Option<Self> {
        let file_name = error_log.file_name()?.to_string_lossy().to_string();
        let source_name = file_name.strip_prefix(ERROR_LOG_PREFIX)?;
        let dir = error_log.parent().unwrap_or_else(|| Path::new(""));
        Self::from_source(&dir.join(source_name)).ok()
    }

    /// Scope of this collection's success records.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        (!self.uncategorized).then_some(self.name.as_str())
    }

    /// Distinct URLs of the source file, in file order.
    ///
    /// # Errors
    ///
    /// Returns an error if the source file cannot be read.
    pub async fn read_urls(&self) -> Result<Vec<String>, CollectionError> {
        let content = tokio::fs::read_to_string(&self.source)
            .await
            .map_err(|source| CollectionError::ReadSource {
                path: self.source.clone(),
                source,
            })?;
        Ok(dedupe_urls(content.lines()))
    }

    async fn ensure_output_folder(&self) -> Result<(), CollectionError> {
        tokio::fs::create_dir_all(&self.output_folder)
            .await
            .map_err(|source| CollectionError::CreateOutput {
                path: self.output_folder.clone(),
                source,
            })
    }

    fn job(&self, url: &str) -> DownloadJob {
        DownloadJob::new(
            url,
            self.scope().map(str::to_string),
            &self.output_folder,
            &self.error_log,
        )
    }
}

/// Trim, drop blanks and keep the first URL per content id. URLs without an
/// id are deduplicated by exact text.
pub fn dedupe_urls<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen_ids: HashSet<ContentId> = HashSet::new();
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut urls = Vec::new();
    for line in lines {
        let url = line.trim();
        if url.is_empty() {
            continue;
        }
        let fresh = match identify(url) {
            Some(id) => seen_ids.insert(id),
            None => seen_urls.insert(url.to_string()),
        };
        if fresh {
            urls.push(url.to_string());
        }
    }
    urls
}

/// Counts for one processed collection.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub name: String,
    pub total: usize,
    pub already_downloaded: usize,
    pub skipped_private: usize,
    pub queued_primary: usize,
    pub queued_fallback: usize,
    pub downloaded: usize,
    pub private: usize,
    pub failed: usize,
    pub sync_queued: bool,
}

impl CollectionReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Terminal outcomes of one collection's jobs, fed by job callbacks.
#[derive(Debug, Default)]
struct Tally {
    downloaded: AtomicUsize,
    private: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn callback(self: &Arc<Self>) -> JobCallback {
        let tally = Arc::clone(self);
        Arc::new(move |_url, outcome| {
            let counter = match outcome {
                JobOutcome::Downloaded => &tally.downloaded,
                JobOutcome::Private => &tally.private,
                JobOutcome::Failed(_) => &tally.failed,
                JobOutcome::Escalated(_) => return,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn fill(&self, report: &mut CollectionReport) {
        report.downloaded = self.downloaded.load(Ordering::Relaxed);
        report.private = self.private.load(Ordering::Relaxed);
        report.failed = self.failed.load(Ordering::Relaxed);
    }
}

/// Source URLs split by what the logs already know about them.
#[derive(Debug, Default)]
struct Partition {
    remaining: Vec<String>,
    already_downloaded: Vec<String>,
    skipped_private: usize,
}

fn partition(
    store: &LogStore,
    urls: Vec<String>,
    scope: Option<&str>,
    skip_private_from: Option<&Path>,
) -> Partition {
    let mut private_ids = HashSet::new();
    let mut private_urls = HashSet::new();
    if let Some(error_log) = skip_private_from {
        for url in store.private_urls(error_log) {
            match identify(&url) {
                Some(id) => {
                    private_ids.insert(id);
                }
                None => {
                    private_urls.insert(url);
                }
            }
        }
    }

    let mut result = Partition::default();
    for url in urls {
        if store.is_downloaded(&url, scope) {
            result.already_downloaded.push(url);
        } else if identify(&url).is_some_and(|id| private_ids.contains(&id))
            || private_urls.contains(&url)
        {
            result.skipped_private += 1;
        } else {
            result.remaining.push(url);
        }
    }
    result
}

/// Turns collections into queued jobs on a shared [`WorkerPool`].
#[derive(Debug)]
pub struct CollectionProcessor<'a> {
    pool: &'a WorkerPool,
    sync: Option<&'a SyncQueue>,
    namespace: String,
    skip_private: bool,
}

impl<'a> CollectionProcessor<'a> {
    #[must_use]
    pub fn new(pool: &'a WorkerPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            sync: None,
            namespace: namespace.into(),
            skip_private: false,
        }
    }

    /// Queue finished collection folders for archival on `sync`.
    #[must_use]
    pub fn with_sync(mut self, sync: &'a SyncQueue) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Leave out URLs already recorded as private.
    #[must_use]
    pub fn skip_private(mut self, skip: bool) -> Self {
        self.skip_private = skip;
        self
    }

    async fn partition(
        &self,
        collection: &Collection,
        urls: Vec<String>,
        skip_private: bool,
    ) -> Result<Partition, CollectionError> {
        let store = Arc::clone(self.pool.store());
        let scope = collection.scope().map(str::to_string);
        let error_log = skip_private.then(|| collection.error_log.clone());
        let partition = tokio::task::spawn_blocking(move || {
            partition(&store, urls, scope.as_deref(), error_log.as_deref())
        })
        .await?;
        Ok(partition)
    }

    /// Route each URL to its tier: photo posts straight to the fallback
    /// fetcher, everything else to the primary.
    async fn dispatch(
        &self,
        collection: &Collection,
        urls: &[String],
        tally: &Arc<Tally>,
        report: &mut CollectionReport,
    ) {
        let callback = tally.callback();
        for url in urls {
            let job = collection.job(url).with_callback(Arc::clone(&callback));
            match ContentKind::of(url) {
                ContentKind::Photo => {
                    report.queued_fallback += 1;
                    self.pool.submit_fallback(job.photos_only()).await;
                }
                ContentKind::Video => {
                    report.queued_primary += 1;
                    self.pool.submit_primary(job).await;
                }
            }
        }
    }

    /// Collections sharing a name share an output folder. Wait until an
    /// earlier archival of that folder has finished so it cannot be
    /// deleted under new downloads.
    async fn wait_for_pending_sync(&self, collection: &Collection) {
        if let Some(sync) = self.sync {
            if sync.wait_for_folder(&collection.output_folder).await {
                debug!(collection = %collection.name, "Earlier archival of output folder finished");
            }
        }
    }

    async fn queue_sync(&self, collection: &Collection) -> bool {
        let Some(sync) = self.sync else {
            return false;
        };
        if !tokio::fs::try_exists(&collection.output_folder)
            .await
            .unwrap_or(false)
        {
            return false;
        }
        sync.queue_sync(&collection.output_folder, self.namespace.clone())
            .await;
        true
    }

    /// Download everything in `collection` that is not yet in the success
    /// log, wait for both tiers to drain, then queue the folder for
    /// archival.
    ///
    /// # Errors
    ///
    /// Returns an error if the source file cannot be read or the output
    /// folder cannot be created. Individual download failures are never
    /// errors; they end up in the error log.
    pub async fn process(
        &self,
        collection: &Collection,
    ) -> Result<CollectionReport, CollectionError> {
        let mut report = CollectionReport::new(&collection.name);
        self.wait_for_pending_sync(collection).await;
        collection.ensure_output_folder().await?;

        let urls = collection.read_urls().await?;
        report.total = urls.len();

        let split = self
            .partition(collection, urls, self.skip_private)
            .await?;
        report.already_downloaded = split.already_downloaded.len();
        report.skipped_private = split.skipped_private;
        info!(
            collection = %collection.name,
            total = report.total,
            already_downloaded = report.already_downloaded,
            skipped_private = report.skipped_private,
            remaining = split.remaining.len(),
            "Processing collection"
        );

        let tally = Arc::new(Tally::default());
        self.dispatch(collection, &split.remaining, &tally, &mut report)
            .await;
        self.pool.join().await;
        tally.fill(&mut report);

        report.sync_queued = self.queue_sync(collection).await;
        info!(
            collection = %collection.name,
            downloaded = report.downloaded,
            private = report.private,
            failed = report.failed,
            "Collection complete"
        );
        Ok(report)
    }
}

async fn remove_file_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
