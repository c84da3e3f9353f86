//! One archival run over an input directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::collection::{self, CollectionProcessor, CollectionReport};
use crate::config::Config;
use crate::constants::SUCCESS_LOG_FILE;
use crate::fetch::{FallbackFetcher, GalleryDl, PrimaryFetcher, YtDlp};
use crate::logstore::LogStore;
use crate::pool::{NoopGate, OperatorGate, PoolSettings, StdinGate, WorkerPool};
use crate::summary::RunSummary;
use crate::sync::{Rclone, RemoteArchive, SyncQueue};

/// External collaborators of a run.
pub struct Collaborators {
    pub primary: Arc<dyn PrimaryFetcher>,
    pub fallback: Arc<dyn FallbackFetcher>,
    pub archive: Arc<dyn RemoteArchive>,
    pub gate: Arc<dyn OperatorGate>,
}

impl Collaborators {
    /// yt-dlp, gallery-dl and rclone as configured.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let gate: Arc<dyn OperatorGate> = if config.unattended {
            Arc::new(NoopGate)
        } else {
            Arc::new(StdinGate)
        };
        Self {
            primary: Arc::new(YtDlp::new(&config.yt_dlp_path)),
            fallback: Arc::new(GalleryDl::new(&config.gallery_dl_path)),
            archive: Arc::new(Rclone::new(&config.rclone_path)),
            gate,
        }
    }
}

/// Directory holding the collections and logs for `input`.
#[must_use]
pub fn input_dir(input: &Path) -> PathBuf {
    if input.is_file() {
        input.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    } else {
        input.to_path_buf()
    }
}

pub struct Runner {
    config: Config,
    input_dir: PathBuf,
    namespace: String,
    pool: WorkerPool,
    sync: Option<SyncQueue>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("input_dir", &self.input_dir)
            .field("namespace", &self.namespace)
            .field("pool", &self.pool)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl Runner {
    #[must_use]
    pub fn new(config: Config, parts: Collaborators) -> Self {
        let input_dir = input_dir(&config.input_path);
        let namespace = collection::namespace_for(&config.input_path);
        let store = Arc::new(LogStore::new(
            input_dir.join(SUCCESS_LOG_FILE),
            config.retry_policy(),
        ));
        let pool = WorkerPool::new(
            PoolSettings::from_config(&config),
            store,
            parts.primary,
            parts.fallback,
            parts.gate,
        );
        let sync = (!config.skip_sync).then(|| {
            SyncQueue::new(
                parts.archive,
                config.remote_base.clone(),
                config.queue_capacity,
                config.dequeue_timeout,
            )
        });

        Self {
            config,
            input_dir,
            namespace,
            pool,
            sync,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LogStore> {
        self.pool.store()
    }

    fn processor(&self) -> CollectionProcessor<'_> {
        let processor = CollectionProcessor::new(&self.pool, self.namespace.clone())
            .skip_private(self.config.skip_private);
        match &self.sync {
            Some(sync) => processor.with_sync(sync),
            None => processor,
        }
    }

    async fn wait_for_syncs(&self) {
        if let Some(sync) = &self.sync {
            sync.wait_for_syncs().await;
        }
    }

    async fn process_collections(&self, reports: &mut Vec<CollectionReport>) -> Result<()> {
        let collections = collection::discover(&self.config.input_path)
            .await
            .context("Failed to discover collections")?;
        info!(count = collections.len(), "Discovered collections");

        let processor = self.processor();
        for (index, collection) in collections.iter().enumerate() {
            info!(
                collection = %collection.name,
                "Collection {} of {}",
                index + 1,
                collections.len()
            );
            match processor.process(collection).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(collection = %collection.name, error = %e, "Collection failed"),
            }
        }
        Ok(())
    }

    async fn retry_error_logs(&self, reports: &mut Vec<CollectionReport>) -> Result<()> {
        let collections = collection::with_error_logs(&self.input_dir)
            .await
            .context("Failed to list error logs")?;
        if collections.is_empty() {
            return Ok(());
        }
        info!(count = collections.len(), "Retrying error logs");

        let processor = self.processor();
        for collection in &collections {
            match processor.retry_errors(collection).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(collection = %collection.name, error = %e, "Retry failed"),
            }
        }
        Ok(())
    }

    async fn archive_logs(&self) {
        let Some(sync) = &self.sync else {
            return;
        };
        match sync.copy_logs(&self.input_dir, &self.namespace).await {
            Ok(()) => info!("Copied text and log files to remote archive"),
            Err(e) => error!(error = %e, "Failed to copy text and log files"),
        }

        let remote = format!(
            "{}/{}",
            sync.remote_base().trim_end_matches('/'),
            self.namespace
        );
        match sync.archive().list(&remote).await {
            Ok(entries) => info!(remote = %remote, entries = entries.len(), "Remote namespace contents"),
            Err(e) => warn!(remote = %remote, error = %e, "Failed to list remote namespace"),
        }
    }

    /// Process every collection, retry error logs, archive, summarize.
    ///
    /// # Errors
    ///
    /// Returns an error if the input cannot be read or the summary cannot be
    /// gathered. Failures of single collections are logged and skipped.
    pub async fn run(&self) -> Result<RunSummary> {
        self.pool.start();
        if let Some(sync) = &self.sync {
            sync.start();
        }

        let mut reports = Vec::new();
        if !self.config.errors_only {
            self.process_collections(&mut reports).await?;
            self.wait_for_syncs().await;
        }
        if self.config.retry_errors || self.config.errors_only {
            self.retry_error_logs(&mut reports).await?;
        }
        self.wait_for_syncs().await;

        let sync_failures = self.sync.as_ref().map(SyncQueue::failures).unwrap_or_default();
        let store = Arc::clone(self.store());
        let input_dir = self.input_dir.clone();
        let summary = tokio::task::spawn_blocking(move || {
            RunSummary::collect(&store, &input_dir, reports, sync_failures)
        })
        .await
        .context("Summary task failed")?
        .context("Failed to gather run summary")?;

        summary.log();
        match summary.write(&self.input_dir) {
            Ok(path) => info!(path = %path.display(), "Wrote run summary"),
            Err(e) => warn!(error = %format!("{e:#}"), "Failed to write run summary"),
        }

        self.archive_logs().await;
        Ok(summary)
    }

    /// Stop the workers and the sync consumer. In-flight jobs finish.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
        if let Some(sync) = &self.sync {
            sync.stop().await;
        }
    }
}
