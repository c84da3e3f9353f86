//! Two-tier worker pool.
//!
//! Primary workers try the fast fetcher. Anything it fails on, other than
//! private content, is handed to the fallback queue where the slower
//! fetcher gets the final say. Every job ends with exactly one durable
//! record: a success line or an error-log entry.

mod job;
mod throttle;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use job::{DownloadJob, JobCallback, JobOutcome};
pub use throttle::{NoopGate, OperatorGate, StdinGate, ThrottleGuard};

use crate::config::Config;
use crate::fetch::{FailureKind, FailureReason, FallbackFetcher, PrimaryFetcher};
use crate::logstore::LogStore;
use crate::queue::JobQueue;

/// Sizing and timing of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub primary_workers: usize,
    pub fallback_workers: usize,
    pub queue_capacity: usize,
    pub dequeue_timeout: Duration,
    pub block_threshold: u32,
    pub success_reset_threshold: u32,
}

impl PoolSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            primary_workers: config.primary_workers,
            fallback_workers: config.fallback_workers,
            queue_capacity: config.queue_capacity,
            dequeue_timeout: config.dequeue_timeout,
            block_threshold: config.block_threshold,
            success_reset_threshold: config.success_reset_threshold,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            primary_workers: 5,
            fallback_workers: 5,
            queue_capacity: 10_000,
            dequeue_timeout: Duration::from_secs(1),
            block_threshold: 5,
            success_reset_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Primary,
    Fallback,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// State shared by every worker task.
struct Shared {
    primary: JobQueue<DownloadJob>,
    fallback: JobQueue<DownloadJob>,
    store: Arc<LogStore>,
    primary_fetcher: Arc<dyn PrimaryFetcher>,
    fallback_fetcher: Arc<dyn FallbackFetcher>,
    throttle: ThrottleGuard,
    dequeue_timeout: Duration,
    cancel: CancellationToken,
}

impl Shared {
    fn queue(&self, tier: Tier) -> &JobQueue<DownloadJob> {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Fallback => &self.fallback,
        }
    }

    async fn log_success(&self, job: &DownloadJob) -> Result<()> {
        let store = Arc::clone(&self.store);
        let url = job.url.clone();
        let scope = job.collection.clone();
        let error_log = job.error_log.clone();
        tokio::task::spawn_blocking(move || {
            store.log_success(&url, scope.as_deref(), Some(&error_log))
        })
        .await
        .context("Success log task failed")??;
        Ok(())
    }

    /// Write an error-log entry. Failures here only get traced: there is no
    /// other place left to record the item.
    async fn log_error(&self, job: &DownloadJob, private: bool) {
        let store = Arc::clone(&self.store);
        let url = job.url.clone();
        let error_log = job.error_log.clone();
        let result =
            tokio::task::spawn_blocking(move || store.log_error(&url, &error_log, private)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(url = %job.url, error = %e, "Failed to write error log"),
            Err(e) => error!(url = %job.url, error = %e, "Error log task failed"),
        }
    }

    /// Log a success, degrading to a plain error entry only if the success
    /// line itself cannot be written.
    async fn finish_success(&self, job: &DownloadJob) -> JobOutcome {
        match self.log_success(job).await {
            Ok(()) => JobOutcome::Downloaded,
            Err(e) => {
                error!(url = %job.url, error = %format!("{e:#}"), "Failed to record success");
                self.log_error(job, false).await;
                JobOutcome::Failed(FailureReason::other(format!("{e:#}")))
            }
        }
    }

    async fn run_primary(&self, job: &DownloadJob) -> JobOutcome {
        match self.primary_fetcher.fetch(&job.url, &job.output_folder).await {
            Ok(fetched) => {
                self.throttle.record_success();
                info!(
                    url = %job.url,
                    speed_mib = ?fetched.speed_mib,
                    "Downloaded"
                );
                self.finish_success(job).await
            }
            Err(reason) if reason.is_private() => {
                info!(url = %job.url, "Content is private");
                self.log_error(job, true).await;
                JobOutcome::Private
            }
            Err(reason) => {
                if reason.kind == FailureKind::Blocked {
                    self.throttle.record_block().await;
                }
                info!(url = %job.url, reason = %reason, "Escalating to fallback");
                self.fallback
                    .enqueue(job.clone().escalate(reason.clone()))
                    .await;
                JobOutcome::Escalated(reason)
            }
        }
    }

    async fn run_fallback(&self, job: &DownloadJob) -> JobOutcome {
        if job.reason.as_ref().is_some_and(FailureReason::is_private) {
            self.log_error(job, true).await;
            return JobOutcome::Private;
        }

        let result = self
            .fallback_fetcher
            .fetch(
                &job.url,
                &job.output_folder,
                job.collection.as_deref(),
                job.photos_only,
            )
            .await;

        match result {
            Ok(fetched) => {
                info!(url = %job.url, file = ?fetched.file, "Downloaded with fallback");
                self.finish_success(job).await
            }
            Err(reason) => {
                let private = reason.is_private();
                warn!(url = %job.url, reason = %reason, "Fallback download failed");
                self.log_error(job, private).await;
                if private {
                    JobOutcome::Private
                } else {
                    JobOutcome::Failed(reason)
                }
            }
        }
    }
}

async fn process(shared: Arc<Shared>, tier: Tier, job: DownloadJob) {
    let outcome = match tier {
        Tier::Primary => shared.run_primary(&job).await,
        Tier::Fallback => shared.run_fallback(&job).await,
    };
    job.notify(&outcome);
}

async fn worker_loop(shared: Arc<Shared>, tier: Tier) {
    debug!("Worker started");
    while !shared.cancel.is_cancelled() {
        let Some(job) = shared.queue(tier).dequeue(shared.dequeue_timeout).await else {
            continue;
        };
        let progress = shared.queue(tier).mark_started();
        info!(
            url = %job.url,
            "Processing {} of {}",
            progress.processed,
            progress.total
        );

        // Run the job in its own task so a panic is contained to this item
        let task = tokio::spawn(process(Arc::clone(&shared), tier, job.clone()).in_current_span());
        if let Err(e) = task.await {
            error!(url = %job.url, error = %e, "Job aborted unexpectedly");
            shared.log_error(&job, false).await;
            job.notify(&JobOutcome::Failed(FailureReason::other(e.to_string())));
        }
        shared.queue(tier).task_done();
    }
    debug!("Worker stopped");
}

/// Owns both job queues and the worker tasks consuming them.
pub struct WorkerPool {
    shared: Arc<Shared>,
    settings: PoolSettings,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("settings", &self.settings)
            .field("primary_pending", &self.shared.primary.len())
            .field("fallback_pending", &self.shared.fallback.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        settings: PoolSettings,
        store: Arc<LogStore>,
        primary_fetcher: Arc<dyn PrimaryFetcher>,
        fallback_fetcher: Arc<dyn FallbackFetcher>,
        gate: Arc<dyn OperatorGate>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let shared = Shared {
            primary: JobQueue::new("primary", settings.queue_capacity),
            fallback: JobQueue::new("fallback", settings.queue_capacity),
            store,
            primary_fetcher,
            fallback_fetcher,
            throttle: ThrottleGuard::new(
                settings.block_threshold,
                settings.success_reset_threshold,
                gate,
                cancel.clone(),
            ),
            dequeue_timeout: settings.dequeue_timeout,
            cancel,
        };
        Self {
            shared: Arc::new(shared),
            settings,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Calling this on a running pool does nothing.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            return;
        }

        let tiers = [
            (Tier::Primary, self.settings.primary_workers.max(1)),
            (Tier::Fallback, self.settings.fallback_workers.max(1)),
        ];
        for (tier, count) in tiers {
            for id in 1..=count {
                let span = info_span!("worker", tier = tier.as_str(), id);
                let shared = Arc::clone(&self.shared);
                handles.push(tokio::spawn(worker_loop(shared, tier).instrument(span)));
            }
        }
        info!(
            primary = self.settings.primary_workers,
            primary_fetcher = self.shared.primary_fetcher.name(),
            fallback = self.settings.fallback_workers,
            fallback_fetcher = self.shared.fallback_fetcher.name(),
            "Worker pool started"
        );
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LogStore> {
        &self.shared.store
    }

    pub async fn submit_primary(&self, job: DownloadJob) {
        self.shared.primary.enqueue(job).await;
    }

    pub async fn submit_fallback(&self, job: DownloadJob) {
        self.shared.fallback.enqueue(job).await;
    }

    /// Wait for every primary job, including their escalations being queued.
    pub async fn join_primary(&self) {
        self.shared.primary.join().await;
    }

    pub async fn join_fallback(&self) {
        self.shared.fallback.join().await;
    }

    /// Wait until both tiers are drained. Primary first, since primary
    /// workers feed the fallback queue.
    pub async fn join(&self) {
        self.join_primary().await;
        self.join_fallback().await;
    }

    /// Stop dequeuing and wait for every worker to finish its current job.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}
