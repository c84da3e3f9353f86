use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::fetch::FailureReason;

/// How a job ended on the tier that handled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Downloaded,
    /// Recorded as private in the error log.
    Private,
    /// Recorded as a plain error in the error log.
    Failed(FailureReason),
    /// Handed to the fallback tier. Another outcome follows.
    Escalated(FailureReason),
}

impl JobOutcome {
    /// Whether the job has a durable record in one of the logs.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Escalated(_))
    }
}

/// Caller-side hook invoked with each outcome of a job.
pub type JobCallback = Arc<dyn Fn(&str, &JobOutcome) + Send + Sync>;

/// One fetch attempt waiting in a queue.
#[derive(Clone)]
pub struct DownloadJob {
    pub url: String,
    /// Collection scope for the success log. `None` logs unscoped.
    pub collection: Option<String>,
    pub output_folder: PathBuf,
    pub error_log: PathBuf,
    /// Why the previous tier gave up on this item.
    pub reason: Option<FailureReason>,
    pub photos_only: bool,
    pub callback: Option<JobCallback>,
}

impl fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadJob")
            .field("url", &self.url)
            .field("collection", &self.collection)
            .field("output_folder", &self.output_folder)
            .field("error_log", &self.error_log)
            .field("reason", &self.reason)
            .field("photos_only", &self.photos_only)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl DownloadJob {
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        collection: Option<String>,
        output_folder: impl Into<PathBuf>,
        error_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            url: url.into(),
            collection,
            output_folder: output_folder.into(),
            error_log: error_log.into(),
            reason: None,
            photos_only: false,
            callback: None,
        }
    }

    #[must_use]
    pub fn photos_only(mut self) -> Self {
        self.photos_only = true;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback: JobCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// The same job, carrying the reason the primary tier failed.
    #[must_use]
    pub fn escalate(mut self, reason: FailureReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub(crate) fn notify(&self, outcome: &JobOutcome) {
        if let Some(callback) = &self.callback {
            callback(&self.url, outcome);
        }
    }
}
