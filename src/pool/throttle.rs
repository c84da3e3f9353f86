//! Block/success counters for the primary tier.
//!
//! A run of consecutive blocked attempts means the network path needs
//! attention (new route, cooldown). Once the run reaches the threshold the
//! guard holds every primary worker at the operator gate until someone
//! confirms or the pool is cancelled. A run of successes clears the block
//! count.

use std::io::BufRead;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Point where the pool waits for a human before continuing.
#[async_trait]
pub trait OperatorGate: Send + Sync {
    async fn wait(&self, consecutive_blocks: u32);
}

/// Waits for Enter on stdin.
///
/// The read happens on a detached thread so an abandoned wait never holds
/// up runtime shutdown.
#[derive(Debug, Default)]
pub struct StdinGate;

#[async_trait]
impl OperatorGate for StdinGate {
    async fn wait(&self, consecutive_blocks: u32) {
        warn!(
            consecutive_blocks,
            "Network access blocked, press Enter to continue"
        );
        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("operator-gate".to_string())
            .spawn(move || {
                let mut line = String::new();
                let _ = tx.send(std::io::stdin().lock().read_line(&mut line));
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start stdin reader, continuing");
            return;
        }
        match rx.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to read from stdin, continuing"),
            Err(_) => warn!("Stdin reader went away, continuing"),
        }
    }
}

/// Never waits. For unattended runs and tests.
#[derive(Debug, Default)]
pub struct NoopGate;

#[async_trait]
impl OperatorGate for NoopGate {
    async fn wait(&self, consecutive_blocks: u32) {
        info!(consecutive_blocks, "Block threshold reached, continuing unattended");
    }
}

#[derive(Debug, Default)]
struct Counters {
    blocks: u32,
    successes: u32,
}

pub struct ThrottleGuard {
    block_threshold: u32,
    success_reset_threshold: u32,
    counters: Mutex<Counters>,
    gate: Arc<dyn OperatorGate>,
    /// Only one worker talks to the operator at a time.
    gate_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ThrottleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleGuard")
            .field("block_threshold", &self.block_threshold)
            .field("success_reset_threshold", &self.success_reset_threshold)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl ThrottleGuard {
    #[must_use]
    pub fn new(
        block_threshold: u32,
        success_reset_threshold: u32,
        gate: Arc<dyn OperatorGate>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            block_threshold: block_threshold.max(1),
            success_reset_threshold: success_reset_threshold.max(1),
            counters: Mutex::new(Counters::default()),
            gate,
            gate_lock: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current consecutive block count.
    #[must_use]
    pub fn blocks(&self) -> u32 {
        self.counters().blocks
    }

    /// Count a blocked attempt, waiting at the gate once the threshold is hit.
    /// Cancellation ends the wait early and leaves the count as it was.
    pub async fn record_block(&self) {
        let blocks = {
            let mut counters = self.counters();
            counters.blocks += 1;
            counters.successes = 0;
            counters.blocks
        };

        if blocks < self.block_threshold {
            info!(blocks, threshold = self.block_threshold, "Block detected");
            return;
        }

        let _gate = tokio::select! {
            gate = self.gate_lock.lock() => gate,
            () = self.cancel.cancelled() => return,
        };
        // Another worker may have cleared the count while we waited
        let blocks = self.blocks();
        if blocks >= self.block_threshold {
            tokio::select! {
                () = self.gate.wait(blocks) => self.counters().blocks = 0,
                () = self.cancel.cancelled() => {
                    info!(blocks, "Operator gate abandoned on shutdown");
                }
            }
        }
    }

    /// Count a successful attempt, clearing blocks after a long enough run.
    pub fn record_success(&self) {
        let mut counters = self.counters();
        counters.successes += 1;
        if counters.successes >= self.success_reset_threshold {
            if counters.blocks > 0 {
                info!(
                    successes = counters.successes,
                    "Resetting block counter after consecutive successes"
                );
            }
            counters.blocks = 0;
            counters.successes = 0;
        }
    }
}
