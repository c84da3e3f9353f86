//! Bounded FIFO job queue with drain tracking.
//!
//! Every enqueued item counts as unfinished until a consumer calls
//! [`JobQueue::task_done`] for it; [`JobQueue::join`] waits until that count
//! reaches zero. Progress counters (processed / total) live behind their own
//! lock and reset whenever the queue runs empty.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

/// Snapshot of a queue's progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    unfinished: usize,
}

#[derive(Debug)]
pub struct JobQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<State<T>>,
    progress: Mutex<Progress>,
    item_ready: Notify,
    space_ready: Notify,
    drained: Notify,
}

impl<T> JobQueue<T> {
    /// Create a queue holding at most `capacity` waiting items.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(State {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            progress: Mutex::new(Progress::default()),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            drained: Notify::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress_lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an item, waiting for space while the queue is full.
    pub async fn enqueue(&self, item: T) {
        let mut item = Some(item);
        loop {
            let space = self.space_ready.notified();
            {
                let mut state = self.state();
                if state.items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                        state.unfinished += 1;
                    }
                    break;
                }
            }
            space.await;
        }
        self.progress_lock().total += 1;
        self.item_ready.notify_one();
    }

    /// Take the oldest item, waiting at most `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, async {
            loop {
                let ready = self.item_ready.notified();
                if let Some(item) = self.try_dequeue() {
                    return item;
                }
                ready.await;
            }
        })
        .await
        .ok()
    }

    /// Take the oldest item if one is waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.state().items.pop_front();
        if item.is_some() {
            self.space_ready.notify_one();
        }
        item
    }

    /// Count a dequeued item as started and return the updated counters.
    pub fn mark_started(&self) -> Progress {
        let mut progress = self.progress_lock();
        progress.processed += 1;
        *progress
    }

    /// Mark one dequeued item as finished.
    pub fn task_done(&self) {
        let (drained, empty) = {
            let mut state = self.state();
            if state.unfinished == 0 {
                warn!(queue = self.name, "task_done called more times than items were enqueued");
                return;
            }
            state.unfinished -= 1;
            (state.unfinished == 0, state.items.is_empty())
        };

        if empty {
            *self.progress_lock() = Progress::default();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every enqueued item has been marked done.
    pub async fn join(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.state().unfinished == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Number of items waiting to be dequeued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items enqueued but not yet marked done.
    #[must_use]
    pub fn unfinished(&self) -> usize {
        self.state().unfinished
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        *self.progress_lock()
    }
}
