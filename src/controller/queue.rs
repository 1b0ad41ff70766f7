//! # Reconciliation Queue
//!
//! Deduplicating, rate-limited work queue of resource identities
//! (`namespace/name` strings).
//!
//! The queue is a set with FIFO-ish delivery: adding an identity that is
//! already pending is a no-op, and adding one that is currently being
//! processed marks it dirty so that exactly one fresh delivery happens after
//! `mark_done`. That gives every identity at-least-once, never-concurrent
//! processing without ever dropping work.
//!
//! Failed items come back through [`WorkQueue::add_after_failure`], which
//! delays the re-add by a per-identity capped exponential backoff. A call to
//! [`WorkQueue::forget`] after a successful attempt resets that backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use super::backoff::ExponentialBackoff;
use crate::observability::metrics;

#[derive(Default)]
struct QueueState {
    /// Identities awaiting delivery, in arrival order.
    order: VecDeque<String>,
    /// Identities that need (re)processing, whether queued or in flight.
    dirty: HashSet<String>,
    /// Identities currently held by a worker between `next` and `mark_done`.
    processing: HashSet<String>,
    /// Per-identity retry backoff, reset on `forget`.
    backoffs: HashMap<String, ExponentialBackoff>,
    shutting_down: bool,
}

/// Shared work queue for reconcile workers.
///
/// All methods are callable from any task; `next` is the only one that
/// suspends.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
        })
    }

    /// Enqueue an identity. No-op if it is already pending; if it is in
    /// flight, it is marked for exactly one redelivery after `mark_done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_owned());
        if state.processing.contains(key) {
            // Redelivered by mark_done once the in-flight attempt finishes.
            return;
        }
        state.order.push_back(key.to_owned());
        metrics::set_workqueue_depth(state.order.len());
        drop(state);
        self.wakeup.notify_one();
    }

    /// Re-enqueue a failed identity after its next backoff delay.
    ///
    /// Unbounded retries: the item is delayed, never dropped.
    pub fn add_after_failure(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutting_down {
                return;
            }
            state
                .backoffs
                .entry(key.to_owned())
                .or_default()
                .next_backoff()
        };
        debug!(key, delay_secs = delay.as_secs_f64(), "requeueing after failure");
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Clear the retry backoff for an identity after a successful attempt.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.backoffs.remove(key);
    }

    /// Wait for the next identity. Returns `None` only once the queue is
    /// shutting down and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                // Pending items are discarded at shutdown; no new work starts.
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.order.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_workqueue_depth(state.order.len());
                    if !state.order.is_empty() {
                        // Cascade the wakeup to the next idle worker.
                        self.wakeup.notify_one();
                    }
                    return Some(key);
                }
            }
            self.wakeup.notified().await;
        }
    }

    /// Finish processing an identity obtained from `next`. Must be called
    /// exactly once per delivery; redelivers the identity if it went dirty
    /// while in flight.
    pub fn mark_done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.order.push_back(key.to_owned());
            metrics::set_workqueue_depth(state.order.len());
            drop(state);
            self.wakeup.notify_one();
        }
    }

    /// Stop delivery. In-flight items may still call `mark_done`; pending
    /// items are discarded and waiting workers receive `None`.
    pub fn shut_down(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.shutting_down = true;
        drop(state);
        self.wakeup.notify_waiters();
        // Wake one more in case a worker raced past notify_waiters.
        self.wakeup.notify_one();
    }

    /// Number of identities awaiting delivery (excludes in-flight ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
