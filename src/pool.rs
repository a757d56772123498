//! Concurrency plumbing shared by the parallel components
//!
//! - [`CancelToken`]: cooperative cancellation flag passed to every blocking
//!   call site
//! - [`WorkQueue`]: join-trackable FIFO of jobs with sentinel-based shutdown
//! - [`TaskGuard`]: acknowledges a popped item on drop, including on unwind
//! - [`ProgressTicker`]: background thread that periodically logs progress
//!
//! Locks in this module are held only for O(1) queue operations, never
//! across I/O.

use crate::error::{Result, SnapError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// How long a blocked queue operation sleeps before re-checking cancellation
const WAKE_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation token
///
/// Clones share the same flag. Cancelling is irreversible.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation holding this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return [`SnapError::Interrupted`] if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SnapError::Interrupted)
        } else {
            Ok(())
        }
    }
}

enum Job<T> {
    Work(T),
    Stop,
}

struct QueueState<T> {
    jobs: VecDeque<Job<T>>,
    /// Pushed work items not yet acknowledged with `task_done`
    unfinished: usize,
}

/// Join-trackable work queue
///
/// Every pushed item must be acknowledged with [`WorkQueue::task_done`] once
/// processed; [`WorkQueue::join`] blocks until all pushed items were
/// acknowledged. [`WorkQueue::interrupt`] injects one stop sentinel per worker
/// so that workers parked in [`WorkQueue::pop`] return.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    drained: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                unfinished: 0,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Enqueue a work item
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        state.jobs.push_back(Job::Work(item));
        state.unfinished += 1;
        self.available.notify_one();
    }

    /// Block until a work item is available
    ///
    /// Returns `None` when a stop sentinel is received or `cancel` fires.
    pub fn pop(&self, cancel: &CancelToken) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match state.jobs.pop_front() {
                Some(Job::Work(item)) => return Some(item),
                Some(Job::Stop) => return None,
                None => {
                    self.available.wait_for(&mut state, WAKE_INTERVAL);
                }
            }
        }
    }

    /// Acknowledge that a popped item was fully processed
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            warn!("task_done called more times than items were pushed");
            return;
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.drained.notify_all();
        }
    }

    /// Acknowledge one popped item when the returned guard is dropped
    ///
    /// The acknowledgement also happens when the holder unwinds, so
    /// [`WorkQueue::join`] cannot wait on an item whose worker panicked.
    pub fn task_guard(&self) -> TaskGuard<'_, T> {
        TaskGuard { queue: self }
    }

    /// Block until every pushed item was acknowledged
    ///
    /// Fails with [`SnapError::Interrupted`] if `cancel` fires first.
    pub fn join(&self, cancel: &CancelToken) -> Result<()> {
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            if cancel.is_cancelled() {
                return Err(SnapError::Interrupted);
            }
            self.drained.wait_for(&mut state, WAKE_INTERVAL);
        }
        Ok(())
    }

    /// Inject one stop sentinel per worker and wake all parked workers
    pub fn interrupt(&self, workers: usize) {
        let mut state = self.state.lock();
        for _ in 0..workers {
            state.jobs.push_back(Job::Stop);
        }
        self.available.notify_all();
    }

    /// Number of items pushed but not yet acknowledged
    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }
}

/// Calls [`WorkQueue::task_done`] on drop
#[must_use = "the item is acknowledged as soon as the guard is dropped"]
pub struct TaskGuard<'a, T> {
    queue: &'a WorkQueue<T>,
}

impl<T> Drop for TaskGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

/// Background thread that calls `report` every `interval` until stopped
pub struct ProgressTicker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn start<F>(interval: Duration, report: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("snapheap-progress".to_string())
            .spawn(move || {
                let (lock, cvar) = &*stop_clone;
                let mut stopped = lock.lock();
                while !*stopped {
                    let timed_out = cvar.wait_for(&mut stopped, interval).timed_out();
                    if timed_out && !*stopped {
                        report();
                    }
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start progress thread: {}", e);
                None
            }
        };

        Self { stop, handle }
    }

    /// Stop the ticker and wait for its thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
