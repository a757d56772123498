//! Parallel breadth-first enumeration of a file tree
//!
//! [`ParallelTreeLister`] runs a fixed number of worker threads over a shared
//! [`WorkQueue`] of directories seeded with the root. Each worker lists one
//! directory at a time, pushes child directories back onto the queue and
//! appends the files it found to a shared result list. The call returns once
//! the queue is drained.
//!
//! A directory that cannot be listed does not stop its siblings: the failure
//! is recorded and every collected failure is raised together as
//! [`SnapError::Listing`] once the walk is complete.
//!
//! The set of returned files does not depend on the worker count; only the
//! order does.

use crate::error::{AggregateError, Result, SnapError};
use crate::filesystem::{DirEntry, EntryKind, FileSystem};
use crate::pool::{CancelToken, ProgressTicker, WorkQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Default number of listing workers
pub const DEFAULT_LISTER_WORKERS: usize = 10;

/// Enumerates every file below a root with a bounded worker pool
#[derive(Debug, Clone)]
pub struct ParallelTreeLister {
    fs: Arc<dyn FileSystem>,
    workers: usize,
    progress_interval: Duration,
}

/// State shared by the workers of one listing
struct ListingState {
    queue: WorkQueue<String>,
    files: Mutex<Vec<DirEntry>>,
    errors: Mutex<Vec<SnapError>>,
    listed: Arc<AtomicUsize>,
}

impl ParallelTreeLister {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            workers: DEFAULT_LISTER_WORKERS,
            progress_interval: Duration::from_secs(10),
        }
    }

    /// Set the number of worker threads (at least 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set how often progress is logged
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// List every file below `root`
    ///
    /// Returned entries carry full paths and backend metadata, in no
    /// particular order.
    #[instrument(skip(self, cancel), fields(workers = self.workers))]
    pub fn list(&self, root: &str, cancel: &CancelToken) -> Result<Vec<DirEntry>> {
        let start = Instant::now();
        let state = ListingState {
            queue: WorkQueue::new(),
            files: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            listed: Arc::new(AtomicUsize::new(0)),
        };
        state.queue.push(root.to_string());

        let ticker = {
            let listed = Arc::clone(&state.listed);
            ProgressTicker::start(self.progress_interval, move || {
                info!("Progress: {} files listed", listed.load(Ordering::Relaxed));
            })
        };

        let drained = thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| self.run_worker(&state, cancel));
            }
            let drained = state.queue.join(cancel);
            // Release every worker parked on the empty queue
            state.queue.interrupt(self.workers);
            drained
        });
        ticker.stop();

        drained?;
        cancel.check()?;

        let errors = state.errors.into_inner();
        if !errors.is_empty() {
            warn!("Listing {} finished with {} errors", root, errors.len());
            return Err(SnapError::Listing(AggregateError::new(errors)));
        }

        let files = state.files.into_inner();
        info!(
            "Listed {} files under {} in {:?}",
            files.len(),
            root,
            start.elapsed()
        );
        Ok(files)
    }

    fn run_worker(&self, state: &ListingState, cancel: &CancelToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(dir) = state.queue.pop(cancel) else {
                return;
            };
            let _done = state.queue.task_guard();
            if cancel.is_cancelled() {
                return;
            }

            self.list_one(&dir, state);
        }
    }

    fn list_one(&self, dir: &str, state: &ListingState) {
        trace!("Listing {}", dir);
        match self.fs.list(dir) {
            Ok(entries) => {
                let mut found = Vec::new();
                for entry in entries {
                    match entry.kind {
                        // Children are queued before the parent is acknowledged,
                        // so the queue cannot look drained while work remains
                        EntryKind::Directory => state.queue.push(entry.path),
                        EntryKind::File => found.push(entry),
                    }
                }
                if !found.is_empty() {
                    state.listed.fetch_add(found.len(), Ordering::Relaxed);
                    state.files.lock().extend(found);
                }
            }
            Err(e) => {
                debug!("Error listing files in {}: {}", dir, e);
                state.errors.lock().push(SnapError::ListDirectory {
                    dir: dir.to_string(),
                    source: e,
                });
            }
        }
    }
}
