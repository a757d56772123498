//! Parallel ingestion of file content into the heap
//!
//! Each requested file is opened on the source file system and streamed into
//! [`Heap::add_file`] by a fixed-size rayon pool. The returned checksum is
//! written back into the file's record.
//!
//! Failures of single files (open errors, read errors, a checksum that does
//! not match the one already declared on the record) are collected while the
//! rest of the batch keeps going, then raised together as
//! [`SnapError::Ingestion`]. Cancellation stops the pool from starting new
//! files; files already in flight notice it at their next block and clean up.

use crate::error::{AggregateError, Result, SnapError};
use crate::filesystem::{join_path, FileSystem};
use crate::heap::Heap;
use crate::pool::{CancelToken, ProgressTicker};
use crate::types::FileRecord;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Default number of ingestion workers
pub const DEFAULT_INGEST_WORKERS: usize = 10;

/// Reads source files into the heap with a bounded worker pool
#[derive(Debug, Clone)]
pub struct ParallelContentIngester {
    fs: Arc<dyn FileSystem>,
    file_root: String,
    workers: usize,
    progress_interval: Duration,
}

impl ParallelContentIngester {
    /// Ingester reading names relative to `file_root` from `fs`
    pub fn new(fs: Arc<dyn FileSystem>, file_root: impl Into<String>) -> Self {
        Self {
            fs,
            file_root: file_root.into(),
            workers: DEFAULT_INGEST_WORKERS,
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

    /// Ingest `names` and fill in the checksums of their records
    ///
    /// On success every requested record carries a checksum.
    #[instrument(skip_all, fields(files = names.len(), workers = self.workers))]
    pub fn ingest(
        &self,
        records: &mut BTreeMap<String, FileRecord>,
        names: &BTreeSet<String>,
        heap: &Heap,
        cancel: &CancelToken,
    ) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let total = names.len();
        let mut errors = Vec::new();

        let mut jobs = Vec::with_capacity(total);
        for name in names {
            match records.get(name) {
                Some(record) => jobs.push((name.as_str(), record.checksum.clone())),
                None => errors.push(SnapError::Ingest {
                    name: name.clone(),
                    source: Box::new(SnapError::InvalidManifest(
                        "no listing record for file".to_string(),
                    )),
                }),
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("snapheap-ingest-{}", i))
            .build()
            .map_err(|e| SnapError::InvalidConfiguration(format!("ingest pool: {}", e)))?;

        let done = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let done = Arc::clone(&done);
            ProgressTicker::start(self.progress_interval, move || {
                info!("Progress: {}/{} files ingested", done.load(Ordering::Relaxed), total);
            })
        };

        let outcomes: Vec<(&str, Option<String>, Result<String>)> = pool.install(|| {
            jobs.into_par_iter()
                .map(|(name, declared)| {
                    if cancel.is_cancelled() {
                        return (name, declared, Err(SnapError::Interrupted));
                    }
                    let outcome = self.ingest_one(name, heap, cancel);
                    done.fetch_add(1, Ordering::Relaxed);
                    (name, declared, outcome)
                })
                .collect()
        });
        ticker.stop();

        cancel.check()?;

        let mut interrupted = false;
        for (name, declared, outcome) in outcomes {
            match outcome {
                Ok(actual) => match declared {
                    Some(declared) if declared != actual => {
                        errors.push(SnapError::ChecksumMismatch {
                            name: name.to_string(),
                            declared,
                            actual,
                        });
                    }
                    _ => {
                        if let Some(record) = records.get_mut(name) {
                            record.checksum = Some(actual);
                        }
                    }
                },
                Err(e) if e.is_interrupted() => interrupted = true,
                Err(e) => errors.push(SnapError::Ingest {
                    name: name.to_string(),
                    source: Box::new(e),
                }),
            }
        }
        if interrupted {
            return Err(SnapError::Interrupted);
        }

        if !errors.is_empty() {
            for err in &errors {
                warn!("{}", err);
            }
            return Err(SnapError::Ingestion(AggregateError::new(errors)));
        }

        info!(
            "Ingested {} files in {:?} (heap holds {} blobs)",
            total,
            start.elapsed(),
            heap.len()
        );
        Ok(())
    }

    fn ingest_one(&self, name: &str, heap: &Heap, cancel: &CancelToken) -> Result<String> {
        let path = join_path(&self.file_root, name);
        let mut reader = self.fs.open_read(&path)?;
        let checksum = heap.add_file(&mut reader, cancel)?;
        debug!("Ingested {} as {}", name, checksum);
        Ok(checksum)
    }
}
