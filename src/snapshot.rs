//! Snapshot orchestration
//!
//! [`SnapshotManager`] ties the components together:
//!
//! 1. **Snapshot**: list the tree, reuse checksums of files the identity
//!    check proves unchanged since the prior snapshot, ingest everything
//!    else into the heap, and persist the resulting manifest.
//! 2. **Read**: locate a persisted manifest by path, or the newest one taken
//!    at or before a given time.
//! 3. **Diff**: merge-join two manifests by name.
//! 4. **Restore**: take a safety snapshot of the current tree (which also
//!    guarantees its content is in the heap), diff the target against it,
//!    then write and delete files until the tree matches the target.
//!
//! The manager keeps no state between calls beyond its configuration, the
//! heap and a cancellation token shared with every component.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapheap::{SnapshotManager, SnapshotOptions, RestoreOptions};
//!
//! # fn example() -> snapheap::Result<()> {
//! let manager = SnapshotManager::builder()
//!     .lister_workers(8)
//!     .ingest_workers(4)
//!     .build("/data/project", "/backup/snapshots", "/backup/heap")?;
//!
//! let (before, _) = manager.make_snapshot(&SnapshotOptions::default())?;
//! // ... files change ...
//! let result = manager.restore(&before, &RestoreOptions::default())?;
//! println!("Restored {} files", result.files_restored);
//! # Ok(())
//! # }
//! ```

use crate::diff::{self, DiffRow, DiffStatus, DiffTable};
use crate::error::{AggregateError, Result, SnapError};
use crate::filesystem::{coerce_root, join_path, parent_path, FileSystem, LocalFileSystem};
use crate::heap::{Heap, DEFAULT_BLOCK_SIZE};
use crate::identity::{identity_check_for, IdentityCheck, IdentityCheckKind};
use crate::ingest::ParallelContentIngester;
use crate::lister::{ParallelTreeLister, DEFAULT_LISTER_WORKERS};
use crate::manifest::{
    latest_at_or_before, read_manifest, snapshot_glob, snapshot_path_for, timestamp_from_path,
    write_manifest,
};
use crate::pool::CancelToken;
use crate::types::{
    FileRecord, Manifest, RestoreOptions, RestoreResult, SnapshotConfig, SnapshotOptions,
    SnapshotSelector,
};
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Orchestrates snapshots, diffs and restores of one file tree
#[derive(Debug)]
pub struct SnapshotManager {
    fs: Arc<dyn FileSystem>,
    snap_fs: Arc<dyn FileSystem>,
    heap: Arc<Heap>,
    file_root: String,
    snap_root: String,
    lister: ParallelTreeLister,
    ingester: ParallelContentIngester,
    identity: Arc<dyn IdentityCheck>,
    cancel: CancelToken,
}

impl SnapshotManager {
    pub fn builder() -> SnapshotManagerBuilder {
        SnapshotManagerBuilder::new()
    }

    /// Build a manager from a loaded configuration
    pub fn from_config(config: &SnapshotConfig) -> Result<Self> {
        SnapshotManagerBuilder::from_config(config).build(
            &config.file_root,
            &config.snap_root,
            &config.heap_root,
        )
    }

    pub fn file_root(&self) -> &str {
        &self.file_root
    }

    pub fn snap_root(&self) -> &str {
        &self.snap_root
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Token cancelling every running and future operation of this manager
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Capture the current state of the tree
    ///
    /// Returns the manifest and its timestamp (UTC, microsecond precision).
    #[instrument(skip(self), fields(root = %self.file_root))]
    pub fn make_snapshot(&self, options: &SnapshotOptions) -> Result<(Manifest, DateTime<Utc>)> {
        let start = Instant::now();
        let timestamp = Utc::now().trunc_subsecs(6);

        let prior = self
            .try_read_snapshot(&SnapshotSelector::AtOrBefore(timestamp))?
            .unwrap_or_default();
        let mut records = self.list_records()?;

        let mut reused = 0usize;
        for record in records.values_mut() {
            if let Some(prior_record) = prior.get(&record.name) {
                if let Some(checksum) = self.identity.unchanged_checksum(record, prior_record) {
                    record.checksum = Some(checksum);
                    reused += 1;
                }
            }
        }

        let missing: BTreeSet<String> = records
            .values()
            .filter(|r| match &r.checksum {
                None => true,
                Some(checksum) => options.ingest_missing && !self.heap.contains(checksum),
            })
            .map(|r| r.name.clone())
            .collect();
        debug!(
            "{} files listed, {} checksums reused, {} to ingest",
            records.len(),
            reused,
            missing.len()
        );

        self.ingester
            .ingest(&mut records, &missing, &self.heap, &self.cancel)?;

        let manifest = Manifest::from_records(records.into_values().collect())?;
        if options.persist {
            let path = snapshot_path_for(&self.snap_root, &timestamp);
            write_manifest(self.snap_fs.as_ref(), &path, &manifest)?;
            info!("Saved snapshot {}", path);
        }

        info!(
            "Snapshot of {} files ({} ingested) taken in {:?}",
            manifest.len(),
            missing.len(),
            start.elapsed()
        );
        Ok((manifest, timestamp))
    }

    /// List the tree into records keyed by relative name
    fn list_records(&self) -> Result<BTreeMap<String, FileRecord>> {
        let entries = self.lister.list(&self.file_root, &self.cancel)?;
        let prefix = format!("{}/", self.file_root.trim_end_matches('/'));

        // Snapshot and heap roots nested in the tree are not part of it
        let excluded: Vec<String> = [self.snap_root.as_str(), self.heap.root()]
            .into_iter()
            .filter_map(|root| root.strip_prefix(prefix.as_str()))
            .map(|relative| format!("{}/", relative))
            .collect();

        let mut records = BTreeMap::new();
        for entry in entries {
            let Some(name) = entry.path.strip_prefix(&prefix) else {
                warn!("Listed path {} is outside {}", entry.path, self.file_root);
                continue;
            };
            if excluded.iter().any(|dir| name.starts_with(dir.as_str())) {
                trace!("Skipping {} inside a snapshot or heap root", name);
                continue;
            }
            records.insert(
                name.to_string(),
                FileRecord {
                    name: name.to_string(),
                    checksum: None,
                    metadata: entry.metadata,
                },
            );
        }
        Ok(records)
    }

    /// All persisted snapshot paths, sorted
    pub fn list_snapshot_paths(&self) -> Result<Vec<String>> {
        self.snap_fs.glob(&snapshot_glob(&self.snap_root))
    }

    /// Persisted snapshots with their timestamps, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<(DateTime<Utc>, String)>> {
        let mut snapshots = Vec::new();
        for path in self.list_snapshot_paths()? {
            match timestamp_from_path(&path) {
                Ok(timestamp) => snapshots.push((timestamp, path)),
                Err(e) => debug!("Skipping {}", e),
            }
        }
        snapshots.sort();
        Ok(snapshots)
    }

    /// Path of the persisted manifest matching `selector`, if any
    pub fn find_snapshot_path(&self, selector: &SnapshotSelector) -> Result<Option<String>> {
        match selector {
            SnapshotSelector::Path(path) => {
                Ok(self.snap_fs.exists(path).then(|| path.clone()))
            }
            SnapshotSelector::Latest => {
                let paths = self.list_snapshot_paths()?;
                Ok(latest_at_or_before(&paths, None).cloned())
            }
            SnapshotSelector::AtOrBefore(limit) => {
                let paths = self.list_snapshot_paths()?;
                Ok(latest_at_or_before(&paths, Some(limit)).cloned())
            }
        }
    }

    /// Read the manifest matching `selector`, or `None` if there is none
    pub fn try_read_snapshot(&self, selector: &SnapshotSelector) -> Result<Option<Manifest>> {
        match self.find_snapshot_path(selector)? {
            Some(path) => {
                debug!("Reading snapshot {}", path);
                read_manifest(self.snap_fs.as_ref(), &path).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Read the manifest matching `selector`
    #[instrument(skip(self))]
    pub fn read_snapshot(&self, selector: &SnapshotSelector) -> Result<Manifest> {
        self.try_read_snapshot(selector)?
            .ok_or_else(|| SnapError::SnapshotNotFound(describe(selector)))
    }

    /// Compare two manifests by name
    pub fn diff(&self, left: &Manifest, right: &Manifest) -> DiffTable {
        diff::diff(left, right)
    }

    /// Make the tree match `target`
    ///
    /// Files only in `target` or with a different checksum are written from
    /// the heap; files absent from `target` are deleted. Every row is
    /// attempted; per-file failures are raised together afterwards.
    #[instrument(skip(self, target), fields(files = target.len()))]
    pub fn restore(&self, target: &Manifest, options: &RestoreOptions) -> Result<RestoreResult> {
        let start = Instant::now();
        info!("Restoring {} to a manifest of {} files", self.file_root, target.len());

        let (current, _) = self.make_snapshot(&SnapshotOptions {
            persist: options.persist_safety_snapshot,
            ingest_missing: true,
        })?;
        let table = diff::diff(target, &current);

        let mut result = RestoreResult {
            stats: table.stats(),
            dry_run: options.dry_run,
            ..Default::default()
        };
        if options.dry_run {
            result.files_restored = result.stats.only_left + result.stats.different;
            result.files_deleted = result.stats.only_right;
            result.duration_ms = start.elapsed().as_millis() as u64;
            info!("Dry run: nothing written");
            return Ok(result);
        }

        let mut errors = Vec::new();
        let to_write = table
            .rows()
            .iter()
            .filter(|row| matches!(row.status, DiffStatus::OnlyLeft | DiffStatus::Different));
        for row in to_write {
            self.cancel.check()?;
            match self.restore_file(row, options.verify_hashes) {
                Ok(bytes) => {
                    result.files_restored += 1;
                    result.bytes_written += bytes;
                    trace!("Restored {}", row.name);
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => errors.push(SnapError::RestoreFile {
                    name: row.name.clone(),
                    source: Box::new(e),
                }),
            }
        }

        for row in table.rows_with(DiffStatus::OnlyRight) {
            self.cancel.check()?;
            match self.fs.remove(&join_path(&self.file_root, &row.name)) {
                Ok(()) => {
                    result.files_deleted += 1;
                    trace!("Deleted {}", row.name);
                }
                Err(e) => errors.push(SnapError::RestoreFile {
                    name: row.name.clone(),
                    source: Box::new(e.into()),
                }),
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        if !errors.is_empty() {
            warn!("Restore finished with {} errors", errors.len());
            return Err(SnapError::Restore(AggregateError::new(errors)));
        }

        info!(
            "Restore complete: {} written, {} deleted, {} bytes in {:?}",
            result.files_restored,
            result.files_deleted,
            result.bytes_written,
            start.elapsed()
        );
        Ok(result)
    }

    /// Resolve a persisted snapshot and restore it
    pub fn restore_snapshot(
        &self,
        selector: &SnapshotSelector,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        let target = self.read_snapshot(selector)?;
        self.restore(&target, options)
    }

    /// Write the target content of one row and return the bytes written
    fn restore_file(&self, row: &DiffRow, verify: bool) -> Result<u64> {
        let checksum = row.left.as_deref().ok_or_else(|| {
            SnapError::InvalidManifest(format!("no checksum recorded for {}", row.name))
        })?;

        // Resolve the blob before touching the destination
        let mut blob: Box<dyn io::Read> = if verify {
            Box::new(io::Cursor::new(self.heap.open_verified(checksum)?))
        } else {
            Box::new(self.heap.open(checksum)?)
        };

        let dest = join_path(&self.file_root, &row.name);
        if let Some(parent) = parent_path(&dest) {
            self.fs.mkdirs(parent)?;
        }

        // The existing file is only replaced once the new content is complete
        let partial = format!("{}.partial", dest);
        let written = (|| -> Result<u64> {
            let mut out = self.fs.open_write(&partial)?;
            let written = io::copy(&mut blob, &mut out)?;
            out.flush()?;
            Ok(written)
        })();
        let renamed = written.and_then(|n| {
            self.fs.rename(&partial, &dest)?;
            Ok(n)
        });
        match renamed {
            Ok(n) => Ok(n),
            Err(e) => {
                if self.fs.exists(&partial) {
                    let _ = self.fs.remove(&partial);
                }
                Err(e)
            }
        }
    }
}

fn describe(selector: &SnapshotSelector) -> String {
    match selector {
        SnapshotSelector::Latest => "latest".to_string(),
        SnapshotSelector::AtOrBefore(ts) => format!("at or before {}", ts.to_rfc3339()),
        SnapshotSelector::Path(path) => path.clone(),
    }
}

/// Builder for configuring a [`SnapshotManager`]
#[derive(Debug, Clone)]
pub struct SnapshotManagerBuilder {
    lister_workers: usize,
    ingest_workers: usize,
    block_size: usize,
    progress_interval: Duration,
    identity_check: Option<Arc<dyn IdentityCheck>>,
    identity_kind: Option<IdentityCheckKind>,
    file_system: Option<Arc<dyn FileSystem>>,
    snap_file_system: Option<Arc<dyn FileSystem>>,
    heap_file_system: Option<Arc<dyn FileSystem>>,
    heap: Option<Arc<Heap>>,
    cancel: Option<CancelToken>,
}

impl Default for SnapshotManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotManagerBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            lister_workers: DEFAULT_LISTER_WORKERS,
            ingest_workers: num_cpus::get(),
            block_size: DEFAULT_BLOCK_SIZE,
            progress_interval: Duration::from_secs(10),
            identity_check: None,
            identity_kind: None,
            file_system: None,
            snap_file_system: None,
            heap_file_system: None,
            heap: None,
            cancel: None,
        }
    }

    /// Builder preloaded with the tuning values of a configuration
    pub fn from_config(config: &SnapshotConfig) -> Self {
        let mut builder = Self::new()
            .lister_workers(config.lister_workers)
            .ingest_workers(config.ingest_workers)
            .block_size(config.block_size)
            .progress_interval(Duration::from_secs(config.progress_interval_secs));
        builder.identity_kind = config.identity_check;
        builder
    }

    /// Set number of directory listing workers (minimum 1)
    pub fn lister_workers(mut self, count: usize) -> Self {
        self.lister_workers = count.max(1);
        self
    }

    /// Set number of content ingestion workers (minimum 1)
    pub fn ingest_workers(mut self, count: usize) -> Self {
        self.ingest_workers = count.max(1);
        self
    }

    /// Set the read block size used while hashing
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set how often long-running components log progress
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Use a specific identity check instead of the backend default
    pub fn identity_check(mut self, check: Arc<dyn IdentityCheck>) -> Self {
        self.identity_check = Some(check);
        self
    }

    /// Select an identity check by kind, instantiated for the source backend
    pub fn identity_check_kind(mut self, kind: IdentityCheckKind) -> Self {
        self.identity_kind = Some(kind);
        self
    }

    /// File system holding the tree (local disk by default)
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// File system holding the manifests (local disk by default)
    pub fn snap_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.snap_file_system = Some(fs);
        self
    }

    /// File system holding the heap (local disk by default)
    pub fn heap_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.heap_file_system = Some(fs);
        self
    }

    /// Use an already opened heap; the heap root passed to `build` is ignored
    pub fn heap(mut self, heap: Arc<Heap>) -> Self {
        self.heap = Some(heap);
        self
    }

    /// Share a cancellation token with the caller
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the manager, opening the heap if none was supplied
    pub fn build(self, file_root: &str, snap_root: &str, heap_root: &str) -> Result<SnapshotManager> {
        if self.block_size == 0 {
            return Err(SnapError::InvalidConfiguration(
                "block size must be greater than zero".to_string(),
            ));
        }

        let local: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
        let fs = self.file_system.unwrap_or_else(|| Arc::clone(&local));
        let snap_fs = self.snap_file_system.unwrap_or_else(|| Arc::clone(&local));
        let cancel = self.cancel.unwrap_or_default();

        let heap = match self.heap {
            Some(heap) => heap,
            None => {
                let heap_fs = self.heap_file_system.unwrap_or(local);
                let heap = Heap::open_dir(heap_fs, heap_root, self.lister_workers, &cancel)?
                    .with_block_size(self.block_size);
                Arc::new(heap)
            }
        };

        let identity = match (self.identity_check, self.identity_kind) {
            (Some(check), _) => check,
            (None, Some(kind)) => kind.build(fs.backend()),
            (None, None) => identity_check_for(fs.backend()),
        };

        let file_root = coerce_root(file_root);
        let lister = ParallelTreeLister::new(Arc::clone(&fs))
            .with_workers(self.lister_workers)
            .with_progress_interval(self.progress_interval);
        let ingester = ParallelContentIngester::new(Arc::clone(&fs), file_root.clone())
            .with_workers(self.ingest_workers)
            .with_progress_interval(self.progress_interval);

        debug!(
            "Snapshot manager for {} ({} listers, {} ingesters, identity {:?})",
            file_root, self.lister_workers, self.ingest_workers, identity
        );

        Ok(SnapshotManager {
            fs,
            snap_fs,
            heap,
            file_root,
            snap_root: coerce_root(snap_root),
            lister,
            ingester,
            identity,
            cancel,
        })
    }
}
