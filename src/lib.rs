//! # snapheap - Deduplicating snapshots of file trees
//!
//! A snapshot engine that captures the state of a file tree as a compact
//! manifest (name → content checksum), stores every distinct content exactly
//! once in a checksum-addressed blob store (the "heap"), and can diff any two
//! manifests or restore a tree to match a chosen one.
//!
//! ## Overview
//!
//! - **Heap**: gzip-compressed blobs at `<c[0:2]>/<c[2:4]>/<c[4:6]>/<c>.gz`,
//!   written through a temp file and renamed into place, so a blob at its
//!   final path is always complete
//! - **Parallel listing**: a bounded pool of threads walks the tree
//!   breadth-first over a shared work queue
//! - **Parallel ingestion**: a bounded rayon pool streams file content
//!   through MD5 and gzip into the heap
//! - **Snapshots**: timestamped gzip JSON-lines manifests under
//!   `<snap_root>/<YYYY>/<MM>/`
//!
//! Unchanged files are not re-read when the backend offers a cheap identity
//! check (e.g. object-store version tags), and content already in the heap
//! is never stored twice.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapheap::{SnapshotManager, SnapshotOptions, RestoreOptions, SnapshotSelector};
//!
//! # fn main() -> snapheap::Result<()> {
//! let manager = SnapshotManager::builder()
//!     .build("./my_project", "./backup/snapshots", "./backup/heap")?;
//!
//! // Capture and persist the current state
//! let (manifest, timestamp) = manager.make_snapshot(&SnapshotOptions::default())?;
//! println!("{} files at {}", manifest.len(), timestamp);
//!
//! // Compare with the newest persisted snapshot
//! let latest = manager.read_snapshot(&SnapshotSelector::Latest)?;
//! let table = manager.diff(&latest, &manifest);
//! println!("{:?}", table.stats());
//!
//! // Roll the tree back
//! let result = manager.restore(&latest, &RestoreOptions::default())?;
//! println!("Restored {} files, deleted {}", result.files_restored, result.files_deleted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`]. Parallel components collect per-item
//! failures and raise them together once all items were attempted, so one
//! error enumerates every failed directory or file. Work completed before a
//! failure (blobs already in the heap) is kept, which makes retries cheap.
//!
//! ## Cancellation
//!
//! Every manager owns a [`CancelToken`]; cancelling it from another thread
//! makes running operations stop promptly with [`SnapError::Interrupted`]
//! without leaving partial blobs behind.
//!
//! ## Module Organization
//!
//! - [`snapshot`]: snapshot manager and its builder
//! - [`heap`]: content-addressable blob store
//! - [`lister`]: parallel tree listing
//! - [`ingest`]: parallel content ingestion
//! - [`diff`]: manifest comparison
//! - [`manifest`]: manifest persistence and snapshot paths
//! - [`identity`]: cheap unchanged-file checks
//! - [`filesystem`]: storage backend abstraction
//! - [`pool`]: cancellation and worker queue plumbing
//! - [`types`]: common types and configuration
//! - [`error`]: error types

pub mod diff;
pub mod error;
pub mod filesystem;
pub mod heap;
pub mod identity;
pub mod ingest;
pub mod lister;
pub mod manifest;
pub mod pool;
pub mod snapshot;
pub mod types;

// Re-export main types for convenience
pub use diff::{diff, DiffRow, DiffStats, DiffStatus, DiffTable};
pub use error::{AggregateError, Result, SnapError};
pub use filesystem::{DirEntry, EntryKind, FileSystem, LocalFileSystem, Metadata};
pub use heap::Heap;
pub use identity::{
    identity_check_for, IdentityCheck, IdentityCheckKind, MetadataIdentityCheck, NoIdentityCheck,
    VersionTagIdentityCheck,
};
pub use ingest::ParallelContentIngester;
pub use lister::ParallelTreeLister;
pub use pool::CancelToken;
pub use snapshot::{SnapshotManager, SnapshotManagerBuilder};
pub use types::*;
