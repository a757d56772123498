//! Core data types used throughout the snapheap library
//!
//! ## Overview
//!
//! - **Tree state**: [`FileRecord`], [`Manifest`]
//! - **Operations**: [`SnapshotOptions`], [`RestoreOptions`], [`RestoreResult`],
//!   [`SnapshotSelector`]
//! - **Configuration**: [`SnapshotConfig`]
//!
//! ## Examples
//!
//! ```rust
//! use snapheap::types::{FileRecord, Manifest};
//!
//! let manifest = Manifest::from_records(vec![
//!     FileRecord::new("b.txt").with_checksum("0cc175b9c0f1b6a831c399e269772661"),
//!     FileRecord::new("a.txt").with_checksum("92eb5ffee6ae2fec3ad71c777531578f"),
//! ])
//! .unwrap();
//!
//! assert_eq!(manifest.names().collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
//! ```

use crate::diff::DiffStats;
use crate::error::{Result, SnapError};
use crate::filesystem::Metadata;
use crate::identity::IdentityCheckKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;

/// One file of a snapshot
///
/// Serialized as one JSON object per line in a manifest: `name`, `md5` and
/// every metadata key flattened next to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    /// Path relative to the file root, `/`-separated
    pub name: String,
    /// Content checksum, `None` until ingested or reused from a prior snapshot
    #[serde(rename = "md5", default)]
    pub checksum: Option<String>,
    /// Backend-specific attributes (size, mtime, version tag, ...)
    #[serde(flatten)]
    pub metadata: Metadata,
}

impl FileRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checksum: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Size in bytes, if the backend reported one
    pub fn size(&self) -> Option<u64> {
        self.metadata.get("size").and_then(Value::as_u64)
    }
}

/// Validate a relative record name
///
/// Names must be non-empty, relative and free of `..` components so that a
/// restore can never write outside the file root.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SnapError::InvalidManifest("empty file name".to_string()));
    }
    if name.starts_with('/') || name.contains('\\') || Path::new(name).is_absolute() {
        return Err(SnapError::InvalidManifest(format!(
            "file name must be relative: {}",
            name
        )));
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(SnapError::InvalidManifest(format!(
            "file name has an invalid component: {}",
            name
        )));
    }
    Ok(())
}

/// Set of file records unique by name, kept sorted by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    records: Vec<FileRecord>,
}

impl Manifest {
    /// Empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from records in any order
    ///
    /// Fails on invalid or duplicate names.
    pub fn from_records(mut records: Vec<FileRecord>) -> Result<Self> {
        for record in &records {
            validate_name(&record.name)?;
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = records.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(SnapError::InvalidManifest(format!(
                "duplicate file name: {}",
                pair[0].name
            )));
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by name
    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.records
            .binary_search_by(|r| r.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.records[idx])
    }

    /// Records in name order
    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileRecord> {
        self.records.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.name.as_str())
    }

    /// Sum of the `size` metadata of all records
    pub fn total_size(&self) -> u64 {
        self.records.iter().filter_map(FileRecord::size).sum()
    }

    pub fn into_records(self) -> Vec<FileRecord> {
        self.records
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a FileRecord;
    type IntoIter = std::slice::Iter<'a, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Options for [`make_snapshot`](crate::SnapshotManager::make_snapshot)
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Write the manifest under the snapshot root
    pub persist: bool,
    /// Also ingest files whose checksum is known but absent from the heap
    pub ingest_missing: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            persist: true,
            ingest_missing: true,
        }
    }
}

/// Options for restore operations
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Persist the snapshot of the current tree taken before restoring
    pub persist_safety_snapshot: bool,
    /// Re-hash heap content before writing it
    pub verify_hashes: bool,
    /// Compute the diff without touching the file tree
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            persist_safety_snapshot: true,
            verify_hashes: false,
            dry_run: false,
        }
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Files written (only-in-target and different)
    pub files_restored: usize,
    /// Files removed (only in the current tree)
    pub files_deleted: usize,
    /// Total bytes written
    pub bytes_written: u64,
    /// Time taken for restoration in milliseconds
    pub duration_ms: u64,
    /// Diff between target and current tree before restoring
    pub stats: DiffStats,
    /// Whether the tree was left untouched
    pub dry_run: bool,
}

/// Which persisted snapshot to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelector {
    /// Newest persisted snapshot
    Latest,
    /// Newest snapshot taken at or before the given instant
    AtOrBefore(DateTime<Utc>),
    /// Explicit manifest path
    Path(String),
}

impl FromStr for SnapshotSelector {
    type Err = SnapError;

    /// `latest`, a path ending in `.jsonl.gz`, or an RFC 3339 timestamp
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(SnapshotSelector::Latest);
        }
        if s.ends_with(".jsonl.gz") {
            return Ok(SnapshotSelector::Path(s.to_string()));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|ts| SnapshotSelector::AtOrBefore(ts.with_timezone(&Utc)))
            .map_err(|e| {
                SnapError::InvalidSnapshotPath(format!(
                    "'{}' is neither 'latest', a manifest path nor an RFC 3339 timestamp: {}",
                    s, e
                ))
            })
    }
}

fn default_workers() -> usize {
    10
}

fn default_block_size() -> usize {
    8 * 1024 * 1024
}

fn default_progress_interval_secs() -> u64 {
    10
}

/// Configuration for a snapshot manager, loadable from JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotConfig {
    /// Tree being snapshotted and restored
    pub file_root: String,
    /// Where manifests are persisted
    pub snap_root: String,
    /// Where content blobs are stored
    pub heap_root: String,
    /// Directory listing workers
    #[serde(default = "default_workers")]
    pub lister_workers: usize,
    /// Content ingestion workers
    #[serde(default = "default_workers")]
    pub ingest_workers: usize,
    /// Read buffer size used while hashing
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Seconds between progress log lines
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    /// Cheap identity check, chosen from the backend when absent
    #[serde(default)]
    pub identity_check: Option<IdentityCheckKind>,
}

impl SnapshotConfig {
    pub fn new(
        file_root: impl Into<String>,
        snap_root: impl Into<String>,
        heap_root: impl Into<String>,
    ) -> Self {
        Self {
            file_root: file_root.into(),
            snap_root: snap_root.into(),
            heap_root: heap_root.into(),
            lister_workers: default_workers(),
            ingest_workers: default_workers(),
            block_size: default_block_size(),
            progress_interval_secs: default_progress_interval_secs(),
            identity_check: None,
        }
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SnapError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SnapError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
