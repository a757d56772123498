//! Error types for the snapheap library
//!
//! Every fallible operation returns [`Result<T>`]. Parallel components never
//! stop at the first failing item: per-directory and per-file failures are
//! recorded, the remaining work keeps running, and the collected failures are
//! raised together as one [`AggregateError`] wrapped in the component's
//! variant ([`SnapError::Listing`], [`SnapError::Ingestion`],
//! [`SnapError::Restore`]).
//!
//! [`SnapError::Interrupted`] is the exception to that rule: cancellation is
//! fatal and propagates as soon as the component has stopped its workers.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the snapheap library
pub type Result<T> = std::result::Result<T, SnapError>;

/// Main error type for all snapheap operations
#[derive(Debug, Error)]
pub enum SnapError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Glob pattern could not be compiled
    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),

    /// Listing a single directory failed
    #[error("Error listing files in {dir}: {source}")]
    ListDirectory {
        /// Directory whose listing failed
        dir: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// One or more directories could not be listed
    #[error("Errors occurred during file listing:\n{0}")]
    Listing(AggregateError),

    /// Reading a single file into the heap failed
    #[error("Error ingesting {name}: {source}")]
    Ingest {
        /// Relative name of the file
        name: String,
        /// Underlying failure
        #[source]
        source: Box<SnapError>,
    },

    /// Declared checksum disagrees with the one computed from content
    #[error("Checksum mismatch for '{name}': declared {declared}, computed {actual}")]
    ChecksumMismatch {
        /// Relative name of the file (or the requested checksum for heap reads)
        name: String,
        /// Checksum carried by the record before ingestion
        declared: String,
        /// Checksum computed from the bytes
        actual: String,
    },

    /// One or more files could not be ingested
    #[error("Errors occurred during file ingestion:\n{0}")]
    Ingestion(AggregateError),

    /// Cooperative cancellation was requested
    #[error("Operation interrupted")]
    Interrupted,

    /// No manifest matches the requested selector
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Checksum is not present in the heap
    #[error("Object not found in heap: {0}")]
    ObjectNotFound(String),

    /// A manifest file is malformed
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// A snapshot path does not carry a decodable timestamp
    #[error("Invalid snapshot path: {0}")]
    InvalidSnapshotPath(String),

    /// Writing or deleting a single file during restore failed
    #[error("Error restoring {name}: {source}")]
    RestoreFile {
        /// Relative name of the file
        name: String,
        /// Underlying failure
        #[source]
        source: Box<SnapError>,
    },

    /// One or more files could not be restored
    #[error("Errors occurred during restore:\n{0}")]
    Restore(AggregateError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file could not be read
    #[error("Cannot read configuration {path:?}: {reason}")]
    ConfigFile {
        /// Path to the configuration file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },
}

impl SnapError {
    /// Whether this error (or the failure it wraps) is a cancellation
    pub fn is_interrupted(&self) -> bool {
        match self {
            SnapError::Interrupted => true,
            SnapError::Ingest { source, .. } | SnapError::RestoreFile { source, .. } => {
                source.is_interrupted()
            }
            _ => false,
        }
    }

    /// Check if retrying the same operation can succeed
    ///
    /// Aggregated per-item failures are recoverable: completed heap writes are
    /// retained, so a retry only redoes the failed items.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SnapError::Listing(_)
                | SnapError::Ingestion(_)
                | SnapError::Restore(_)
                | SnapError::Interrupted
        )
    }

    /// Individual failures carried by an aggregate error
    pub fn failures(&self) -> &[SnapError] {
        match self {
            SnapError::Listing(agg) | SnapError::Ingestion(agg) | SnapError::Restore(agg) => {
                &agg.errors
            }
            _ => &[],
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SnapError::SnapshotNotFound(what) => {
                format!("No snapshot matches {}. Use 'snapheap list' to see available snapshots.", what)
            }
            SnapError::ObjectNotFound(checksum) => {
                format!(
                    "Content {} is missing from the heap. The heap may have been pruned or \
                     belongs to a different snapshot set.",
                    checksum
                )
            }
            SnapError::Interrupted => "Operation was interrupted. Re-running it is safe.".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Collection of per-item failures raised together
#[derive(Debug, Default)]
pub struct AggregateError {
    /// The collected failures, in the order they were recorded
    pub errors: Vec<SnapError>,
}

impl AggregateError {
    pub fn new(errors: Vec<SnapError>) -> Self {
        Self { errors }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
                writeln!(f, "---------------------------")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
