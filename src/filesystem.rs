//! File system abstraction used by every component
//!
//! The engine never touches `std::fs` directly. Source trees, snapshot
//! manifests and heap blobs are all reached through a [`FileSystem`], so the
//! same engine can run against local disk or an object store binding that
//! implements the trait.
//!
//! Paths are `/`-separated strings. Implementations are free to map them to
//! whatever their native addressing scheme is.

use crate::error::{Result, SnapError};
use globset::GlobBuilder;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::trace;
use walkdir::WalkDir;

/// Backend-specific key/value attributes of a file (size, mtime, version tag, ...)
pub type Metadata = BTreeMap<String, Value>;

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One immediate child returned by [`FileSystem::list`]
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Full `/`-separated path of the entry
    pub path: String,
    /// File or directory
    pub kind: EntryKind,
    /// Backend-specific attributes
    pub metadata: Metadata,
}

/// Operations the engine needs from a storage backend
///
/// All methods may be called concurrently from worker threads.
pub trait FileSystem: Send + Sync + Debug {
    /// Backend identifier, used to pick a default identity check
    fn backend(&self) -> &str;

    /// List the immediate children of `dir` (non-recursive)
    fn list(&self, dir: &str) -> io::Result<Vec<DirEntry>>;

    /// Open a file for streaming reads
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Create or truncate a file for writing
    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;

    /// Create a directory and all missing parents
    fn mkdirs(&self, path: &str) -> io::Result<()>;

    /// Delete a file
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Move `src` to `dst`, replacing `dst` if it exists
    fn rename(&self, src: &str, dst: &str) -> io::Result<()>;

    /// Whether a file or directory exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// All file paths matching a glob pattern, sorted
    fn glob(&self, pattern: &str) -> Result<Vec<String>>;
}

/// [`FileSystem`] over the local disk
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn local_metadata(meta: &fs::Metadata) -> Metadata {
    let mut out = Metadata::new();
    out.insert("type".to_string(), Value::from("file"));
    out.insert("size".to_string(), Value::from(meta.len()));
    if let Ok(modified) = meta.modified() {
        let mtime_ns = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(e) => -(e.duration().as_nanos() as i64),
        };
        out.insert("mtime_ns".to_string(), Value::from(mtime_ns));
    }
    out
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

impl FileSystem for LocalFileSystem {
    fn backend(&self) -> &str {
        "file"
    }

    fn list(&self, dir: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = join_path(dir, &entry.file_name().to_string_lossy());

            if file_type.is_dir() {
                entries.push(DirEntry {
                    path,
                    kind: EntryKind::Directory,
                    metadata: Metadata::new(),
                });
            } else if file_type.is_file() {
                let meta = entry.metadata()?;
                entries.push(DirEntry {
                    path,
                    kind: EntryKind::File,
                    metadata: local_metadata(&meta),
                });
            } else {
                // Symlinks and special files are not part of a snapshot
                trace!("Skipping non-regular entry {}", path);
            }
        }
        Ok(entries)
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn mkdirs(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, src: &str, dst: &str) -> io::Result<()> {
        fs::rename(src, dst)
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| SnapError::InvalidPattern(format!("{}: {}", pattern, e)))?
            .compile_matcher();

        // Only walk below the part of the pattern that has no wildcards
        let base = literal_prefix(pattern);
        if !Path::new(&base).exists() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        for entry in WalkDir::new(&base) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = path_to_string(entry.path());
            if matcher.is_match(&path) {
                matches.push(path);
            }
        }
        matches.sort();
        Ok(matches)
    }
}

/// Directory portion of a glob pattern that contains no wildcard characters
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = Vec::new();
    for part in pattern.split('/') {
        if part.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(part);
    }
    let joined = prefix.join("/");
    if joined.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(joined)
    }
}

/// Join a root and a relative `/`-separated name
pub fn join_path(root: &str, name: &str) -> String {
    if root.ends_with('/') {
        format!("{}{}", root, name)
    } else {
        format!("{}/{}", root, name)
    }
}

/// Parent directory of a `/`-separated path
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Normalise a root directory: `\` becomes `/`, trailing `/` is stripped and
/// an empty root becomes `/`
pub fn coerce_root(root: &str) -> String {
    let root = root.trim().replace('\\', "/");
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        "/".to_string()
    } else {
        root.to_string()
    }
}

/// Normalise a local path into a root string
pub fn coerce_root_path(root: &Path) -> String {
    coerce_root(&path_to_string(root))
}
