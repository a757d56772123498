//! Content-addressable blob store ("heap")
//!
//! Every distinct content is stored exactly once, gzip-compressed, at a path
//! derived from its MD5 checksum:
//!
//! ```text
//! heap_root/
//! ├── temp/                    # In-flight writes, never read back
//! │   └── <uuid>.gz
//! └── <c[0:2]>/<c[2:4]>/<c[4:6]>/
//!     └── <checksum>.gz        # Blob for checksum c
//! ```
//!
//! ## Write protocol
//!
//! [`Heap::add_file`] streams its input through the digester and the gzip
//! encoder into a uniquely named temp file. Once the checksum is known the
//! temp file is either discarded (content already stored) or renamed into
//! its final path. A blob at a final path is therefore always complete.
//! Two writers racing on the same content both rename to the same final
//! path; the content is identical, so either rename winning is correct.
//!
//! On cancellation or any failure the temp file is removed before the error
//! is returned.
//!
//! ## Known set
//!
//! The set of stored checksums is built once when the heap is opened, from
//! the file names found under the root (no content is read), and is then
//! kept in memory behind a mutex held only for O(1) lookups and inserts.

use crate::error::{Result, SnapError};
use crate::filesystem::{coerce_root, join_path, parent_path, FileSystem};
use crate::lister::ParallelTreeLister;
use crate::pool::CancelToken;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// Directory below the heap root holding in-flight writes
pub const TEMP_DIR: &str = "temp";

/// Default read block size while hashing (8 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Deduplicating, checksum-addressed blob store
#[derive(Debug)]
pub struct Heap {
    fs: Arc<dyn FileSystem>,
    root: String,
    block_size: usize,
    known: Mutex<HashSet<String>>,
}

impl Heap {
    /// Open (creating if needed) the heap at `root`
    ///
    /// Enumerates the existing blobs with `workers` listing threads to build
    /// the known-checksum set.
    #[instrument(skip(fs, cancel))]
    pub fn open_dir(
        fs: Arc<dyn FileSystem>,
        root: &str,
        workers: usize,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let root = coerce_root(root);
        fs.mkdirs(&root)?;

        let entries = ParallelTreeLister::new(Arc::clone(&fs))
            .with_workers(workers)
            .list(&root, cancel)?;

        let prefix = format!("{}/", root.trim_end_matches('/'));
        let mut known = HashSet::with_capacity(entries.len());
        for entry in entries {
            let Some(relative) = entry.path.strip_prefix(&prefix) else {
                continue;
            };
            if relative.starts_with("temp/") {
                trace!("Ignoring in-flight heap file {}", relative);
                continue;
            }
            match checksum_from_blob_path(relative) {
                Some(checksum) => {
                    known.insert(checksum.to_string());
                }
                None => debug!("Ignoring foreign file in heap: {}", relative),
            }
        }

        info!("Opened heap at {} with {} blobs", root, known.len());
        Ok(Self {
            fs,
            root,
            block_size: DEFAULT_BLOCK_SIZE,
            known: Mutex::new(known),
        })
    }

    /// Set the read block size used while hashing
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Whether a blob for `checksum` is stored
    pub fn contains(&self, checksum: &str) -> bool {
        self.known.lock().contains(checksum)
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }

    /// Final path of the blob for `checksum`
    pub fn object_path(&self, checksum: &str) -> String {
        let shard = |range: std::ops::Range<usize>| checksum.get(range).unwrap_or("");
        format!(
            "{}/{}/{}/{}/{}.gz",
            self.root.trim_end_matches('/'),
            shard(0..2),
            shard(2..4),
            shard(4..6),
            checksum
        )
    }

    fn temp_path(&self) -> String {
        join_path(
            &join_path(&self.root, TEMP_DIR),
            &format!("{}.gz", Uuid::new_v4()),
        )
    }

    /// Store the content read from `reader` and return its checksum
    ///
    /// `cancel` is polled between blocks; a cancelled add leaves nothing
    /// behind.
    pub fn add_file<R: Read + ?Sized>(&self, reader: &mut R, cancel: &CancelToken) -> Result<String> {
        self.fs.mkdirs(&join_path(&self.root, TEMP_DIR))?;
        let temp = self.temp_path();

        let result = self
            .write_temp(reader, &temp, cancel)
            .and_then(|checksum| self.commit(&temp, &checksum).map(|()| checksum));

        if result.is_err() {
            self.discard(&temp);
        }
        result
    }

    fn write_temp<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        temp: &str,
        cancel: &CancelToken,
    ) -> Result<String> {
        let out = self.fs.open_write(temp)?;
        let mut encoder = GzEncoder::new(out, Compression::default());
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; self.block_size];

        loop {
            cancel.check()?;
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buffer[..read]);
            encoder.write_all(&buffer[..read])?;
        }
        cancel.check()?;

        let mut out = encoder.finish()?;
        out.flush()?;
        Ok(hex::encode(hasher.finalize()))
    }

    fn commit(&self, temp: &str, checksum: &str) -> Result<()> {
        if self.contains(checksum) {
            trace!("Blob {} already stored", checksum);
            self.discard(temp);
            return Ok(());
        }

        let final_path = self.object_path(checksum);
        if let Some(parent) = parent_path(&final_path) {
            self.fs.mkdirs(parent)?;
        }
        self.fs.rename(temp, &final_path)?;
        self.known.lock().insert(checksum.to_string());
        trace!("Stored blob {}", checksum);
        Ok(())
    }

    fn discard(&self, temp: &str) {
        if self.fs.exists(temp) {
            if let Err(e) = self.fs.remove(temp) {
                warn!("Could not remove heap temp file {}: {}", temp, e);
            }
        }
    }

    /// Open the blob for `checksum` as a decompressing reader
    pub fn open(&self, checksum: &str) -> Result<Box<dyn Read + Send>> {
        if !self.contains(checksum) {
            return Err(SnapError::ObjectNotFound(checksum.to_string()));
        }
        let raw = self.fs.open_read(&self.object_path(checksum))?;
        Ok(Box::new(GzDecoder::new(raw)))
    }

    /// Read the blob for `checksum` fully and check that it hashes back to
    /// `checksum`
    pub fn open_verified(&self, checksum: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.open(checksum)?.read_to_end(&mut content)?;

        let actual = compute_checksum(&content);
        if actual != checksum {
            return Err(SnapError::ChecksumMismatch {
                name: format!("heap blob {}", checksum),
                declared: checksum.to_string(),
                actual,
            });
        }
        Ok(content)
    }
}

/// MD5 of `content` as lowercase hex
pub fn compute_checksum(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Whether `s` looks like a checksum produced by this heap
pub fn is_checksum(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Checksum of a blob given its path relative to the heap root
fn checksum_from_blob_path(relative: &str) -> Option<&str> {
    let mut parts = relative.split('/');
    let (a, b, c, file) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let checksum = file.strip_suffix(".gz")?;
    if !is_checksum(checksum) || !checksum.starts_with(&format!("{}{}{}", a, b, c)) {
        return None;
    }
    Some(checksum)
}
