//! Manifest persistence
//!
//! A persisted snapshot is a gzip-compressed JSON-lines file, one
//! [`FileRecord`] per line, stored at a path derived from its timestamp:
//!
//! ```text
//! snap_root/<YYYY>/<MM>/<YYYY-MM-DD_HH-MM-SS_ffffffZ>.jsonl.gz
//! ```
//!
//! The encoded timestamp is fixed-width, so ordering file names as strings
//! orders snapshots chronologically.

use crate::error::{Result, SnapError};
use crate::filesystem::{parent_path, FileSystem};
use crate::types::{FileRecord, Manifest};
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, BufReader, Write};
use tracing::{debug, trace};

/// Timestamp encoding used in snapshot file names (microsecond precision)
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%6fZ";

/// Extension of persisted manifests
pub const SNAPSHOT_EXTENSION: &str = ".jsonl.gz";

/// File name of the snapshot taken at `timestamp`
pub fn snapshot_file_name(timestamp: &DateTime<Utc>) -> String {
    format!("{}{}", timestamp.format(SNAPSHOT_TIMESTAMP_FORMAT), SNAPSHOT_EXTENSION)
}

/// Full path of the snapshot taken at `timestamp`
pub fn snapshot_path_for(snap_root: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}",
        snap_root.trim_end_matches('/'),
        timestamp.format("%Y/%m"),
        snapshot_file_name(timestamp)
    )
}

/// Glob matching every snapshot below `snap_root`
pub fn snapshot_glob(snap_root: &str) -> String {
    format!("{}/*/*/*{}", snap_root.trim_end_matches('/'), SNAPSHOT_EXTENSION)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Decode the timestamp encoded in a snapshot path
pub fn timestamp_from_path(path: &str) -> Result<DateTime<Utc>> {
    let stem = file_name(path)
        .strip_suffix(SNAPSHOT_EXTENSION)
        .ok_or_else(|| SnapError::InvalidSnapshotPath(path.to_string()))?;
    NaiveDateTime::parse_from_str(stem, SNAPSHOT_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| SnapError::InvalidSnapshotPath(format!("{}: {}", path, e)))
}

/// Newest snapshot path whose timestamp is at or before `limit`
///
/// With no limit the newest path overall is returned. Paths are compared by
/// file name only.
pub fn latest_at_or_before<'a>(
    paths: &'a [String],
    limit: Option<&DateTime<Utc>>,
) -> Option<&'a String> {
    let limit_name = limit.map(snapshot_file_name);
    let mut candidates: Vec<&String> = paths
        .iter()
        .filter(|p| file_name(p).ends_with(SNAPSHOT_EXTENSION))
        .collect();
    candidates.sort_by(|a, b| file_name(b).cmp(file_name(a)));

    candidates.into_iter().find(|p| match &limit_name {
        Some(limit_name) => file_name(p) <= limit_name.as_str(),
        None => true,
    })
}

/// Write `manifest` to `path`
///
/// The manifest is written next to its final path and renamed into place,
/// so a partially written manifest is never picked up as a snapshot.
pub fn write_manifest(fs: &dyn FileSystem, path: &str, manifest: &Manifest) -> Result<()> {
    if let Some(parent) = parent_path(path) {
        fs.mkdirs(parent)?;
    }
    let partial = format!("{}.partial", path);

    let written = (|| -> Result<()> {
        let mut encoder = GzEncoder::new(fs.open_write(&partial)?, Compression::default());
        for record in manifest {
            serde_json::to_writer(&mut encoder, record)?;
            encoder.write_all(b"\n")?;
        }
        let mut out = encoder.finish()?;
        out.flush()?;
        Ok(())
    })();

    if let Err(e) = written.and_then(|()| fs.rename(&partial, path).map_err(SnapError::from)) {
        if fs.exists(&partial) {
            let _ = fs.remove(&partial);
        }
        return Err(e);
    }

    debug!("Wrote manifest {} ({} files)", path, manifest.len());
    Ok(())
}

/// Read the manifest stored at `path`
pub fn read_manifest(fs: &dyn FileSystem, path: &str) -> Result<Manifest> {
    let reader = BufReader::new(GzDecoder::new(fs.open_read(path)?));
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FileRecord = serde_json::from_str(&line).map_err(|e| {
            SnapError::InvalidManifest(format!("{} line {}: {}", path, idx + 1, e))
        })?;
        records.push(record);
    }

    trace!("Read {} records from {}", records.len(), path);
    Manifest::from_records(records)
        .map_err(|e| SnapError::InvalidManifest(format!("{}: {}", path, e)))
}
