//! Cheap "unchanged since the prior snapshot" checks
//!
//! An [`IdentityCheck`] decides from metadata alone whether a file still has
//! the content recorded in the prior manifest. When it does, the prior
//! checksum is reused and the file is not read again.
//!
//! Backend version tags (ETags, generation numbers, ...) are treated as
//! opaque tokens: equal tokens mean "unchanged", nothing more. They are never
//! compared against checksums.

use crate::types::FileRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Strategy for reusing a prior checksum without reading content
pub trait IdentityCheck: Send + Sync + Debug {
    /// Return the prior checksum if `current` is known to be unchanged
    fn unchanged_checksum(&self, current: &FileRecord, prior: &FileRecord) -> Option<String>;
}

/// Never reuses checksums; every file is re-hashed
#[derive(Debug, Clone, Default)]
pub struct NoIdentityCheck;

impl IdentityCheck for NoIdentityCheck {
    fn unchanged_checksum(&self, _current: &FileRecord, _prior: &FileRecord) -> Option<String> {
        None
    }
}

/// Reuses the prior checksum when size and modification time are identical
#[derive(Debug, Clone, Default)]
pub struct MetadataIdentityCheck;

impl IdentityCheck for MetadataIdentityCheck {
    fn unchanged_checksum(&self, current: &FileRecord, prior: &FileRecord) -> Option<String> {
        let same = |key: &str| match (current.metadata.get(key), prior.metadata.get(key)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if same("size") && same("mtime_ns") {
            prior.checksum.clone()
        } else {
            None
        }
    }
}

/// Reuses the prior checksum when a backend version tag is identical
#[derive(Debug, Clone)]
pub struct VersionTagIdentityCheck {
    /// Metadata key holding the version tag
    pub key: String,
}

impl VersionTagIdentityCheck {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl IdentityCheck for VersionTagIdentityCheck {
    fn unchanged_checksum(&self, current: &FileRecord, prior: &FileRecord) -> Option<String> {
        match (current.metadata.get(&self.key), prior.metadata.get(&self.key)) {
            (Some(Value::Null), _) | (_, Some(Value::Null)) => None,
            (Some(a), Some(b)) if a == b => prior.checksum.clone(),
            _ => None,
        }
    }
}

/// Identity check selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityCheckKind {
    None,
    Metadata,
    VersionTag,
}

/// Metadata key carrying the version tag of a backend
fn version_tag_key(backend: &str) -> &'static str {
    match backend {
        "gcs" | "gs" => "md5Hash",
        "az" | "abfs" => "etag",
        _ => "ETag",
    }
}

impl IdentityCheckKind {
    /// Instantiate the check for a backend
    pub fn build(self, backend: &str) -> Arc<dyn IdentityCheck> {
        match self {
            IdentityCheckKind::None => Arc::new(NoIdentityCheck),
            IdentityCheckKind::Metadata => Arc::new(MetadataIdentityCheck),
            IdentityCheckKind::VersionTag => {
                Arc::new(VersionTagIdentityCheck::new(version_tag_key(backend)))
            }
        }
    }
}

/// Default identity check for a backend identifier
///
/// Object stores expose stable version tags. Local disk does not: mtimes can
/// be coarser than the rate at which files change, so local files are always
/// re-hashed.
pub fn identity_check_for(backend: &str) -> Arc<dyn IdentityCheck> {
    match backend {
        "s3" | "gcs" | "gs" | "az" | "abfs" => IdentityCheckKind::VersionTag.build(backend),
        _ => IdentityCheckKind::None.build(backend),
    }
}
