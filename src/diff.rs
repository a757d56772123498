//! Manifest comparison
//!
//! [`diff`] performs an outer merge-join by name over two manifests (both
//! kept sorted by name) and classifies every name found on either side.

use crate::types::Manifest;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::info;

/// Classification of one name in a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffStatus {
    /// Same checksum on both sides
    Equal,
    /// Present on both sides with different checksums
    Different,
    /// Only in the left manifest
    OnlyLeft,
    /// Only in the right manifest
    OnlyRight,
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffStatus::Equal => "equal",
            DiffStatus::Different => "different",
            DiffStatus::OnlyLeft => "only_left",
            DiffStatus::OnlyRight => "only_right",
        };
        f.write_str(s)
    }
}

/// One row of a diff table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRow {
    pub name: String,
    pub status: DiffStatus,
    /// Checksum on the left side, if present there
    pub left: Option<String>,
    /// Checksum on the right side, if present there
    pub right: Option<String>,
}

/// Count of rows per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub equal: usize,
    pub different: usize,
    pub only_left: usize,
    pub only_right: usize,
}

impl DiffStats {
    /// Whether the two sides differ at all
    pub fn has_changes(&self) -> bool {
        self.different > 0 || self.only_left > 0 || self.only_right > 0
    }

    pub fn total(&self) -> usize {
        self.equal + self.different + self.only_left + self.only_right
    }
}

/// Result of comparing two manifests, rows sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffTable {
    rows: Vec<DiffRow>,
}

impl DiffTable {
    pub fn rows(&self) -> &[DiffRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows with the given status, in name order
    pub fn rows_with(&self, status: DiffStatus) -> impl Iterator<Item = &DiffRow> {
        self.rows.iter().filter(move |row| row.status == status)
    }

    pub fn stats(&self) -> DiffStats {
        let mut stats = DiffStats::default();
        for row in &self.rows {
            match row.status {
                DiffStatus::Equal => stats.equal += 1,
                DiffStatus::Different => stats.different += 1,
                DiffStatus::OnlyLeft => stats.only_left += 1,
                DiffStatus::OnlyRight => stats.only_right += 1,
            }
        }
        stats
    }
}

/// Compare `left` and `right` by name
pub fn diff(left: &Manifest, right: &Manifest) -> DiffTable {
    let left = left.records();
    let right = right.records();
    let mut rows = Vec::with_capacity(left.len().max(right.len()));
    let (mut i, mut j) = (0, 0);

    while i < left.len() || j < right.len() {
        let order = match (left.get(i), right.get(j)) {
            (Some(l), Some(r)) => l.name.cmp(&r.name),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };

        let row = match order {
            Ordering::Less => {
                let l = &left[i];
                i += 1;
                DiffRow {
                    name: l.name.clone(),
                    status: DiffStatus::OnlyLeft,
                    left: l.checksum.clone(),
                    right: None,
                }
            }
            Ordering::Greater => {
                let r = &right[j];
                j += 1;
                DiffRow {
                    name: r.name.clone(),
                    status: DiffStatus::OnlyRight,
                    left: None,
                    right: r.checksum.clone(),
                }
            }
            Ordering::Equal => {
                let (l, r) = (&left[i], &right[j]);
                i += 1;
                j += 1;
                let status = if l.checksum == r.checksum {
                    DiffStatus::Equal
                } else {
                    DiffStatus::Different
                };
                DiffRow {
                    name: l.name.clone(),
                    status,
                    left: l.checksum.clone(),
                    right: r.checksum.clone(),
                }
            }
        };
        rows.push(row);
    }

    let table = DiffTable { rows };
    let stats = table.stats();
    info!(
        "Diff: {} equal, {} different, {} only left, {} only right",
        stats.equal, stats.different, stats.only_left, stats.only_right
    );
    table
}
