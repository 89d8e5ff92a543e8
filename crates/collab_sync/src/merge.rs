//! Line-based three-way merge.
//!
//! The merge walks base, local and remote line by line at the same index.
//! For every index:
//!
//! - local and remote agree: keep that line
//! - only remote changed (local equals base): keep remote
//! - only local changed (remote equals base): keep local
//! - both changed differently: emit a marker block and flag the merge
//!
//! A missing line (one side is shorter) compares like any other value, so a
//! line deleted on one side and untouched on the other is dropped.

use serde::{Deserialize, Serialize};

/// Opening marker of a conflict block.
pub const MARKER_LOCAL: &str = "<<<<<<< local";
/// Separator between the local and remote side.
pub const MARKER_SEPARATOR: &str = "=======";
/// Closing marker of a conflict block.
pub const MARKER_REMOTE: &str = ">>>>>>> remote";

/// Outcome of a three-way merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub content: String,
    pub has_conflicts: bool,
    /// Number of marker blocks in `content`.
    pub conflict_count: usize,
}

/// Merge `local` and `remote` against their common ancestor `base`.
pub fn three_way_merge(base: &str, local: &str, remote: &str) -> MergeResult {
    let base_lines: Vec<&str> = base.split('\n').collect();
    let local_lines: Vec<&str> = local.split('\n').collect();
    let remote_lines: Vec<&str> = remote.split('\n').collect();

    let count = base_lines.len().max(local_lines.len()).max(remote_lines.len());
    let mut merged: Vec<&str> = Vec::with_capacity(count);
    let mut conflict_count = 0;

    for i in 0..count {
        let b = base_lines.get(i).copied();
        let l = local_lines.get(i).copied();
        let r = remote_lines.get(i).copied();

        let kept = if l == r {
            l
        } else if l == b {
            r
        } else if r == b {
            l
        } else {
            conflict_count += 1;
            merged.push(MARKER_LOCAL);
            merged.extend(l);
            merged.push(MARKER_SEPARATOR);
            merged.extend(r);
            merged.push(MARKER_REMOTE);
            continue;
        };
        merged.extend(kept);
    }

    MergeResult {
        content: merged.join("\n"),
        has_conflicts: conflict_count > 0,
        conflict_count,
    }
}

/// Whether `text` still contains an unedited marker block.
pub fn contains_markers(text: &str) -> bool {
    text.split('\n')
        .any(|line| line == MARKER_LOCAL || line == MARKER_REMOTE)
}
