//! Conflict detection for concurrent text operations.
//!
//! Detection is a pure function over a local and a remote operation declared
//! against the same base text. It classifies the pair into one of four
//! conflict types:
//!
//! - **insert_insert**: both insert at the same position
//! - **modify_modify**: overlapping replace ranges (or an insert inside a
//!   replaced range)
//! - **delete_modify**: one side deletes text the other edits
//! - **move_modify**: one side repositions text the other edits; this is a
//!   content heuristic and may miss moves
//!
//! Pairs that cannot disagree are not conflicts: operations by the same
//! author, two deletions (the union is removed), and edits with an identical
//! effect.

use crate::ids::UserId;
use crate::operation::{char_len, char_slice, OpKind, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Classification of a conflicting pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    InsertInsert,
    ModifyModify,
    DeleteModify,
    MoveModify,
}

/// How urgently a conflict needs attention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

impl ConflictSeverity {
    fn raised(self) -> Self {
        match self {
            ConflictSeverity::Low => ConflictSeverity::Medium,
            _ => ConflictSeverity::High,
        }
    }
}

/// Lifecycle of a conflict. There is no rejected state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolving,
    Resolved,
}

/// The document span a manual conflict is about.
///
/// `start..end` is measured in the canonical text at `version`. The three
/// variants are the span as it was before either edit, with only the local
/// edit, and with only the remote edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRegion {
    pub version: u64,
    pub start: usize,
    pub end: usize,
    pub base_text: String,
    pub local_text: String,
    pub remote_text: String,
    /// Three-way merge of the span, with markers where the sides disagree.
    pub merge_preview: String,
}

/// Two concurrent operations whose affected ranges overlap ambiguously.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub local_operation: Operation,
    pub remote_operation: Operation,
    /// Document text both operations were declared against.
    pub base_content: String,
    pub position: usize,
    pub involved_user_ids: Vec<UserId>,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    pub auto_resolvable: bool,
    pub detected_at: DateTime<Utc>,
    /// Present once the conflict is routed to manual resolution.
    pub region: Option<ConflictRegion>,
}

/// Whether two half-open ranges share at least one position.
///
/// An empty range overlaps a range it lies strictly inside.
pub fn ranges_overlap(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

fn overlap_len(a: &Range<usize>, b: &Range<usize>) -> usize {
    a.end.min(b.end).saturating_sub(a.start.max(b.start))
}

fn strictly_inside(pos: usize, range: &Range<usize>) -> bool {
    range.start < pos && pos < range.end
}

fn edit_kind_against(range_op: &Operation) -> ConflictType {
    if range_op.kind == OpKind::Delete {
        ConflictType::DeleteModify
    } else {
        ConflictType::ModifyModify
    }
}

/// Detect a conflict between a pending local operation and a remote one.
///
/// `base` is the text both operations were declared against.
/// `authors_active` feeds the severity heuristic.
pub fn detect(
    local: &Operation,
    remote: &Operation,
    base: &str,
    authors_active: bool,
) -> Option<Conflict> {
    if local.author_id == remote.author_id {
        return None;
    }
    if local.kind == OpKind::Delete && remote.kind == OpKind::Delete {
        return None;
    }
    if same_effect(local, remote, base) {
        return None;
    }

    let conflict_type = classify(local, remote, base)?;
    let local_range = local.affected_range();
    let remote_range = remote.affected_range();
    let overlap = overlap_len(&local_range, &remote_range);

    let mut conflict = Conflict {
        id: uuid::Uuid::new_v4().to_string(),
        conflict_type,
        local_operation: local.clone(),
        remote_operation: remote.clone(),
        base_content: base.to_string(),
        position: local_range.start.min(remote_range.start),
        involved_user_ids: vec![local.author_id.clone(), remote.author_id.clone()],
        severity: severity_for(overlap, authors_active),
        status: ConflictStatus::Pending,
        auto_resolvable: false,
        detected_at: Utc::now(),
        region: None,
    };
    conflict.auto_resolvable = auto_resolvable(&conflict);
    Some(conflict)
}

/// Whether the conflict can be merged by a fixed policy.
pub fn auto_resolvable(conflict: &Conflict) -> bool {
    match conflict.conflict_type {
        ConflictType::InsertInsert | ConflictType::DeleteModify | ConflictType::MoveModify => true,
        ConflictType::ModifyModify => !ranges_overlap(
            &conflict.local_operation.removed_range(),
            &conflict.remote_operation.removed_range(),
        ),
    }
}

/// Severity from the overlap size, raised one step while both authors are
/// connected.
pub fn severity_for(overlap: usize, authors_active: bool) -> ConflictSeverity {
    let severity = match overlap {
        0 => ConflictSeverity::Low,
        1..=32 => ConflictSeverity::Medium,
        _ => ConflictSeverity::High,
    };
    if authors_active {
        severity.raised()
    } else {
        severity
    }
}

fn same_effect(local: &Operation, remote: &Operation, base: &str) -> bool {
    match (local.apply(base), remote.apply(base)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn classify(local: &Operation, remote: &Operation, base: &str) -> Option<ConflictType> {
    if find_move(local, remote, base).is_some() || find_move(remote, local, base).is_some() {
        return Some(ConflictType::MoveModify);
    }

    match (local.kind, remote.kind) {
        (OpKind::Insert, OpKind::Insert) => {
            (local.position == remote.position).then_some(ConflictType::InsertInsert)
        }
        (OpKind::Insert, _) => strictly_inside(local.position, &remote.removed_range())
            .then(|| edit_kind_against(remote)),
        (_, OpKind::Insert) => strictly_inside(remote.position, &local.removed_range())
            .then(|| edit_kind_against(local)),
        _ => {
            if !ranges_overlap(&local.affected_range(), &remote.affected_range()) {
                None
            } else if local.kind == OpKind::Delete || remote.kind == OpKind::Delete {
                Some(ConflictType::DeleteModify)
            } else {
                Some(ConflictType::ModifyModify)
            }
        }
    }
}

/// Check whether `mover` looks like a reposition of the text `other` edits.
///
/// A mover is a same-length replacement whose new content contains the
/// edited text at a different offset. Returns that offset (in chars from the
/// start of the mover's range).
pub fn find_move(mover: &Operation, other: &Operation, base: &str) -> Option<usize> {
    if mover.kind != OpKind::Replace || other.kind == OpKind::Insert {
        return None;
    }
    if mover.length < 2 || mover.content_len() != mover.length {
        return None;
    }
    if other.position < mover.position || other.end() > mover.end() {
        return None;
    }

    let original = char_slice(base, mover.position, mover.end());
    if original == mover.content || char_len(original) != mover.length {
        return None;
    }
    let moved: Vec<char> = char_slice(base, other.position, other.end()).chars().collect();
    if moved.is_empty() {
        return None;
    }

    let old_offset = other.position - mover.position;
    let content: Vec<char> = mover.content.chars().collect();
    (0..=content.len().saturating_sub(moved.len()))
        .filter(|&offset| offset != old_offset)
        .find(|&offset| content[offset..].starts_with(&moved))
}
