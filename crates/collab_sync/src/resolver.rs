//! Conflict resolution.
//!
//! Every conflict moves through `pending → resolving → resolved`. Automatic
//! strategies are deterministic so every replica that merges the same pair
//! produces the same text:
//!
//! - **insert_insert**: local content, then remote content, at the shared
//!   position. Local-before-remote is a fixed tie-break, not configurable.
//! - **modify_modify** (ranges disjoint at char level): line-based three-way
//!   merge of the whole document; any marker block downgrades the conflict to
//!   manual resolution.
//! - **delete_modify**: the modification wins. Deleted text outside the
//!   modified span is removed; the modification's content is kept.
//! - **move_modify**: the modification is applied where the text was moved.
//!
//! Manual conflicts carry a [`ConflictRegion`] with the marker-filled merge
//! preview as a starting point for the user.

use crate::conflict::{find_move, Conflict, ConflictRegion, ConflictStatus, ConflictType};
use crate::error::{SyncError, SyncResult};
use crate::ids::UserId;
use crate::merge::{contains_markers, three_way_merge, MergeResult};
use crate::operation::{char_len, char_slice, find_line_bounds, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a conflict was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Merged by the fixed policy for the conflict type
    Auto,
    AcceptLocal,
    AcceptRemote,
    ManualMerge,
}

/// A user's answer to a manual conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    pub strategy: ResolutionStrategy,
    /// Required for `manual_merge`.
    pub content: Option<String>,
}

impl ResolutionRequest {
    pub fn accept_local() -> Self {
        Self {
            strategy: ResolutionStrategy::AcceptLocal,
            content: None,
        }
    }

    pub fn accept_remote() -> Self {
        Self {
            strategy: ResolutionStrategy::AcceptRemote,
            content: None,
        }
    }

    pub fn manual_merge(content: impl Into<String>) -> Self {
        Self {
            strategy: ResolutionStrategy::ManualMerge,
            content: Some(content.into()),
        }
    }
}

/// Final outcome of a conflict, broadcast to every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// Text the conflicted region (or the document, for automatic merges)
    /// ended up with.
    pub content: String,
    pub resolved_by: UserId,
    pub resolved_at: DateTime<Utc>,
}

/// Result of attempting an automatic resolution.
#[derive(Clone, Debug, PartialEq)]
pub enum AutoResolution {
    /// Merged document text; the conflict is resolved.
    Merged { conflict: Conflict, content: String },
    /// The conflict needs a human; `preview` holds the marked-up merge.
    Manual { conflict: Conflict, preview: MergeResult },
}

/// Record of a resolved conflict
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    pub involved_user_ids: Vec<UserId>,
    pub resolved_at: DateTime<Utc>,
}

/// Tracks unresolved conflicts and settles them.
pub struct ConflictResolver {
    /// Pending and resolving conflicts by id
    conflicts: HashMap<String, Conflict>,
    /// Resolved conflicts, for inspection
    conflict_history: Vec<ConflictRecord>,
    /// Log every resolution at info level
    log_conflicts: bool,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    /// Create a new conflict resolver
    pub fn new() -> Self {
        Self {
            conflicts: HashMap::new(),
            conflict_history: Vec::new(),
            log_conflicts: false,
        }
    }

    /// Enable conflict logging
    pub fn with_logging(mut self) -> Self {
        self.log_conflicts = true;
        self
    }

    fn record(&mut self, conflict: &Conflict, strategy: ResolutionStrategy) {
        if self.log_conflicts {
            tracing::info!(
                "Conflict {} ({:?}) resolved with {:?}",
                conflict.id,
                conflict.conflict_type,
                strategy
            );
        }
        self.conflict_history.push(ConflictRecord {
            conflict_id: conflict.id.clone(),
            conflict_type: conflict.conflict_type,
            strategy,
            involved_user_ids: conflict.involved_user_ids.clone(),
            resolved_at: Utc::now(),
        });
    }

    // ========== Automatic Resolution ==========

    /// Try the fixed policy for the conflict type.
    ///
    /// A resolved conflict goes straight to history; a downgraded one is
    /// returned with `auto_resolvable` cleared and must be registered by the
    /// caller once its region is known.
    pub fn auto_resolve(&mut self, mut conflict: Conflict) -> AutoResolution {
        let merged = auto_merge(&conflict);

        if !conflict.auto_resolvable || merged.has_conflicts {
            if conflict.auto_resolvable {
                tracing::debug!(
                    "Conflict {} downgraded to manual: {}",
                    conflict.id,
                    SyncError::ConflictUnresolvable(conflict.id.clone())
                );
            }
            conflict.auto_resolvable = false;
            conflict.status = ConflictStatus::Pending;
            return AutoResolution::Manual {
                conflict,
                preview: merged,
            };
        }

        conflict.status = ConflictStatus::Resolved;
        self.record(&conflict, ResolutionStrategy::Auto);
        AutoResolution::Merged {
            conflict,
            content: merged.content,
        }
    }

    // ========== Manual Resolution ==========

    /// Track a conflict awaiting a human decision.
    ///
    /// Registering a known id keeps the existing entry.
    pub fn register(&mut self, mut conflict: Conflict) -> bool {
        if self.conflicts.contains_key(&conflict.id) {
            return false;
        }
        if conflict.status == ConflictStatus::Resolved {
            conflict.status = ConflictStatus::Pending;
        }
        tracing::info!(
            "Conflict {} ({:?}) awaiting manual resolution",
            conflict.id,
            conflict.conflict_type
        );
        self.conflicts.insert(conflict.id.clone(), conflict);
        true
    }

    /// Mark a conflict as being worked on.
    pub fn begin_resolution(&mut self, conflict_id: &str) -> SyncResult<&Conflict> {
        let conflict = self
            .conflicts
            .get_mut(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        conflict.status = ConflictStatus::Resolving;
        Ok(conflict)
    }

    /// Region text chosen by a resolution request.
    pub fn resolution_content(
        &self,
        conflict_id: &str,
        request: &ResolutionRequest,
    ) -> SyncResult<String> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        let region = conflict.region.as_ref().ok_or_else(|| {
            SyncError::InvalidResolution(format!("conflict {} has no region", conflict_id))
        })?;

        match request.strategy {
            ResolutionStrategy::AcceptLocal => Ok(region.local_text.clone()),
            ResolutionStrategy::AcceptRemote => Ok(region.remote_text.clone()),
            ResolutionStrategy::ManualMerge => {
                let content = request.content.clone().ok_or_else(|| {
                    SyncError::InvalidResolution("manual_merge requires content".to_string())
                })?;
                if contains_markers(&content) {
                    tracing::warn!("Conflict {} resolved with markers left in", conflict_id);
                }
                Ok(content)
            }
            ResolutionStrategy::Auto => Err(SyncError::InvalidResolution(
                "automatic strategy cannot be requested".to_string(),
            )),
        }
    }

    /// Settle a conflict. Always ends in `resolved`.
    pub fn complete(&mut self, conflict_id: &str, resolution: &Resolution) -> SyncResult<Conflict> {
        let mut conflict = self
            .conflicts
            .remove(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        conflict.status = ConflictStatus::Resolved;
        self.record(&conflict, resolution.strategy);
        Ok(conflict)
    }

    pub fn get(&self, conflict_id: &str) -> Option<&Conflict> {
        self.conflicts.get(conflict_id)
    }

    /// Unresolved conflicts, oldest first.
    pub fn unresolved(&self) -> Vec<&Conflict> {
        let mut conflicts: Vec<&Conflict> = self.conflicts.values().collect();
        conflicts.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        conflicts
    }

    pub fn unresolved_count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn history(&self) -> &[ConflictRecord] {
        &self.conflict_history
    }
}

/// Merge a conflict's two operations over its base text.
pub fn auto_merge(conflict: &Conflict) -> MergeResult {
    let base = conflict.base_content.as_str();
    let local = &conflict.local_operation;
    let remote = &conflict.remote_operation;

    let clean = |content: String| MergeResult {
        content,
        has_conflicts: false,
        conflict_count: 0,
    };

    match conflict.conflict_type {
        ConflictType::InsertInsert => {
            let at = local.position;
            clean(format!(
                "{}{}{}{}",
                char_slice(base, 0, at),
                local.content,
                remote.content,
                char_slice(base, at, char_len(base))
            ))
        }
        ConflictType::DeleteModify => match sequence(base, remote, local) {
            Some(content) => clean(content),
            None => whole_document_merge(base, local, remote),
        },
        ConflictType::MoveModify => match merge_move(base, local, remote) {
            Some(content) => clean(content),
            None => whole_document_merge(base, local, remote),
        },
        ConflictType::ModifyModify => whole_document_merge(base, local, remote),
    }
}

/// Apply `first`, then `second` moved past it.
fn sequence(base: &str, first: &Operation, second: &Operation) -> Option<String> {
    let after = first.apply(base).ok()?;
    match second.transform_against(first) {
        Some(op) => op.apply(&after).ok(),
        None => Some(after),
    }
}

fn whole_document_merge(base: &str, local: &Operation, remote: &Operation) -> MergeResult {
    let local_text = local.apply(base).unwrap_or_else(|_| base.to_string());
    let remote_text = remote.apply(base).unwrap_or_else(|_| base.to_string());
    three_way_merge(base, &local_text, &remote_text)
}

fn merge_move(base: &str, local: &Operation, remote: &Operation) -> Option<String> {
    let (mover, modifier, offset) = match find_move(remote, local, base) {
        Some(offset) => (remote, local, offset),
        None => (local, remote, find_move(local, remote, base)?),
    };

    let moved_len = modifier.length;
    let content: Vec<char> = mover.content.chars().collect();
    let before: String = content[..offset].iter().collect();
    let after: String = content[offset + moved_len..].iter().collect();

    Some(format!(
        "{}{}{}{}{}",
        char_slice(base, 0, mover.position),
        before,
        modifier.content,
        after,
        char_slice(base, mover.end(), char_len(base))
    ))
}

/// Build the manual-resolution region for a conflict whose remote operation
/// has been applied at `version`.
///
/// The span covers both operations widened to whole lines, so the preview
/// merges complete lines.
pub fn manual_region(conflict: &Conflict, version: u64) -> Option<ConflictRegion> {
    let base = conflict.base_content.as_str();
    let local = &conflict.local_operation;
    let remote = &conflict.remote_operation;

    let start = local.position.min(remote.position);
    let end = local.end().max(remote.end());
    let (start, end) = find_line_bounds(base, start, end);

    let shift = |op: &Operation| op.rebased(op.position - start, op.length, op.content.clone());
    let base_text = char_slice(base, start, end).to_string();
    let local_text = shift(local)?.apply(&base_text).ok()?;
    let remote_text = shift(remote)?.apply(&base_text).ok()?;
    let preview = three_way_merge(&base_text, &local_text, &remote_text);

    Some(ConflictRegion {
        version,
        start,
        end: end - remote.length + remote.content_len(),
        base_text,
        local_text,
        remote_text,
        merge_preview: preview.content,
    })
}
