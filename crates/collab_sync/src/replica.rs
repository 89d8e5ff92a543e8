//! Per-session document replica.
//!
//! The replica keeps two views of the document:
//!
//! - the **confirmed** view: canonical text at `current_version`, advanced
//!   only by operations the channel sequenced;
//! - the **speculative** view: the confirmed text with this session's
//!   unacknowledged operations layered on top, which is what the user sees.
//!
//! Keeping them apart lets a remote operation be applied to the confirmed
//! text and the local layer be rebuilt on top of it, rather than patching a
//! single buffer in place.

use crate::error::{SyncError, SyncResult};
use crate::ids::OpId;
use crate::operation::{Assoc, Operation, SequencedOperation};
use std::collections::{HashSet, VecDeque};

/// Local copy of a shared document.
#[derive(Debug, Clone)]
pub struct DocumentReplica {
    confirmed: String,
    speculative: String,
    current_version: u64,
    applied_operation_ids: HashSet<OpId>,
    history: VecDeque<SequencedOperation>,
    history_capacity: usize,
}

impl DocumentReplica {
    /// Create an empty replica at version 0.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            confirmed: String::new(),
            speculative: String::new(),
            current_version: 0,
            applied_operation_ids: HashSet::new(),
            history: VecDeque::new(),
            history_capacity,
        }
    }

    /// Replace the confirmed text with a snapshot from the channel.
    ///
    /// Snapshots older than the current version are refused so the version
    /// never moves backwards. History is cleared because positions recorded
    /// against the previous text cannot be mapped across a reset.
    pub fn reset(&mut self, content: String, version: u64) -> SyncResult<()> {
        if version < self.current_version {
            return Err(SyncError::StaleVersion {
                base_version: version,
                current_version: self.current_version,
            });
        }
        self.confirmed = content.clone();
        self.speculative = content;
        self.current_version = version;
        self.history.clear();
        Ok(())
    }

    /// Apply a sequenced operation to the confirmed view.
    ///
    /// Returns `Ok(false)` when the operation was already applied. The id is
    /// recorded in the same step as the text mutation.
    pub fn apply_sequenced(&mut self, sequenced: &SequencedOperation) -> SyncResult<bool> {
        let op = &sequenced.operation;
        if self.applied_operation_ids.contains(&op.id) {
            return Ok(false);
        }
        if sequenced.version != self.current_version + 1 {
            return Err(SyncError::InvalidOperation(format!(
                "{} has version {} but replica is at {}",
                op.id, sequenced.version, self.current_version
            )));
        }

        let text = op.apply(&self.confirmed)?;
        self.confirmed = text;
        self.applied_operation_ids.insert(op.id.clone());
        self.current_version = sequenced.version;

        self.history.push_back(sequenced.clone());
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        Ok(true)
    }

    /// Rebuild the speculative view from the confirmed text and the ordered
    /// unacknowledged operations.
    ///
    /// An operation that no longer fits is skipped and reported back so the
    /// caller can withdraw it.
    pub fn rebuild_speculative<'a>(
        &mut self,
        pending: impl IntoIterator<Item = &'a Operation>,
    ) -> Vec<OpId> {
        let mut text = self.confirmed.clone();
        let mut skipped = Vec::new();
        for op in pending {
            match op.apply(&text) {
                Ok(next) => text = next,
                Err(e) => {
                    tracing::warn!("Dropping local operation {} from view: {}", op.id, e);
                    skipped.push(op.id.clone());
                }
            }
        }
        self.speculative = text;
        skipped
    }

    /// Set the speculative text directly.
    pub fn set_speculative(&mut self, text: String) {
        self.speculative = text;
    }

    /// The text the user sees.
    pub fn content(&self) -> &str {
        &self.speculative
    }

    /// The canonical text at `current_version`.
    pub fn confirmed_content(&self) -> &str {
        &self.confirmed
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn has_applied(&self, id: &OpId) -> bool {
        self.applied_operation_ids.contains(id)
    }

    pub fn applied_count(&self) -> usize {
        self.applied_operation_ids.len()
    }

    /// Canonical operations after `version`, if history still covers them.
    pub fn history_since(&self, version: u64) -> Option<Vec<SequencedOperation>> {
        if version >= self.current_version {
            return Some(Vec::new());
        }
        match self.history.front() {
            Some(first) if first.version <= version + 1 => Some(
                self.history
                    .iter()
                    .filter(|s| s.version > version)
                    .cloned()
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Map a `start..end` span recorded at `version` to the confirmed text.
    ///
    /// Returns `None` when the replica has not reached `version` yet or its
    /// history no longer reaches back that far.
    pub fn map_span(&self, version: u64, start: usize, end: usize) -> Option<(usize, usize)> {
        if version > self.current_version {
            return None;
        }
        let ops = self.history_since(version)?;
        let (mut start, mut end) = (start, end);
        for sequenced in &ops {
            start = sequenced.operation.map_position(start, Assoc::Right);
            end = sequenced.operation.map_position(end, Assoc::Left);
        }
        Some((start, end.max(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, UserId};

    fn make_op(seq: u64, pos: usize, content: &str) -> Operation {
        Operation::insert(
            OpId::new(ClientId::from("remote"), seq),
            UserId::from("bob"),
            pos,
            content,
            seq - 1,
        )
    }

    fn make_replica(content: &str) -> DocumentReplica {
        let mut replica = DocumentReplica::new(16);
        replica.reset(content.to_string(), 0).unwrap();
        replica
    }

    #[test]
    fn test_apply_sequenced_advances_version() {
        let mut replica = make_replica("hello");
        let applied = replica
            .apply_sequenced(&SequencedOperation::new(1, make_op(1, 5, "!")))
            .unwrap();
        assert!(applied);
        assert_eq!(replica.confirmed_content(), "hello!");
        assert_eq!(replica.current_version(), 1);
        assert!(replica.has_applied(&OpId::new(ClientId::from("remote"), 1)));
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let mut replica = make_replica("hello");
        let sequenced = SequencedOperation::new(1, make_op(1, 0, ">"));
        assert!(replica.apply_sequenced(&sequenced).unwrap());
        assert!(!replica.apply_sequenced(&sequenced).unwrap());
        assert_eq!(replica.confirmed_content(), ">hello");
        assert_eq!(replica.current_version(), 1);
        assert_eq!(replica.applied_count(), 1);
    }

    #[test]
    fn test_version_gap_rejected() {
        let mut replica = make_replica("hello");
        let result = replica.apply_sequenced(&SequencedOperation::new(3, make_op(3, 0, "x")));
        assert!(result.is_err());
        assert_eq!(replica.current_version(), 0);
        assert_eq!(replica.confirmed_content(), "hello");
    }

    #[test]
    fn test_reset_never_moves_backwards() {
        let mut replica = make_replica("a");
        replica.reset("abc".to_string(), 5).unwrap();
        assert!(replica.reset("old".to_string(), 2).is_err());
        assert_eq!(replica.current_version(), 5);
        assert_eq!(replica.content(), "abc");
    }

    #[test]
    fn test_speculative_layer() {
        let mut replica = make_replica("hello");
        let local = Operation::insert(
            OpId::new(ClientId::from("me"), 1),
            UserId::from("alice"),
            5,
            " world",
            0,
        );
        let skipped = replica.rebuild_speculative([&local]);
        assert!(skipped.is_empty());
        assert_eq!(replica.content(), "hello world");
        assert_eq!(replica.confirmed_content(), "hello");

        let broken = Operation::delete(
            OpId::new(ClientId::from("me"), 2),
            UserId::from("alice"),
            40,
            2,
            0,
        );
        let skipped = replica.rebuild_speculative([&local, &broken]);
        assert_eq!(skipped, vec![broken.id.clone()]);
        assert_eq!(replica.content(), "hello world");
    }

    #[test]
    fn test_map_span_through_history() {
        let mut replica = make_replica("line1\nline2");
        replica
            .apply_sequenced(&SequencedOperation::new(1, make_op(1, 0, ">> ")))
            .unwrap();
        assert_eq!(replica.map_span(0, 6, 11), Some((9, 14)));
        assert_eq!(replica.map_span(1, 9, 14), Some((9, 14)));
        assert_eq!(replica.map_span(2, 0, 1), None);
    }

    #[test]
    fn test_history_truncation() {
        let mut replica = DocumentReplica::new(2);
        replica.reset(String::new(), 0).unwrap();
        for seq in 1..=4 {
            replica
                .apply_sequenced(&SequencedOperation::new(seq, make_op(seq, 0, "x")))
                .unwrap();
        }
        assert!(replica.history_since(0).is_none());
        assert_eq!(replica.history_since(2).map(|ops| ops.len()), Some(2));
        assert_eq!(replica.history_since(4).map(|ops| ops.len()), Some(0));
    }
}
