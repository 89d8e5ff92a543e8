//! Text operations.
//!
//! An [`Operation`] is an atomic, author-attributed edit of a linear text
//! document. Positions and lengths count Unicode scalar values, not bytes,
//! so every replica agrees on offsets regardless of encoding.
//!
//! Besides application, this module provides the positional algebra used to
//! move a pending operation past one that was sequenced before it
//! ([`Operation::transform_against`]), to describe the difference between two
//! texts as a single operation ([`Operation::between`]), and to map positions
//! such as cursors through an applied edit ([`Operation::map_position`]).

use crate::error::{SyncError, SyncResult};
use crate::ids::{OpId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Kind of edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
}

/// An atomic edit declared against a base document version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OpId,
    #[serde(rename = "type")]
    pub kind: OpKind,
    /// Char offset where the edit starts.
    pub position: usize,
    /// Inserted text (empty for deletes).
    pub content: String,
    /// Number of chars removed (zero for inserts).
    pub length: usize,
    pub author_id: UserId,
    pub client_timestamp: DateTime<Utc>,
    /// Version the author believed current when the edit was made.
    pub base_version: u64,
}

/// An operation as accepted by the channel, with the canonical version it
/// produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOperation {
    pub version: u64,
    pub operation: Operation,
}

impl SequencedOperation {
    pub fn new(version: u64, operation: Operation) -> Self {
        Self { version, operation }
    }
}

/// Which side of an insertion point a mapped position sticks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assoc {
    /// Stay before text inserted exactly at the position.
    Left,
    /// Move after text inserted exactly at the position.
    Right,
}

impl Operation {
    /// Create an insertion.
    pub fn insert(
        id: OpId,
        author_id: UserId,
        position: usize,
        content: impl Into<String>,
        base_version: u64,
    ) -> Self {
        Self::build(id, OpKind::Insert, author_id, position, 0, content.into(), base_version)
    }

    /// Create a deletion of `length` chars.
    pub fn delete(
        id: OpId,
        author_id: UserId,
        position: usize,
        length: usize,
        base_version: u64,
    ) -> Self {
        Self::build(id, OpKind::Delete, author_id, position, length, String::new(), base_version)
    }

    /// Create a replacement of `length` chars with `content`.
    pub fn replace(
        id: OpId,
        author_id: UserId,
        position: usize,
        length: usize,
        content: impl Into<String>,
        base_version: u64,
    ) -> Self {
        Self::build(
            id,
            OpKind::Replace,
            author_id,
            position,
            length,
            content.into(),
            base_version,
        )
    }

    fn build(
        id: OpId,
        kind: OpKind,
        author_id: UserId,
        position: usize,
        length: usize,
        content: String,
        base_version: u64,
    ) -> Self {
        Self {
            id,
            kind,
            position,
            content,
            length,
            author_id,
            client_timestamp: Utc::now(),
            base_version,
        }
    }

    /// Kind implied by a removed length and inserted content, or `None` for
    /// an edit that changes nothing.
    fn kind_for(length: usize, content: &str) -> Option<OpKind> {
        match (length, content.is_empty()) {
            (0, true) => None,
            (0, false) => Some(OpKind::Insert),
            (_, true) => Some(OpKind::Delete),
            (_, false) => Some(OpKind::Replace),
        }
    }

    /// A copy with the same identity and a different effect.
    ///
    /// Returns `None` when the new effect would be a no-op.
    pub fn rebased(&self, position: usize, length: usize, content: String) -> Option<Operation> {
        let kind = Self::kind_for(length, &content)?;
        Some(Operation {
            id: self.id.clone(),
            kind,
            position,
            content,
            length,
            author_id: self.author_id.clone(),
            client_timestamp: self.client_timestamp,
            base_version: self.base_version,
        })
    }

    /// A copy declared against another base version.
    pub fn with_base_version(&self, base_version: u64) -> Operation {
        Operation {
            base_version,
            ..self.clone()
        }
    }

    /// Check the shape rules for the operation kind.
    pub fn validate(&self) -> SyncResult<()> {
        match Self::kind_for(self.length, &self.content) {
            Some(kind) if kind == self.kind => Ok(()),
            Some(kind) => Err(SyncError::InvalidOperation(format!(
                "{} declared as {:?} but shaped like {:?}",
                self.id, self.kind, kind
            ))),
            None => Err(SyncError::InvalidOperation(format!(
                "{} changes nothing",
                self.id
            ))),
        }
    }

    /// End of the removed range (exclusive).
    pub fn end(&self) -> usize {
        self.position + self.length
    }

    /// Length of the inserted content in chars.
    pub fn content_len(&self) -> usize {
        char_len(&self.content)
    }

    /// Range of chars removed from the base text.
    pub fn removed_range(&self) -> Range<usize> {
        self.position..self.end()
    }

    /// Range this operation touches, in base coordinates.
    ///
    /// An insert touches only its insertion point. A replace covers the
    /// larger of what it removes and what it writes.
    pub fn affected_range(&self) -> Range<usize> {
        match self.kind {
            OpKind::Insert => self.position..self.position,
            OpKind::Delete => self.removed_range(),
            OpKind::Replace => {
                self.position..self.position + self.length.max(self.content_len())
            }
        }
    }

    /// Apply the operation to `text`, returning the edited text.
    pub fn apply(&self, text: &str) -> SyncResult<String> {
        let start = byte_index(text, self.position).ok_or_else(|| {
            SyncError::InvalidOperation(format!(
                "{} starts at {} beyond document length {}",
                self.id,
                self.position,
                char_len(text)
            ))
        })?;
        let end = byte_index(text, self.end()).ok_or_else(|| {
            SyncError::InvalidOperation(format!(
                "{} removes up to {} beyond document length {}",
                self.id,
                self.end(),
                char_len(text)
            ))
        })?;

        let mut result = String::with_capacity(text.len() + self.content.len());
        result.push_str(&text[..start]);
        result.push_str(&self.content);
        result.push_str(&text[end..]);
        Ok(result)
    }

    /// Express this operation on top of `earlier`, an operation declared
    /// against the same base text and sequenced before this one.
    ///
    /// Rules, in base coordinates:
    /// - entirely before `earlier` (including an insertion tie): unchanged,
    ///   so the later edit lands first at a shared position;
    /// - entirely after: shifted by `earlier`'s length change;
    /// - overlapping: the removal is applied, `earlier`'s inserted content is
    ///   kept, and this operation's content is placed in front of it.
    ///
    /// Returns `None` when nothing is left to do (for example a deletion of
    /// text `earlier` already removed).
    pub fn transform_against(&self, earlier: &Operation) -> Option<Operation> {
        let (ps, pe) = (self.position, self.end());
        let (fs, fe) = (earlier.position, earlier.end());
        let earlier_len = earlier.content_len();

        let (position, length, content) = if pe <= fs {
            (ps, self.length, self.content.clone())
        } else if ps >= fe {
            (ps - earlier.length + earlier_len, self.length, self.content.clone())
        } else if ps >= fs && pe <= fe {
            (fs, 0, self.content.clone())
        } else if pe <= fe {
            (ps, fs - ps, self.content.clone())
        } else {
            let start = ps.min(fs);
            (
                start,
                (fs - start) + earlier_len + (pe - fe),
                format!("{}{}", self.content, earlier.content),
            )
        };

        self.rebased(position, length, content)
    }

    /// The single edit turning `old` into `new`, carrying `template`'s
    /// identity. `None` when the texts are equal.
    pub fn between(old: &str, new: &str, template: &Operation) -> Option<Operation> {
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let removed = old_chars.len() - prefix - suffix;
        let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
        template.rebased(prefix, removed, inserted)
    }

    /// Map a position in the base text to the text after this operation.
    pub fn map_position(&self, pos: usize, assoc: Assoc) -> usize {
        if pos < self.position || (pos == self.position && assoc == Assoc::Left) {
            return pos;
        }
        if pos < self.end() {
            return match assoc {
                Assoc::Left => self.position + self.content_len(),
                Assoc::Right => self.position,
            };
        }
        pos - self.length + self.content_len()
    }
}

/// Number of chars in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte index of the char at `char_pos`; `char_len` maps to `text.len()`.
pub fn byte_index(text: &str, char_pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}

/// Slice of `text` between two char offsets, clamped to the text.
pub fn char_slice(text: &str, start: usize, end: usize) -> &str {
    let len = char_len(text);
    let start = byte_index(text, start.min(len)).unwrap_or(text.len());
    let end = byte_index(text, end.min(len)).unwrap_or(text.len());
    if start <= end {
        &text[start..end]
    } else {
        ""
    }
}

/// Widen `start..end` to whole lines of `text`.
///
/// The start moves back to the beginning of its line and the end forward to
/// the next line break (excluded) or the end of the text.
pub fn find_line_bounds(text: &str, start: usize, end: usize) -> (usize, usize) {
    let chars: Vec<char> = text.chars().collect();
    let end = end.min(chars.len());
    let start = start.min(end);
    let line_start = chars[..start]
        .iter()
        .rposition(|&c| c == '\n')
        .map_or(0, |i| i + 1);
    let line_end = chars[end..]
        .iter()
        .position(|&c| c == '\n')
        .map_or(chars.len(), |i| end + i);
    (line_start, line_end)
}
