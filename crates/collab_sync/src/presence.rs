//! Presence system for showing remote cursors, selections and typing state.
//!
//! Presence is fire-and-forget: updates never enter the operation queue and
//! a lost update is superseded by the next one. This module provides:
//!
//! - [`PresenceRegistry`]: who is in the document, where their cursor is and
//!   whether they are typing, with a liveness sweep that expires stale state
//! - [`CursorThrottle`]: rate limiting for outgoing cursor updates
//! - [`ColorAssigner`]: round-robin cursor colors handed out by the channel

use crate::config::PresenceConfig;
use crate::ids::UserId;
use crate::operation::{Assoc, Operation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A selection range in the document, in chars
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    /// Create a new selection range
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Check if this is a collapsed selection (cursor position)
    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }

    fn mapped(&self, op: &Operation) -> Self {
        let start = op.map_position(self.start, Assoc::Right);
        let end = op.map_position(self.end, Assoc::Left);
        Self {
            start,
            end: end.max(start),
        }
    }
}

/// Connection quality derived from how recently a user was heard from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Good,
    Degraded,
    Poor,
}

impl ConnectionQuality {
    /// Within two heartbeats is good; within half the presence timeout is
    /// degraded; anything older is poor.
    pub fn from_activity_age(age: Duration, config: &PresenceConfig) -> Self {
        if age <= config.heartbeat_interval() * 2 {
            ConnectionQuality::Good
        } else if age <= config.presence_timeout() / 2 {
            ConnectionQuality::Degraded
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// A presence change sent by one user.
///
/// Absent fields are left as they were; an update with every field absent is
/// a heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
}

impl PresenceUpdate {
    /// An update that only says the user is still here.
    pub fn heartbeat(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.cursor.is_none() && self.selection.is_none() && self.is_typing.is_none()
    }

    /// Fill fields this update leaves absent from an older one.
    fn merge_older(mut self, older: PresenceUpdate) -> Self {
        self.cursor = self.cursor.or(older.cursor);
        self.selection = self.selection.or(older.selection);
        self.is_typing = self.is_typing.or(older.is_typing);
        self
    }
}

/// One user's presence in a document.
#[derive(Clone, Debug)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub user_name: String,
    pub color: String,
    pub cursor_position: Option<usize>,
    pub selection_range: Option<SelectionRange>,
    pub is_typing: bool,
    pub last_activity_at: Instant,
    pub last_typing_at: Option<Instant>,
    pub connection_quality: ConnectionQuality,
}

impl PresenceEntry {
    fn new(user_id: UserId, user_name: String, color: String, now: Instant) -> Self {
        Self {
            user_id,
            user_name,
            color,
            cursor_position: None,
            selection_range: None,
            is_typing: false,
            last_activity_at: now,
            last_typing_at: None,
            connection_quality: ConnectionQuality::Good,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity_at = now;
        self.connection_quality = ConnectionQuality::Good;
    }
}

/// Remote cursor for rendering
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub user_id: UserId,
    pub user_name: String,
    pub color: String,
    pub position: usize,
    pub selection: Option<SelectionRange>,
    pub is_typing: bool,
    pub connection_quality: ConnectionQuality,
}

/// Something observers of presence should know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined { user_id: UserId },
    Updated { user_id: UserId },
    TypingStarted { user_id: UserId },
    TypingStopped { user_id: UserId },
    Left { user_id: UserId },
}

/// Presence of every remote user in one document.
#[derive(Clone, Debug)]
pub struct PresenceRegistry {
    entries: HashMap<UserId, PresenceEntry>,
    config: PresenceConfig,
    last_sweep: Option<Instant>,
}

impl PresenceRegistry {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
            last_sweep: None,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Add a user, or refresh a user that is already known.
    pub fn join(
        &mut self,
        user_id: UserId,
        user_name: impl Into<String>,
        color: impl Into<String>,
        now: Instant,
    ) -> Option<PresenceEvent> {
        let user_name = user_name.into();
        let color = color.into();
        if let Some(entry) = self.entries.get_mut(&user_id) {
            entry.user_name = user_name;
            entry.color = color;
            entry.touch(now);
            return None;
        }
        self.entries.insert(
            user_id.clone(),
            PresenceEntry::new(user_id.clone(), user_name, color, now),
        );
        Some(PresenceEvent::Joined { user_id })
    }

    /// Remove a user. Returns the `Left` event only if the user was present.
    pub fn leave(&mut self, user_id: &UserId) -> Option<PresenceEvent> {
        self.entries.remove(user_id).map(|entry| PresenceEvent::Left {
            user_id: entry.user_id,
        })
    }

    /// Apply an update from a remote user.
    ///
    /// Updates from users that never joined are dropped.
    pub fn apply_update(&mut self, update: &PresenceUpdate, now: Instant) -> Vec<PresenceEvent> {
        let Some(entry) = self.entries.get_mut(&update.user_id) else {
            tracing::debug!("Presence update from unknown user {}", update.user_id);
            return Vec::new();
        };
        entry.touch(now);

        let mut events = Vec::new();
        if update.cursor.is_some() || update.selection.is_some() {
            if update.cursor.is_some() {
                entry.cursor_position = update.cursor;
            }
            if update.selection.is_some() {
                entry.selection_range = update.selection;
            }
            events.push(PresenceEvent::Updated {
                user_id: update.user_id.clone(),
            });
        }

        match update.is_typing {
            Some(true) => {
                entry.last_typing_at = Some(now);
                if !entry.is_typing {
                    entry.is_typing = true;
                    events.push(PresenceEvent::TypingStarted {
                        user_id: update.user_id.clone(),
                    });
                }
            }
            Some(false) if entry.is_typing => {
                entry.is_typing = false;
                entry.last_typing_at = None;
                events.push(PresenceEvent::TypingStopped {
                    user_id: update.user_id.clone(),
                });
            }
            _ => {}
        }
        events
    }

    /// Whether a sweep is due at `now`.
    pub fn sweep_due(&self, now: Instant) -> bool {
        self.last_sweep
            .map_or(true, |at| now.duration_since(at) >= self.config.sweep_interval())
    }

    /// Expire stale typing indicators and entries.
    ///
    /// Each expiry produces its event once: the typing flag is cleared and
    /// the entry removed in the same step the event is emitted.
    pub fn sweep(&mut self, now: Instant) -> Vec<PresenceEvent> {
        self.last_sweep = Some(now);
        let typing_timeout = self.config.typing_timeout();
        let presence_timeout = self.config.presence_timeout();

        let mut events = Vec::new();
        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            let age = now.duration_since(entry.last_activity_at);
            if age > presence_timeout {
                expired.push(entry.user_id.clone());
                continue;
            }
            entry.connection_quality = ConnectionQuality::from_activity_age(age, &self.config);

            let typing_stale = entry
                .last_typing_at
                .map_or(true, |at| now.duration_since(at) > typing_timeout);
            if entry.is_typing && typing_stale {
                entry.is_typing = false;
                entry.last_typing_at = None;
                events.push(PresenceEvent::TypingStopped {
                    user_id: entry.user_id.clone(),
                });
            }
        }

        expired.sort();
        for user_id in expired {
            tracing::debug!("Presence of {} expired", user_id);
            events.extend(self.leave(&user_id));
        }
        events
    }

    /// Move remote cursors and selections through an applied operation.
    pub fn transform_positions(&mut self, op: &Operation) {
        for entry in self.entries.values_mut() {
            if let Some(cursor) = entry.cursor_position {
                entry.cursor_position = Some(op.map_position(cursor, Assoc::Right));
            }
            if let Some(selection) = entry.selection_range {
                entry.selection_range = Some(selection.mapped(op));
            }
        }
    }

    /// Cursors of every user except `exclude`, ordered by user id.
    pub fn remote_cursors(&self, exclude: &UserId) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> = self
            .entries
            .values()
            .filter(|entry| &entry.user_id != exclude)
            .filter_map(|entry| {
                let position = entry.cursor_position?;
                Some(RemoteCursor {
                    user_id: entry.user_id.clone(),
                    user_name: entry.user_name.clone(),
                    color: entry.color.clone(),
                    position,
                    selection: entry.selection_range,
                    is_typing: entry.is_typing,
                    connection_quality: entry.connection_quality,
                })
            })
            .collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Users that are currently typing, ordered by id.
    pub fn typing_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .values()
            .filter(|entry| entry.is_typing)
            .map(|entry| entry.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// Every known user, ordered by id.
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.entries.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Rate limiter for outgoing cursor updates.
///
/// At most one update per interval is released; updates offered in between
/// are folded into a single pending one, newest fields winning.
#[derive(Clone, Debug)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<PresenceUpdate>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer an update; returns it if it may be sent now.
    pub fn offer(&mut self, update: PresenceUpdate, now: Instant) -> Option<PresenceUpdate> {
        let update = match self.pending.take() {
            Some(older) => update.merge_older(older),
            None => update,
        };
        if self.ready(now) {
            self.last_sent = Some(now);
            Some(update)
        } else {
            self.pending = Some(update);
            None
        }
    }

    /// Release the held update once the interval has passed.
    pub fn poll(&mut self, now: Instant) -> Option<PresenceUpdate> {
        if self.pending.is_some() && self.ready(now) {
            self.last_sent = Some(now);
            return self.pending.take();
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn ready(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |at| now.duration_since(at) >= self.interval)
    }
}

/// Default color palette for user cursors
pub fn default_colors() -> Vec<String> {
    vec![
        "#E91E63".into(), // Pink
        "#9C27B0".into(), // Purple
        "#3F51B5".into(), // Indigo
        "#2196F3".into(), // Blue
        "#00BCD4".into(), // Cyan
        "#4CAF50".into(), // Green
        "#FF9800".into(), // Orange
        "#795548".into(), // Brown
    ]
}

/// Round-robin color assignment that remembers users across rejoins.
#[derive(Clone, Debug)]
pub struct ColorAssigner {
    colors: Vec<String>,
    assignments: HashMap<UserId, String>,
    next_color_index: usize,
}

impl Default for ColorAssigner {
    fn default() -> Self {
        Self::new(default_colors())
    }
}

impl ColorAssigner {
    /// Create an assigner over `colors`; an empty palette falls back to the
    /// default one.
    pub fn new(colors: Vec<String>) -> Self {
        let colors = if colors.is_empty() {
            default_colors()
        } else {
            colors
        };
        Self {
            colors,
            assignments: HashMap::new(),
            next_color_index: 0,
        }
    }

    /// Color for a user, assigning the next palette entry on first sight.
    pub fn assign(&mut self, user_id: &UserId) -> String {
        if let Some(color) = self.assignments.get(user_id) {
            return color.clone();
        }
        let color = self.colors[self.next_color_index].clone();
        self.next_color_index = (self.next_color_index + 1) % self.colors.len();
        self.assignments.insert(user_id.clone(), color.clone());
        color
    }
}
