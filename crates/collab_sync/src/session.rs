//! Per-session synchronization state machine.
//!
//! [`SyncSession`] owns the document replica, the outgoing queue, the
//! conflict resolver and the presence registry for one client session. It is
//! deterministic: every entry point takes the current [`Instant`], outgoing
//! messages collect in an outbox and observable changes in an event list.
//! The [`crate::manager`] actor drives it from a single task.
//!
//! # Remote operations
//!
//! A remote operation is applied to the confirmed view first. Each
//! unacknowledged local operation is then moved past it in enqueue order:
//! the Conflict Detector compares the pair, disjoint pairs are rebased
//! positionally, auto-resolvable conflicts are rebased onto the merged text,
//! and manual conflicts withdraw the local operation and lock the region
//! until someone resolves it. The speculative view is the result, and the
//! local view receives the difference.

use crate::config::SyncConfig;
use crate::conflict::{detect, Conflict, ConflictType};
use crate::error::{SyncError, SyncResult};
use crate::ids::{ClientId, DocId, Identity, OpId, UserId};
use crate::message::{ClientMessage, ServerMessage};
use crate::operation::{char_slice, Assoc, Operation, SequencedOperation};
use crate::presence::{
    CursorThrottle, PresenceEvent, PresenceRegistry, PresenceUpdate, RemoteCursor, SelectionRange,
};
use crate::queue::{OpState, OperationQueue, QueueEvent, QueueStats};
use crate::replica::DocumentReplica;
use crate::resolver::{
    manual_region, AutoResolution, ConflictRecord, ConflictResolver, Resolution,
    ResolutionRequest,
};
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Rendering surface the session pushes document changes into.
pub trait LocalView: Send {
    /// Apply an edit expressed against the text the view currently shows.
    fn apply_operation_to_local_view(&mut self, operation: &Operation);
}

/// Connection state of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline { reason: String },
    Reconnecting { attempt: u32 },
    /// Waiting for a sync response
    Syncing,
    Online,
}

/// Something observers of a session should know about.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    StatusChanged(ConnectionStatus),
    /// The replica caught up with the channel.
    Synced { version: u64 },
    RemoteOperation { operation: Operation, version: u64 },
    OperationAcknowledged { op_id: OpId, version: u64 },
    /// A local edit could not be delivered. It stays in the view, unsynced.
    OperationFailed { operation: Operation, error: SyncError },
    Retransmit { op_ids: Vec<OpId>, retry: u32 },
    /// A conflict needs a human decision.
    ConflictDetected(Conflict),
    ConflictAutoResolved {
        conflict_id: String,
        conflict_type: ConflictType,
    },
    ConflictResolved {
        conflict_id: String,
        resolution: Resolution,
    },
    Presence(PresenceEvent),
    Error(SyncError),
}

/// Point-in-time view of a session, for inspection.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub document_id: DocId,
    pub client_id: ClientId,
    pub user_id: UserId,
    pub status: ConnectionStatus,
    pub version: u64,
    pub content: String,
    pub confirmed_content: String,
    pub queue: QueueStats,
    pub unresolved_conflicts: Vec<Conflict>,
    pub remote_cursors: Vec<RemoteCursor>,
    pub typing_users: Vec<UserId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncKind {
    /// First sync of the session
    Initial,
    /// After the transport came back
    Reconnect,
    /// Filling a version gap while online
    CatchUp,
}

/// Synchronization state machine for one client session.
pub struct SyncSession {
    document_id: DocId,
    client_id: ClientId,
    identity: Identity,
    config: SyncConfig,
    replica: DocumentReplica,
    queue: OperationQueue,
    resolver: ConflictResolver,
    presence: PresenceRegistry,
    throttle: CursorThrottle,
    view: Option<Box<dyn LocalView>>,
    status: ConnectionStatus,
    synced_once: bool,
    next_seq: u64,
    /// Sequenced operations that arrived ahead of a gap
    buffered: BTreeMap<u64, SequencedOperation>,
    sync_requested_at: Option<Instant>,
    sync_kind: Option<SyncKind>,
    outbox: Vec<ClientMessage>,
    /// Conflict messages held until the session is online
    deferred: Vec<ClientMessage>,
    events: Vec<SyncEvent>,
    last_sent_at: Option<Instant>,
    is_typing: bool,
    last_typing_at: Option<Instant>,
}

impl SyncSession {
    /// Create a session that has not synced yet.
    pub fn new(document_id: DocId, client_id: ClientId, identity: Identity, config: SyncConfig) -> Self {
        Self {
            replica: DocumentReplica::new(config.history_capacity),
            queue: OperationQueue::new(client_id.clone(), config.queue.clone()),
            resolver: ConflictResolver::new().with_logging(),
            presence: PresenceRegistry::new(config.presence.clone()),
            throttle: CursorThrottle::new(config.presence.cursor_throttle()),
            document_id,
            client_id,
            identity,
            config,
            view: None,
            status: ConnectionStatus::Offline {
                reason: "not connected".to_string(),
            },
            synced_once: false,
            next_seq: 1,
            buffered: BTreeMap::new(),
            sync_requested_at: None,
            sync_kind: None,
            outbox: Vec::new(),
            deferred: Vec::new(),
            events: Vec::new(),
            last_sent_at: None,
            is_typing: false,
            last_typing_at: None,
        }
    }

    /// Attach the rendering surface.
    pub fn with_view(mut self, view: Box<dyn LocalView>) -> Self {
        self.view = Some(view);
        self
    }

    pub fn set_view(&mut self, view: Box<dyn LocalView>) {
        self.view = Some(view);
    }

    pub fn document_id(&self) -> &DocId {
        &self.document_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Whether the initial sync completed.
    pub fn is_synced(&self) -> bool {
        self.synced_once
    }

    /// The text the user sees, local edits included.
    pub fn content(&self) -> &str {
        self.replica.content()
    }

    /// The canonical text at `current_version`.
    pub fn confirmed_content(&self) -> &str {
        self.replica.confirmed_content()
    }

    pub fn current_version(&self) -> u64 {
        self.replica.current_version()
    }

    pub fn replica(&self) -> &DocumentReplica {
        &self.replica
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Unresolved conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.resolver.unresolved().into_iter().cloned().collect()
    }

    pub fn resolution_history(&self) -> &[ConflictRecord] {
        self.resolver.history()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.presence.remote_cursors(&self.identity.user_id)
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.presence.typing_users()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            document_id: self.document_id.clone(),
            client_id: self.client_id.clone(),
            user_id: self.identity.user_id.clone(),
            status: self.status.clone(),
            version: self.replica.current_version(),
            content: self.replica.content().to_string(),
            confirmed_content: self.replica.confirmed_content().to_string(),
            queue: self.queue.stats(),
            unresolved_conflicts: self.conflicts(),
            remote_cursors: self.remote_cursors(),
            typing_users: self.typing_users(),
        }
    }

    /// Messages waiting to go out, in order.
    pub fn take_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Events since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    // ========== Connection Lifecycle ==========

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        if status == ConnectionStatus::Online {
            let deferred = std::mem::take(&mut self.deferred);
            self.outbox.extend(deferred);
        }
        self.status = status.clone();
        self.events.push(SyncEvent::StatusChanged(status));
    }

    /// Ask the channel for the document: a full snapshot the first time,
    /// everything since `current_version` afterwards.
    pub fn begin_sync(&mut self, now: Instant) {
        let (since, kind) = if self.synced_once {
            (Some(self.replica.current_version()), SyncKind::Reconnect)
        } else {
            (None, SyncKind::Initial)
        };
        self.set_status(ConnectionStatus::Syncing);
        self.request_sync(since, kind, now);
    }

    /// Retry after a failed initial sync or a lost connection.
    pub fn retry_sync(&mut self, now: Instant) {
        self.begin_sync(now);
    }

    fn request_sync(&mut self, since_version: Option<u64>, kind: SyncKind, now: Instant) {
        tracing::debug!(
            "Session {} requesting sync of {} since {:?}",
            self.client_id,
            self.document_id,
            since_version
        );
        self.sync_requested_at = Some(now);
        self.sync_kind = Some(kind);
        self.send(ClientMessage::DocumentSyncRequest { since_version }, now);
    }

    fn request_catch_up(&mut self, since_version: Option<u64>, now: Instant) {
        if self.sync_requested_at.is_some() {
            return;
        }
        self.request_sync(since_version, SyncKind::CatchUp, now);
    }

    /// A transport link is up again.
    pub fn connected(&mut self, now: Instant) {
        let retried = self.queue.retry_failed();
        if retried > 0 {
            tracing::info!("Retrying {} failed operations after reconnect", retried);
        }
        self.begin_sync(now);
    }

    /// The transport dropped. Unacknowledged operations stay queued.
    pub fn transport_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Session {} lost its connection: {}", self.client_id, reason);

        let requeued = self.queue.requeue_in_flight();
        if requeued > 0 {
            tracing::debug!("{} in-flight operations returned to pending", requeued);
        }
        self.outbox.clear();
        self.buffered.clear();
        self.sync_requested_at = None;
        self.sync_kind = None;
        for user_id in self.presence.user_ids() {
            if let Some(event) = self.presence.leave(&user_id) {
                self.events.push(SyncEvent::Presence(event));
            }
        }
        self.set_status(ConnectionStatus::Offline { reason });
    }

    pub fn set_reconnecting(&mut self, attempt: u32) {
        self.set_status(ConnectionStatus::Reconnecting { attempt });
    }

    /// Give up on every operation the channel has not acknowledged.
    ///
    /// Each one is reported with `OperationFailed` unless it already was.
    /// Returns the number of operations dropped from the queue.
    pub fn abandon_unacknowledged(&mut self) -> usize {
        let operations = self.queue.unacknowledged();
        let count = operations.len();
        for operation in operations {
            let already_failed = self.queue.state_of(&operation.id) == Some(OpState::Failed);
            self.queue.withdraw(&operation.id);
            if !already_failed {
                tracing::warn!("Operation {} abandoned unsynced", operation.id);
                self.events.push(SyncEvent::OperationFailed {
                    operation,
                    error: SyncError::SessionClosed,
                });
            }
        }
        count
    }

    /// Give failed operations another set of retries.
    pub fn retry_failed(&mut self) -> usize {
        let count = self.queue.retry_failed();
        self.queue.restamp(self.replica.current_version());
        count
    }

    fn send(&mut self, message: ClientMessage, now: Instant) {
        self.last_sent_at = Some(now);
        self.outbox.push(message);
    }

    /// Conflict coordination messages survive offline periods.
    fn send_control(&mut self, message: ClientMessage, now: Instant) {
        if self.status == ConnectionStatus::Online {
            self.send(message, now);
        } else {
            self.deferred.push(message);
        }
    }

    // ========== Local Edits ==========

    fn next_op_id(&self) -> OpId {
        OpId::new(self.client_id.clone(), self.next_seq)
    }

    /// Insert text at a char position of the visible content.
    pub fn insert(&mut self, position: usize, content: &str, now: Instant) -> SyncResult<Operation> {
        let op = Operation::insert(
            self.next_op_id(),
            self.identity.user_id.clone(),
            position,
            content,
            self.replica.current_version(),
        );
        self.local_edit(op, true, now)
    }

    /// Delete `length` chars at a position of the visible content.
    pub fn delete(&mut self, position: usize, length: usize, now: Instant) -> SyncResult<Operation> {
        let op = Operation::delete(
            self.next_op_id(),
            self.identity.user_id.clone(),
            position,
            length,
            self.replica.current_version(),
        );
        self.local_edit(op, true, now)
    }

    /// Replace `length` chars at a position of the visible content.
    pub fn replace(
        &mut self,
        position: usize,
        length: usize,
        content: &str,
        now: Instant,
    ) -> SyncResult<Operation> {
        let op = Operation::replace(
            self.next_op_id(),
            self.identity.user_id.clone(),
            position,
            length,
            content,
            self.replica.current_version(),
        );
        self.local_edit(op, true, now)
    }

    fn local_edit(&mut self, op: Operation, check_lock: bool, now: Instant) -> SyncResult<Operation> {
        if !self.synced_once {
            return Err(SyncError::NotSynced);
        }
        op.validate()?;
        if check_lock {
            if let Some(conflict_id) = self.locked_by(&op) {
                return Err(SyncError::RegionLocked(conflict_id));
            }
        }

        let text = op.apply(self.replica.content())?;
        self.replica.set_speculative(text);
        self.next_seq += 1;
        if let Some(view) = self.view.as_mut() {
            view.apply_operation_to_local_view(&op);
        }
        self.presence.transform_positions(&op);
        self.queue.enqueue(op.clone(), now);
        self.note_typing(now);
        Ok(op)
    }

    /// Id of an unresolved conflict whose region the edit touches.
    fn locked_by(&self, op: &Operation) -> Option<String> {
        let start = op.position;
        let end = op.end().max(op.position + 1);
        self.resolver
            .unresolved()
            .into_iter()
            .find(|conflict| {
                conflict
                    .region
                    .as_ref()
                    .and_then(|region| self.region_in_view(region.version, region.start, region.end))
                    .is_some_and(|(s, e)| start < e && s < end)
            })
            .map(|conflict| conflict.id.clone())
    }

    /// Map a canonical span to the visible text.
    fn region_in_view(&self, version: u64, start: usize, end: usize) -> Option<(usize, usize)> {
        let (mut start, mut end) = self.replica.map_span(version, start, end)?;
        for op in self.queue.unacknowledged() {
            start = op.map_position(start, Assoc::Right);
            end = op.map_position(end, Assoc::Left);
        }
        Some((start, end.max(start)))
    }

    // ========== Presence ==========

    /// Report the local cursor. Updates are throttled, latest wins.
    pub fn set_cursor(&mut self, position: usize, now: Instant) {
        let update = PresenceUpdate {
            user_id: self.identity.user_id.clone(),
            cursor: Some(position),
            ..PresenceUpdate::default()
        };
        self.offer_presence(update, now);
    }

    /// Report the local selection; the cursor follows its end.
    pub fn set_selection(&mut self, selection: SelectionRange, now: Instant) {
        let update = PresenceUpdate {
            user_id: self.identity.user_id.clone(),
            cursor: Some(selection.end),
            selection: Some(selection),
            ..PresenceUpdate::default()
        };
        self.offer_presence(update, now);
    }

    /// Report whether the local user is typing. Only changes are sent.
    pub fn set_typing(&mut self, typing: bool, now: Instant) {
        if typing {
            self.last_typing_at = Some(now);
        }
        if self.is_typing == typing {
            return;
        }
        self.is_typing = typing;
        if !typing {
            self.last_typing_at = None;
        }
        if self.status == ConnectionStatus::Online {
            let update = PresenceUpdate {
                user_id: self.identity.user_id.clone(),
                is_typing: Some(typing),
                ..PresenceUpdate::default()
            };
            self.send(ClientMessage::PresenceUpdate(update), now);
        }
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing
    }

    fn note_typing(&mut self, now: Instant) {
        self.set_typing(true, now);
    }

    fn offer_presence(&mut self, update: PresenceUpdate, now: Instant) {
        if self.status != ConnectionStatus::Online {
            return;
        }
        if let Some(update) = self.throttle.offer(update, now) {
            self.send(ClientMessage::PresenceUpdate(update), now);
        }
    }

    // ========== Conflicts ==========

    /// Mark a conflict as being worked on.
    pub fn begin_resolution(&mut self, conflict_id: &str) -> SyncResult<Conflict> {
        self.resolver.begin_resolution(conflict_id).cloned()
    }

    /// Settle a manual conflict.
    ///
    /// The chosen text replaces the conflicted region as a regular edit, and
    /// the resolution is broadcast so every replica closes the conflict.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        request: ResolutionRequest,
        now: Instant,
    ) -> SyncResult<Resolution> {
        if !self.synced_once {
            return Err(SyncError::NotSynced);
        }
        self.resolver.begin_resolution(conflict_id)?;
        let content = self.resolver.resolution_content(conflict_id, &request)?;
        let region = self
            .resolver
            .get(conflict_id)
            .and_then(|conflict| conflict.region.clone())
            .ok_or_else(|| SyncError::InvalidResolution(format!("conflict {} has no region", conflict_id)))?;
        let (start, end) = self
            .region_in_view(region.version, region.start, region.end)
            .ok_or_else(|| {
                SyncError::InvalidResolution(format!(
                    "region of conflict {} is not reachable from version {}",
                    conflict_id,
                    self.replica.current_version()
                ))
            })?;

        if char_slice(self.replica.content(), start, end) != content {
            let template = Operation::insert(
                self.next_op_id(),
                self.identity.user_id.clone(),
                start,
                content.clone(),
                self.replica.current_version(),
            );
            if let Some(op) = template.rebased(start, end - start, content.clone()) {
                self.local_edit(op, false, now)?;
            }
        }

        let resolution = Resolution {
            strategy: request.strategy,
            content,
            resolved_by: self.identity.user_id.clone(),
            resolved_at: Utc::now(),
        };
        self.resolver.complete(conflict_id, &resolution)?;
        self.send_control(
            ClientMessage::ConflictResolved {
                conflict_id: conflict_id.to_string(),
                resolution: resolution.clone(),
            },
            now,
        );
        self.events.push(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            resolution: resolution.clone(),
        });
        Ok(resolution)
    }

    /// Settle a conflict found while rebasing `pending` over a remote
    /// operation. Returns the local operation to keep, if any.
    fn settle_conflict(
        &mut self,
        conflict: Conflict,
        pending: &Operation,
        new_ctx: &str,
        rebased_locals: &[Operation],
        version: u64,
        now: Instant,
    ) -> Option<Operation> {
        match self.resolver.auto_resolve(conflict) {
            AutoResolution::Merged { conflict, content } => {
                tracing::debug!(
                    "Conflict {} ({:?}) merged automatically",
                    conflict.id,
                    conflict.conflict_type
                );
                self.events.push(SyncEvent::ConflictAutoResolved {
                    conflict_id: conflict.id,
                    conflict_type: conflict.conflict_type,
                });
                Operation::between(new_ctx, &content, pending)
            }
            AutoResolution::Manual { mut conflict, .. } => {
                let Some(mut region) = manual_region(&conflict, version) else {
                    tracing::warn!(
                        "Conflict {} has no mergeable region, rebasing positionally",
                        conflict.id
                    );
                    return pending.transform_against(&conflict.remote_operation);
                };
                // Back to canonical coordinates at `version`
                for op in rebased_locals.iter().rev() {
                    region.start = unmap_position(op, region.start, Assoc::Left);
                    region.end = unmap_position(op, region.end, Assoc::Right);
                }
                region.end = region.end.max(region.start);
                conflict.region = Some(region);

                self.resolver.register(conflict.clone());
                self.send_control(
                    ClientMessage::ConflictDetected {
                        conflict: conflict.clone(),
                    },
                    now,
                );
                self.events.push(SyncEvent::ConflictDetected(conflict));
                None
            }
        }
    }

    // ========== Inbound Messages ==========

    /// Handle a message from the channel.
    pub fn handle_message(&mut self, message: ServerMessage, now: Instant) {
        let result = match message {
            ServerMessage::OperationBatch { operations, .. } => operations
                .into_iter()
                .try_for_each(|sequenced| self.receive_sequenced(sequenced, now)),
            ServerMessage::OperationAck {
                operation_id,
                server_version,
            } => self.on_ack(operation_id, server_version, now),
            ServerMessage::PresenceUpdate(update) => {
                if update.user_id != self.identity.user_id {
                    for event in self.presence.apply_update(&update, now) {
                        self.events.push(SyncEvent::Presence(event));
                    }
                }
                Ok(())
            }
            ServerMessage::UserJoined {
                user_id,
                user_name,
                color,
            } => {
                if user_id != self.identity.user_id {
                    if let Some(event) = self.presence.join(user_id, user_name, color, now) {
                        self.events.push(SyncEvent::Presence(event));
                    }
                }
                Ok(())
            }
            ServerMessage::UserLeft { user_id } => {
                if let Some(event) = self.presence.leave(&user_id) {
                    self.events.push(SyncEvent::Presence(event));
                }
                Ok(())
            }
            ServerMessage::ConflictDetected { conflict } => {
                if self.resolver.register(conflict.clone()) {
                    self.events.push(SyncEvent::ConflictDetected(conflict));
                }
                Ok(())
            }
            ServerMessage::ConflictResolved {
                conflict_id,
                resolution,
            } => {
                match self.resolver.complete(&conflict_id, &resolution) {
                    Ok(_) => self.events.push(SyncEvent::ConflictResolved {
                        conflict_id,
                        resolution,
                    }),
                    Err(_) => tracing::debug!("Resolution for unknown conflict {}", conflict_id),
                }
                Ok(())
            }
            ServerMessage::DocumentSyncResponse {
                content,
                version,
                active_operations,
                forced,
                rejected,
            } => self.on_sync_response(content, version, active_operations, forced, rejected, now),
            ServerMessage::Error { code, message } => {
                tracing::warn!("Channel error for {}: {} ({})", self.client_id, message, code);
                self.events
                    .push(SyncEvent::Error(SyncError::Transport(format!("{}: {}", code, message))));
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!("Session {} diverged: {}", self.client_id, e);
            self.events.push(SyncEvent::Error(e));
            self.buffered.clear();
            self.sync_requested_at = None;
            self.request_catch_up(None, now);
        }
    }

    fn receive_sequenced(&mut self, sequenced: SequencedOperation, now: Instant) -> SyncResult<()> {
        if !self.synced_once {
            // The replica holds no document yet; wait for the snapshot
            tracing::debug!(
                "Holding {} at version {} until the initial sync",
                sequenced.operation.id,
                sequenced.version
            );
            self.buffered.insert(sequenced.version, sequenced);
            return Ok(());
        }
        let current = self.replica.current_version();
        if self.replica.has_applied(&sequenced.operation.id) || sequenced.version <= current {
            tracing::debug!("Skipping already applied {}", sequenced.operation.id);
            return Ok(());
        }
        if sequenced.version > current + 1 {
            tracing::debug!(
                "Buffering {} at version {} (replica at {})",
                sequenced.operation.id,
                sequenced.version,
                current
            );
            self.buffered.insert(sequenced.version, sequenced);
            self.request_catch_up(Some(current), now);
            return Ok(());
        }

        self.integrate_next(sequenced, now)?;
        self.drain_buffered(now)
    }

    fn drain_buffered(&mut self, now: Instant) -> SyncResult<()> {
        while let Some((version, sequenced)) = self.buffered.pop_first() {
            let current = self.replica.current_version();
            if version <= current {
                continue;
            }
            if version != current + 1 {
                self.buffered.insert(version, sequenced);
                break;
            }
            if !self.replica.has_applied(&sequenced.operation.id) {
                self.integrate_next(sequenced, now)?;
            }
        }
        Ok(())
    }

    /// Integrate the operation at `current_version + 1`.
    fn integrate_next(&mut self, sequenced: SequencedOperation, now: Instant) -> SyncResult<()> {
        if sequenced.operation.id.client_id == self.client_id {
            self.integrate_own(sequenced)
        } else {
            self.integrate_foreign(sequenced, now)
        }
    }

    /// One of this session's operations, learned without its ack.
    fn integrate_own(&mut self, sequenced: SequencedOperation) -> SyncResult<()> {
        let old_view = self.replica.content().to_string();
        self.queue.withdraw(&sequenced.operation.id);
        self.replica.apply_sequenced(&sequenced)?;
        self.rebuild_speculative();
        self.emit_view_delta(&old_view, &sequenced.operation);
        self.events.push(SyncEvent::OperationAcknowledged {
            op_id: sequenced.operation.id.clone(),
            version: sequenced.version,
        });
        Ok(())
    }

    fn integrate_foreign(&mut self, sequenced: SequencedOperation, now: Instant) -> SyncResult<()> {
        let old_view = self.replica.content().to_string();
        let base = self.replica.confirmed_content().to_string();
        self.replica.apply_sequenced(&sequenced)?;
        let confirmed = self.replica.confirmed_content().to_string();

        let speculative = self.rebase_pending(
            base,
            confirmed,
            &sequenced.operation,
            sequenced.version,
            true,
            now,
        );
        self.replica.set_speculative(speculative);

        self.events.push(SyncEvent::RemoteOperation {
            operation: sequenced.operation.clone(),
            version: sequenced.version,
        });
        self.emit_view_delta(&old_view, &sequenced.operation);
        Ok(())
    }

    /// Move every unacknowledged local operation past `incoming`, which
    /// turned `old_base` into `new_base`. Returns the new speculative text.
    fn rebase_pending(
        &mut self,
        old_base: String,
        new_base: String,
        incoming: &Operation,
        version: u64,
        detect_conflicts: bool,
        now: Instant,
    ) -> String {
        let mut old_ctx = old_base;
        let mut new_ctx = new_base;
        let mut current = Operation::between(&old_ctx, &new_ctx, incoming);
        let mut rebased_locals: Vec<Operation> = Vec::new();

        for pending in self.queue.unacknowledged() {
            let rebased = match &current {
                None => Some(pending.clone()),
                Some(remote) if detect_conflicts => {
                    let authors_active = self.presence.contains(&remote.author_id);
                    match detect(&pending, remote, &old_ctx, authors_active) {
                        None => pending.transform_against(remote),
                        Some(conflict) => self.settle_conflict(
                            conflict,
                            &pending,
                            &new_ctx,
                            &rebased_locals,
                            version,
                            now,
                        ),
                    }
                }
                Some(remote) => pending.transform_against(remote),
            };

            let next_old = match pending.apply(&old_ctx) {
                Ok(text) => text,
                Err(e) => {
                    self.fail_local(&pending.id, e);
                    continue;
                }
            };
            let next_new = match &rebased {
                Some(op) => match op.apply(&new_ctx) {
                    Ok(text) => {
                        self.queue.replace(op.with_base_version(version));
                        rebased_locals.push(op.clone());
                        text
                    }
                    Err(e) => {
                        self.fail_local(&pending.id, e);
                        new_ctx.clone()
                    }
                },
                None => {
                    tracing::debug!("Local operation {} absorbed by {}", pending.id, incoming.id);
                    self.queue.withdraw(&pending.id);
                    new_ctx.clone()
                }
            };

            current = Operation::between(&next_old, &next_new, incoming);
            old_ctx = next_old;
            new_ctx = next_new;
        }
        new_ctx
    }

    fn fail_local(&mut self, op_id: &OpId, error: SyncError) {
        tracing::warn!("Dropping local operation {}: {}", op_id, error);
        if let Some(operation) = self.queue.withdraw(op_id) {
            self.events.push(SyncEvent::OperationFailed { operation, error });
        }
    }

    fn rebuild_speculative(&mut self) {
        let pending = self.queue.unacknowledged();
        let skipped = self.replica.rebuild_speculative(pending.iter());
        for op_id in skipped {
            self.fail_local(
                &op_id,
                SyncError::InvalidOperation(format!("{} no longer fits the document", op_id)),
            );
        }
    }

    /// Push the change from `old` to the current speculative text into the
    /// view and move remote cursors with it.
    fn emit_view_delta(&mut self, old: &str, template: &Operation) {
        let Some(delta) = Operation::between(old, self.replica.content(), template) else {
            return;
        };
        if let Some(view) = self.view.as_mut() {
            view.apply_operation_to_local_view(&delta);
        }
        self.presence.transform_positions(&delta);
    }

    fn on_ack(&mut self, op_id: OpId, server_version: u64, now: Instant) -> SyncResult<()> {
        let Some(op) = self.queue.acknowledge(&op_id, server_version) else {
            tracing::debug!("Ignoring ack for unknown {}", op_id);
            return Ok(());
        };
        if self.replica.has_applied(&op_id) {
            return Ok(());
        }

        let current = self.replica.current_version();
        if server_version == current + 1 {
            self.replica
                .apply_sequenced(&SequencedOperation::new(server_version, op))?;
            self.queue.restamp(server_version);
            self.drain_buffered(now)?;
        } else if server_version <= current {
            // Already part of the snapshot the replica was reset to
            let old_view = self.replica.content().to_string();
            self.rebuild_speculative();
            self.emit_view_delta(&old_view, &op);
        } else {
            tracing::debug!(
                "Ack for {} at {} skips ahead of {}, catching up",
                op_id,
                server_version,
                current
            );
            self.buffered
                .insert(server_version, SequencedOperation::new(server_version, op));
            self.request_catch_up(Some(current), now);
        }

        self.events.push(SyncEvent::OperationAcknowledged {
            op_id,
            version: server_version,
        });
        Ok(())
    }

    fn on_sync_response(
        &mut self,
        content: String,
        version: u64,
        active_operations: Vec<SequencedOperation>,
        forced: bool,
        rejected: Vec<OpId>,
        now: Instant,
    ) -> SyncResult<()> {
        self.sync_requested_at = None;
        self.sync_kind = None;
        if forced {
            let count = self.queue.reject(&rejected);
            tracing::debug!("{} operations rejected as stale, resending", count);
        }

        if !self.synced_once {
            let old_view = self.replica.content().to_string();
            self.replica.reset(content, version)?;
            self.synced_once = true;
            self.rebuild_speculative();
            let template = self.snapshot_template(version);
            self.emit_view_delta(&old_view, &template);
            tracing::info!(
                "Session {} synced {} at version {}",
                self.client_id,
                self.document_id,
                version
            );
            self.buffered.retain(|v, _| *v > version);
            self.drain_buffered(now)?;
            if !self.buffered.is_empty() {
                self.request_catch_up(Some(self.replica.current_version()), now);
            }
        } else {
            for sequenced in active_operations {
                if sequenced.version > self.replica.current_version() {
                    self.receive_sequenced(sequenced, now)?;
                }
            }
            if self.replica.current_version() < version {
                self.reset_to_snapshot(content, version, now)?;
            }
        }

        let current = self.replica.current_version();
        self.buffered.retain(|v, _| *v > current);
        self.queue.restamp(current);
        self.set_status(ConnectionStatus::Online);
        self.events.push(SyncEvent::Synced { version: current });
        Ok(())
    }

    /// Jump to a snapshot the replica cannot reach through operations.
    fn reset_to_snapshot(&mut self, content: String, version: u64, now: Instant) -> SyncResult<()> {
        tracing::info!(
            "Session {} resetting to snapshot at version {}",
            self.client_id,
            version
        );
        let old_view = self.replica.content().to_string();
        let old_confirmed = self.replica.confirmed_content().to_string();
        self.replica.reset(content.clone(), version)?;

        let template = self.snapshot_template(version);
        let speculative = self.rebase_pending(old_confirmed, content, &template, version, false, now);
        self.replica.set_speculative(speculative);
        self.emit_view_delta(&old_view, &template);
        Ok(())
    }

    /// Identity carried by view deltas that have no single source operation.
    fn snapshot_template(&self, version: u64) -> Operation {
        Operation::insert(
            OpId::new(self.client_id.clone(), 0),
            self.identity.user_id.clone(),
            0,
            String::new(),
            version,
        )
    }

    // ========== Timers ==========

    /// Drive every timer: batch flush, ack timeouts, cursor throttle,
    /// heartbeats, typing expiry, presence sweep and sync timeout.
    pub fn tick(&mut self, now: Instant) {
        if self.status == ConnectionStatus::Online {
            if self.queue.should_flush(now) {
                if let Some(batch) = self.queue.flush(now) {
                    self.send(ClientMessage::OperationBatch(batch), now);
                }
            }
            if let Some(update) = self.throttle.poll(now) {
                self.send(ClientMessage::PresenceUpdate(update), now);
            }
            let heartbeat_due = self
                .last_sent_at
                .map_or(true, |at| now.duration_since(at) >= self.config.presence.heartbeat_interval());
            if heartbeat_due {
                let heartbeat = PresenceUpdate::heartbeat(self.identity.user_id.clone());
                self.send(ClientMessage::PresenceUpdate(heartbeat), now);
            }
        }

        for event in self.queue.sweep_timeouts(now) {
            match event {
                QueueEvent::Retransmit { op_ids, retry } => {
                    self.events.push(SyncEvent::Retransmit { op_ids, retry });
                }
                QueueEvent::Failed { operation, error } => {
                    self.events.push(SyncEvent::OperationFailed { operation, error });
                }
            }
        }

        let typing_expired = self
            .last_typing_at
            .is_some_and(|at| now.duration_since(at) >= self.config.presence.typing_timeout());
        if self.is_typing && typing_expired {
            self.set_typing(false, now);
        }

        if self.presence.sweep_due(now) {
            for event in self.presence.sweep(now) {
                self.events.push(SyncEvent::Presence(event));
            }
        }

        if let Some(requested_at) = self.sync_requested_at {
            if now.duration_since(requested_at) >= self.config.sync_timeout() {
                self.sync_timed_out(now);
            }
        }
    }

    fn sync_timed_out(&mut self, now: Instant) {
        self.sync_requested_at = None;
        match self.sync_kind.take() {
            Some(SyncKind::CatchUp) => {
                tracing::debug!("Catch-up sync timed out, asking again");
                let since = self.replica.current_version();
                self.request_catch_up(Some(since), now);
            }
            _ => {
                let error = SyncError::Transport("sync request timed out".to_string());
                tracing::warn!("Session {}: {}", self.client_id, error);
                self.events.push(SyncEvent::Error(error));
                self.set_status(ConnectionStatus::Offline {
                    reason: "sync timed out".to_string(),
                });
            }
        }
    }
}

/// Map a position in the text after `op` back to the text before it.
///
/// Positions inside the inserted text widen to the replaced span: `Left`
/// goes to its start, `Right` to its end.
fn unmap_position(op: &Operation, pos: usize, assoc: Assoc) -> usize {
    let inserted_end = op.position + op.content_len();
    if pos <= op.position {
        pos
    } else if pos >= inserted_end {
        pos - op.content_len() + op.length
    } else {
        match assoc {
            Assoc::Left => op.position,
            Assoc::Right => op.end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::conflict::ConflictStatus;
    use crate::resolver::ResolutionStrategy;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// View that mirrors the session by applying every delta it receives.
    #[derive(Clone, Default)]
    struct MirrorView {
        text: Arc<Mutex<String>>,
    }

    impl LocalView for MirrorView {
        fn apply_operation_to_local_view(&mut self, operation: &Operation) {
            let mut text = self.text.lock().unwrap();
            *text = operation.apply(&text).unwrap();
        }
    }

    fn make_session() -> SyncSession {
        SyncSession::new(
            DocId::from("doc"),
            ClientId::from("local"),
            Identity::new("alice", "Alice"),
            SyncConfig::default(),
        )
    }

    fn synced_session(content: &str, now: Instant) -> SyncSession {
        let mut session = make_session();
        session.begin_sync(now);
        session.handle_message(sync_response(content, 0), now);
        session.take_outbox();
        session.drain_events();
        session
    }

    fn sync_response(content: &str, version: u64) -> ServerMessage {
        ServerMessage::DocumentSyncResponse {
            content: content.to_string(),
            version,
            active_operations: Vec::new(),
            forced: false,
            rejected: Vec::new(),
        }
    }

    fn remote(version: u64, op: Operation) -> ServerMessage {
        ServerMessage::OperationBatch {
            client_id: op.id.client_id.clone(),
            operations: vec![SequencedOperation::new(version, op)],
        }
    }

    fn remote_insert(seq: u64, pos: usize, content: &str, base: u64) -> Operation {
        Operation::insert(
            OpId::new(ClientId::from("remote"), seq),
            UserId::from("bob"),
            pos,
            content,
            base,
        )
    }

    fn remote_replace(seq: u64, pos: usize, len: usize, content: &str, base: u64) -> Operation {
        Operation::replace(
            OpId::new(ClientId::from("remote"), seq),
            UserId::from("bob"),
            pos,
            len,
            content,
            base,
        )
    }

    fn flushed_batch(session: &mut SyncSession, now: Instant) -> Vec<Operation> {
        session.tick(now);
        session
            .take_outbox()
            .into_iter()
            .find_map(|message| match message {
                ClientMessage::OperationBatch(batch) => Some(batch.operations),
                _ => None,
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_edits_refused_before_sync() {
        let mut session = make_session();
        let result = session.insert(0, "x", Instant::now());
        assert_eq!(result, Err(SyncError::NotSynced));
    }

    #[test]
    fn test_initial_sync_seeds_replica_and_view() {
        let now = Instant::now();
        let view = MirrorView::default();
        let mut session = make_session().with_view(Box::new(view.clone()));

        session.begin_sync(now);
        assert_eq!(
            session.take_outbox(),
            vec![ClientMessage::DocumentSyncRequest { since_version: None }]
        );
        assert_eq!(session.status(), &ConnectionStatus::Syncing);

        session.handle_message(sync_response("hello", 7), now);
        assert_eq!(session.content(), "hello");
        assert_eq!(session.current_version(), 7);
        assert_eq!(session.status(), &ConnectionStatus::Online);
        assert_eq!(*view.text.lock().unwrap(), "hello");
        assert!(session
            .drain_events()
            .contains(&SyncEvent::Synced { version: 7 }));
    }

    #[test]
    fn test_remote_batch_before_initial_sync_waits_for_snapshot() {
        let now = Instant::now();
        let view = MirrorView::default();
        let mut session = make_session().with_view(Box::new(view.clone()));
        session.begin_sync(now);
        session.take_outbox();
        session.drain_events();

        // Sequenced before the snapshot was taken; the replica is still empty
        session.handle_message(remote(1, remote_replace(1, 2, 1, "X", 0)), now);
        assert_eq!(session.current_version(), 0);
        assert_eq!(session.confirmed_content(), "");
        assert!(!session.is_synced());
        assert!(session.take_outbox().is_empty());
        assert!(session.drain_events().is_empty());

        session.handle_message(sync_response("abX", 1), now);
        assert_eq!(session.content(), "abX");
        assert_eq!(session.current_version(), 1);
        assert_eq!(*view.text.lock().unwrap(), "abX");
        let events = session.drain_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, SyncEvent::Error(_) | SyncEvent::RemoteOperation { .. })));
    }

    #[test]
    fn test_remote_batch_newer_than_snapshot_applies_after_sync() {
        let now = Instant::now();
        let view = MirrorView::default();
        let mut session = make_session().with_view(Box::new(view.clone()));
        session.begin_sync(now);
        session.take_outbox();

        session.handle_message(remote(2, remote_insert(2, 3, "!", 1)), now);
        session.handle_message(sync_response("abX", 1), now);

        assert_eq!(session.content(), "abX!");
        assert_eq!(session.current_version(), 2);
        assert_eq!(*view.text.lock().unwrap(), "abX!");
        assert!(session.take_outbox().is_empty());
        assert_eq!(session.status(), &ConnectionStatus::Online);
    }

    #[test]
    fn test_local_edit_is_optimistic_and_batched() {
        let start = Instant::now();
        let mut session = synced_session("hello", start);

        let op = session.insert(5, " world", start).unwrap();
        assert_eq!(op.base_version, 0);
        assert_eq!(op.id, OpId::new(ClientId::from("local"), 1));
        assert_eq!(session.content(), "hello world");
        assert_eq!(session.confirmed_content(), "hello");
        assert!(session.is_typing());

        let batch = flushed_batch(&mut session, start + Duration::from_millis(150));
        assert_eq!(batch, vec![op]);
        assert_eq!(session.queue_stats().awaiting_ack, 1);
    }

    #[test]
    fn test_ack_confirms_operation() {
        let start = Instant::now();
        let mut session = synced_session("hello", start);
        let op = session.insert(0, ">", start).unwrap();
        flushed_batch(&mut session, start + Duration::from_millis(150));

        session.handle_message(
            ServerMessage::OperationAck {
                operation_id: op.id.clone(),
                server_version: 1,
            },
            start,
        );
        assert_eq!(session.confirmed_content(), ">hello");
        assert_eq!(session.current_version(), 1);
        assert!(session.queue_stats().awaiting_ack == 0);
        assert!(session.replica().has_applied(&op.id));
    }

    #[test]
    fn test_concurrent_inserts_at_same_position() {
        let start = Instant::now();
        let view = MirrorView::default();
        let mut session = make_session().with_view(Box::new(view.clone()));
        session.begin_sync(start);
        session.handle_message(sync_response("hello", 0), start);

        session.insert(5, " world", start).unwrap();
        session.handle_message(remote(1, remote_insert(1, 5, "!", 0)), start);

        assert_eq!(session.confirmed_content(), "hello!");
        assert_eq!(session.content(), "hello world!");
        assert_eq!(*view.text.lock().unwrap(), "hello world!");
        assert!(session.drain_events().iter().any(|e| matches!(
            e,
            SyncEvent::ConflictAutoResolved {
                conflict_type: ConflictType::InsertInsert,
                ..
            }
        )));

        let batch = flushed_batch(&mut session, start + Duration::from_millis(150));
        assert_eq!(batch[0].position, 5);
        assert_eq!(batch[0].base_version, 1);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let now = Instant::now();
        let mut session = synced_session("abc", now);
        let op = remote_insert(1, 3, "d", 0);

        session.handle_message(remote(1, op.clone()), now);
        session.handle_message(remote(1, op), now);

        assert_eq!(session.content(), "abcd");
        assert_eq!(session.current_version(), 1);
    }

    #[test]
    fn test_gap_is_buffered_until_filled() {
        let now = Instant::now();
        let mut session = synced_session("", now);

        session.handle_message(remote(2, remote_insert(2, 1, "b", 1)), now);
        assert_eq!(session.current_version(), 0);
        assert_eq!(
            session.take_outbox(),
            vec![ClientMessage::DocumentSyncRequest {
                since_version: Some(0)
            }]
        );

        session.handle_message(remote(1, remote_insert(1, 0, "a", 0)), now);
        assert_eq!(session.content(), "ab");
        assert_eq!(session.current_version(), 2);
    }

    #[test]
    fn test_disjoint_line_edits_merge() {
        let now = Instant::now();
        let mut session = synced_session("line1\nline2\nline3", now);

        session.replace(6, 5, "LINE2", now).unwrap();
        session.handle_message(remote(1, remote_replace(1, 12, 5, "LINE3", 0)), now);

        assert_eq!(session.content(), "line1\nLINE2\nLINE3");
        assert!(session.conflicts().is_empty());
    }

    #[test]
    fn test_manual_conflict_locks_region_until_resolved() {
        let now = Instant::now();
        let view = MirrorView::default();
        let mut session = make_session().with_view(Box::new(view.clone()));
        session.begin_sync(now);
        session.handle_message(sync_response("line1\nline2", 0), now);
        session.take_outbox();

        session.replace(6, 5, "A", now).unwrap();
        session.handle_message(remote(1, remote_replace(1, 6, 5, "B", 0)), now);

        // The local edit is withdrawn in favor of the canonical text
        assert_eq!(session.content(), "line1\nB");
        assert_eq!(*view.text.lock().unwrap(), "line1\nB");
        let conflicts = session.conflicts();
        assert_eq!(conflicts.len(), 1);
        let conflict = conflicts[0].clone();
        assert_eq!(conflict.conflict_type, ConflictType::ModifyModify);
        assert_eq!(conflict.status, ConflictStatus::Pending);
        let region = conflict.region.clone().unwrap();
        assert_eq!((region.start, region.end), (6, 7));
        assert!(region.merge_preview.contains("<<<<<<< local\nA\n=======\nB\n>>>>>>> remote"));
        assert!(session
            .take_outbox()
            .iter()
            .any(|m| matches!(m, ClientMessage::ConflictDetected { .. })));

        assert!(matches!(
            session.insert(6, "x", now),
            Err(SyncError::RegionLocked(_))
        ));
        session.insert(0, "> ", now).unwrap();

        let resolution = session
            .resolve_conflict(&conflict.id, ResolutionRequest::accept_local(), now)
            .unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::AcceptLocal);
        assert_eq!(session.content(), "> line1\nA");
        assert_eq!(*view.text.lock().unwrap(), "> line1\nA");
        assert!(session.conflicts().is_empty());
        assert!(session
            .take_outbox()
            .iter()
            .any(|m| matches!(m, ClientMessage::ConflictResolved { .. })));
    }

    #[test]
    fn test_remote_conflict_messages() {
        let now = Instant::now();
        let mut session = synced_session("line1\nline2", now);
        session.replace(6, 5, "A", now).unwrap();
        session.handle_message(remote(1, remote_replace(1, 6, 5, "B", 0)), now);
        let conflict = session.conflicts()[0].clone();

        let mut other = SyncSession::new(
            DocId::from("doc"),
            ClientId::from("other"),
            Identity::new("carol", "Carol"),
            SyncConfig::default(),
        );
        other.begin_sync(now);
        other.handle_message(sync_response("line1\nB", 1), now);
        other.handle_message(
            ServerMessage::ConflictDetected {
                conflict: conflict.clone(),
            },
            now,
        );
        assert_eq!(other.conflicts().len(), 1);
        assert!(matches!(other.insert(6, "x", now), Err(SyncError::RegionLocked(_))));

        let resolution = session
            .resolve_conflict(&conflict.id, ResolutionRequest::accept_remote(), now)
            .unwrap();
        other.handle_message(
            ServerMessage::ConflictResolved {
                conflict_id: conflict.id.clone(),
                resolution,
            },
            now,
        );
        assert!(other.conflicts().is_empty());
        // Resolving a second time is harmless
        assert!(matches!(
            session.resolve_conflict(&conflict.id, ResolutionRequest::accept_local(), now),
            Err(SyncError::ConflictNotFound(_))
        ));
    }

    #[test]
    fn test_retry_exhaustion_keeps_edit_visible() {
        let start = Instant::now();
        let config = SyncConfig::default().with_queue(
            QueueConfig::default()
                .with_ack_timeout(Duration::from_secs(1))
                .with_max_retries(3),
        );
        let mut session = SyncSession::new(
            DocId::from("doc"),
            ClientId::from("local"),
            Identity::new("alice", "Alice"),
            config,
        );
        session.begin_sync(start);
        session.handle_message(sync_response("hello", 0), start);
        session.insert(5, "!", start).unwrap();

        let mut failed = None;
        let mut now = start;
        for _ in 0..40 {
            now += Duration::from_millis(250);
            session.tick(now);
            for event in session.drain_events() {
                if let SyncEvent::OperationFailed { error, .. } = event {
                    failed = Some(error);
                }
            }
        }

        assert!(matches!(
            failed,
            Some(SyncError::OperationRetryExhausted { attempts: 4, .. })
        ));
        assert_eq!(session.content(), "hello!");
        assert_eq!(session.queue_stats().failed, 1);

        // Abandoning reports only the edit that was not already failed
        let pending = session.insert(6, "?", now).unwrap();
        assert_eq!(session.abandon_unacknowledged(), 2);
        let events = session.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SyncEvent::OperationFailed {
                operation,
                error: SyncError::SessionClosed,
            } if operation.id == pending.id
        ));
        let stats = session.queue_stats();
        assert_eq!((stats.pending, stats.awaiting_ack, stats.failed), (0, 0, 0));
        assert_eq!(session.content(), "hello!?");
    }

    #[test]
    fn test_presence_from_remote_users() {
        let now = Instant::now();
        let mut session = synced_session("hello world", now);
        session.handle_message(
            ServerMessage::UserJoined {
                user_id: UserId::from("bob"),
                user_name: "Bob".into(),
                color: "#E91E63".into(),
            },
            now,
        );
        session.handle_message(
            ServerMessage::PresenceUpdate(PresenceUpdate {
                user_id: UserId::from("bob"),
                cursor: Some(6),
                is_typing: Some(true),
                ..PresenceUpdate::default()
            }),
            now,
        );
        assert_eq!(session.typing_users(), vec![UserId::from("bob")]);

        // Remote cursors follow remote edits before them
        session.handle_message(remote(1, remote_insert(1, 0, ">> ", 0)), now);
        assert_eq!(session.remote_cursors()[0].position, 9);

        let events = session.drain_events();
        assert!(events.contains(&SyncEvent::Presence(PresenceEvent::Joined {
            user_id: UserId::from("bob")
        })));
        assert!(events.contains(&SyncEvent::Presence(PresenceEvent::TypingStarted {
            user_id: UserId::from("bob")
        })));

        session.handle_message(
            ServerMessage::UserLeft {
                user_id: UserId::from("bob"),
            },
            now,
        );
        assert!(session.remote_cursors().is_empty());
    }

    #[test]
    fn test_cursor_updates_are_throttled() {
        let start = Instant::now();
        let mut session = synced_session("hello", start);

        session.set_cursor(1, start);
        session.set_cursor(2, start + Duration::from_millis(10));
        session.set_cursor(3, start + Duration::from_millis(20));
        let sent: Vec<ClientMessage> = session.take_outbox();
        assert_eq!(sent.len(), 1);

        session.tick(start + Duration::from_millis(120));
        let cursors: Vec<Option<usize>> = session
            .take_outbox()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::PresenceUpdate(update) => Some(update.cursor),
                _ => None,
            })
            .collect();
        assert_eq!(cursors, vec![Some(3)]);
    }

    #[test]
    fn test_typing_stops_after_timeout() {
        let start = Instant::now();
        let mut session = synced_session("", start);
        session.insert(0, "a", start).unwrap();
        assert!(session.is_typing());
        session.take_outbox();

        session.tick(start + Duration::from_secs(9));
        assert!(!session.is_typing());
        assert!(session.take_outbox().iter().any(|m| matches!(
            m,
            ClientMessage::PresenceUpdate(PresenceUpdate {
                is_typing: Some(false),
                ..
            })
        )));
    }

    #[test]
    fn test_transport_loss_and_catch_up() {
        let start = Instant::now();
        let mut session = synced_session("abc", start);
        session.insert(3, "d", start).unwrap();
        flushed_batch(&mut session, start + Duration::from_millis(150));

        session.transport_lost("socket closed");
        assert!(matches!(session.status(), ConnectionStatus::Offline { .. }));
        assert_eq!(session.queue_stats().pending, 1);
        assert_eq!(session.content(), "abcd");

        session.connected(start + Duration::from_secs(1));
        assert_eq!(
            session.take_outbox(),
            vec![ClientMessage::DocumentSyncRequest {
                since_version: Some(0)
            }]
        );

        session.handle_message(
            ServerMessage::DocumentSyncResponse {
                content: ">abc".into(),
                version: 1,
                active_operations: vec![SequencedOperation::new(1, remote_insert(1, 0, ">", 0))],
                forced: false,
                rejected: Vec::new(),
            },
            start + Duration::from_secs(1),
        );
        assert_eq!(session.status(), &ConnectionStatus::Online);
        assert_eq!(session.content(), ">abcd");

        let batch = flushed_batch(&mut session, start + Duration::from_secs(2));
        assert_eq!(batch[0].position, 4);
        assert_eq!(batch[0].base_version, 1);
    }

    #[test]
    fn test_truncated_history_resets_and_rebases() {
        let start = Instant::now();
        let mut session = synced_session("abc", start);
        session.insert(3, "!", start).unwrap();
        session.transport_lost("gone");
        session.connected(start);
        session.take_outbox();

        session.handle_message(sync_response("xxabc", 5), start);
        assert_eq!(session.current_version(), 5);
        assert_eq!(session.confirmed_content(), "xxabc");
        assert_eq!(session.content(), "xxabc!");
    }

    #[test]
    fn test_forced_sync_resends_rejected_operations() {
        let start = Instant::now();
        let mut session = synced_session("hello", start);
        let op = session.insert(0, "A", start).unwrap();
        flushed_batch(&mut session, start + Duration::from_millis(150));

        // Sequenced ahead of ours
        session.handle_message(remote(1, remote_insert(1, 5, "!", 0)), start);
        session.handle_message(
            ServerMessage::DocumentSyncResponse {
                content: "hello!".into(),
                version: 1,
                active_operations: vec![SequencedOperation::new(1, remote_insert(1, 5, "!", 0))],
                forced: true,
                rejected: vec![op.id.clone()],
            },
            start,
        );

        assert_eq!(session.content(), "Ahello!");
        let batch = flushed_batch(&mut session, start + Duration::from_millis(300));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, op.id);
        assert_eq!(batch[0].base_version, 1);
    }

    #[test]
    fn test_initial_sync_timeout_goes_offline() {
        let start = Instant::now();
        let mut session = make_session();
        session.begin_sync(start);
        session.tick(start + Duration::from_secs(11));

        assert!(matches!(session.status(), ConnectionStatus::Offline { .. }));
        assert!(session
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::Error(SyncError::Transport(_)))));

        session.retry_sync(start + Duration::from_secs(12));
        assert_eq!(session.status(), &ConnectionStatus::Syncing);
    }

    #[test]
    fn test_unmap_position() {
        let op = Operation::replace(
            OpId::new(ClientId::from("c"), 1),
            UserId::from("u"),
            2,
            3,
            "XY",
            0,
        );
        assert_eq!(unmap_position(&op, 1, Assoc::Left), 1);
        assert_eq!(unmap_position(&op, 3, Assoc::Left), 2);
        assert_eq!(unmap_position(&op, 3, Assoc::Right), 5);
        assert_eq!(unmap_position(&op, 6, Assoc::Left), 7);
    }
}
