//! Server-authoritative document channel.
//!
//! A [`DocumentChannel`] owns the canonical content and version of one
//! document and every session subscribed to it. Operations are sequenced
//! with a compare-and-set rule: an operation is accepted when every
//! operation logged after its `base_version` came from the same session, so
//! the author already had them in view. Anything else is stale; the author
//! gets a forced sync response and rebases locally.
//!
//! The channel does not transform operations and never blocks: it is driven
//! by the per-document task in [`crate::registry`] and talks to subscribers
//! through unbounded senders.

use crate::config::ChannelConfig;
use crate::conflict::Conflict;
use crate::error::{SyncError, SyncResult};
use crate::ids::{ClientId, DocId, OpId, UserId};
use crate::message::{ClientMessage, ServerMessage};
use crate::operation::{Operation, SequencedOperation};
use crate::presence::ColorAssigner;
use crate::queue::OperationBatch;
use crate::store::StoredDocument;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A connected session.
struct Subscriber {
    user_id: UserId,
    user_name: String,
    color: String,
    sender: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Instant,
    /// Distinguishes a resubscription from the connection it replaced.
    token: u64,
}

/// Statistics about a document channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub document_id: DocId,
    pub version: u64,
    pub subscribers: usize,
    pub accepted_operations: u64,
    pub rejected_operations: u64,
    pub open_conflicts: usize,
    pub dirty: bool,
}

/// Canonical state and subscribers of one document.
pub struct DocumentChannel {
    document_id: DocId,
    content: String,
    version: u64,
    /// Most recent accepted operations, oldest first
    log: VecDeque<SequencedOperation>,
    /// Versions of the operations still in the log
    accepted: HashMap<OpId, u64>,
    /// Highest accepted sequence number per session
    client_seqs: HashMap<ClientId, u64>,
    subscribers: HashMap<ClientId, Subscriber>,
    colors: ColorAssigner,
    /// Manual conflicts not yet resolved, replayed to late joiners
    open_conflicts: HashMap<String, Conflict>,
    config: ChannelConfig,
    saved_version: u64,
    accepted_count: u64,
    rejected_count: u64,
    next_token: u64,
}

impl DocumentChannel {
    /// Create a channel seeded from a stored document.
    pub fn new(document_id: DocId, document: StoredDocument, config: ChannelConfig) -> Self {
        Self {
            document_id,
            content: document.content,
            version: document.version,
            log: VecDeque::new(),
            accepted: HashMap::new(),
            client_seqs: HashMap::new(),
            subscribers: HashMap::new(),
            colors: ColorAssigner::new(config.colors.clone()),
            open_conflicts: HashMap::new(),
            saved_version: document.version,
            config,
            accepted_count: 0,
            rejected_count: 0,
            next_token: 0,
        }
    }

    /// Create a channel for a document that was never saved.
    pub fn empty(document_id: DocId, config: ChannelConfig) -> Self {
        Self::new(document_id, StoredDocument::new("", 0), config)
    }

    pub fn document_id(&self) -> &DocId {
        &self.document_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn is_subscribed(&self, client_id: &ClientId) -> bool {
        self.subscribers.contains_key(client_id)
    }

    /// Whether the canonical content changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.version != self.saved_version
    }

    pub fn snapshot(&self) -> StoredDocument {
        StoredDocument::new(self.content.clone(), self.version)
    }

    pub fn mark_saved(&mut self, version: u64) {
        self.saved_version = self.saved_version.max(version);
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            document_id: self.document_id.clone(),
            version: self.version,
            subscribers: self.subscribers.len(),
            accepted_operations: self.accepted_count,
            rejected_operations: self.rejected_count,
            open_conflicts: self.open_conflicts.len(),
            dirty: self.is_dirty(),
        }
    }

    // ========== Subscribers ==========

    /// Subscribe a session. Returns a token identifying this subscription.
    ///
    /// A session that subscribes again replaces its previous connection.
    pub fn subscribe(
        &mut self,
        client_id: ClientId,
        user_id: UserId,
        user_name: String,
        sender: mpsc::UnboundedSender<ServerMessage>,
        now: Instant,
    ) -> SyncResult<u64> {
        if !self.subscribers.contains_key(&client_id)
            && self.subscribers.len() >= self.config.max_subscribers
        {
            return Err(SyncError::Transport(format!(
                "document {} is full (max: {})",
                self.document_id, self.config.max_subscribers
            )));
        }

        let color = self.colors.assign(&user_id);
        let user_present = self.user_present(&user_id, Some(&client_id));

        // Tell the newcomer who is already here
        let mut announced: Vec<&UserId> = Vec::new();
        for (id, other) in &self.subscribers {
            if id == &client_id || other.user_id == user_id || announced.contains(&&other.user_id) {
                continue;
            }
            announced.push(&other.user_id);
            let _ = sender.send(ServerMessage::UserJoined {
                user_id: other.user_id.clone(),
                user_name: other.user_name.clone(),
                color: other.color.clone(),
            });
        }
        for conflict in self.open_conflicts.values() {
            let _ = sender.send(ServerMessage::ConflictDetected {
                conflict: conflict.clone(),
            });
        }

        let token = self.next_token;
        self.next_token += 1;
        self.subscribers.insert(
            client_id.clone(),
            Subscriber {
                user_id: user_id.clone(),
                user_name: user_name.clone(),
                color: color.clone(),
                sender,
                last_seen: now,
                token,
            },
        );

        if !user_present {
            self.broadcast_to_others(
                &client_id,
                ServerMessage::UserJoined {
                    user_id: user_id.clone(),
                    user_name,
                    color,
                },
            );
        }
        tracing::info!(
            "Session {} ({}) joined {} at version {}",
            client_id,
            user_id,
            self.document_id,
            self.version
        );
        Ok(token)
    }

    /// Remove a session. With a token, only that exact subscription is
    /// removed.
    pub fn unsubscribe(&mut self, client_id: &ClientId, token: Option<u64>) -> bool {
        match self.subscribers.get(client_id) {
            Some(subscriber) if token.map_or(true, |t| t == subscriber.token) => {}
            _ => return false,
        }
        let Some(subscriber) = self.subscribers.remove(client_id) else {
            return false;
        };

        if !self.user_present(&subscriber.user_id, None) {
            self.broadcast_to_all(ServerMessage::UserLeft {
                user_id: subscriber.user_id.clone(),
            });
        }
        tracing::info!(
            "Session {} ({}) left {}",
            client_id,
            subscriber.user_id,
            self.document_id
        );
        true
    }

    /// Drop subscribers that went silent or whose connection is gone.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientId> {
        let timeout = self.config.subscriber_timeout();
        let mut stale: Vec<ClientId> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.sender.is_closed() || now.duration_since(s.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();

        for client_id in &stale {
            tracing::debug!("Dropping silent session {} from {}", client_id, self.document_id);
            self.unsubscribe(client_id, None);
        }
        stale
    }

    fn user_present(&self, user_id: &UserId, except: Option<&ClientId>) -> bool {
        self.subscribers
            .iter()
            .any(|(id, s)| &s.user_id == user_id && Some(id) != except)
    }

    // ========== Message Handling ==========

    /// Handle a message from a subscribed session.
    pub fn handle(&mut self, client_id: &ClientId, message: ClientMessage, now: Instant) {
        let Some(subscriber) = self.subscribers.get_mut(client_id) else {
            tracing::debug!(
                "Ignoring {} from unsubscribed session {}",
                message.kind(),
                client_id
            );
            return;
        };
        subscriber.last_seen = now;
        let user_id = subscriber.user_id.clone();

        match message {
            ClientMessage::Join { .. } => {
                self.send(
                    client_id,
                    ServerMessage::error("already_joined", "session is already subscribed"),
                );
            }
            ClientMessage::Leave => {
                self.unsubscribe(client_id, None);
            }
            ClientMessage::OperationBatch(batch) => {
                if &batch.client_id != client_id {
                    self.send(
                        client_id,
                        ServerMessage::error(
                            "client_mismatch",
                            format!("batch from {} sent on {}", batch.client_id, client_id),
                        ),
                    );
                    return;
                }
                self.apply_batch(client_id, batch);
            }
            ClientMessage::PresenceUpdate(mut update) => {
                update.user_id = user_id;
                self.broadcast_to_others(client_id, ServerMessage::PresenceUpdate(update));
            }
            ClientMessage::ConflictDetected { conflict } => {
                tracing::info!(
                    "Conflict {} ({:?}) raised in {}",
                    conflict.id,
                    conflict.conflict_type,
                    self.document_id
                );
                self.open_conflicts
                    .entry(conflict.id.clone())
                    .or_insert_with(|| conflict.clone());
                self.broadcast_to_others(client_id, ServerMessage::ConflictDetected { conflict });
            }
            ClientMessage::ConflictResolved {
                conflict_id,
                resolution,
            } => {
                self.open_conflicts.remove(&conflict_id);
                self.broadcast_to_others(
                    client_id,
                    ServerMessage::ConflictResolved {
                        conflict_id,
                        resolution,
                    },
                );
            }
            ClientMessage::DocumentSyncRequest { since_version } => {
                let response = self.sync_response(since_version, false, Vec::new());
                self.send(client_id, response);
            }
        }
    }

    /// Sequence a batch. Accepted operations are acknowledged to the author
    /// and broadcast to everyone else; once one operation is refused, the
    /// rest of the batch is refused with it.
    pub fn apply_batch(&mut self, client_id: &ClientId, batch: OperationBatch) {
        let mut sequenced = Vec::new();
        let mut rejected: Vec<OpId> = Vec::new();
        let mut oldest_base: Option<u64> = None;

        for op in batch.operations {
            if !rejected.is_empty() {
                oldest_base = Some(oldest_base.map_or(op.base_version, |b| b.min(op.base_version)));
                rejected.push(op.id);
                continue;
            }

            if let Some(version) = self.duplicate_version(&op.id) {
                tracing::debug!("Re-acknowledging duplicate {} at {}", op.id, version);
                self.send(
                    client_id,
                    ServerMessage::OperationAck {
                        operation_id: op.id,
                        server_version: version,
                    },
                );
                continue;
            }

            match self.accept(&op) {
                Ok(version) => {
                    self.send(
                        client_id,
                        ServerMessage::OperationAck {
                            operation_id: op.id.clone(),
                            server_version: version,
                        },
                    );
                    sequenced.push(SequencedOperation::new(version, op));
                }
                Err(e) => {
                    tracing::debug!("Rejecting {} in {}: {}", op.id, self.document_id, e);
                    oldest_base = Some(op.base_version);
                    rejected.push(op.id);
                }
            }
        }

        if !sequenced.is_empty() {
            self.broadcast_to_others(
                client_id,
                ServerMessage::OperationBatch {
                    operations: sequenced,
                    client_id: client_id.clone(),
                },
            );
        }

        if !rejected.is_empty() {
            self.rejected_count += rejected.len() as u64;
            tracing::info!(
                "Forcing resync of {} in {}: {} operations rejected",
                client_id,
                self.document_id,
                rejected.len()
            );
            let response = self.sync_response(oldest_base, true, rejected);
            self.send(client_id, response);
        }
    }

    /// Version an already accepted operation was sequenced at.
    ///
    /// Operations that fell out of the log are reported at the start of the
    /// log window, meaning "at or before".
    fn duplicate_version(&self, op_id: &OpId) -> Option<u64> {
        if let Some(&version) = self.accepted.get(op_id) {
            return Some(version);
        }
        match self.client_seqs.get(&op_id.client_id) {
            Some(&seq) if op_id.seq <= seq => Some(self.window_start()),
            _ => None,
        }
    }

    /// Oldest version the log can replay from.
    fn window_start(&self) -> u64 {
        self.version - self.log.len() as u64
    }

    fn accept(&mut self, op: &Operation) -> SyncResult<u64> {
        op.validate()?;
        if op.base_version > self.version {
            return Err(SyncError::InvalidOperation(format!(
                "{} declares base version {} but {} is at {}",
                op.id, op.base_version, self.document_id, self.version
            )));
        }
        let stale = op.base_version < self.window_start()
            || self
                .log
                .iter()
                .filter(|s| s.version > op.base_version)
                .any(|s| s.operation.id.client_id != op.id.client_id);
        if stale {
            return Err(SyncError::StaleVersion {
                base_version: op.base_version,
                current_version: self.version,
            });
        }

        self.content = op.apply(&self.content)?;
        self.version += 1;
        self.accepted_count += 1;
        self.accepted.insert(op.id.clone(), self.version);
        let seq = self.client_seqs.entry(op.id.client_id.clone()).or_insert(0);
        *seq = (*seq).max(op.id.seq);

        self.log
            .push_back(SequencedOperation::new(self.version, op.clone()));
        while self.log.len() > self.config.log_capacity {
            if let Some(old) = self.log.pop_front() {
                self.accepted.remove(&old.operation.id);
            }
        }
        Ok(self.version)
    }

    /// Logged operations after `version`, or `None` once the log no longer
    /// reaches back that far.
    pub fn operations_since(&self, version: u64) -> Option<Vec<SequencedOperation>> {
        if version >= self.version {
            return Some(Vec::new());
        }
        if version < self.window_start() {
            return None;
        }
        Some(
            self.log
                .iter()
                .filter(|s| s.version > version)
                .cloned()
                .collect(),
        )
    }

    fn sync_response(
        &self,
        since_version: Option<u64>,
        forced: bool,
        rejected: Vec<OpId>,
    ) -> ServerMessage {
        let active_operations = since_version
            .and_then(|v| self.operations_since(v))
            .unwrap_or_default();
        ServerMessage::DocumentSyncResponse {
            content: self.content.clone(),
            version: self.version,
            active_operations,
            forced,
            rejected,
        }
    }

    // ========== Delivery ==========

    fn send(&self, client_id: &ClientId, message: ServerMessage) {
        if let Some(subscriber) = self.subscribers.get(client_id) {
            if subscriber.sender.send(message).is_err() {
                tracing::debug!("Session {} is gone, message dropped", client_id);
            }
        }
    }

    fn broadcast_to_others(&self, origin: &ClientId, message: ServerMessage) {
        for (id, subscriber) in &self.subscribers {
            if id != origin {
                let _ = subscriber.sender.send(message.clone());
            }
        }
    }

    fn broadcast_to_all(&self, message: ServerMessage) {
        for subscriber in self.subscribers.values() {
            let _ = subscriber.sender.send(message.clone());
        }
    }
}
