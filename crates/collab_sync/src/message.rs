//! Wire messages exchanged between sessions and document channels.
//!
//! Every message is a JSON object tagged by a snake_case `type` field, with
//! camelCase payload fields.

use crate::conflict::Conflict;
use crate::ids::{ClientId, DocId, OpId, UserId};
use crate::operation::SequencedOperation;
use crate::presence::PresenceUpdate;
use crate::queue::OperationBatch;
use crate::resolver::Resolution;
use serde::{Deserialize, Serialize};

/// Messages sent from a session to its document channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a document channel.
    #[serde(rename_all = "camelCase")]
    Join {
        document_id: DocId,
        client_id: ClientId,
        user_id: UserId,
        user_name: String,
    },

    /// Unsubscribe from the channel.
    Leave,

    /// Locally-authored operations, in enqueue order.
    OperationBatch(OperationBatch),

    /// Cursor, selection or typing change; an empty update is a heartbeat.
    PresenceUpdate(PresenceUpdate),

    /// A conflict this session routed to manual resolution.
    ConflictDetected { conflict: Conflict },

    /// The outcome of a manual resolution.
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: String,
        resolution: Resolution,
    },

    /// Ask for the document state; `None` requests a full snapshot.
    #[serde(rename_all = "camelCase")]
    DocumentSyncRequest { since_version: Option<u64> },
}

/// Messages sent from a document channel to its sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Operations accepted from another session, with their versions.
    #[serde(rename_all = "camelCase")]
    OperationBatch {
        operations: Vec<SequencedOperation>,
        client_id: ClientId,
    },

    /// One of this session's operations was accepted.
    #[serde(rename_all = "camelCase")]
    OperationAck {
        operation_id: OpId,
        server_version: u64,
    },

    /// Presence change from another user.
    PresenceUpdate(PresenceUpdate),

    /// A user subscribed.
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: UserId,
        user_name: String,
        color: String,
    },

    /// A user unsubscribed or went silent.
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: UserId },

    /// A conflict raised by another session.
    ConflictDetected { conflict: Conflict },

    /// A conflict settled by another session.
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: String,
        resolution: Resolution,
    },

    /// Document state.
    ///
    /// `active_operations` are the canonical operations after the requested
    /// version when the channel still has them. `forced` responses answer a
    /// stale batch and list the operations that were `rejected`.
    #[serde(rename_all = "camelCase")]
    DocumentSyncResponse {
        content: String,
        version: u64,
        active_operations: Vec<SequencedOperation>,
        #[serde(default)]
        forced: bool,
        #[serde(default)]
        rejected: Vec<OpId>,
    },

    /// Error message.
    Error { code: String, message: String },
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The message type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::OperationBatch(_) => "operation_batch",
            ClientMessage::PresenceUpdate(_) => "presence_update",
            ClientMessage::ConflictDetected { .. } => "conflict_detected",
            ClientMessage::ConflictResolved { .. } => "conflict_resolved",
            ClientMessage::DocumentSyncRequest { .. } => "document_sync_request",
        }
    }
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
