//! Real-time collaborative editing synchronization.
//!
//! Several clients edit one plain-text document. Each client applies its
//! edits locally at once, ships them to a per-document channel that assigns
//! the canonical order, and folds in everyone else's edits as they arrive.
//! Conflicting concurrent edits are merged automatically where a fixed
//! policy applies and handed to the users otherwise.
//!
//! # Modules
//!
//! - `operation`: Text edits, their positions and how they move past each other
//! - `replica`: Confirmed and speculative copies of the document
//! - `queue`: Outgoing operations, batching, acknowledgment and retry
//! - `conflict`: Detection and classification of conflicting edits
//! - `merge`: Line-based three-way merge with conflict markers
//! - `resolver`: Automatic and manual conflict resolution
//! - `presence`: Remote cursors, selections and typing indicators
//! - `session`: The per-session synchronization state machine
//! - `manager`: Task that drives a session over a transport
//! - `channel`: The per-document sequencer
//! - `registry`: Live channels, one task per document
//! - `transport`: Connection seam between sessions and channels
//! - `message`: JSON wire messages
//! - `store`: Document persistence
//!
//! # Example
//!
//! ```
//! use collab_sync::{ClientId, DocId, Identity, ServerMessage, SyncConfig, SyncSession};
//! use tokio::time::Instant;
//!
//! let mut session = SyncSession::new(
//!     DocId::from("notes"),
//!     ClientId::from("c1"),
//!     Identity::new("alice", "Alice"),
//!     SyncConfig::default(),
//! );
//!
//! let now = Instant::now();
//! session.begin_sync(now);
//! session.handle_message(
//!     ServerMessage::DocumentSyncResponse {
//!         content: "hello".into(),
//!         version: 0,
//!         active_operations: Vec::new(),
//!         forced: false,
//!         rejected: Vec::new(),
//!     },
//!     now,
//! );
//!
//! session.insert(5, " world", now).unwrap();
//! assert_eq!(session.content(), "hello world");
//! assert_eq!(session.confirmed_content(), "hello");
//! ```

pub mod channel;
pub mod config;
pub mod conflict;
pub mod error;
pub mod ids;
pub mod manager;
pub mod merge;
pub mod message;
pub mod operation;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod replica;
pub mod resolver;
pub mod session;
pub mod store;
pub mod transport;

/// WebSocket server and connector.
///
/// This module is only available when the `server` feature is enabled.
#[cfg(feature = "server")]
pub mod websocket;

// Re-export commonly used types
pub use channel::{ChannelStats, DocumentChannel};
pub use config::{ChannelConfig, PresenceConfig, QueueConfig, SyncConfig};
pub use conflict::{Conflict, ConflictRegion, ConflictSeverity, ConflictStatus, ConflictType};
pub use error::{SyncError, SyncResult};
pub use ids::{ClientId, DocId, Identity, OpId, UserId};
pub use manager::SessionHandle;
pub use merge::{three_way_merge, MergeResult};
pub use message::{ClientMessage, ServerMessage};
pub use operation::{OpKind, Operation, SequencedOperation};
pub use presence::{PresenceEvent, PresenceUpdate, RemoteCursor, SelectionRange};
pub use queue::{OperationBatch, OperationQueue, QueueStats};
pub use registry::{ChannelRegistry, ChannelSender};
pub use replica::DocumentReplica;
pub use resolver::{ConflictResolver, Resolution, ResolutionRequest, ResolutionStrategy};
pub use session::{ConnectionStatus, LocalView, SessionSnapshot, SyncEvent, SyncSession};
pub use store::{DocumentStore, FileDocumentStore, MemoryDocumentStore, StoreError, StoredDocument};
pub use transport::{Connector, LocalConnector, Transport, TransportLink};

#[cfg(feature = "server")]
pub use websocket::{ServerConfig, ServerError, ShutdownHandle, SyncServer, WebSocketConnector};
