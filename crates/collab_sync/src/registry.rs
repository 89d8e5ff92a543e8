//! Registry of live document channels.
//!
//! The registry is an explicit object shared by whatever needs to reach a
//! document's channel. A channel is created on the first subscribe (seeded
//! from the [`DocumentStore`]) and torn down once its last subscriber leaves,
//! saving the canonical content on the way out.
//!
//! Each channel runs in its own task, so documents are sequenced
//! independently and in parallel. Subscribers interact with it only through
//! commands on an unbounded queue.

use crate::channel::{ChannelStats, DocumentChannel};
use crate::config::ChannelConfig;
use crate::error::{SyncError, SyncResult};
use crate::ids::{ClientId, DocId, Identity, UserId};
use crate::message::{ClientMessage, ServerMessage};
use crate::store::{DocumentStore, StoredDocument};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

/// Commands processed by a channel task.
enum ChannelCommand {
    Subscribe {
        client_id: ClientId,
        user_id: UserId,
        user_name: String,
        sender: mpsc::UnboundedSender<ServerMessage>,
        reply: oneshot::Sender<SyncResult<u64>>,
    },
    Message {
        client_id: ClientId,
        message: ClientMessage,
    },
    /// The connection behind a subscription went away.
    Disconnect { client_id: ClientId, token: u64 },
    Stats {
        reply: oneshot::Sender<ChannelStats>,
    },
    Snapshot {
        reply: oneshot::Sender<StoredDocument>,
    },
    /// Save and stop. Unless forced, only an empty channel stops; the reply
    /// says whether it did.
    Close {
        force: bool,
        reply: oneshot::Sender<bool>,
    },
}

struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

/// Sending half of a channel subscription.
///
/// Dropping it unsubscribes the session.
pub struct ChannelSender {
    doc_id: DocId,
    client_id: ClientId,
    token: u64,
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelSender {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}

impl Transport for ChannelSender {
    fn send(&self, message: ClientMessage) -> SyncResult<()> {
        self.commands
            .send(ChannelCommand::Message {
                client_id: self.client_id.clone(),
                message,
            })
            .map_err(|_| channel_closed(&self.doc_id))
    }
}

impl Drop for ChannelSender {
    fn drop(&mut self) {
        let _ = self.commands.send(ChannelCommand::Disconnect {
            client_id: self.client_id.clone(),
            token: self.token,
        });
    }
}

fn channel_closed(doc_id: &DocId) -> SyncError {
    SyncError::Transport(format!("channel for {} is closed", doc_id))
}

/// Live document channels, keyed by document id.
pub struct ChannelRegistry<S: DocumentStore + 'static> {
    store: Arc<S>,
    config: ChannelConfig,
    channels: Mutex<HashMap<DocId, ChannelHandle>>,
    /// Channel tasks report here when they lose their last subscriber
    idle_tx: mpsc::UnboundedSender<DocId>,
}

impl<S: DocumentStore + 'static> ChannelRegistry<S> {
    /// Create a registry and start its idle-channel reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<S>, config: ChannelConfig) -> Arc<Self> {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<DocId>();
        let registry = Arc::new(Self {
            store,
            config,
            channels: Mutex::new(HashMap::new()),
            idle_tx,
        });

        let weak: Weak<Self> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(doc_id) = idle_rx.recv().await {
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.teardown_if_empty(&doc_id).await;
            }
        });
        registry
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Subscribe a session to a document, opening its channel if needed.
    pub async fn subscribe(
        &self,
        doc_id: &DocId,
        client_id: ClientId,
        identity: &Identity,
    ) -> SyncResult<(ChannelSender, mpsc::UnboundedReceiver<ServerMessage>)> {
        let mut channels = self.channels.lock().await;
        let commands = match channels.get(doc_id) {
            Some(handle) if !handle.commands.is_closed() => handle.commands.clone(),
            _ => {
                let handle = self.open(doc_id).await?;
                let commands = handle.commands.clone();
                channels.insert(doc_id.clone(), handle);
                commands
            }
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(ChannelCommand::Subscribe {
                client_id: client_id.clone(),
                user_id: identity.user_id.clone(),
                user_name: identity.user_name.clone(),
                sender,
                reply: reply_tx,
            })
            .map_err(|_| channel_closed(doc_id))?;
        let token = reply_rx.await.map_err(|_| channel_closed(doc_id))??;

        Ok((
            ChannelSender {
                doc_id: doc_id.clone(),
                client_id,
                token,
                commands,
            },
            receiver,
        ))
    }

    /// Unsubscribe a session and tear the channel down if it was the last.
    pub async fn unsubscribe(&self, doc_id: &DocId, client_id: &ClientId) -> SyncResult<()> {
        {
            let channels = self.channels.lock().await;
            let handle = channels
                .get(doc_id)
                .ok_or_else(|| SyncError::NotSubscribed(doc_id.clone()))?;
            handle
                .commands
                .send(ChannelCommand::Message {
                    client_id: client_id.clone(),
                    message: ClientMessage::Leave,
                })
                .map_err(|_| channel_closed(doc_id))?;
        }
        self.teardown_if_empty(doc_id).await;
        Ok(())
    }

    async fn open(&self, doc_id: &DocId) -> SyncResult<ChannelHandle> {
        let document = match self.store.load(doc_id).await? {
            Some(document) => {
                tracing::info!("Loaded {} at version {}", doc_id, document.version);
                document
            }
            None => {
                tracing::info!("Creating new document {}", doc_id);
                StoredDocument::new("", 0)
            }
        };

        let channel = DocumentChannel::new(doc_id.clone(), document, self.config.clone());
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(
            channel,
            Arc::clone(&self.store),
            receiver,
            self.idle_tx.clone(),
        ));
        Ok(ChannelHandle { commands })
    }

    /// Stop a channel with no subscribers. Returns whether it was removed.
    pub async fn teardown_if_empty(&self, doc_id: &DocId) -> bool {
        let mut channels = self.channels.lock().await;
        let Some(handle) = channels.get(doc_id) else {
            return false;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let closed = match handle.commands.send(ChannelCommand::Close {
            force: false,
            reply: reply_tx,
        }) {
            Ok(()) => reply_rx.await.unwrap_or(true),
            Err(_) => true,
        };
        if closed {
            channels.remove(doc_id);
            tracing::info!("Channel for {} torn down", doc_id);
        }
        closed
    }

    /// Number of open channels.
    pub async fn document_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_open(&self, doc_id: &DocId) -> bool {
        self.channels.lock().await.contains_key(doc_id)
    }

    /// Statistics for an open channel.
    pub async fn stats(&self, doc_id: &DocId) -> Option<ChannelStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(doc_id, ChannelCommand::Stats { reply: reply_tx })
            .await?;
        reply_rx.await.ok()
    }

    /// Canonical content of an open channel.
    pub async fn document_snapshot(&self, doc_id: &DocId) -> Option<StoredDocument> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(doc_id, ChannelCommand::Snapshot { reply: reply_tx })
            .await?;
        reply_rx.await.ok()
    }

    async fn command(&self, doc_id: &DocId, command: ChannelCommand) -> Option<()> {
        let channels = self.channels.lock().await;
        channels.get(doc_id)?.commands.send(command).ok()
    }

    /// Save and stop every channel.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(DocId, ChannelHandle)> = self.channels.lock().await.drain().collect();
        for (doc_id, handle) in handles {
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle
                .commands
                .send(ChannelCommand::Close {
                    force: true,
                    reply: reply_tx,
                })
                .is_ok()
            {
                let _ = reply_rx.await;
            }
            tracing::debug!("Channel for {} stopped", doc_id);
        }
    }
}

/// Save the channel if it changed since the last save.
async fn persist<S: DocumentStore>(channel: &mut DocumentChannel, store: &S) {
    if !channel.is_dirty() {
        return;
    }
    let snapshot = channel.snapshot();
    match store.save(channel.document_id(), &snapshot).await {
        Ok(()) => {
            tracing::debug!(
                "Saved {} at version {}",
                channel.document_id(),
                snapshot.version
            );
            channel.mark_saved(snapshot.version);
        }
        Err(e) => {
            tracing::error!("Failed to save {}: {}", channel.document_id(), e);
        }
    }
}

async fn run_channel<S: DocumentStore>(
    mut channel: DocumentChannel,
    store: Arc<S>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    idle_tx: mpsc::UnboundedSender<DocId>,
) {
    let config = channel.config().clone();
    let mut sweep = tokio::time::interval_at(
        Instant::now() + config.sweep_interval(),
        config.sweep_interval(),
    );
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut autosave = tokio::time::interval_at(
        Instant::now() + config.autosave_interval(),
        config.autosave_interval(),
    );
    autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let was_empty = channel.is_empty();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    persist(&mut channel, store.as_ref()).await;
                    break;
                };
                match command {
                    ChannelCommand::Subscribe { client_id, user_id, user_name, sender, reply } => {
                        let result = channel.subscribe(client_id, user_id, user_name, sender, Instant::now());
                        let _ = reply.send(result);
                    }
                    ChannelCommand::Message { client_id, message } => {
                        channel.handle(&client_id, message, Instant::now());
                    }
                    ChannelCommand::Disconnect { client_id, token } => {
                        channel.unsubscribe(&client_id, Some(token));
                    }
                    ChannelCommand::Stats { reply } => {
                        let _ = reply.send(channel.stats());
                    }
                    ChannelCommand::Snapshot { reply } => {
                        let _ = reply.send(channel.snapshot());
                    }
                    ChannelCommand::Close { force, reply } => {
                        if force || channel.is_empty() {
                            persist(&mut channel, store.as_ref()).await;
                            let _ = reply.send(true);
                            break;
                        }
                        let _ = reply.send(false);
                    }
                }
            }
            _ = sweep.tick() => {
                channel.sweep(Instant::now());
            }
            _ = autosave.tick() => {
                persist(&mut channel, store.as_ref()).await;
            }
        }

        if !was_empty && channel.is_empty() {
            let _ = idle_tx.send(channel.document_id().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OpId;
    use crate::operation::Operation;
    use crate::queue::OperationBatch;
    use crate::store::MemoryDocumentStore;
    use std::time::Duration;

    async fn make_registry(content: &str) -> Arc<ChannelRegistry<MemoryDocumentStore>> {
        let store = MemoryDocumentStore::with_document(DocId::from("doc"), content).await;
        ChannelRegistry::new(Arc::new(store), ChannelConfig::default())
    }

    async fn wait_until_closed(registry: &ChannelRegistry<MemoryDocumentStore>, doc_id: &DocId) {
        for _ in 0..100 {
            if !registry.is_open(doc_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channel for {} stayed open", doc_id);
    }

    fn insert_batch(client: &str, pos: usize, content: &str) -> ClientMessage {
        ClientMessage::OperationBatch(OperationBatch {
            client_id: ClientId::from(client),
            batch_seq: 0,
            operations: vec![Operation::insert(
                OpId::new(ClientId::from(client), 1),
                UserId::from(client),
                pos,
                content,
                0,
            )],
        })
    }

    #[tokio::test]
    async fn test_subscribe_opens_channel_from_store() {
        let registry = make_registry("hello").await;
        let doc = DocId::from("doc");
        let (_sender, _rx) = registry
            .subscribe(&doc, ClientId::from("a"), &Identity::new("alice", "Alice"))
            .await
            .unwrap();

        assert_eq!(registry.document_count().await, 1);
        let snapshot = registry.document_snapshot(&doc).await.unwrap();
        assert_eq!(snapshot.content, "hello");
        assert_eq!(registry.stats(&doc).await.unwrap().subscribers, 1);
    }

    #[tokio::test]
    async fn test_operations_flow_between_subscribers() {
        let registry = make_registry("hello").await;
        let doc = DocId::from("doc");
        let (alice, mut alice_rx) = registry
            .subscribe(&doc, ClientId::from("a"), &Identity::new("alice", "Alice"))
            .await
            .unwrap();
        let (_bob, mut bob_rx) = registry
            .subscribe(&doc, ClientId::from("b"), &Identity::new("bob", "Bob"))
            .await
            .unwrap();

        alice.send(insert_batch("a", 5, "!")).unwrap();

        // Bob's first message announces alice
        assert!(matches!(bob_rx.recv().await, Some(ServerMessage::UserJoined { .. })));
        assert!(matches!(
            bob_rx.recv().await,
            Some(ServerMessage::OperationBatch { .. })
        ));
        assert!(matches!(alice_rx.recv().await, Some(ServerMessage::UserJoined { .. })));
        assert!(matches!(
            alice_rx.recv().await,
            Some(ServerMessage::OperationAck { server_version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_last_unsubscribe_saves_and_tears_down() {
        let registry = make_registry("hello").await;
        let doc = DocId::from("doc");
        let (alice, mut alice_rx) = registry
            .subscribe(&doc, ClientId::from("a"), &Identity::new("alice", "Alice"))
            .await
            .unwrap();
        alice.send(insert_batch("a", 0, ">")).unwrap();
        assert!(alice_rx.recv().await.is_some());

        registry.unsubscribe(&doc, &ClientId::from("a")).await.unwrap();
        assert!(!registry.is_open(&doc).await);

        let saved = registry.store().load(&doc).await.unwrap().unwrap();
        assert_eq!(saved.content, ">hello");
        assert_eq!(saved.version, 1);
    }

    #[tokio::test]
    async fn test_dropped_sender_reaps_channel() {
        let registry = make_registry("").await;
        let doc = DocId::from("doc");
        let (alice, _alice_rx) = registry
            .subscribe(&doc, ClientId::from("a"), &Identity::new("alice", "Alice"))
            .await
            .unwrap();
        drop(alice);
        wait_until_closed(&registry, &doc).await;
    }

    #[tokio::test]
    async fn test_channel_reopens_with_saved_state() {
        let registry = make_registry("x").await;
        let doc = DocId::from("doc");
        let (alice, mut alice_rx) = registry
            .subscribe(&doc, ClientId::from("a"), &Identity::new("alice", "Alice"))
            .await
            .unwrap();
        alice.send(insert_batch("a", 1, "y")).unwrap();
        assert!(alice_rx.recv().await.is_some());
        drop(alice);
        wait_until_closed(&registry, &doc).await;

        let (_bob, _bob_rx) = registry
            .subscribe(&doc, ClientId::from("b"), &Identity::new("bob", "Bob"))
            .await
            .unwrap();
        let snapshot = registry.document_snapshot(&doc).await.unwrap();
        assert_eq!(snapshot.content, "xy");
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_document() {
        let registry = make_registry("").await;
        let result = registry
            .unsubscribe(&DocId::from("missing"), &ClientId::from("a"))
            .await;
        assert!(matches!(result, Err(SyncError::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn test_shutdown_all_saves_open_channels() {
        let registry = make_registry("").await;
        let doc = DocId::from("doc");
        let (alice, mut alice_rx) = registry
            .subscribe(&doc, ClientId::from("a"), &Identity::new("alice", "Alice"))
            .await
            .unwrap();
        alice.send(insert_batch("a", 0, "saved")).unwrap();
        assert!(alice_rx.recv().await.is_some());

        registry.shutdown_all().await;
        assert_eq!(registry.document_count().await, 0);
        let saved = registry.store().load(&doc).await.unwrap().unwrap();
        assert_eq!(saved.content, "saved");
    }
}
