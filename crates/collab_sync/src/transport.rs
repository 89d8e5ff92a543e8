//! Transport seam between sessions and document channels.
//!
//! A session talks to its channel through a [`TransportLink`]: a
//! [`Transport`] for outgoing messages and a receiver for incoming ones. A
//! [`Connector`] produces links; [`LocalConnector`] subscribes directly to an
//! in-process [`ChannelRegistry`], and the `server` feature adds a WebSocket
//! connector.

use crate::error::{SyncError, SyncResult};
use crate::ids::{ClientId, DocId, Identity};
use crate::message::{ClientMessage, ServerMessage};
use crate::registry::ChannelRegistry;
use crate::store::DocumentStore;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outgoing half of a connection.
pub trait Transport: Send {
    /// Queue a message for the channel. Fails once the connection is gone.
    fn send(&self, message: ClientMessage) -> SyncResult<()>;
}

impl Transport for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, message: ClientMessage) -> SyncResult<()> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|_| SyncError::Transport("connection closed".to_string()))
    }
}

/// An established connection to one document channel.
pub struct TransportLink {
    pub client_id: ClientId,
    pub sender: Box<dyn Transport>,
    pub receiver: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TransportLink {
    pub fn new(
        client_id: ClientId,
        sender: impl Transport + 'static,
        receiver: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self {
            client_id,
            sender: Box::new(sender),
            receiver,
        }
    }
}

/// Opens connections to document channels.
#[trait_variant::make(Send)]
pub trait Connector: Send + Sync {
    /// Connect `client_id` to a document as `identity`.
    async fn connect(
        &self,
        document_id: &DocId,
        client_id: &ClientId,
        identity: &Identity,
    ) -> SyncResult<TransportLink>;
}

/// Connector for channels hosted in the same process.
pub struct LocalConnector<S: DocumentStore + 'static> {
    registry: Arc<ChannelRegistry<S>>,
}

impl<S: DocumentStore + 'static> LocalConnector<S> {
    pub fn new(registry: Arc<ChannelRegistry<S>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry<S>> {
        &self.registry
    }
}

impl<S: DocumentStore + 'static> Clone for LocalConnector<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: DocumentStore + 'static> Connector for LocalConnector<S> {
    async fn connect(
        &self,
        document_id: &DocId,
        client_id: &ClientId,
        identity: &Identity,
    ) -> SyncResult<TransportLink> {
        let (sender, receiver) = self
            .registry
            .subscribe(document_id, client_id.clone(), identity)
            .await?;
        Ok(TransportLink::new(client_id.clone(), sender, receiver))
    }
}
