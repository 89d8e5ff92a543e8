//! WebSocket transport.
//!
//! [`SyncServer`] accepts WebSocket connections and attaches each one to a
//! document channel in a [`ChannelRegistry`]. A connection must open with a
//! `join` message; everything after it is relayed to the channel, and the
//! channel's messages are written back as JSON text frames.
//!
//! [`WebSocketConnector`] is the client side: a [`Connector`] that dials the
//! server and sends the `join` on the session's behalf.

use crate::error::{SyncError, SyncResult};
use crate::ids::{ClientId, DocId, Identity};
use crate::message::{ClientMessage, ServerMessage};
use crate::registry::{ChannelRegistry, ChannelSender};
use crate::store::DocumentStore;
use crate::transport::{Connector, Transport, TransportLink};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum simultaneous connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get the full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(String, #[source] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Handle for triggering server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the server and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// WebSocket front end for a channel registry.
pub struct SyncServer<S: DocumentStore + 'static> {
    config: ServerConfig,
    registry: Arc<ChannelRegistry<S>>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: DocumentStore + 'static> SyncServer<S> {
    pub fn new(config: ServerConfig, registry: Arc<ChannelRegistry<S>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry<S>> {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Bind to the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr.clone(), e))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::BindFailed(self.config.socket_addr(), e))?;
        tracing::info!("Sync server listening on {}", local);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.config.max_connections {
                                tracing::warn!("Max connections reached, rejecting {}", addr);
                                continue;
                            }
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server received shutdown signal");
                    break;
                }
            }
        }

        tracing::info!("Server shutdown complete");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = Arc::clone(&self.registry);
        let connections = Arc::clone(&self.connections);
        let shutdown_rx = self.shutdown_tx.subscribe();

        connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, addr, registry, shutdown_rx).await {
                tracing::warn!("Connection {} ended with error: {}", addr, e);
            }
            connections.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// The channel a connection joined.
struct Joined {
    sender: ChannelSender,
    forwarder: tokio::task::JoinHandle<()>,
}

async fn serve_connection<S: DocumentStore + 'static>(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ChannelRegistry<S>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::debug!("New connection from {}", addr);
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ServerError::WebSocket(e.to_string()))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let outgoing = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match msg.to_json() {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut joined: Option<Joined> = None;
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, &registry, &mut joined, &out_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Connection {} closed", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Connection {} received shutdown signal", addr);
                break;
            }
        }
    }

    if let Some(joined) = joined.take() {
        joined.forwarder.abort();
    }
    drop(out_tx);
    let _ = outgoing.await;
    Ok(())
}

async fn handle_text<S: DocumentStore + 'static>(
    text: &str,
    registry: &Arc<ChannelRegistry<S>>,
    joined: &mut Option<Joined>,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            let _ = out_tx.send(ServerMessage::error("parse_error", e.to_string()));
            return;
        }
    };

    match (message, joined.as_ref()) {
        (
            ClientMessage::Join {
                document_id,
                client_id,
                user_id,
                user_name,
            },
            None,
        ) => {
            let identity = Identity::new(user_id, user_name);
            match registry.subscribe(&document_id, client_id, &identity).await {
                Ok((sender, mut receiver)) => {
                    let out = out_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(message) = receiver.recv().await {
                            if out.send(message).is_err() {
                                break;
                            }
                        }
                    });
                    *joined = Some(Joined { sender, forwarder });
                }
                Err(e) => {
                    let _ = out_tx.send(ServerMessage::error("join_failed", e.to_string()));
                }
            }
        }
        (ClientMessage::Join { .. }, Some(_)) => {
            let _ = out_tx.send(ServerMessage::error(
                "already_joined",
                "Connection already joined a document",
            ));
        }
        (_, None) => {
            let _ = out_tx.send(ServerMessage::error("not_joined", "Must join a document first"));
        }
        (ClientMessage::Leave, Some(current)) => {
            let _ = current.sender.send(ClientMessage::Leave);
            if let Some(previous) = joined.take() {
                previous.forwarder.abort();
            }
        }
        (message, Some(current)) => {
            if let Err(e) = current.sender.send(message) {
                let _ = out_tx.send(ServerMessage::error("channel_closed", e.to_string()));
            }
        }
    }
}

/// Connector that reaches channels through a [`SyncServer`].
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// `url` is the server address, e.g. `ws://127.0.0.1:8080`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        document_id: &DocId,
        client_id: &ClientId,
        identity: &Identity,
    ) -> SyncResult<TransportLink> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let join = ClientMessage::Join {
            document_id: document_id.clone(),
            client_id: client_id.clone(),
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
        };
        ws_tx
            .send(Message::Text(join.to_json()?))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping malformed server message: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(TransportLink::new(client_id.clone(), out_tx, in_rx))
    }
}
