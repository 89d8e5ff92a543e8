//! Sync Manager: the task that drives one [`SyncSession`].
//!
//! [`SessionHandle::spawn`] moves a session into its own task together with
//! a [`Connector`]. The task owns the transport link, feeds incoming
//! messages and timer ticks into the session, writes the session's outbox
//! to the link and forwards [`SyncEvent`]s to the caller. When the link
//! drops it reconnects with exponential backoff and resumes from the last
//! confirmed version.

use crate::conflict::Conflict;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ids::{ClientId, DocId, Identity};
use crate::message::{ClientMessage, ServerMessage};
use crate::operation::Operation;
use crate::presence::SelectionRange;
use crate::resolver::{Resolution, ResolutionRequest};
use crate::session::{ConnectionStatus, SessionSnapshot, SyncEvent, SyncSession};
use crate::transport::{Connector, TransportLink};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Commands processed by a session task.
enum SessionCommand {
    Insert {
        position: usize,
        content: String,
        reply: oneshot::Sender<SyncResult<Operation>>,
    },
    Delete {
        position: usize,
        length: usize,
        reply: oneshot::Sender<SyncResult<Operation>>,
    },
    Replace {
        position: usize,
        length: usize,
        content: String,
        reply: oneshot::Sender<SyncResult<Operation>>,
    },
    Cursor {
        position: usize,
    },
    Selection {
        selection: SelectionRange,
    },
    Typing {
        typing: bool,
    },
    BeginResolution {
        conflict_id: String,
        reply: oneshot::Sender<SyncResult<Conflict>>,
    },
    ResolveConflict {
        conflict_id: String,
        request: ResolutionRequest,
        reply: oneshot::Sender<SyncResult<Resolution>>,
    },
    RetryFailed {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Leave the channel and stop the task.
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running session task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    document_id: DocId,
    client_id: ClientId,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Open a session on a document with a fresh client id.
    pub fn connect<C: Connector + 'static>(
        connector: C,
        document_id: DocId,
        identity: Identity,
        config: SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let session = SyncSession::new(document_id, ClientId::generate(), identity, config);
        Self::spawn(connector, session)
    }

    /// Drive an existing session from a new task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<C: Connector + 'static>(
        connector: C,
        session: SyncSession,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Self {
            document_id: session.document_id().clone(),
            client_id: session.client_id().clone(),
            tx,
        };

        let task = SessionTask {
            reconnect: Backoff::new(
                session.config().reconnect_initial(),
                session.config().reconnect_max(),
            ),
            session,
            connector,
            link: None,
            rx,
            events: events_tx,
        };
        tokio::spawn(task.run());
        (handle, events_rx)
    }

    pub fn document_id(&self) -> &DocId {
        &self.document_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    fn notify(&self, command: SessionCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Session {} already closed", self.client_id);
        }
    }

    /// Insert text at a char position of the visible content.
    pub async fn insert(&self, position: usize, content: impl Into<String>) -> SyncResult<Operation> {
        let content = content.into();
        self.request(|reply| SessionCommand::Insert {
            position,
            content,
            reply,
        })
        .await?
    }

    pub async fn delete(&self, position: usize, length: usize) -> SyncResult<Operation> {
        self.request(|reply| SessionCommand::Delete {
            position,
            length,
            reply,
        })
        .await?
    }

    pub async fn replace(
        &self,
        position: usize,
        length: usize,
        content: impl Into<String>,
    ) -> SyncResult<Operation> {
        let content = content.into();
        self.request(|reply| SessionCommand::Replace {
            position,
            length,
            content,
            reply,
        })
        .await?
    }

    pub fn set_cursor(&self, position: usize) {
        self.notify(SessionCommand::Cursor { position });
    }

    pub fn set_selection(&self, selection: SelectionRange) {
        self.notify(SessionCommand::Selection { selection });
    }

    pub fn set_typing(&self, typing: bool) {
        self.notify(SessionCommand::Typing { typing });
    }

    /// Mark a conflict as being worked on.
    pub async fn begin_resolution(&self, conflict_id: impl Into<String>) -> SyncResult<Conflict> {
        let conflict_id = conflict_id.into();
        self.request(|reply| SessionCommand::BeginResolution { conflict_id, reply })
            .await?
    }

    /// Settle a manual conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: impl Into<String>,
        request: ResolutionRequest,
    ) -> SyncResult<Resolution> {
        let conflict_id = conflict_id.into();
        self.request(|reply| SessionCommand::ResolveConflict {
            conflict_id,
            request,
            reply,
        })
        .await?
    }

    /// Give operations that exhausted their retries another round.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        self.request(|reply| SessionCommand::RetryFailed { reply }).await
    }

    pub async fn snapshot(&self) -> SyncResult<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// The visible text.
    pub async fn content(&self) -> SyncResult<String> {
        Ok(self.snapshot().await?.content)
    }

    pub async fn conflicts(&self) -> SyncResult<Vec<Conflict>> {
        Ok(self.snapshot().await?.unresolved_conflicts)
    }

    /// Leave the channel and stop the task.
    ///
    /// Operations the channel has not acknowledged are reported as
    /// `OperationFailed` with `SessionClosed` before the task stops.
    pub async fn close(&self) -> SyncResult<()> {
        self.request(|reply| SessionCommand::Close { reply }).await
    }
}

/// Exponential reconnect delay.
#[derive(Clone, Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt.
    fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        self.attempt += 1;
        self.initial.saturating_mul(1 << shift).min(self.max)
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

struct SessionTask<C: Connector> {
    session: SyncSession,
    connector: C,
    link: Option<TransportLink>,
    reconnect: Backoff,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl<C: Connector> SessionTask<C> {
    async fn run(mut self) {
        self.connect().await;
        self.pump();

        let mut ticker = interval(self.session.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect_at: Option<Instant> = self.schedule_if_offline();

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                message = recv_from(&mut self.link) => {
                    match message {
                        Some(message) => self.session.handle_message(message, Instant::now()),
                        None => {
                            self.connection_lost("connection closed");
                            reconnect_at = self.schedule_if_offline();
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.session.tick(now);
                    if self.link.is_some() && is_offline(self.session.status()) {
                        self.connection_lost("sync timed out");
                        reconnect_at = self.schedule_if_offline();
                    }
                    if reconnect_at.is_some_and(|at| now >= at) {
                        self.connect().await;
                        reconnect_at = self.schedule_if_offline();
                    }
                }
            }
            if self.pump() {
                reconnect_at = self.schedule_if_offline();
            }
        }

        self.shutdown();
        tracing::debug!("Session {} stopped", self.session.client_id());
    }

    async fn connect(&mut self) {
        let document_id = self.session.document_id().clone();
        let client_id = self.session.client_id().clone();
        let identity = self.session.identity().clone();

        match self.connector.connect(&document_id, &client_id, &identity).await {
            Ok(link) => {
                tracing::info!("Session {} connected to {}", client_id, document_id);
                self.link = Some(link);
                self.reconnect.reset();
                self.session.connected(Instant::now());
            }
            Err(e) => {
                tracing::warn!("Session {} failed to connect to {}: {}", client_id, document_id, e);
                self.session.transport_lost(e.to_string());
            }
        }
    }

    /// Next reconnect deadline when there is no link.
    fn schedule_if_offline(&mut self) -> Option<Instant> {
        if self.link.is_some() {
            return None;
        }
        let delay = self.reconnect.next_delay();
        self.session.set_reconnecting(self.reconnect.attempt());
        self.forward_events();
        tracing::debug!(
            "Session {} reconnecting in {:?} (attempt {})",
            self.session.client_id(),
            delay,
            self.reconnect.attempt()
        );
        Some(Instant::now() + delay)
    }

    fn connection_lost(&mut self, reason: &str) {
        self.link = None;
        self.session.transport_lost(reason);
    }

    /// Returns false once the task should stop.
    fn handle_command(&mut self, command: SessionCommand) -> bool {
        let now = Instant::now();
        match command {
            SessionCommand::Insert {
                position,
                content,
                reply,
            } => {
                let _ = reply.send(self.session.insert(position, &content, now));
            }
            SessionCommand::Delete {
                position,
                length,
                reply,
            } => {
                let _ = reply.send(self.session.delete(position, length, now));
            }
            SessionCommand::Replace {
                position,
                length,
                content,
                reply,
            } => {
                let _ = reply.send(self.session.replace(position, length, &content, now));
            }
            SessionCommand::Cursor { position } => self.session.set_cursor(position, now),
            SessionCommand::Selection { selection } => self.session.set_selection(selection, now),
            SessionCommand::Typing { typing } => self.session.set_typing(typing, now),
            SessionCommand::BeginResolution { conflict_id, reply } => {
                let _ = reply.send(self.session.begin_resolution(&conflict_id));
            }
            SessionCommand::ResolveConflict {
                conflict_id,
                request,
                reply,
            } => {
                let _ = reply.send(self.session.resolve_conflict(&conflict_id, request, now));
            }
            SessionCommand::RetryFailed { reply } => {
                let _ = reply.send(self.session.retry_failed());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            SessionCommand::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Write the outbox to the link and forward events. Returns true when
    /// the link failed.
    fn pump(&mut self) -> bool {
        let outbox = self.session.take_outbox();
        let mut failed = false;
        if let Some(link) = self.link.as_ref() {
            for message in outbox {
                if let Err(e) = link.sender.send(message) {
                    tracing::warn!("Session {} send failed: {}", self.session.client_id(), e);
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.connection_lost("send failed");
        }
        self.forward_events();
        failed
    }

    fn forward_events(&mut self) {
        for event in self.session.drain_events() {
            // The receiver may be gone; the session keeps running regardless
            let _ = self.events.send(event);
        }
    }

    /// Report undelivered edits, then leave the channel.
    fn shutdown(&mut self) {
        let abandoned = self.session.abandon_unacknowledged();
        if abandoned > 0 {
            tracing::info!(
                "Session {} closing with {} unsynced operations",
                self.session.client_id(),
                abandoned
            );
        }
        self.forward_events();
        self.leave();
    }

    fn leave(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.sender.send(ClientMessage::Leave);
        }
    }
}

async fn recv_from(link: &mut Option<TransportLink>) -> Option<ServerMessage> {
    match link {
        Some(link) => link.receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn is_offline(status: &ConnectionStatus) -> bool {
    matches!(status, ConnectionStatus::Offline { .. })
}
