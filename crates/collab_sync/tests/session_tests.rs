//! Tests for sessions driven by their own tasks
//! Tests the session handle, the channel registry and reconnection
//!
//! Time is paused; the runtime advances it whenever every task is idle.

use collab_sync::{
    ChannelConfig, ChannelRegistry, ClientId, Connector, ConnectionStatus, DocId, DocumentStore,
    Identity, LocalConnector, MemoryDocumentStore, ResolutionRequest, SessionHandle, SyncConfig,
    SyncError, SyncEvent, SyncResult, TransportLink,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

type Events = mpsc::UnboundedReceiver<SyncEvent>;

async fn make_connector(content: &str) -> LocalConnector<MemoryDocumentStore> {
    let store = MemoryDocumentStore::with_document(DocId::from("doc"), content).await;
    LocalConnector::new(ChannelRegistry::new(
        Arc::new(store),
        ChannelConfig::default(),
    ))
}

fn open<C: Connector + 'static>(connector: C, user: &str) -> (SessionHandle, Events) {
    SessionHandle::connect(
        connector,
        DocId::from("doc"),
        Identity::new(user, user),
        SyncConfig::default(),
    )
}

/// Wait until a session shows the expected content.
async fn wait_for_content(handle: &SessionHandle, expected: &str) {
    for _ in 0..200 {
        if handle.content().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "session {} never reached {:?}, has {:?}",
        handle.client_id(),
        expected,
        handle.content().await.unwrap()
    );
}

async fn wait_until_online(handle: &SessionHandle) {
    for _ in 0..200 {
        if handle.snapshot().await.unwrap().status == ConnectionStatus::Online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {} never came online", handle.client_id());
}

async fn wait_until_idle(handle: &SessionHandle) {
    for _ in 0..200 {
        let queue = handle.snapshot().await.unwrap().queue;
        if queue.pending == 0 && queue.awaiting_ack == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {} kept operations in flight", handle.client_id());
}

fn drain(events: &mut Events) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Connector whose links can be cut and whose connects can be refused.
#[derive(Clone)]
struct SeverableConnector {
    inner: LocalConnector<MemoryDocumentStore>,
    cut: Arc<Notify>,
    refuse: Arc<AtomicBool>,
}

impl SeverableConnector {
    fn new(inner: LocalConnector<MemoryDocumentStore>) -> Self {
        Self {
            inner,
            cut: Arc::new(Notify::new()),
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }

    fn sever(&self) {
        self.cut.notify_waiters();
    }

    fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for SeverableConnector {
    async fn connect(
        &self,
        document_id: &DocId,
        client_id: &ClientId,
        identity: &Identity,
    ) -> SyncResult<TransportLink> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        let TransportLink {
            client_id,
            sender,
            mut receiver,
        } = self.inner.connect(document_id, client_id, identity).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cut = Arc::clone(&self.cut);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cut.notified() => break,
                    message = receiver.recv() => {
                        let Some(message) = message else { break };
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(TransportLink {
            client_id,
            sender,
            receiver: rx,
        })
    }
}

// ================== Session Handle Tests ==================

#[tokio::test(start_paused = true)]
async fn test_sessions_converge_through_registry() {
    let connector = make_connector("hello").await;
    let (alice, _alice_events) = open(connector.clone(), "alice");
    let (bob, _bob_events) = open(connector.clone(), "bob");
    wait_until_online(&alice).await;
    wait_until_online(&bob).await;

    alice.insert(5, " world").await.unwrap();
    wait_for_content(&bob, "hello world").await;

    bob.delete(0, 6).await.unwrap();
    wait_for_content(&alice, "world").await;
    wait_until_idle(&alice).await;
    wait_until_idle(&bob).await;

    let snapshot = connector
        .registry()
        .document_snapshot(&DocId::from("doc"))
        .await
        .unwrap();
    assert_eq!(snapshot.content, "world");
    assert_eq!(snapshot.version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_edit_before_sync_is_refused() {
    let connector = SeverableConnector::new(make_connector("text").await);
    connector.refuse_connections(true);
    let (handle, _events) = open(connector.clone(), "alice");

    assert!(matches!(
        handle.insert(0, "x").await,
        Err(SyncError::NotSynced)
    ));
    let snapshot = handle.snapshot().await.unwrap();
    assert!(!matches!(snapshot.status, ConnectionStatus::Online));

    connector.refuse_connections(false);
    wait_until_online(&handle).await;
    handle.insert(0, "x").await.unwrap();
    assert_eq!(handle.content().await.unwrap(), "xtext");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_inserts_auto_resolve() {
    let connector = make_connector("hello").await;
    let (alice, mut alice_events) = open(connector.clone(), "alice");
    let (bob, mut bob_events) = open(connector.clone(), "bob");
    wait_until_online(&alice).await;
    wait_until_online(&bob).await;

    // Both edits are queued before either batch is flushed
    let (a, b) = tokio::join!(alice.insert(5, " world"), bob.insert(5, "!"));
    a.unwrap();
    b.unwrap();

    wait_until_idle(&alice).await;
    wait_until_idle(&bob).await;
    let content = alice.content().await.unwrap();
    wait_for_content(&bob, &content).await;
    assert!(content == "hello world!" || content == "hello! world");

    let mut events = drain(&mut alice_events);
    events.extend(drain(&mut bob_events));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::ConflictAutoResolved { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_manual_resolution_through_handles() {
    let connector = make_connector("line1\nline2").await;
    let (alice, _alice_events) = open(connector.clone(), "alice");
    let (bob, _bob_events) = open(connector.clone(), "bob");
    wait_until_online(&alice).await;
    wait_until_online(&bob).await;

    let (a, b) = tokio::join!(alice.replace(6, 5, "A"), bob.replace(6, 5, "B"));
    a.unwrap();
    b.unwrap();
    wait_until_idle(&alice).await;
    wait_until_idle(&bob).await;

    let mut conflict = None;
    for _ in 0..100 {
        let conflicts = alice.conflicts().await.unwrap();
        if let Some(found) = conflicts.into_iter().next() {
            conflict = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let conflict = conflict.expect("a conflict should be raised");

    let resolving = alice.begin_resolution(conflict.id.clone()).await.unwrap();
    assert_eq!(resolving.id, conflict.id);
    alice
        .resolve_conflict(conflict.id.clone(), ResolutionRequest::manual_merge("AB"))
        .await
        .unwrap();

    wait_for_content(&bob, "line1\nAB").await;
    wait_for_content(&alice, "line1\nAB").await;
    for _ in 0..100 {
        if bob.conflicts().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(bob.conflicts().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_the_task() {
    let connector = make_connector("").await;
    let (handle, _events) = open(connector.clone(), "alice");
    wait_until_online(&handle).await;

    handle.close().await.unwrap();
    for _ in 0..100 {
        if !handle.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!handle.is_running());
    assert!(matches!(
        handle.insert(0, "x").await,
        Err(SyncError::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_reports_unsynced_edits() {
    let connector = SeverableConnector::new(make_connector("text").await);
    let (handle, mut events) = open(connector.clone(), "alice");
    wait_until_online(&handle).await;

    connector.refuse_connections(true);
    connector.sever();
    let mut offline = false;
    for _ in 0..100 {
        if !matches!(handle.snapshot().await.unwrap().status, ConnectionStatus::Online) {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline);

    let op = handle.insert(4, "!").await.unwrap();
    handle.close().await.unwrap();

    let failed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::OperationFailed { operation, error } => Some((operation.id, error)),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![(op.id, SyncError::SessionClosed)]);
}

// ================== Reconnection Tests ==================

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_link_is_cut() {
    let local = make_connector("abc").await;
    let severable = SeverableConnector::new(local.clone());
    let (alice, mut alice_events) = open(severable.clone(), "alice");
    let (bob, _bob_events) = open(local.clone(), "bob");
    wait_until_online(&alice).await;
    wait_until_online(&bob).await;

    severable.refuse_connections(true);
    severable.sever();

    // Offline edits stay local until the link is back
    let mut offline = false;
    for _ in 0..100 {
        if matches!(
            alice.snapshot().await.unwrap().status,
            ConnectionStatus::Offline { .. } | ConnectionStatus::Reconnecting { .. }
        ) {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline);

    alice.insert(3, "!").await.unwrap();
    bob.insert(0, ">").await.unwrap();
    wait_until_idle(&bob).await;
    assert_eq!(alice.content().await.unwrap(), "abc!");

    severable.refuse_connections(false);
    wait_until_online(&alice).await;
    wait_for_content(&alice, ">abc!").await;
    wait_for_content(&bob, ">abc!").await;

    let events = drain(&mut alice_events);
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::StatusChanged(ConnectionStatus::Reconnecting { .. })
    )));
}

#[tokio::test(start_paused = true)]
async fn test_last_session_leaving_saves_document() {
    let connector = make_connector("draft").await;
    let (handle, _events) = open(connector.clone(), "alice");
    wait_until_online(&handle).await;

    handle.insert(5, " v2").await.unwrap();
    wait_until_idle(&handle).await;
    handle.close().await.unwrap();

    let registry = connector.registry();
    let doc = DocId::from("doc");
    for _ in 0..100 {
        if !registry.is_open(&doc).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!registry.is_open(&doc).await);

    let saved = registry.store().load(&doc).await.unwrap().unwrap();
    assert_eq!(saved.content, "draft v2");
    assert_eq!(saved.version, 1);
}
