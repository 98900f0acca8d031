//! Session scenarios driven through channel-backed peers.
//!
//! Each peer is an outbox receiver, so these exercise the registry, the
//! dispatcher and fan-out without sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use folio_collab::session::outbox;
use folio_collab::{
    Dispatched, LocalMirror, MemoryStore, MirrorOutcome, PageStore, SessionConfig,
    SessionRegistry, StoreError, StoredPage,
};
use folio_core::{ManualClock, MonotonicClock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Peer {
    id: Uuid,
    rx: mpsc::Receiver<Arc<str>>,
    mirror: LocalMirror,
}

impl Peer {
    /// Drain every queued frame into the mirror.
    fn pump(&mut self) -> Vec<MirrorOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            outcomes.push(self.mirror.receive(&frame));
        }
        outcomes
    }

    fn next_json(&mut self) -> Option<Value> {
        self.rx.try_recv().ok().map(|frame| serde_json::from_str(&frame).unwrap())
    }
}

fn registry_with(store: Arc<dyn PageStore>) -> Arc<SessionRegistry> {
    SessionRegistry::new(store, Arc::new(ManualClock::new(1_000)), SessionConfig::default())
}

async fn join(registry: &Arc<SessionRegistry>, page_id: Uuid) -> (Peer, Arc<folio_collab::Session>) {
    let id = Uuid::new_v4();
    let (tx, rx) = outbox(64);
    let session = registry.join(page_id, id, tx).await.unwrap();
    let mut peer = Peer {
        id,
        rx,
        mirror: LocalMirror::new(),
    };
    assert_eq!(peer.pump(), vec![MirrorOutcome::Loaded]);
    (peer, session)
}

fn first_block(peer: &Peer) -> String {
    peer.mirror.document().structure().children[0].id().unwrap().to_string()
}

#[tokio::test]
async fn test_edit_reaches_other_peer_not_sender() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (mut a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;
    let block = first_block(&a);

    let message = a
        .mirror
        .edit_block(&block, json!({"textContent": "Hello"}).as_object().unwrap().clone())
        .unwrap();
    session
        .handle_text(a.id, &message.encode(None).unwrap())
        .await
        .unwrap();

    assert!(a.pump().is_empty(), "sender gets no echo");
    assert_eq!(b.pump(), vec![MirrorOutcome::Applied("block_change")]);
    assert_eq!(b.mirror.document().content_of(&block).unwrap()["textContent"], "Hello");
    assert_eq!(a.mirror.hash(), b.mirror.hash());
    assert_eq!(session.lock().await.hash(), b.mirror.hash());
}

#[tokio::test]
async fn test_insert_delete_and_undo_converge() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (mut a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;
    let block = first_block(&a);

    let (new_id, insert) = a
        .mirror
        .insert_block(Some(&block), json!({"type": "text"}).as_object().unwrap().clone(), Default::default())
        .unwrap();
    session.handle_text(a.id, &insert.encode(None).unwrap()).await.unwrap();
    assert_eq!(b.pump(), vec![MirrorOutcome::Applied("block_addition")]);

    let delete = b.mirror.delete_block(&new_id).unwrap();
    session.handle_text(b.id, &delete.encode(None).unwrap()).await.unwrap();
    assert_eq!(a.pump(), vec![MirrorOutcome::Applied("block_deletion")]);
    assert!(!a.mirror.document().contains_block(&new_id));

    // Undo goes to every peer, the requester included.
    let undo = a.mirror.request_history(folio_collab::HistoryAction::Undo);
    let result = session.handle_text(a.id, &undo.encode(None).unwrap()).await.unwrap();
    assert!(matches!(result, Dispatched::History { peers: 2, .. }));
    assert_eq!(a.pump(), vec![MirrorOutcome::Applied("history_action")]);
    assert_eq!(b.pump(), vec![MirrorOutcome::Applied("history_action")]);
    assert!(a.mirror.document().contains_block(&new_id));
    assert_eq!(a.mirror.hash(), b.mirror.hash());
    assert_eq!(a.mirror.hash(), session.lock().await.hash());
}

#[tokio::test]
async fn test_rejected_request_answered_with_full_sync() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (mut a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;
    let before = session.lock().await.hash();

    let result = session
        .handle_text(a.id, r#"{"type":"block_deletion","blockId":"missing"}"#)
        .await;
    assert!(result.is_err());

    assert_eq!(a.pump(), vec![MirrorOutcome::Resynced]);
    assert!(b.pump().is_empty());
    assert_eq!(session.lock().await.hash(), before);

    assert!(session.handle_text(a.id, "not json").await.is_err());
    assert_eq!(a.next_json().unwrap()["type"], "full_sync");
}

#[tokio::test]
async fn test_unknown_type_ignored_without_reply() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (mut a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;

    let result = session.handle_text(a.id, r#"{"type":"cursor","x":1}"#).await.unwrap();
    assert_eq!(result, Dispatched::Ignored);
    assert!(a.next_json().is_none());
    assert!(b.next_json().is_none());
}

#[tokio::test]
async fn test_disconnected_peer_receives_nothing() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (mut a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;
    let block = first_block(&a);

    registry.leave(&session, &b.id).await;
    let text = json!({"type": "block_change", "blockId": block, "content": {"textContent": "after"}}).to_string();
    let result = session.handle_text(a.id, &text).await.unwrap();

    assert_eq!(result, Dispatched::Relayed { kind: "block_change", peers: 0 });
    assert!(b.next_json().is_none());
    assert!(a.next_json().is_none());
}

#[tokio::test]
async fn test_stale_peer_diverges_and_recovers() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;
    let block = first_block(&a);

    // B edits locally without telling the server.
    b.mirror
        .edit_block(&block, json!({"textContent": "local only"}).as_object().unwrap().clone())
        .unwrap();

    let text = json!({"type": "block_change", "blockId": block, "content": {"checked": true}}).to_string();
    session.handle_text(a.id, &text).await.unwrap();
    let outcomes = b.pump();
    assert!(matches!(outcomes.as_slice(), [MirrorOutcome::Diverged { .. }]));

    session
        .handle_text(b.id, &b.mirror.request_sync().encode(None).unwrap())
        .await
        .unwrap();
    assert_eq!(b.pump(), vec![MirrorOutcome::Resynced]);
    assert_eq!(b.mirror.hash(), session.lock().await.hash());
}

async fn join_slow(registry: &Arc<SessionRegistry>, page_id: Uuid) -> Peer {
    let id = Uuid::new_v4();
    // Room for exactly one frame, already taken by initial_page_data.
    let (tx, rx) = outbox(1);
    registry.join(page_id, id, tx).await.unwrap();
    Peer {
        id,
        rx,
        mirror: LocalMirror::new(),
    }
}

#[tokio::test]
async fn test_lagging_peer_resynced_once_drained() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (a, session) = join(&registry, page_id).await;
    let mut slow = join_slow(&registry, page_id).await;
    let block = first_block(&a);

    let text = json!({"type": "block_change", "blockId": block, "content": {"textContent": "missed"}}).to_string();
    let result = session.handle_text(a.id, &text).await.unwrap();
    assert_eq!(result, Dispatched::Relayed { kind: "block_change", peers: 0 });
    assert!(session.lock().await.peers().is_stale(&slow.id));

    // Only the initial page made it; the edit was dropped.
    assert_eq!(slow.pump(), vec![MirrorOutcome::Loaded]);
    assert_ne!(slow.mirror.hash(), session.lock().await.hash());

    // Nothing else happens on the page, the drained outbox alone triggers it.
    assert!(session.resync_if_stale(&slow.id).await);
    assert_eq!(slow.pump(), vec![MirrorOutcome::Resynced]);
    assert_eq!(slow.mirror.hash(), session.lock().await.hash());
    assert_eq!(slow.mirror.document().content_of(&block).unwrap()["textContent"], "missed");
    assert!(!session.lock().await.peers().is_stale(&slow.id));
    assert!(!session.resync_if_stale(&slow.id).await);
}

#[tokio::test]
async fn test_lagging_peer_resynced_by_next_change() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let page_id = Uuid::new_v4();
    let (a, session) = join(&registry, page_id).await;
    let mut slow = join_slow(&registry, page_id).await;
    let block = first_block(&a);

    for text in ["one", "two"] {
        let change = json!({"type": "block_change", "blockId": block, "content": {"textContent": text}});
        session.handle_text(a.id, &change.to_string()).await.unwrap();
    }
    assert_eq!(slow.pump(), vec![MirrorOutcome::Loaded]);

    // The next fan-out skips the stale peer and sends it the whole page.
    let change = json!({"type": "block_change", "blockId": block, "content": {"textContent": "three"}});
    session.handle_text(a.id, &change.to_string()).await.unwrap();
    assert_eq!(slow.pump(), vec![MirrorOutcome::Resynced]);
    assert_eq!(slow.mirror.hash(), session.lock().await.hash());
    assert_eq!(slow.mirror.document().content_of(&block).unwrap()["textContent"], "three");
}

#[tokio::test]
async fn test_rename_notifies_listeners() {
    let registry = registry_with(Arc::new(MemoryStore::new()));
    let mut renames = registry.subscribe_renames();
    let page_id = Uuid::new_v4();
    let (mut a, session) = join(&registry, page_id).await;
    let (mut b, _) = join(&registry, page_id).await;

    let rename = a.mirror.rename("Reading list").unwrap();
    session.handle_text(a.id, &rename.encode(None).unwrap()).await.unwrap();

    assert_eq!(b.pump(), vec![MirrorOutcome::Applied("metadata_change")]);
    assert_eq!(b.mirror.metadata().unwrap().name, "Reading list");
    let event = renames.recv().await.unwrap();
    assert_eq!((event.page_id, event.name.as_str()), (page_id, "Reading list"));

    // Same name again changes nothing and emits nothing.
    session.handle_text(a.id, &rename.encode(None).unwrap()).await.unwrap();
    assert!(renames.try_recv().is_err());
}

/// Counts loads so racing opens can be checked.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
}

impl PageStore for CountingStore {
    fn load(&self, page_id: Uuid) -> Result<Option<StoredPage>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        self.inner.load(page_id)
    }

    fn save(&self, page: &StoredPage) -> Result<(), StoreError> {
        self.inner.save(page)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_joins_load_page_once() {
    let store = Arc::new(CountingStore::default());
    let registry = SessionRegistry::new(store.clone(), Arc::new(MonotonicClock::new()), SessionConfig::default());
    let page_id = Uuid::new_v4();

    let mut tasks = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let (tx, rx) = outbox(8);
        receivers.push(rx);
        tasks.push(tokio::spawn(async move {
            registry.join(page_id, Uuid::new_v4(), tx).await.map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    assert_eq!(registry.session_count().await, 1);
    let session = registry.get(&page_id).await.unwrap();
    assert_eq!(session.lock().await.peers().peer_count(), 8);
}

#[tokio::test]
async fn test_changes_survive_session_close() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone());
    let page_id = Uuid::new_v4();
    let (a, session) = join(&registry, page_id).await;
    let block = first_block(&a);

    let text = json!({"type": "block_change", "blockId": block, "content": {"textContent": "kept"}}).to_string();
    session.handle_text(a.id, &text).await.unwrap();
    registry.leave(&session, &a.id).await;
    assert_eq!(registry.session_count().await, 0);

    let (reopened, _) = join(&registry, page_id).await;
    assert_eq!(reopened.mirror.document().content_of(&block).unwrap()["textContent"], "kept");
}
