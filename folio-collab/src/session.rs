//! Live page sessions.
//!
//! ```text
//! SessionRegistry ── page_id ──► Session
//!   │                              └── Mutex<ActivePage>
//!   │                                    ├── DocumentState (history on)
//!   │                                    ├── PageMetadata
//!   │                                    ├── BroadcastGroup
//!   │                                    └── dirty / closed
//!   ├── InFlight<page_id>   (one load per page, however many joiners race)
//!   ├── PageStore           (load on open, save on flush / last leave)
//!   └── rename channel      (PageRenamed events)
//! ```
//!
//! All mutation of a page happens under its session mutex and fan-out is
//! done before the lock is released, so every peer sees changes in the
//! order they were applied.

use std::collections::HashMap;
use std::sync::Arc;

use folio_core::{Clock, DocumentState, PageMetadata, PageSnapshot};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Outbox, PeerId};
use crate::dispatcher::{self, DispatchContext, Dispatched};
use crate::error::{DispatchError, JoinError, StoreError};
use crate::inflight::InFlight;
use crate::protocol::WireMessage;
use crate::store::{PageStore, StoredPage};

/// Capacity of the rename event channel.
const RENAME_CHANNEL_CAPACITY: usize = 64;

/// Emitted when a page's name changes, for views listing the notebook's pages.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRenamed {
    pub page_id: Uuid,
    pub notebook_id: Option<Uuid>,
    pub name: String,
}

/// A page's document state joined with the peers editing it.
#[derive(Debug)]
pub struct ActivePage {
    document: DocumentState,
    metadata: PageMetadata,
    peers: BroadcastGroup,
    dirty: bool,
    closed: bool,
}

impl ActivePage {
    pub fn new(page: StoredPage, max_peers: usize) -> Self {
        let snapshot = PageSnapshot {
            structure: page.structure,
            content: page.content,
        };
        Self {
            document: DocumentState::from_snapshot(snapshot, true),
            metadata: page.metadata,
            peers: BroadcastGroup::new(max_peers),
            dirty: false,
            closed: false,
        }
    }

    pub fn page_id(&self) -> Uuid {
        self.metadata.page_id
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut DocumentState {
        &mut self.document
    }

    pub fn metadata(&self) -> &PageMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut PageMetadata {
        &mut self.metadata
    }

    pub fn peers(&self) -> &BroadcastGroup {
        &self.peers
    }

    pub fn stats(&self) -> BroadcastStats {
        self.peers.stats()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn to_stored(&self) -> StoredPage {
        StoredPage {
            metadata: self.metadata.clone(),
            structure: self.document.structure().clone(),
            content: self.document.content().clone(),
        }
    }

    /// Snapshot for saving and clear the dirty flag; `None` when clean.
    pub fn take_dirty(&mut self) -> Option<StoredPage> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.to_stored())
    }

    /// Attach a peer and push it the current page. `false` when full.
    pub fn connect(&mut self, peer_id: PeerId, outbox: Outbox) -> bool {
        if !self.peers.add_peer(peer_id, outbox) {
            return false;
        }
        let initial = WireMessage::initial_page_data(&self.metadata, &self.document);
        self.send_with_hash(&peer_id, &initial);
        true
    }

    /// Detach a peer. Returns `true` when nobody is left.
    pub fn disconnect(&mut self, peer_id: &PeerId) -> bool {
        self.peers.remove_peer(peer_id);
        self.peers.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.document.consistency_hash()
    }

    fn encode(&self, message: &WireMessage) -> Option<Arc<str>> {
        match message.encode(Some(self.hash())) {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                error!("Failed to encode {} for page {}: {e}", message.kind(), self.page_id());
                None
            }
        }
    }

    pub fn send_with_hash(&mut self, peer_id: &PeerId, message: &WireMessage) -> bool {
        match self.encode(message) {
            Some(frame) => self.peers.send_to(peer_id, &frame),
            None => false,
        }
    }

    pub fn send_to_others_with_hash(&mut self, origin: &PeerId, message: &WireMessage) -> usize {
        let peers = match self.encode(message) {
            Some(frame) => self.peers.broadcast_except(origin, &frame),
            None => 0,
        };
        self.resync_stale();
        peers
    }

    pub fn send_to_all_with_hash(&mut self, message: &WireMessage) -> usize {
        let peers = match self.encode(message) {
            Some(frame) => self.peers.broadcast_all(&frame),
            None => 0,
        };
        self.resync_stale();
        peers
    }

    /// Forward an already-encoded frame to everyone but its sender.
    pub fn relay_to_others(&mut self, origin: &PeerId, frame: &Arc<str>) -> usize {
        let peers = self.peers.broadcast_except(origin, frame);
        self.resync_stale();
        peers
    }

    /// Overwrite the peer's view with the authoritative page.
    pub fn send_full_sync(&mut self, peer_id: &PeerId) -> bool {
        let message = WireMessage::full_sync(&self.document);
        match self.encode(&message) {
            Some(frame) => self.peers.resync(peer_id, &frame),
            None => false,
        }
    }

    /// Push a full sync to every peer that missed a frame. Peers whose
    /// outbox is still full stay stale for the next attempt.
    pub fn resync_stale(&mut self) -> usize {
        let stale = self.peers.stale_peers();
        if stale.is_empty() {
            return 0;
        }
        let Some(frame) = self.encode(&WireMessage::full_sync(&self.document)) else {
            return 0;
        };
        let resynced = stale
            .iter()
            .filter(|peer_id| self.peers.resync(peer_id, &frame))
            .count();
        if resynced > 0 {
            debug!("Resynced {resynced} lagging peers on page {}", self.page_id());
        }
        resynced
    }
}

/// One open page shared by its connections.
pub struct Session {
    page_id: Uuid,
    page: Mutex<ActivePage>,
    context: DispatchContext,
}

impl Session {
    pub fn new(page: StoredPage, max_peers: usize, context: DispatchContext) -> Self {
        Self {
            page_id: page.page_id(),
            page: Mutex::new(ActivePage::new(page, max_peers)),
            context,
        }
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }

    /// Lock the page for direct access.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ActivePage> {
        self.page.lock().await
    }

    /// Full sync for `peer_id` if it missed a frame. Called once its
    /// outbox has drained.
    pub async fn resync_if_stale(&self, peer_id: &PeerId) -> bool {
        let mut page = self.page.lock().await;
        page.peers().is_stale(peer_id) && page.send_full_sync(peer_id)
    }

    /// Dispatch one text frame from `origin`.
    ///
    /// A rejected request leaves the page untouched and the requester is
    /// answered with a full sync.
    pub async fn handle_text(&self, origin: PeerId, text: &str) -> Result<Dispatched, DispatchError> {
        let mut page = self.page.lock().await;
        let result = dispatcher::dispatch(&mut page, &origin, text, &self.context);
        if let Err(e) = &result {
            warn!(
                "Rejected request from {origin} on page {}: {e}, forcing full sync",
                self.page_id
            );
            page.send_full_sync(&origin);
        }
        result
    }
}

/// Tunables for sessions created by a registry.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_peers_per_session: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers_per_session: 100,
        }
    }
}

type OpenResult = Result<Arc<Session>, StoreError>;

/// Page id → open session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    opening: InFlight<Uuid, OpenResult>,
    store: Arc<dyn PageStore>,
    clock: Arc<dyn Clock>,
    renames: broadcast::Sender<PageRenamed>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn PageStore>, clock: Arc<dyn Clock>, config: SessionConfig) -> Arc<Self> {
        let (renames, _) = broadcast::channel(RENAME_CHANNEL_CAPACITY);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            opening: InFlight::new(),
            store,
            clock,
            renames,
            config,
        })
    }

    /// Receive `PageRenamed` events from every session.
    pub fn subscribe_renames(&self) -> broadcast::Receiver<PageRenamed> {
        self.renames.subscribe()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, page_id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(page_id).cloned()
    }

    /// Open a page session, loading it from the store on first use.
    ///
    /// Concurrent opens of the same page share a single load.
    pub async fn open(self: &Arc<Self>, page_id: Uuid) -> OpenResult {
        if let Some(session) = self.get(&page_id).await {
            return Ok(session);
        }
        let this = Arc::clone(self);
        self.opening
            .run(page_id, move || async move { this.load_session(page_id).await })
            .await
    }

    async fn load_session(self: Arc<Self>, page_id: Uuid) -> OpenResult {
        if let Some(session) = self.get(&page_id).await {
            return Ok(session);
        }

        let store = Arc::clone(&self.store);
        let page = tokio::task::spawn_blocking(move || store.load_or_create(page_id))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
            .inspect_err(|e| error!("Failed to open page {page_id}: {e}"))?;

        let context = DispatchContext {
            clock: Arc::clone(&self.clock),
            renames: self.renames.clone(),
        };
        let session = Arc::new(Session::new(page, self.config.max_peers_per_session, context));
        self.sessions.write().await.insert(page_id, Arc::clone(&session));
        info!("Opened session for page {page_id}");
        Ok(session)
    }

    /// Attach a peer to a page, opening the session if needed.
    ///
    /// The peer is pushed `initial_page_data` before this returns.
    pub async fn join(self: &Arc<Self>, page_id: Uuid, peer_id: PeerId, outbox: Outbox) -> Result<Arc<Session>, JoinError> {
        loop {
            let session = self.open(page_id).await?;
            let joined = {
                let mut page = session.lock().await;
                if page.is_closed() {
                    None
                } else {
                    Some(page.connect(peer_id, outbox.clone()))
                }
            };
            match joined {
                Some(true) => {
                    info!("Peer {peer_id} joined page {page_id}");
                    return Ok(session);
                }
                Some(false) => {
                    return Err(JoinError::Full {
                        page_id,
                        max: self.config.max_peers_per_session,
                    })
                }
                // Closed under us by the last leaver; reopen from the store.
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Detach a peer. The last peer out saves the page and closes the session.
    pub async fn leave(&self, session: &Arc<Session>, peer_id: &PeerId) {
        let page_id = session.page_id();
        let mut page = session.lock().await;
        if !page.disconnect(peer_id) {
            debug!("Peer {peer_id} left page {page_id}");
            return;
        }

        page.closed = true;
        if let Some(stored) = page.take_dirty() {
            if let Err(e) = self.save(stored).await {
                error!("Failed to save page {page_id} on close: {e}");
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions.get(&page_id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&page_id);
        }
        info!("Peer {peer_id} left page {page_id}, session closed");
    }

    /// Save every dirty page. Returns how many were written.
    pub async fn flush_dirty(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut saved = 0;
        for session in sessions {
            let stored = {
                let mut page = session.lock().await;
                if page.is_closed() {
                    continue;
                }
                page.take_dirty()
            };
            let Some(stored) = stored else {
                continue;
            };
            match self.save(stored).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    error!("Failed to flush page {}: {e}", session.page_id());
                    session.lock().await.mark_dirty();
                }
            }
        }
        if saved > 0 {
            debug!("Flushed {saved} dirty pages");
        }
        saved
    }

    async fn save(&self, page: StoredPage) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&page))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }
}

/// A channel-backed peer, for driving sessions without a socket.
pub fn outbox(capacity: usize) -> (Outbox, mpsc::Receiver<Arc<str>>) {
    mpsc::channel(capacity.max(1))
}
