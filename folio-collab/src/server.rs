//! WebSocket server with one session per page.
//!
//! Architecture:
//! ```text
//! ws://host:port/<page-uuid>
//!
//! Client A ──┐                   ┌── DocumentState (authoritative)
//!            ├── Session(page) ──┼── BroadcastGroup ──► Client A, B, C
//! Client B ──┘                   └── metadata, dirty flag
//!                                        │
//!                                  flush task / last leave
//!                                        ▼
//!                                   PageStore (memory or snapshots)
//! ```
//!
//! Each connection gets a fresh peer id and a bounded outbox. The
//! connection task pumps inbound text frames into the session and drains
//! the outbox onto the socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use folio_core::MonotonicClock;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::{SessionConfig, SessionRegistry};
use crate::store::{MemoryStore, PageStore, SnapshotStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per page session
    pub max_peers_per_session: usize,
    /// Outbound frames buffered per peer before new ones are dropped
    pub outbox_capacity: usize,
    /// Seconds between flushes of dirty pages (0 disables the flush task)
    pub flush_interval_secs: u64,
    /// Snapshot directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_session: 100,
            outbox_capacity: 256,
            flush_interval_secs: 5,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_sessions: usize,
}

/// The page server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the snapshot directory when one is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn PageStore> = match &config.storage_path {
            Some(path) => {
                log::info!("Storing pages under {}", path.display());
                Arc::new(SnapshotStore::open(path)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PageStore>) -> Self {
        let session_config = SessionConfig {
            max_peers_per_session: config.max_peers_per_session,
        };
        let registry = SessionRegistry::new(store, Arc::new(MonotonicClock::new()), session_config);
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    /// Save every dirty page now.
    pub async fn flush(&self) -> usize {
        self.registry.flush_dirty().await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Page server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let flusher = self.spawn_flusher();
        let result = self.accept_loop(listener).await;
        if let Some(flusher) = flusher {
            flusher.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity.max(1);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, outbox_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_flusher(&self) -> Option<JoinHandle<()>> {
        if self.config.flush_interval_secs == 0 {
            return None;
        }
        let registry = self.registry.clone();
        let period = Duration::from_secs(self.config.flush_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.flush_dirty().await;
            }
        }))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        outbox_capacity: usize,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_owned();
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let Some(page_id) = page_id_from_path(&path) else {
            log::warn!("Rejecting {addr}: {path:?} does not name a page");
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };

        let peer_id = Uuid::new_v4();
        let (outbox, mut outbox_rx) = mpsc::channel::<Arc<str>>(outbox_capacity);
        let session = match registry.join(page_id, peer_id, outbox).await {
            Ok(session) => session,
            Err(e) => {
                ws_sender.send(Message::Close(None)).await?;
                return Err(e.into());
            }
        };
        log::info!("WebSocket connection from {addr} is peer {peer_id} on page {page_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            // Set when the outbox filled up, so frames may have been dropped.
            let mut backlogged = false;
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                if session.handle_text(peer_id, text.as_str()).await.is_err() {
                                    stats.write().await.rejected_messages += 1;
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                log::warn!("Ignoring {}-byte binary frame from {peer_id}", data.len());
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => return Err(e.into()),
                        }
                    }

                    frame = outbox_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                if outbox_rx.len() + 1 >= outbox_capacity {
                                    backlogged = true;
                                }
                                ws_sender.send(Message::Text((&*frame).into())).await?;
                                if backlogged && outbox_rx.is_empty() {
                                    backlogged = false;
                                    if session.resync_if_stale(&peer_id).await {
                                        log::info!("Sent full sync to lagging peer {peer_id}");
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        registry.leave(&session, &peer_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Peer {peer_id} disconnected from page {page_id}");
        result
    }
}

/// Page id named by a connection path such as `/3f2c…`.
pub fn page_id_from_path(path: &str) -> Option<Uuid> {
    let segment = path.trim_matches('/');
    if segment.is_empty() || segment.contains('/') {
        return None;
    }
    Uuid::parse_str(segment).ok()
}
