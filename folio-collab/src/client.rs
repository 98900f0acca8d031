//! WebSocket client for editing a page on the server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - A [`LocalMirror`] kept in step with the server
//! - Local edits applied immediately and sent as wire messages
//! - Automatic `needs_sync` when the mirror diverges

use std::sync::Arc;

use folio_core::{BlockId, Content, Direction, StructureNode};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{ClientError, ProtocolError};
use crate::mirror::{LocalMirror, MirrorOutcome};
use crate::protocol::{HistoryAction, WireMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial page data received
    Loaded,
    /// Page replaced by a full sync
    Resynced,
    /// A change from another peer (or an undo/redo) was applied
    RemoteChange(&'static str),
    /// Local page no longer matches the server; a sync was requested
    Diverged { expected: u32, actual: u32 },
    /// A server frame could not be applied; a sync was requested
    SyncRequested(String),
}

const CHANNEL_CAPACITY: usize = 256;

/// The page client.
pub struct SyncClient {
    /// Page being edited
    page_id: Uuid,

    /// Server URL without the page path
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local replica of the page
    mirror: Arc<Mutex<LocalMirror>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Writer task, which closes the socket once `outgoing_tx` is dropped
    writer: Option<JoinHandle<()>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(page_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            page_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            mirror: Arc::new(Mutex::new(LocalMirror::new())),
            outgoing_tx: None,
            writer: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// URL of this page's socket.
    pub fn page_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.page_id)
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing the socket. The page
    /// arrives as a [`SyncEvent::Loaded`] shortly after.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.page_url();
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: feed server frames to the mirror
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let mirror = self.mirror.clone();
        // Weak, so only `outgoing_tx` keeps the writer alive.
        let sync_tx = out_tx.downgrade();
        let page_id = self.page_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let outcome = mirror.lock().await.receive(text.as_str());
                        if outcome.wants_sync() {
                            log::info!("Requesting full sync of page {page_id}");
                            if let (Some(tx), Ok(request)) =
                                (sync_tx.upgrade(), WireMessage::NeedsSync.encode(None))
                            {
                                let _ = tx.send(request).await;
                            }
                        }
                        if let Some(event) = event_for(outcome) {
                            emit(&event_tx, event);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        });

        self.outgoing_tx = Some(out_tx);
        self.writer = Some(writer);
        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);
        log::info!("Connected to page {}", self.page_id);
        Ok(())
    }

    /// Close the connection. The mirror keeps its last state.
    ///
    /// Returns once the close frame has been written.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                log::warn!("Writer task for page {} failed: {e}", self.page_id);
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if *self.state.read().await == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    /// Send a message as-is.
    pub async fn send(&self, message: &WireMessage) -> Result<(), ProtocolError> {
        self.ensure_connected().await?;
        let text = message.encode(None)?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(text)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::NotConnected),
        }
    }

    pub async fn edit_block(&self, block_id: &str, content: Content) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let message = self.mirror.lock().await.edit_block(block_id, content)?;
        Ok(self.send(&message).await?)
    }

    /// Add a block and return its id.
    pub async fn insert_block(
        &self,
        adjacent: Option<&str>,
        content: Content,
        direction: Direction,
    ) -> Result<BlockId, ClientError> {
        self.ensure_connected().await?;
        let (block_id, message) = self
            .mirror
            .lock()
            .await
            .insert_block(adjacent, content, direction)?;
        self.send(&message).await?;
        Ok(block_id)
    }

    pub async fn delete_block(&self, block_id: &str) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let message = self.mirror.lock().await.delete_block(block_id)?;
        Ok(self.send(&message).await?)
    }

    /// Duplicate a block and return the copy's id.
    pub async fn clone_block(&self, source: &str) -> Result<BlockId, ClientError> {
        self.ensure_connected().await?;
        let (copy_id, message) = self.mirror.lock().await.clone_block(source)?;
        self.send(&message).await?;
        Ok(copy_id)
    }

    pub async fn replace_structure(&self, structure: StructureNode) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let message = self.mirror.lock().await.replace_structure(structure);
        Ok(self.send(&message).await?)
    }

    pub async fn rename(&self, name: &str) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let message = self.mirror.lock().await.rename(name)?;
        Ok(self.send(&message).await?)
    }

    /// Ask the server to undo the page's last change.
    pub async fn undo(&self) -> Result<(), ProtocolError> {
        let message = self.mirror.lock().await.request_history(HistoryAction::Undo);
        self.send(&message).await
    }

    pub async fn redo(&self) -> Result<(), ProtocolError> {
        let message = self.mirror.lock().await.request_history(HistoryAction::Redo);
        self.send(&message).await
    }

    pub async fn request_sync(&self) -> Result<(), ProtocolError> {
        self.send(&WireMessage::NeedsSync).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Shared handle to the local replica.
    pub fn mirror(&self) -> Arc<Mutex<LocalMirror>> {
        self.mirror.clone()
    }

    /// Consistency hash of the local replica.
    pub async fn hash(&self) -> u32 {
        self.mirror.lock().await.hash()
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn event_for(outcome: MirrorOutcome) -> Option<SyncEvent> {
    match outcome {
        MirrorOutcome::Loaded => Some(SyncEvent::Loaded),
        MirrorOutcome::Resynced => Some(SyncEvent::Resynced),
        MirrorOutcome::Applied(kind) => Some(SyncEvent::RemoteChange(kind)),
        MirrorOutcome::Diverged { expected, actual } => Some(SyncEvent::Diverged { expected, actual }),
        MirrorOutcome::NeedsSync(reason) => Some(SyncEvent::SyncRequested(reason)),
        MirrorOutcome::Ignored => None,
    }
}

fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if tx.try_send(event).is_err() {
        log::debug!("Event channel full or closed, dropping event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let page_id = Uuid::new_v4();
        let client = SyncClient::new(page_id, "ws://localhost:9090/");

        assert_eq!(client.page_id(), page_id);
        assert_eq!(client.server_url(), "ws://localhost:9090/");
        assert_eq!(client.page_url(), format!("ws://localhost:9090/{page_id}"));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!client.mirror().lock().await.is_loaded());
    }

    #[tokio::test]
    async fn test_edits_need_a_connection() {
        let client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.undo().await, Err(ProtocolError::NotConnected));
        assert_eq!(
            client.edit_block("b", Content::new()).await,
            Err(ClientError::Protocol(ProtocolError::NotConnected))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        // Port 9 (discard) is not serving WebSockets.
        let mut client = SyncClient::new(Uuid::new_v4(), "ws://127.0.0.1:9");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_outcome_events() {
        assert_eq!(event_for(MirrorOutcome::Ignored), None);
        assert_eq!(
            event_for(MirrorOutcome::Applied("block_change")),
            Some(SyncEvent::RemoteChange("block_change"))
        );
    }
}
