//! # folio-collab: Real-time page collaboration for Folio
//!
//! Serves pages over WebSocket: the server owns the authoritative
//! [`folio_core::DocumentState`] of each open page and relays every change
//! to the other peers together with a consistency hash.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────┐
//! │ SyncClient  │ ◄──────────────► │ SyncServer   │
//! │ (per user)  │   JSON frames    │ (central)    │
//! └──────┬──────┘                  └──────┬───────┘
//!        │                                │
//!        ▼                                ▼
//! ┌─────────────┐                  ┌──────────────┐      ┌───────────┐
//! │ LocalMirror │                  │ Session      │ ───► │ PageStore │
//! │ (replica)   │                  │ (authority)  │      └───────────┘
//! └─────────────┘                  └──────┬───────┘
//!                                         │
//!                                 ┌───────┴────────┐
//!                                 │ BroadcastGroup │
//!                                 │ (fan-out)      │
//!                                 └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and frame decoding
//! - [`broadcast`]: Per-page fan-out over bounded outboxes
//! - [`dispatcher`]: Validates and applies inbound messages
//! - [`session`]: Open pages, their peers and persistence hooks
//! - [`mirror`]: Client-side replica with hash checking
//! - [`store`]: Page persistence (memory or LZ4 snapshots)
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod broadcast;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod inflight;
pub mod mirror;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbox, PeerId};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use dispatcher::{dispatch, DispatchContext, Dispatched};
pub use error::{ClientError, DispatchError, JoinError, ProtocolError, StoreError};
pub use inflight::InFlight;
pub use mirror::{LocalMirror, MirrorOutcome};
pub use protocol::{Frame, HistoryAction, WireMessage};
pub use server::{page_id_from_path, ServerConfig, ServerStats, SyncServer};
pub use session::{outbox, ActivePage, PageRenamed, Session, SessionConfig, SessionRegistry};
pub use store::{MemoryStore, PageStore, SnapshotStore, StoredPage, DEFAULT_PAGE_NAME};
