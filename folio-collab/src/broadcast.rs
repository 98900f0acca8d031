//! Per-page fan-out to connected peers with bounded outboxes.
//!
//! Each peer owns a bounded FIFO outbox drained by its connection task, so
//! frames from one sender always reach a given peer in order.
//!
//! ```text
//!                    ┌──► outbox A ──► ws A
//! broadcast_except ──┼──► outbox B ──► ws B     (origin C skipped)
//!                    └──x outbox D  full: frame dropped, D marked stale
//! ```
//!
//! A full outbox drops the frame instead of stalling the page. The peer is
//! then marked stale and skipped by later fan-outs until the page hands it
//! a fresh full sync through [`BroadcastGroup::resync`]. A closed outbox
//! means the connection is gone and the peer is removed.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

pub type PeerId = Uuid;

/// Sending half of a peer's outbox.
pub type Outbox = mpsc::Sender<Arc<str>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub peers_removed: u64,
    pub active_peers: usize,
}

#[derive(Debug)]
struct Peer {
    id: PeerId,
    outbox: Outbox,
    /// Missed at least one frame since its last full page.
    stale: bool,
}

/// The connected peers of one page.
#[derive(Debug)]
pub struct BroadcastGroup {
    peers: Vec<Peer>,
    max_peers: usize,
    messages_sent: u64,
    messages_dropped: u64,
    peers_removed: u64,
}

impl BroadcastGroup {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Vec::new(),
            max_peers,
            messages_sent: 0,
            messages_dropped: 0,
            peers_removed: 0,
        }
    }

    /// Register a peer. Returns `false` when the group is full or the id is taken.
    pub fn add_peer(&mut self, peer_id: PeerId, outbox: Outbox) -> bool {
        self.prune_closed();
        if self.peers.len() >= self.max_peers || self.has_peer(&peer_id) {
            return false;
        }
        self.peers.push(Peer {
            id: peer_id,
            outbox,
            stale: false,
        });
        true
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|peer| peer.id != *peer_id);
        before != self.peers.len()
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.position(peer_id).is_some()
    }

    /// Whether the peer has missed a frame and awaits a full sync.
    pub fn is_stale(&self, peer_id: &PeerId) -> bool {
        self.position(peer_id).is_some_and(|index| self.peers[index].stale)
    }

    pub fn stale_peers(&self) -> Vec<PeerId> {
        self.peers.iter().filter(|peer| peer.stale).map(|peer| peer.id).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peer ids in join order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|peer| peer.id).collect()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Send to every peer except `origin`. Returns how many accepted the frame.
    pub fn broadcast_except(&mut self, origin: &PeerId, frame: &Arc<str>) -> usize {
        self.fan_out(Some(origin), frame)
    }

    /// Send to every peer, the originator included.
    pub fn broadcast_all(&mut self, frame: &Arc<str>) -> usize {
        self.fan_out(None, frame)
    }

    /// Send to a single peer.
    pub fn send_to(&mut self, peer_id: &PeerId, frame: &Arc<str>) -> bool {
        let Some(index) = self.position(peer_id) else {
            debug!("Peer {peer_id} not in group, dropping direct frame");
            return false;
        };
        let delivered = self.deliver(index, frame);
        self.prune_closed();
        delivered
    }

    /// Send a frame carrying the whole page. Once accepted the peer is no
    /// longer stale.
    pub fn resync(&mut self, peer_id: &PeerId, frame: &Arc<str>) -> bool {
        let Some(index) = self.position(peer_id) else {
            debug!("Peer {peer_id} not in group, dropping resync");
            return false;
        };
        let delivered = self.deliver(index, frame);
        if delivered {
            self.peers[index].stale = false;
        }
        self.prune_closed();
        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            peers_removed: self.peers_removed,
            active_peers: self.peers.len(),
        }
    }

    fn fan_out(&mut self, skip: Option<&PeerId>, frame: &Arc<str>) -> usize {
        self.prune_closed();
        let mut delivered = 0;
        for index in 0..self.peers.len() {
            let peer = &self.peers[index];
            if Some(&peer.id) == skip {
                continue;
            }
            if peer.stale {
                // Its pending full sync will cover this frame.
                self.messages_dropped += 1;
                continue;
            }
            if self.deliver(index, frame) {
                delivered += 1;
            }
        }
        self.prune_closed();
        delivered
    }

    fn position(&self, peer_id: &PeerId) -> Option<usize> {
        self.peers.iter().position(|peer| peer.id == *peer_id)
    }

    fn deliver(&mut self, index: usize, frame: &Arc<str>) -> bool {
        let peer = &mut self.peers[index];
        match peer.outbox.try_send(Arc::clone(frame)) {
            Ok(()) => {
                self.messages_sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                if !peer.stale {
                    warn!("Outbox of peer {} is full, dropping frame until it resyncs", peer.id);
                }
                peer.stale = true;
                self.messages_dropped += 1;
                false
            }
            // Pruned right after the fan-out.
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn prune_closed(&mut self) {
        let before = self.peers.len();
        self.peers.retain(|peer| {
            let open = !peer.outbox.is_closed();
            if !open {
                debug!("Removing peer {} with closed outbox", peer.id);
            }
            open
        });
        self.peers_removed += (before - self.peers.len()) as u64;
    }
}
