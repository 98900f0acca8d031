//! Side table for local, per-block rendering handles.
//!
//! Handles (widget references, update callbacks) belong to the process that
//! renders a page. Keeping them here instead of in the content record means
//! they never reach the wire, the hash or the store.

use std::collections::{HashMap, HashSet};

use crate::block::BlockId;
use crate::document::DocumentState;

#[derive(Debug)]
pub struct HandleTable<H> {
    handles: HashMap<BlockId, H>,
}

impl<H> Default for HandleTable<H> {
    fn default() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }
}

impl<H> HandleTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a handle, returning the one it replaced.
    pub fn attach(&mut self, block_id: impl Into<BlockId>, handle: H) -> Option<H> {
        self.handles.insert(block_id.into(), handle)
    }

    pub fn get(&self, block_id: &str) -> Option<&H> {
        self.handles.get(block_id)
    }

    pub fn get_mut(&mut self, block_id: &str) -> Option<&mut H> {
        self.handles.get_mut(block_id)
    }

    pub fn detach(&mut self, block_id: &str) -> Option<H> {
        self.handles.remove(block_id)
    }

    /// Drop handles whose blocks are gone from `state`, returning them.
    pub fn retain_live(&mut self, state: &DocumentState) -> Vec<(BlockId, H)> {
        let live: HashSet<BlockId> = state.block_ids().into_iter().collect();
        let dead: Vec<BlockId> = self
            .handles
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        dead.into_iter()
            .filter_map(|id| self.handles.remove_entry(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}
