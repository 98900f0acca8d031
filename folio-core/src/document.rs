//! Mutable page state: structure tree, content map and undo history.
//!
//! `DocumentState` exposes the block-level primitives operations are built
//! from (insert / delete / move / find / segment) and owns the bounded
//! history and redo stacks.
//!
//! Lookups that miss are logged and treated as no-ops: a missing block is
//! almost always a concurrent delete that raced the request, not a bug in
//! the caller.

use std::collections::{HashSet, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::block::{
    new_block_id, BlockId, Content, ContentMap, Direction, Segment, SegmentLocation,
    StructureNode,
};
use crate::hash::consistency_hash;
use crate::operation::Operation;

/// Maximum number of undoable operations kept per page.
pub const HISTORY_LIMIT: usize = 50;

/// Two edits of the same block closer than this are undone together.
pub const EDIT_MERGE_WINDOW_MS: u64 = 1000;

/// Serializable copy of a page's structure and content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub structure: StructureNode,
    pub content: ContentMap,
}

/// Result of locating a block in the structure tree.
#[derive(Debug, Clone, Copy)]
pub struct Found<'a> {
    pub node: &'a StructureNode,
    pub parent: &'a StructureNode,
    pub index: usize,
}

impl<'a> Found<'a> {
    /// Id of the parent block, `None` for top-level blocks.
    pub fn parent_id(&self) -> Option<&'a str> {
        self.parent.id()
    }
}

/// The live, mutable state of one page.
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    pub(crate) structure: StructureNode,
    pub(crate) content: ContentMap,
    track_history: bool,
    history: VecDeque<Operation>,
    redo: Vec<Operation>,
}

impl DocumentState {
    /// State without history tracking (replicas, local mirrors).
    pub fn new(structure: StructureNode, content: ContentMap) -> Self {
        Self {
            structure,
            content,
            ..Self::default()
        }
    }

    /// State that records performed operations for undo/redo.
    pub fn with_history(structure: StructureNode, content: ContentMap) -> Self {
        Self {
            track_history: true,
            ..Self::new(structure, content)
        }
    }

    pub fn from_snapshot(snapshot: PageSnapshot, track_history: bool) -> Self {
        Self {
            track_history,
            ..Self::new(snapshot.structure, snapshot.content)
        }
    }

    // ─── Operations & history ─────────────────────────────────────────

    /// Apply an operation and, when tracking, record it for undo.
    ///
    /// Consecutive edits of the same block inside [`EDIT_MERGE_WINDOW_MS`]
    /// collapse into the existing history entry, keeping its first
    /// "before" snapshot. Merging does not touch the redo stack.
    ///
    /// Returns the history entry now holding the operation, `None` when
    /// history is not tracked or the page refused the operation. A refused
    /// operation is never recorded, so undo cannot revert what it never did.
    pub fn perform_operation(&mut self, mut operation: Operation) -> Option<&Operation> {
        if !operation.apply(self) {
            warn!("Page refused {} operation, not recording it", operation.kind());
            return None;
        }
        if !self.track_history {
            return None;
        }

        let merges = matches!(
            (&operation, self.history.back()),
            (Operation::Edit(incoming), Some(Operation::Edit(top)))
                if top.block_id == incoming.block_id
                    && top.timestamp.abs_diff(incoming.timestamp) < EDIT_MERGE_WINDOW_MS
        );

        if merges {
            if let (Operation::Edit(incoming), Some(Operation::Edit(top))) =
                (&operation, self.history.back_mut())
            {
                top.absorb(incoming);
            }
        } else {
            self.history.push_back(operation);
            if self.history.len() > HISTORY_LIMIT {
                self.history.pop_front();
            }
            self.redo.clear();
        }
        self.history.back()
    }

    /// Revert the most recent operation. `None` when there is nothing to undo.
    pub fn undo(&mut self) -> Option<Operation> {
        if !self.track_history {
            return None;
        }
        let operation = self.history.pop_back()?;
        operation.revert(self);
        self.redo.push(operation.clone());
        Some(operation)
    }

    /// Re-apply the most recently undone operation.
    pub fn redo(&mut self) -> Option<Operation> {
        if !self.track_history {
            return None;
        }
        let Some(mut operation) = self.redo.pop() else {
            debug!("No operation to redo");
            return None;
        };
        if !operation.apply(self) {
            warn!("Redo of {} no longer applies, dropping it", operation.kind());
            return None;
        }
        self.history.push_back(operation.clone());
        Some(operation)
    }

    pub fn is_tracking_history(&self) -> bool {
        self.track_history
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn can_undo(&self) -> bool {
        self.track_history && !self.history.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        self.track_history && !self.redo.is_empty()
    }

    /// Most recent history entry.
    pub fn last_operation(&self) -> Option<&Operation> {
        self.history.back()
    }

    /// Overwrite structure and content wholesale.
    ///
    /// A full overwrite has no inverse, so both stacks are discarded.
    pub fn apply_full_sync(&mut self, structure: StructureNode, content: ContentMap) {
        if self.track_history {
            warn!(
                "Full sync is incompatible with history tracking, discarding {} undo entries",
                self.history.len()
            );
        }
        self.history.clear();
        self.redo.clear();
        self.structure = structure;
        self.content = content;
    }

    // ─── Read access ──────────────────────────────────────────────────

    pub fn structure(&self) -> &StructureNode {
        &self.structure
    }

    pub fn content(&self) -> &ContentMap {
        &self.content
    }

    pub fn content_of(&self, block_id: &str) -> Option<&Content> {
        self.content.get(block_id)
    }

    pub fn snapshot(&self) -> PageSnapshot {
        PageSnapshot {
            structure: self.structure.clone(),
            content: self.content.clone(),
        }
    }

    /// Fingerprint of the current content and structure.
    pub fn consistency_hash(&self) -> u32 {
        consistency_hash(&self.content, &self.structure)
    }

    /// Every block id in the tree, pre-order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids = Vec::new();
        self.structure.collect_ids(&mut ids);
        ids
    }

    pub fn contains_block(&self, block_id: &str) -> bool {
        self.path_to(block_id).is_some()
    }

    /// Children of a block, or of the root when `block_id` is `None`.
    /// Unknown blocks have no children.
    pub fn children(&self, block_id: Option<&str>) -> &[StructureNode] {
        match block_id {
            None => &self.structure.children,
            Some(id) => self
                .find(id)
                .map(|found| found.node.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    pub fn has_children(&self, block_id: &str) -> bool {
        !self.children(Some(block_id)).is_empty()
    }

    pub fn find(&self, block_id: &str) -> Option<Found<'_>> {
        let path = self.path_to(block_id)?;
        let (&index, parent_path) = path.split_last()?;
        let parent = self.node_at(parent_path);
        Some(Found {
            node: &parent.children[index],
            parent,
            index,
        })
    }

    /// Parent node of a block (the root for top-level blocks).
    pub fn parent_of(&self, block_id: &str) -> Option<&StructureNode> {
        self.find(block_id).map(|found| found.parent)
    }

    // ─── Tree primitives ──────────────────────────────────────────────

    /// Insert a new leaf block with its content.
    ///
    /// Without an adjacent block the new block becomes the first child of
    /// the root. Returns `false` (and writes nothing) when the adjacent
    /// block is missing or the new id already exists.
    pub fn insert_block(
        &mut self,
        adjacent: Option<&str>,
        new_block_id: BlockId,
        data: Content,
        direction: Direction,
    ) -> bool {
        if self.contains_block(&new_block_id) {
            warn!("Block {new_block_id} already exists, skipping insert");
            return false;
        }
        if !self.insert_node(adjacent, StructureNode::leaf(new_block_id.clone()), direction) {
            return false;
        }
        self.content.insert(new_block_id, data);
        true
    }

    /// Remove a block and its whole subtree, purging their content.
    pub fn delete_block(&mut self, block_id: &str) -> Option<StructureNode> {
        let Some(path) = self.path_to(block_id) else {
            warn!("Block {block_id} not found for delete");
            return None;
        };
        let (&index, parent_path) = path.split_last()?;
        let removed = self.node_at_mut(parent_path).children.remove(index);

        let mut ids = Vec::new();
        removed.collect_ids(&mut ids);
        for id in &ids {
            self.content.remove(id);
        }
        Some(removed)
    }

    /// Move a block (with its subtree) next to or into `target`.
    ///
    /// Content is untouched. Moving a block into its own subtree is refused.
    pub fn move_block(&mut self, block_id: &str, target: Option<&str>, direction: Direction) -> bool {
        let Some(found) = self.find(block_id) else {
            warn!("Block {block_id} not found for move");
            return false;
        };
        if let Some(target) = target {
            let mut subtree = Vec::new();
            found.node.collect_ids(&mut subtree);
            if subtree.iter().any(|id| id == target) {
                warn!("Cannot move block {block_id} relative to its own subtree");
                return false;
            }
            if !self.contains_block(target) {
                warn!("Move target {target} not found");
                return false;
            }
        }

        let Some(path) = self.path_to(block_id) else {
            return false;
        };
        let Some((&index, parent_path)) = path.split_last() else {
            return false;
        };
        let node = self.node_at_mut(parent_path).children.remove(index);
        self.insert_node(target, node, direction)
    }

    /// Copy a block's subtree together with its content.
    ///
    /// With `fresh_ids` every node in the copy gets a newly generated id.
    pub fn segment(&self, block_id: &str, fresh_ids: bool) -> Option<SegmentLocation> {
        let Some(found) = self.find(block_id) else {
            warn!("Block {block_id} not found in structure for segment");
            return None;
        };
        Some(SegmentLocation {
            segment: self.build_segment(found.node, fresh_ids),
            parent_block_id: found.parent.block_id.clone(),
            index: found.index,
        })
    }

    /// Place a segment under `parent` (root when `None` or missing) at `index`.
    ///
    /// Refuses segments whose blocks are already present, so replaying a
    /// placement is harmless.
    pub fn place_segment(&mut self, segment: &Segment, parent: Option<&str>, index: usize) -> bool {
        let present: HashSet<BlockId> = self.block_ids().into_iter().collect();
        if let Some(existing) = segment.ids().into_iter().find(|id| present.contains(id)) {
            warn!("Segment block {existing} is already placed, skipping");
            return false;
        }

        let parent_path = match parent {
            None => Vec::new(),
            Some(parent_id) => self.path_to(parent_id).unwrap_or_else(|| {
                warn!("Segment parent {parent_id} not found, placing under root");
                Vec::new()
            }),
        };

        let node = segment.split_into(&mut self.content);
        let children = &mut self.node_at_mut(&parent_path).children;
        let index = index.min(children.len());
        children.insert(index, node);
        true
    }

    /// Drop content records no longer referenced by the tree.
    pub fn purge_orphans(&mut self) -> ContentMap {
        let live: HashSet<BlockId> = self.block_ids().into_iter().collect();
        let orphaned: Vec<BlockId> = self
            .content
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        orphaned
            .into_iter()
            .filter_map(|id| self.content.remove_entry(&id))
            .collect()
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn insert_node(&mut self, adjacent: Option<&str>, node: StructureNode, direction: Direction) -> bool {
        let Some(adjacent) = adjacent else {
            self.structure.children.insert(0, node);
            return true;
        };
        let Some(path) = self.path_to(adjacent) else {
            warn!("Adjacent block {adjacent} not found for insert");
            return false;
        };
        let Some((&index, parent_path)) = path.split_last() else {
            return false;
        };

        match direction {
            Direction::Before => self.node_at_mut(parent_path).children.insert(index, node),
            Direction::After => self.node_at_mut(parent_path).children.insert(index + 1, node),
            Direction::Inside => self.node_at_mut(&path).children.push(node),
        }
        true
    }

    fn build_segment(&self, node: &StructureNode, fresh_ids: bool) -> Segment {
        let id = node.id().unwrap_or_default();
        Segment {
            block_id: if fresh_ids { new_block_id() } else { id.to_owned() },
            content: self.content.get(id).cloned(),
            children: node
                .children
                .iter()
                .map(|child| self.build_segment(child, fresh_ids))
                .collect(),
        }
    }

    /// Child indices leading from the root to `block_id`.
    fn path_to(&self, block_id: &str) -> Option<Vec<usize>> {
        fn walk(node: &StructureNode, target: &str, path: &mut Vec<usize>) -> bool {
            for (i, child) in node.children.iter().enumerate() {
                path.push(i);
                if child.id() == Some(target) || walk(child, target, path) {
                    return true;
                }
                path.pop();
            }
            false
        }

        let mut path = Vec::new();
        walk(&self.structure, block_id, &mut path).then_some(path)
    }

    fn node_at(&self, path: &[usize]) -> &StructureNode {
        path.iter().fold(&self.structure, |node, &i| &node.children[i])
    }

    fn node_at_mut(&mut self, path: &[usize]) -> &mut StructureNode {
        let mut node = &mut self.structure;
        for &i in path {
            node = &mut node.children[i];
        }
        node
    }
}
