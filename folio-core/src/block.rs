//! Block tree primitives.
//!
//! A page is split into two parallel halves that share block ids:
//!
//! ```text
//! StructureNode (root, no id)          ContentMap
//! ├── "a"                              "a" → { type: "text", ... }
//! │   └── "a1"                         "a1" → { type: "math", ... }
//! └── "b"                              "b" → { type: "image", ... }
//! ```
//!
//! The structure tree owns ordering and nesting; the content map owns the
//! per-block payload. Every id in the tree has at most one content record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Globally unique block identifier.
pub type BlockId = String;

/// Arbitrary key/value payload of a single block.
pub type Content = Map<String, Value>;

/// Block id → content record. Ordered so serialization is canonical.
pub type ContentMap = BTreeMap<BlockId, Content>;

/// Generate a fresh block id (UUID v4, hyphenated).
pub fn new_block_id() -> BlockId {
    Uuid::new_v4().to_string()
}

/// Merge `patch` over `base`, field by field.
pub fn merge_content(base: &Content, patch: &Content) -> Content {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// One node of the structure tree.
///
/// The root node has no `block_id`. Empty child lists are omitted when
/// serialized so that "no children" has exactly one representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<BlockId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    /// An empty root.
    pub fn root() -> Self {
        Self::default()
    }

    /// A root holding the given top-level nodes.
    pub fn root_with(children: Vec<StructureNode>) -> Self {
        Self {
            block_id: None,
            children,
        }
    }

    /// A block with no children.
    pub fn leaf(block_id: impl Into<BlockId>) -> Self {
        Self {
            block_id: Some(block_id.into()),
            children: Vec::new(),
        }
    }

    /// A block with the given children.
    pub fn node(block_id: impl Into<BlockId>, children: Vec<StructureNode>) -> Self {
        Self {
            block_id: Some(block_id.into()),
            children,
        }
    }

    pub fn is_root(&self) -> bool {
        self.block_id.is_none()
    }

    pub fn id(&self) -> Option<&str> {
        self.block_id.as_deref()
    }

    /// Pre-order ids of this node (if it has one) and all descendants.
    pub fn collect_ids(&self, out: &mut Vec<BlockId>) {
        if let Some(id) = &self.block_id {
            out.push(id.clone());
        }
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    /// Number of identified nodes in this subtree.
    pub fn len(&self) -> usize {
        let own = usize::from(self.block_id.is_some());
        own + self.children.iter().map(StructureNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a new block lands relative to its adjacent block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sibling immediately before the adjacent block.
    Before,
    /// Sibling immediately after the adjacent block.
    #[default]
    After,
    /// Last child of the adjacent block.
    Inside,
}

/// A detached subtree that carries its own content.
///
/// Segments are what delete captures and what clone produces; placing one
/// back into a page restores both structure and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub block_id: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Segment>,
}

impl Segment {
    /// Pre-order ids of every block in the segment.
    pub fn ids(&self) -> Vec<BlockId> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, out: &mut Vec<BlockId>) {
        out.push(self.block_id.clone());
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    /// Split into a structure node, writing content records into `content`.
    pub(crate) fn split_into(&self, content: &mut ContentMap) -> StructureNode {
        if let Some(data) = &self.content {
            content.insert(self.block_id.clone(), data.clone());
        }
        StructureNode {
            block_id: Some(self.block_id.clone()),
            children: self
                .children
                .iter()
                .map(|child| child.split_into(content))
                .collect(),
        }
    }
}

/// A segment together with the position it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentLocation {
    pub segment: Segment,
    /// `None` when the segment sat directly under the root.
    #[serde(default)]
    pub parent_block_id: Option<BlockId>,
    pub index: usize,
}
