//! Reversible page operations.
//!
//! Every operation knows how to apply itself to a [`DocumentState`] and how
//! to revert what it applied. State needed for the revert (the block's old
//! fields, a deleted subtree, a replaced tree) is captured during `apply`
//! and travels with the operation when it is serialized, so a replica can
//! revert an operation it never applied itself.
//!
//! Wire form:
//!
//! ```text
//! { "kind": "delete_block", "data": { "blockId": "…", "deleted": { … } } }
//! ```

use std::mem;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::{BlockId, Content, ContentMap, Direction, SegmentLocation, StructureNode};
use crate::document::DocumentState;
use crate::error::OperationError;

pub const INSERT_BLOCK: &str = "insert_block";
pub const EDIT_BLOCK: &str = "edit_block";
pub const DELETE_BLOCK: &str = "delete_block";
pub const CLONE_BLOCK: &str = "clone_block";
pub const REPLACE_STRUCTURE: &str = "replace_structure";

/// A reversible edit of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SerializedOperation", into = "SerializedOperation")]
pub enum Operation {
    Insert(InsertBlock),
    Edit(EditBlock),
    Delete(DeleteBlock),
    Clone(CloneBlock),
    ReplaceStructure(ReplaceStructure),
}

/// Kind-tagged wire form of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedOperation {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertBlock {
    #[serde(default)]
    pub adjacent_block_id: Option<BlockId>,
    pub new_block_id: BlockId,
    #[serde(default)]
    pub block_data: Content,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBlock {
    pub block_id: BlockId,
    pub new_data: Content,
    /// Milliseconds since the Unix epoch, used for history merging.
    #[serde(default)]
    pub timestamp: u64,
    /// Full record as it was before the edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBlock {
    pub block_id: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<SegmentLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneBlock {
    pub source_block_id: BlockId,
    /// The copy, with fresh ids. Fixed on first apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<SegmentLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceStructure {
    pub new_structure: StructureNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_structure: Option<StructureNode>,
    /// Content dropped because its blocks left the tree.
    #[serde(default, skip_serializing_if = "ContentMap::is_empty")]
    pub orphaned: ContentMap,
}

impl Operation {
    pub fn insert(
        adjacent_block_id: Option<BlockId>,
        new_block_id: impl Into<BlockId>,
        block_data: Content,
        direction: Direction,
    ) -> Self {
        Self::Insert(InsertBlock {
            adjacent_block_id,
            new_block_id: new_block_id.into(),
            block_data,
            direction,
        })
    }

    pub fn edit(block_id: impl Into<BlockId>, new_data: Content, timestamp: u64) -> Self {
        Self::Edit(EditBlock {
            block_id: block_id.into(),
            new_data,
            timestamp,
            old_data: None,
        })
    }

    pub fn delete(block_id: impl Into<BlockId>) -> Self {
        Self::Delete(DeleteBlock {
            block_id: block_id.into(),
            deleted: None,
        })
    }

    pub fn clone_of(source_block_id: impl Into<BlockId>) -> Self {
        Self::Clone(CloneBlock {
            source_block_id: source_block_id.into(),
            copy: None,
        })
    }

    pub fn replace_structure(new_structure: StructureNode) -> Self {
        Self::ReplaceStructure(ReplaceStructure {
            new_structure,
            old_structure: None,
            orphaned: ContentMap::new(),
        })
    }

    /// Wire name of this operation's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => INSERT_BLOCK,
            Self::Edit(_) => EDIT_BLOCK,
            Self::Delete(_) => DELETE_BLOCK,
            Self::Clone(_) => CLONE_BLOCK,
            Self::ReplaceStructure(_) => REPLACE_STRUCTURE,
        }
    }

    /// The block this operation is about, if any.
    pub fn block_id(&self) -> Option<&str> {
        match self {
            Self::Insert(op) => Some(&op.new_block_id),
            Self::Edit(op) => Some(&op.block_id),
            Self::Delete(op) => Some(&op.block_id),
            Self::Clone(op) => Some(&op.source_block_id),
            Self::ReplaceStructure(_) => None,
        }
    }

    /// Apply to `state`, capturing whatever `revert` will need.
    ///
    /// Returns `false` when the page refused the operation and nothing
    /// was written. Such an operation must not be reverted.
    pub fn apply(&mut self, state: &mut DocumentState) -> bool {
        match self {
            Self::Insert(op) => op.apply(state),
            Self::Edit(op) => op.apply(state),
            Self::Delete(op) => op.apply(state),
            Self::Clone(op) => op.apply(state),
            Self::ReplaceStructure(op) => op.apply(state),
        }
    }

    /// Undo a previous `apply`.
    pub fn revert(&self, state: &mut DocumentState) {
        match self {
            Self::Insert(op) => op.revert(state),
            Self::Edit(op) => op.revert(state),
            Self::Delete(op) => op.revert(state),
            Self::Clone(op) => op.revert(state),
            Self::ReplaceStructure(op) => op.revert(state),
        }
    }

    pub fn to_serialized(&self) -> SerializedOperation {
        self.clone().into()
    }
}

impl InsertBlock {
    fn apply(&mut self, state: &mut DocumentState) -> bool {
        state.insert_block(
            self.adjacent_block_id.as_deref(),
            self.new_block_id.clone(),
            self.block_data.clone(),
            self.direction,
        )
    }

    fn revert(&self, state: &mut DocumentState) {
        state.delete_block(&self.new_block_id);
    }
}

impl EditBlock {
    fn apply(&mut self, state: &mut DocumentState) -> bool {
        let Some(current) = state.content.get_mut(&self.block_id) else {
            warn!("Block {} has no content to edit", self.block_id);
            return false;
        };
        self.old_data = Some(current.clone());
        for (key, value) in &self.new_data {
            current.insert(key.clone(), value.clone());
        }
        true
    }

    fn revert(&self, state: &mut DocumentState) {
        let Some(old) = &self.old_data else {
            warn!("Edit of {} was never applied, nothing to revert", self.block_id);
            return;
        };
        let Some(current) = state.content.get_mut(&self.block_id) else {
            warn!("Block {} has no content to restore", self.block_id);
            return;
        };
        for (key, value) in old {
            current.insert(key.clone(), value.clone());
        }
        for key in self.new_data.keys() {
            if !old.contains_key(key) {
                current.remove(key);
            }
        }
    }

    /// Fold a later edit of the same block into this one.
    ///
    /// The "before" snapshot and timestamp stay as they are. The later
    /// fields are merged over the earlier ones instead of replacing them,
    /// so a key set only by the earlier edit is still removed on undo and
    /// still written on redo.
    pub(crate) fn absorb(&mut self, later: &EditBlock) {
        for (key, value) in &later.new_data {
            self.new_data.insert(key.clone(), value.clone());
        }
    }
}

impl DeleteBlock {
    fn apply(&mut self, state: &mut DocumentState) -> bool {
        self.deleted = state.segment(&self.block_id, false);
        self.deleted.is_some() && state.delete_block(&self.block_id).is_some()
    }

    fn revert(&self, state: &mut DocumentState) {
        if let Some(location) = &self.deleted {
            state.place_segment(
                &location.segment,
                location.parent_block_id.as_deref(),
                location.index,
            );
        }
    }
}

impl CloneBlock {
    fn apply(&mut self, state: &mut DocumentState) -> bool {
        if self.copy.is_none() {
            self.copy = state.segment(&self.source_block_id, true);
        }
        // The copy takes the source's slot, pushing the source down by one.
        let Some(location) = &self.copy else {
            return false;
        };
        state.place_segment(
            &location.segment,
            location.parent_block_id.as_deref(),
            location.index,
        )
    }

    fn revert(&self, state: &mut DocumentState) {
        if let Some(location) = &self.copy {
            state.delete_block(&location.segment.block_id);
        }
    }

    /// Root id of the copy once applied.
    pub fn copy_id(&self) -> Option<&str> {
        self.copy.as_ref().map(|location| location.segment.block_id.as_str())
    }
}

impl ReplaceStructure {
    fn apply(&mut self, state: &mut DocumentState) -> bool {
        self.old_structure = Some(mem::replace(
            &mut state.structure,
            self.new_structure.clone(),
        ));
        self.orphaned = state.purge_orphans();
        true
    }

    fn revert(&self, state: &mut DocumentState) {
        let Some(old) = &self.old_structure else {
            warn!("Structure replacement was never applied, nothing to revert");
            return;
        };
        state.structure = old.clone();
        state
            .content
            .extend(self.orphaned.iter().map(|(id, record)| (id.clone(), record.clone())));
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, OperationError> {
    serde_json::from_value(data).map_err(|e| OperationError::Malformed {
        kind: kind.to_owned(),
        reason: e.to_string(),
    })
}

impl TryFrom<SerializedOperation> for Operation {
    type Error = OperationError;

    fn try_from(serialized: SerializedOperation) -> Result<Self, Self::Error> {
        let SerializedOperation { kind, data } = serialized;
        match kind.as_str() {
            INSERT_BLOCK => decode(&kind, data).map(Self::Insert),
            EDIT_BLOCK => decode(&kind, data).map(Self::Edit),
            DELETE_BLOCK => decode(&kind, data).map(Self::Delete),
            CLONE_BLOCK => decode(&kind, data).map(Self::Clone),
            REPLACE_STRUCTURE => decode(&kind, data).map(Self::ReplaceStructure),
            _ => Err(OperationError::UnknownKind(kind)),
        }
    }
}

impl From<Operation> for SerializedOperation {
    fn from(operation: Operation) -> Self {
        let kind = operation.kind().to_owned();
        let data = match operation {
            Operation::Insert(op) => serde_json::to_value(op),
            Operation::Edit(op) => serde_json::to_value(op),
            Operation::Delete(op) => serde_json::to_value(op),
            Operation::Clone(op) => serde_json::to_value(op),
            Operation::ReplaceStructure(op) => serde_json::to_value(op),
        }
        .unwrap_or_default();
        Self { kind, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Content {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn page() -> DocumentState {
        let structure = StructureNode::root_with(vec![
            StructureNode::node("list", vec![StructureNode::leaf("item")]),
            StructureNode::leaf("text"),
        ]);
        let content: ContentMap = [
            ("list", json!({"type": "list"})),
            ("item", json!({"type": "text", "textContent": "one"})),
            ("text", json!({"type": "text", "textContent": "hello"})),
        ]
        .into_iter()
        .map(|(id, value)| (id.to_string(), record(value)))
        .collect();
        DocumentState::with_history(structure, content)
    }

    #[test]
    fn test_wire_shape() {
        let op = Operation::edit("b1", record(json!({"textContent": "x"})), 42);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            json!({"kind": "edit_block", "data": {"blockId": "b1", "newData": {"textContent": "x"}, "timestamp": 42}})
        );

        let parsed: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Operation::try_from(SerializedOperation {
            kind: "explode_block".into(),
            data: json!({}),
        })
        .unwrap_err();
        assert_eq!(err, OperationError::UnknownKind("explode_block".into()));

        let result: Result<Operation, _> =
            serde_json::from_value(json!({"kind": "explode_block", "data": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_data_rejected() {
        let err = Operation::try_from(SerializedOperation {
            kind: DELETE_BLOCK.into(),
            data: json!({"nope": 1}),
        })
        .unwrap_err();
        assert!(matches!(err, OperationError::Malformed { ref kind, .. } if kind == DELETE_BLOCK));
    }

    #[test]
    fn test_edit_revert_restores_exact_record() {
        let mut state = page();
        let before = state.snapshot();
        let mut op = Operation::edit("text", record(json!({"textContent": "bye", "bold": true})), 1);
        op.apply(&mut state);
        assert_eq!(state.content_of("text").unwrap()["bold"], true);

        op.revert(&mut state);
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_edit_of_missing_block_is_noop() {
        let mut state = page();
        let before = state.snapshot();
        let mut op = Operation::edit("ghost", record(json!({"x": 1})), 1);
        op.apply(&mut state);
        op.revert(&mut state);
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_delete_revert_restores_subtree_in_place() {
        let mut state = page();
        let before = state.snapshot();
        let mut op = Operation::delete("list");
        op.apply(&mut state);
        assert_eq!(state.block_ids(), vec!["text"]);

        op.revert(&mut state);
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_clone_places_copy_before_source() {
        let mut state = page();
        let mut op = Operation::clone_of("list");
        op.apply(&mut state);

        let Operation::Clone(clone) = &op else { unreachable!() };
        let copy_id = clone.copy_id().unwrap().to_string();
        let top: Vec<_> = state.children(None).iter().filter_map(|n| n.id()).collect();
        assert_eq!(top, vec![copy_id.as_str(), "list", "text"]);
        assert_eq!(state.children(Some(&copy_id)).len(), 1);
        assert_eq!(state.content().len(), 5);

        op.revert(&mut state);
        assert_eq!(state.content().len(), 3);
        assert!(!state.contains_block(&copy_id));
    }

    #[test]
    fn test_serialized_clone_reproduces_same_ids_on_replica() {
        let mut origin = page();
        let mut replica = DocumentState::new(origin.structure().clone(), origin.content().clone());

        let mut op = Operation::clone_of("text");
        op.apply(&mut origin);

        let wire = serde_json::to_string(&op).unwrap();
        let mut received: Operation = serde_json::from_str(&wire).unwrap();
        received.apply(&mut replica);

        assert_eq!(origin.consistency_hash(), replica.consistency_hash());
    }

    #[test]
    fn test_replace_structure_restores_orphans() {
        let mut state = page();
        let before = state.snapshot();
        let mut op = Operation::replace_structure(StructureNode::root_with(vec![
            StructureNode::leaf("text"),
            StructureNode::leaf("item"),
        ]));
        op.apply(&mut state);
        assert!(state.content_of("list").is_none());

        let Operation::ReplaceStructure(replace) = &op else { unreachable!() };
        assert_eq!(replace.orphaned.keys().collect::<Vec<_>>(), vec!["list"]);

        op.revert(&mut state);
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_refused_operations_report_no_effect() {
        let mut state = page();
        let before = state.snapshot();

        let mut duplicate = Operation::insert(None, "text", Content::new(), Direction::After);
        assert!(!duplicate.apply(&mut state));
        assert!(!Operation::edit("ghost", Content::new(), 1).apply(&mut state));
        assert!(!Operation::delete("ghost").apply(&mut state));
        assert!(!Operation::clone_of("ghost").apply(&mut state));
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_clone_with_colliding_copy_refused() {
        let mut state = page();
        let before = state.snapshot();
        let wire = json!({
            "kind": "clone_block",
            "data": {
                "sourceBlockId": "text",
                "copy": {"segment": {"blockId": "list"}, "parentBlockId": null, "index": 0}
            }
        });
        let mut op: Operation = serde_json::from_value(wire).unwrap();
        assert!(!op.apply(&mut state));
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_insert_revert_removes_block() {
        let mut state = page();
        let before = state.snapshot();
        let mut op = Operation::insert(Some("item".into()), "new", record(json!({"type": "text"})), Direction::Before);
        op.apply(&mut state);
        let inner: Vec<_> = state.children(Some("list")).iter().filter_map(|n| n.id()).collect();
        assert_eq!(inner, vec!["new", "item"]);

        op.revert(&mut state);
        assert_eq!(state.snapshot(), before);
    }
}
