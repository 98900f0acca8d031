//! Client-side replica of a page.
//!
//! The mirror applies server frames to a local [`DocumentState`] (history
//! off; undo/redo is the server's business) and checks the page hash after
//! every structural frame. It knows nothing about transports: feed it text,
//! send whatever it hands back.
//!
//! ```text
//!   server frame ──► receive() ──► MirrorOutcome
//!                                   ├── Applied / Loaded / Resynced
//!                                   ├── Diverged      → send request_sync()
//!                                   └── NeedsSync     → send request_sync()
//!
//!   local edit ──► edit_block() etc. ──► applied locally, WireMessage out
//! ```

use std::sync::Arc;

use folio_core::metadata::validate_page_name;
use folio_core::{
    new_block_id, BlockId, Clock, Content, Direction, DocumentState, HandleTable, MonotonicClock,
    Operation, PageMetadata, StructureNode, ValidationError,
};
use log::{debug, warn};
use serde_json::{Map, Value};

use crate::protocol::{Frame, HistoryAction, WireMessage};

/// Result of feeding one server frame to the mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOutcome {
    /// First page data arrived.
    Loaded,
    /// Page overwritten by a full sync.
    Resynced,
    /// A change was applied and the hashes agree.
    Applied(&'static str),
    /// A change was applied but the hashes differ.
    Diverged { expected: u32, actual: u32 },
    /// Nothing for a client to do with this frame.
    Ignored,
    /// The frame could not be used; the page should be resynced.
    NeedsSync(String),
}

impl MirrorOutcome {
    /// Whether the caller should answer with `needs_sync`.
    pub fn wants_sync(&self) -> bool {
        matches!(self, Self::Diverged { .. } | Self::NeedsSync(_))
    }
}

/// A local replica of one page with a side table of presentation handles.
pub struct LocalMirror<H = ()> {
    document: DocumentState,
    metadata: Option<PageMetadata>,
    handles: HandleTable<H>,
    released: Vec<(BlockId, H)>,
    clock: Arc<dyn Clock>,
    loaded: bool,
}

impl<H> Default for LocalMirror<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> LocalMirror<H> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            document: DocumentState::new(StructureNode::root(), Default::default()),
            metadata: None,
            handles: HandleTable::new(),
            released: Vec::new(),
            clock,
            loaded: false,
        }
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn metadata(&self) -> Option<&PageMetadata> {
        self.metadata.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn hash(&self) -> u32 {
        self.document.consistency_hash()
    }

    pub fn handles(&self) -> &HandleTable<H> {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut HandleTable<H> {
        &mut self.handles
    }

    /// Handles whose blocks have left the page since the last call.
    pub fn take_released(&mut self) -> Vec<(BlockId, H)> {
        std::mem::take(&mut self.released)
    }

    fn prune_handles(&mut self) {
        let dropped = self.handles.retain_live(&self.document);
        self.released.extend(dropped);
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    /// Apply one frame from the server.
    pub fn receive(&mut self, text: &str) -> MirrorOutcome {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame from server: {e}");
                return MirrorOutcome::NeedsSync(e.to_string());
            }
        };
        let kind = frame.message.kind();
        match self.apply(frame.message) {
            Ok(Applied::Loaded) => MirrorOutcome::Loaded,
            Ok(Applied::Resynced) => MirrorOutcome::Resynced,
            Ok(Applied::Ignored) => MirrorOutcome::Ignored,
            Ok(Applied::Changed) => {
                self.prune_handles();
                self.check_hash(kind, frame.hash)
            }
            Err(reason) => {
                warn!("Cannot apply {kind} from server: {reason}");
                MirrorOutcome::NeedsSync(reason)
            }
        }
    }

    fn check_hash(&self, kind: &'static str, expected: Option<u32>) -> MirrorOutcome {
        let actual = self.hash();
        match expected {
            Some(expected) if expected != actual => {
                warn!("Page diverged after {kind}: server {expected:#010x}, local {actual:#010x}");
                MirrorOutcome::Diverged { expected, actual }
            }
            _ => MirrorOutcome::Applied(kind),
        }
    }

    fn apply(&mut self, message: WireMessage) -> Result<Applied, String> {
        match message {
            WireMessage::InitialPageData {
                metadata,
                structure,
                content,
            } => {
                self.document = DocumentState::new(structure, content);
                self.metadata = Some(metadata);
                self.loaded = true;
                self.prune_handles();
                Ok(Applied::Loaded)
            }

            WireMessage::FullSync { structure, content } => {
                let structure = need(structure, "structure")?;
                let content = need(content, "content")?;
                self.document.apply_full_sync(structure, content);
                self.prune_handles();
                Ok(Applied::Resynced)
            }

            WireMessage::BlockChange { block_id, content } => {
                let block_id = need(block_id, "blockId")?;
                let content = need(content, "content")?;
                self.known(&block_id)?;
                let now = self.clock.now_millis();
                self.document.perform_operation(Operation::edit(block_id, content, now));
                Ok(Applied::Changed)
            }

            WireMessage::BlockAddition {
                adjacent_block_id,
                new_block_id,
                content,
                direction,
            } => {
                let new_block_id = need(new_block_id, "newBlockId")?;
                let content = need(content, "content")?;
                self.document.perform_operation(Operation::insert(
                    adjacent_block_id,
                    new_block_id,
                    content,
                    direction.unwrap_or_default(),
                ));
                Ok(Applied::Changed)
            }

            WireMessage::BlockDeletion { block_id } => {
                let block_id = need(block_id, "blockId")?;
                self.known(&block_id)?;
                self.document.perform_operation(Operation::delete(block_id));
                Ok(Applied::Changed)
            }

            WireMessage::StructureChange { structure } => {
                let structure = need(structure, "structure")?;
                self.document
                    .perform_operation(Operation::replace_structure(structure));
                Ok(Applied::Changed)
            }

            WireMessage::Operation { operation_data } => {
                let data = need(operation_data, "operationData")?;
                let mut operation = Operation::try_from(data).map_err(|e| e.to_string())?;
                if !operation.apply(&mut self.document) {
                    return Err(format!("{} does not apply to this replica", operation.kind()));
                }
                Ok(Applied::Changed)
            }

            WireMessage::HistoryAction {
                action,
                operation_data,
            } => {
                let action = need(action, "action")?;
                let data = need(operation_data, "operationData")?;
                let mut operation = Operation::try_from(data).map_err(|e| e.to_string())?;
                match action {
                    HistoryAction::Undo => operation.revert(&mut self.document),
                    HistoryAction::Redo => {
                        if !operation.apply(&mut self.document) {
                            return Err(format!("redo of {} does not apply to this replica", operation.kind()));
                        }
                    }
                }
                Ok(Applied::Changed)
            }

            WireMessage::MetadataChange { metadata } => {
                let patch = need(metadata, "metadata")?;
                self.merge_metadata(patch)?;
                Ok(Applied::Changed)
            }

            other @ (WireMessage::NeedsSync | WireMessage::Unknown) => {
                debug!("Ignoring {} from server", other.kind());
                Ok(Applied::Ignored)
            }
        }
    }

    fn known(&self, block_id: &str) -> Result<(), String> {
        if self.document.contains_block(block_id) {
            Ok(())
        } else {
            Err(ValidationError::UnknownBlock(block_id.to_owned()).to_string())
        }
    }

    fn merge_metadata(&mut self, patch: Map<String, Value>) -> Result<(), String> {
        let mut merged = match &self.metadata {
            Some(current) => match serde_json::to_value(current).map_err(|e| e.to_string())? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        merged.extend(patch);
        let metadata = serde_json::from_value(Value::Object(merged)).map_err(|e| e.to_string())?;
        self.metadata = Some(metadata);
        Ok(())
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    /// Change fields of a block.
    pub fn edit_block(&mut self, block_id: &str, content: Content) -> Result<WireMessage, ValidationError> {
        self.require_block(block_id)?;
        let now = self.clock.now_millis();
        self.document
            .perform_operation(Operation::edit(block_id, content.clone(), now));
        Ok(WireMessage::BlockChange {
            block_id: Some(block_id.to_owned()),
            content: Some(content),
        })
    }

    /// Add a block next to (or inside) `adjacent`, or as the first block of
    /// the page when `adjacent` is `None`. Returns the new block's id.
    pub fn insert_block(
        &mut self,
        adjacent: Option<&str>,
        content: Content,
        direction: Direction,
    ) -> Result<(BlockId, WireMessage), ValidationError> {
        if let Some(adjacent) = adjacent {
            self.require_block(adjacent)?;
        }
        let block_id = new_block_id();
        self.document.perform_operation(Operation::insert(
            adjacent.map(str::to_owned),
            block_id.clone(),
            content.clone(),
            direction,
        ));
        let message = WireMessage::BlockAddition {
            adjacent_block_id: adjacent.map(str::to_owned),
            new_block_id: Some(block_id.clone()),
            content: Some(content),
            direction: Some(direction),
        };
        Ok((block_id, message))
    }

    pub fn delete_block(&mut self, block_id: &str) -> Result<WireMessage, ValidationError> {
        self.require_block(block_id)?;
        self.document.perform_operation(Operation::delete(block_id));
        self.prune_handles();
        Ok(WireMessage::BlockDeletion {
            block_id: Some(block_id.to_owned()),
        })
    }

    /// Duplicate a block and its descendants. Returns the copy's root id.
    pub fn clone_block(&mut self, source: &str) -> Result<(BlockId, WireMessage), ValidationError> {
        self.require_block(source)?;
        let mut operation = Operation::clone_of(source);
        operation.apply(&mut self.document);

        let copy_id = match &operation {
            Operation::Clone(clone) => clone.copy_id().map(str::to_owned),
            _ => None,
        }
        .ok_or_else(|| ValidationError::UnknownBlock(source.to_owned()))?;

        let message = WireMessage::Operation {
            operation_data: Some(operation.to_serialized()),
        };
        Ok((copy_id, message))
    }

    pub fn replace_structure(&mut self, structure: StructureNode) -> WireMessage {
        self.document
            .perform_operation(Operation::replace_structure(structure.clone()));
        self.prune_handles();
        WireMessage::StructureChange {
            structure: Some(structure),
        }
    }

    /// Rename the page.
    pub fn rename(&mut self, name: &str) -> Result<WireMessage, ValidationError> {
        let name = validate_page_name(&Value::from(name))?;
        if let Some(metadata) = &mut self.metadata {
            metadata.name = name.clone();
        }
        let mut patch = Map::new();
        patch.insert("name".into(), Value::from(name));
        Ok(WireMessage::MetadataChange {
            metadata: Some(patch),
        })
    }

    /// Ask the server to undo or redo. Applied when the server answers.
    pub fn request_history(&self, action: HistoryAction) -> WireMessage {
        WireMessage::HistoryAction {
            action: Some(action),
            operation_data: None,
        }
    }

    pub fn request_sync(&self) -> WireMessage {
        WireMessage::NeedsSync
    }

    fn require_block(&self, block_id: &str) -> Result<(), ValidationError> {
        if self.document.contains_block(block_id) {
            Ok(())
        } else {
            Err(ValidationError::UnknownBlock(block_id.to_owned()))
        }
    }
}

enum Applied {
    Loaded,
    Resynced,
    Changed,
    Ignored,
}

fn need<T>(value: Option<T>, field: &'static str) -> Result<T, String> {
    value.ok_or_else(|| ValidationError::MissingField(field).to_string())
}
