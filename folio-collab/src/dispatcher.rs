//! Server-side handling of inbound page messages.
//!
//! Each frame is validated, turned into an [`Operation`] or a control
//! action, applied to the page and fanned out. Validation happens before
//! anything is written, so a rejected frame leaves the page untouched.

use std::sync::Arc;

use folio_core::{Clock, Operation, ValidationError};
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broadcast::PeerId;
use crate::error::{DispatchError, ProtocolError};
use crate::protocol::{Frame, HistoryAction, WireMessage};
use crate::session::{ActivePage, PageRenamed};

/// Shared services a session hands to the dispatcher.
#[derive(Clone)]
pub struct DispatchContext {
    pub clock: Arc<dyn Clock>,
    pub renames: broadcast::Sender<PageRenamed>,
}

/// What became of an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Applied, then relayed to `peers` other connections.
    Relayed { kind: &'static str, peers: usize },
    /// Undo/redo performed and announced to every connection.
    History { action: HistoryAction, peers: usize },
    /// Undo/redo requested with an empty stack.
    NothingToReplay,
    /// Requester was sent a full sync.
    Synced,
    /// Nothing to do for this type.
    Ignored,
}

fn require<T>(value: Option<T>, field: &'static str) -> Result<T, ValidationError> {
    value.ok_or(ValidationError::MissingField(field))
}

fn require_block(page: &ActivePage, block_id: &str) -> Result<(), ValidationError> {
    if page.document().contains_block(block_id) {
        Ok(())
    } else {
        Err(ValidationError::UnknownBlock(block_id.to_owned()))
    }
}

fn require_absent(page: &ActivePage, field: &'static str, block_id: &str) -> Result<(), ValidationError> {
    if page.document().contains_block(block_id) {
        Err(ValidationError::InvalidField {
            field,
            reason: format!("block {block_id} already exists"),
        })
    } else {
        Ok(())
    }
}

/// Hold a client-built operation to the same rules as the dedicated
/// message types. Edits are stamped with the server clock.
fn check_operation(page: &ActivePage, operation: &mut Operation, now: u64) -> Result<(), ValidationError> {
    match operation {
        Operation::Insert(insert) => {
            require_absent(page, "newBlockId", &insert.new_block_id)?;
            if let Some(adjacent) = &insert.adjacent_block_id {
                require_block(page, adjacent)?;
            }
        }
        Operation::Edit(edit) => {
            require_block(page, &edit.block_id)?;
            edit.timestamp = now;
        }
        Operation::Delete(delete) => require_block(page, &delete.block_id)?,
        Operation::Clone(clone) => {
            require_block(page, &clone.source_block_id)?;
            if let Some(location) = &clone.copy {
                for id in location.segment.ids() {
                    require_absent(page, "copy", &id)?;
                }
            }
        }
        Operation::ReplaceStructure(_) => {}
    }
    Ok(())
}

/// Decode and handle one text frame from `origin`.
pub fn dispatch(
    page: &mut ActivePage,
    origin: &PeerId,
    text: &str,
    ctx: &DispatchContext,
) -> Result<Dispatched, DispatchError> {
    let frame = Frame::decode(text)?;
    debug!("Page {} <- {origin}: {}", page.page_id(), frame.type_name());

    match frame.message.clone() {
        WireMessage::BlockChange { block_id, content } => {
            let block_id = require(block_id, "blockId")?;
            let content = require(content, "content")?;
            require_block(page, &block_id)?;

            let operation = Operation::edit(block_id, content, ctx.clock.now_millis());
            Ok(apply_and_relay(page, origin, &frame, operation))
        }

        WireMessage::BlockAddition {
            adjacent_block_id,
            new_block_id,
            content,
            direction,
        } => {
            let new_block_id = require(new_block_id, "newBlockId")?;
            let content = require(content, "content")?;
            if page.document().contains_block(&new_block_id) {
                return Err(ValidationError::InvalidField {
                    field: "newBlockId",
                    reason: format!("block {new_block_id} already exists"),
                }
                .into());
            }
            if let Some(adjacent) = &adjacent_block_id {
                require_block(page, adjacent)?;
            }

            let operation = Operation::insert(
                adjacent_block_id,
                new_block_id,
                content,
                direction.unwrap_or_default(),
            );
            Ok(apply_and_relay(page, origin, &frame, operation))
        }

        WireMessage::BlockDeletion { block_id } => {
            let block_id = require(block_id, "blockId")?;
            require_block(page, &block_id)?;
            Ok(apply_and_relay(page, origin, &frame, Operation::delete(block_id)))
        }

        WireMessage::StructureChange { structure } => {
            let structure = require(structure, "structure")?;
            Ok(apply_and_relay(page, origin, &frame, Operation::replace_structure(structure)))
        }

        WireMessage::Operation { operation_data } => {
            let serialized = require(operation_data, "operationData")?;
            let mut operation = Operation::try_from(serialized)?;
            let kind = operation.kind();
            check_operation(page, &mut operation, ctx.clock.now_millis())?;

            // Relay what the server recorded so every replica gets the same
            // ids for blocks the operation created.
            let Some(recorded) = page
                .document_mut()
                .perform_operation(operation)
                .map(Operation::to_serialized)
            else {
                return Err(ValidationError::InvalidField {
                    field: "operationData",
                    reason: format!("{kind} was refused by the page"),
                }
                .into());
            };
            page.mark_dirty();

            let message = WireMessage::Operation {
                operation_data: Some(recorded),
            };
            let peers = page.send_to_others_with_hash(origin, &message);
            Ok(Dispatched::Relayed { kind, peers })
        }

        WireMessage::MetadataChange { metadata } => {
            let patch = require(metadata, "metadata")?;
            let change = page.metadata_mut().apply_patch(&patch)?;
            if change.touched {
                page.mark_dirty();
            }

            let Value::Object(full) = serde_json::to_value(page.metadata())
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?
            else {
                return Err(ProtocolError::NotAnObject.into());
            };
            let peers = page.send_to_others_with_hash(
                origin,
                &WireMessage::MetadataChange {
                    metadata: Some(full),
                },
            );

            if let Some(name) = change.renamed {
                let event = PageRenamed {
                    page_id: page.page_id(),
                    notebook_id: page.metadata().notebook_id,
                    name,
                };
                if ctx.renames.send(event).is_err() {
                    debug!("No rename listeners for page {}", page.page_id());
                }
            }
            Ok(Dispatched::Relayed {
                kind: "metadata_change",
                peers,
            })
        }

        WireMessage::HistoryAction { action, .. } => {
            let action = require(action, "action")?;
            let replayed = match action {
                HistoryAction::Undo => page.document_mut().undo(),
                HistoryAction::Redo => page.document_mut().redo(),
            };
            let Some(operation) = replayed else {
                debug!("Nothing to {action:?} on page {}", page.page_id());
                return Ok(Dispatched::NothingToReplay);
            };
            page.mark_dirty();

            let message = WireMessage::history(action, operation.to_serialized());
            let peers = page.send_to_all_with_hash(&message);
            Ok(Dispatched::History { action, peers })
        }

        WireMessage::NeedsSync => {
            page.send_full_sync(origin);
            Ok(Dispatched::Synced)
        }

        WireMessage::InitialPageData { .. } | WireMessage::FullSync { .. } => {
            warn!(
                "Ignoring server-only {} from {origin} on page {}",
                frame.type_name(),
                page.page_id()
            );
            Ok(Dispatched::Ignored)
        }

        WireMessage::Unknown => {
            warn!(
                "Ignoring unknown message type {:?} from {origin} on page {}",
                frame.type_name(),
                page.page_id()
            );
            Ok(Dispatched::Ignored)
        }
    }
}

/// Apply a validated operation and forward the sender's frame to the rest.
fn apply_and_relay(
    page: &mut ActivePage,
    origin: &PeerId,
    frame: &Frame,
    operation: Operation,
) -> Dispatched {
    let kind = frame.message.kind();
    page.document_mut().perform_operation(operation);
    page.mark_dirty();
    let relayed = frame.relay(page.hash());
    let peers = page.relay_to_others(origin, &relayed);
    Dispatched::Relayed { kind, peers }
}
