//! JSON wire protocol for page editing.
//!
//! Every frame is a JSON object tagged by `type`:
//! ```text
//! { "type": "block_change", "blockId": "…", "content": { … }, "hash": 3735928559 }
//!   ───────┬──────────────  ──────────────┬──────────────────  ───────┬─────────
//!      discriminator              message fields                 server→client
//!       (snake_case)               (camelCase)                  consistency hash
//! ```
//!
//! Inbound fields are all optional at the type level so that "missing" and
//! `null` both surface as a validation failure in the dispatcher rather
//! than as an opaque decode error.

use std::sync::Arc;

use folio_core::{
    BlockId, Content, ContentMap, Direction, DocumentState, PageMetadata, SerializedOperation,
    StructureNode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Undo or redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Undo,
    Redo,
}

/// All message types understood on a page connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    InitialPageData {
        metadata: PageMetadata,
        structure: StructureNode,
        content: ContentMap,
    },
    BlockChange {
        block_id: Option<BlockId>,
        content: Option<Content>,
    },
    BlockAddition {
        adjacent_block_id: Option<BlockId>,
        new_block_id: Option<BlockId>,
        content: Option<Content>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },
    BlockDeletion {
        block_id: Option<BlockId>,
    },
    StructureChange {
        structure: Option<StructureNode>,
    },
    MetadataChange {
        metadata: Option<Map<String, Value>>,
    },
    HistoryAction {
        action: Option<HistoryAction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_data: Option<SerializedOperation>,
    },
    Operation {
        operation_data: Option<SerializedOperation>,
    },
    NeedsSync,
    FullSync {
        structure: Option<StructureNode>,
        content: Option<ContentMap>,
    },
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn initial_page_data(metadata: &PageMetadata, document: &DocumentState) -> Self {
        Self::InitialPageData {
            metadata: metadata.clone(),
            structure: document.structure().clone(),
            content: document.content().clone(),
        }
    }

    pub fn full_sync(document: &DocumentState) -> Self {
        Self::FullSync {
            structure: Some(document.structure().clone()),
            content: Some(document.content().clone()),
        }
    }

    pub fn history(action: HistoryAction, operation: SerializedOperation) -> Self {
        Self::HistoryAction {
            action: Some(action),
            operation_data: Some(operation),
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitialPageData { .. } => "initial_page_data",
            Self::BlockChange { .. } => "block_change",
            Self::BlockAddition { .. } => "block_addition",
            Self::BlockDeletion { .. } => "block_deletion",
            Self::StructureChange { .. } => "structure_change",
            Self::MetadataChange { .. } => "metadata_change",
            Self::HistoryAction { .. } => "history_action",
            Self::Operation { .. } => "operation",
            Self::NeedsSync => "needs_sync",
            Self::FullSync { .. } => "full_sync",
            Self::Unknown => "unknown",
        }
    }

    /// Serialize, attaching `hash` when given.
    pub fn encode(&self, hash: Option<u32>) -> Result<String, ProtocolError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if let (Some(hash), Value::Object(map)) = (hash, &mut value) {
            map.insert("hash".into(), Value::from(hash));
        }
        Ok(value.to_string())
    }
}

/// A decoded inbound frame.
///
/// Keeps the original object so that relays forward exactly what the
/// sender wrote, with only the hash replaced.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message: WireMessage,
    pub hash: Option<u32>,
    raw: Map<String, Value>,
}

impl Frame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(mut raw) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let hash = raw
            .remove("hash")
            .and_then(|h| h.as_u64())
            .and_then(|h| u32::try_from(h).ok());
        let message = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(Self { message, hash, raw })
    }

    /// The `type` string as sent, including types this crate does not know.
    pub fn type_name(&self) -> &str {
        self.raw.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// Re-encode the original object with a fresh hash.
    pub fn relay(&self, hash: u32) -> Arc<str> {
        let mut raw = self.raw.clone();
        raw.insert("hash".into(), Value::from(hash));
        Arc::from(Value::Object(raw).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_block_change() {
        let frame = Frame::decode(r#"{"type":"block_change","blockId":"b1","content":{"textContent":"hi"}}"#).unwrap();
        match frame.message {
            WireMessage::BlockChange { block_id, content } => {
                assert_eq!(block_id.as_deref(), Some("b1"));
                assert_eq!(content.unwrap()["textContent"], "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(frame.hash, None);
    }

    #[test]
    fn test_missing_and_null_fields_decode_as_none() {
        let frame = Frame::decode(r#"{"type":"block_deletion","blockId":null}"#).unwrap();
        assert_eq!(frame.message, WireMessage::BlockDeletion { block_id: None });

        let frame = Frame::decode(r#"{"type":"block_addition","content":{}}"#).unwrap();
        assert!(matches!(
            frame.message,
            WireMessage::BlockAddition { new_block_id: None, adjacent_block_id: None, direction: None, .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let frame = Frame::decode(r#"{"type":"cursor_move","x":1}"#).unwrap();
        assert_eq!(frame.message, WireMessage::Unknown);
        assert_eq!(frame.type_name(), "cursor_move");
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(Frame::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert_eq!(Frame::decode("[1,2]").unwrap_err(), ProtocolError::NotAnObject);
        assert!(matches!(
            Frame::decode(r#"{"type":"history_action","action":"sideways"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_hash_is_split_from_message() {
        let frame = Frame::decode(r#"{"type":"needs_sync","hash":42}"#).unwrap();
        assert_eq!(frame.message, WireMessage::NeedsSync);
        assert_eq!(frame.hash, Some(42));
    }

    #[test]
    fn test_relay_keeps_sender_fields() {
        let frame = Frame::decode(r#"{"type":"block_deletion","blockId":"x","clientTag":7,"hash":1}"#).unwrap();
        let relayed: Value = serde_json::from_str(&frame.relay(99)).unwrap();
        assert_eq!(relayed, json!({"type": "block_deletion", "blockId": "x", "clientTag": 7, "hash": 99}));
    }

    #[test]
    fn test_encode_with_hash() {
        let message = WireMessage::history(
            HistoryAction::Undo,
            SerializedOperation { kind: "delete_block".into(), data: json!({"blockId": "b"}) },
        );
        let value: Value = serde_json::from_str(&message.encode(Some(7)).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "history_action",
                "action": "undo",
                "operationData": {"kind": "delete_block", "data": {"blockId": "b"}},
                "hash": 7
            })
        );
    }

    #[test]
    fn test_request_without_operation_data_omits_field() {
        let message = WireMessage::HistoryAction { action: Some(HistoryAction::Redo), operation_data: None };
        let value: Value = serde_json::from_str(&message.encode(None).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "history_action", "action": "redo"}));
    }
}
