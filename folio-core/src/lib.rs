//! # folio-core: Document model for Folio pages
//!
//! A page is a structure tree plus a content map, mutated only through
//! reversible operations.
//!
//! ```text
//!            Operation::apply / revert
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │ DocumentState                            │
//! │  ├── StructureNode (ordered tree)        │
//! │  ├── ContentMap    (blockId → record)    │
//! │  ├── history  (≤ 50, edits merge <1s)    │
//! │  └── redo                                │
//! └───────────────────┬──────────────────────┘
//!                     │
//!                     ▼
//!              consistency_hash (CRC-32)
//! ```
//!
//! ## Modules
//!
//! - [`block`]: Ids, structure nodes, content records, segments
//! - [`document`]: `DocumentState`, tree primitives, undo/redo
//! - [`operation`]: Insert / Edit / Delete / Clone / ReplaceStructure
//! - [`hash`]: Canonical serialization and divergence fingerprint
//! - [`metadata`]: Page metadata and client-editable field validation
//! - [`clock`]: Edit timestamps
//! - [`handles`]: Local rendering handles kept out of content

pub mod block;
pub mod clock;
pub mod document;
pub mod error;
pub mod handles;
pub mod hash;
pub mod metadata;
pub mod operation;

pub use block::{
    merge_content, new_block_id, BlockId, Content, ContentMap, Direction, Segment,
    SegmentLocation, StructureNode,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use document::{DocumentState, Found, PageSnapshot, EDIT_MERGE_WINDOW_MS, HISTORY_LIMIT};
pub use error::{OperationError, ValidationError};
pub use handles::HandleTable;
pub use hash::{canonical_json, consistency_hash};
pub use metadata::{MetadataChange, PageMetadata, PAGE_NAME_MAX_CHARS};
pub use operation::{Operation, SerializedOperation};
