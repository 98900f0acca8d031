//! Page persistence.
//!
//! Pages are loaded when their session opens and saved when it is flushed.
//! The snapshot store keeps one file per page:
//!
//! ```text
//! <root>/<page-uuid>.page   bincode(SnapshotFrame)
//! ┌─────────┬─────────┬──────────┬──────────────┬─────────────────────┐
//! │ version │ page_id │ saved_at │ content_hash │ body                │
//! │ u32     │ uuid    │ u64 ms   │ u32 (CRC-32) │ lz4(JSON StoredPage)│
//! └─────────┴─────────┴──────────┴──────────────┴─────────────────────┘
//! ```
//!
//! The hash is recomputed from the decoded body on load; a mismatch means
//! the file is corrupt.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use folio_core::{
    consistency_hash, new_block_id, Content, ContentMap, PageMetadata, PageSnapshot,
    StructureNode,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

const SNAPSHOT_FORMAT_VERSION: u32 = 1;
const SNAPSHOT_EXTENSION: &str = "page";

/// Name given to pages created on first open.
pub const DEFAULT_PAGE_NAME: &str = "Untitled";

/// Everything persisted for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPage {
    pub metadata: PageMetadata,
    pub structure: StructureNode,
    pub content: ContentMap,
}

impl StoredPage {
    /// A fresh page holding one empty text block.
    pub fn new_default(page_id: Uuid) -> Self {
        let block_id = new_block_id();
        let mut block = Content::new();
        block.insert("type".into(), Value::from("text"));
        block.insert("textContent".into(), Value::from(""));

        Self {
            metadata: PageMetadata::new(page_id, DEFAULT_PAGE_NAME),
            structure: StructureNode::root_with(vec![StructureNode::leaf(block_id.clone())]),
            content: [(block_id, block)].into_iter().collect(),
        }
    }

    pub fn page_id(&self) -> Uuid {
        self.metadata.page_id
    }

    pub fn snapshot(&self) -> PageSnapshot {
        PageSnapshot {
            structure: self.structure.clone(),
            content: self.content.clone(),
        }
    }

    pub fn consistency_hash(&self) -> u32 {
        consistency_hash(&self.content, &self.structure)
    }
}

/// Load/save backend for pages. Implementations block; callers on the
/// async runtime go through `spawn_blocking`.
pub trait PageStore: Send + Sync + 'static {
    fn load(&self, page_id: Uuid) -> Result<Option<StoredPage>, StoreError>;

    fn save(&self, page: &StoredPage) -> Result<(), StoreError>;

    /// Load a page, creating and saving the default page when it is missing.
    fn load_or_create(&self, page_id: Uuid) -> Result<StoredPage, StoreError> {
        if let Some(page) = self.load(page_id)? {
            return Ok(page);
        }
        let page = StoredPage::new_default(page_id);
        self.save(&page)?;
        info!("Created default page {page_id}");
        Ok(page)
    }
}

/// In-process store, for tests and servers without a storage path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pages: Mutex<HashMap<Uuid, StoredPage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageStore for MemoryStore {
    fn load(&self, page_id: Uuid) -> Result<Option<StoredPage>, StoreError> {
        let pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(pages.get(&page_id).cloned())
    }

    fn save(&self, page: &StoredPage) -> Result<(), StoreError> {
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        pages.insert(page.page_id(), page.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFrame {
    version: u32,
    page_id: Uuid,
    saved_at: u64,
    content_hash: u32,
    body: Vec<u8>,
}

/// Directory of LZ4-compressed page snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open (creating if needed) a snapshot directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, page_id: Uuid) -> PathBuf {
        self.root.join(format!("{page_id}.{SNAPSHOT_EXTENSION}"))
    }

    /// Ids of every page with a snapshot on disk.
    pub fn list_pages(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn encode(page: &StoredPage) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(page).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let frame = SnapshotFrame {
            version: SNAPSHOT_FORMAT_VERSION,
            page_id: page.page_id(),
            saved_at: now_millis(),
            content_hash: page.consistency_hash(),
            body: lz4_flex::compress_prepend_size(&json),
        };
        bincode::serde::encode_to_vec(&frame, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(page_id: Uuid, bytes: &[u8]) -> Result<StoredPage, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt { page_id, reason };

        let (frame, _): (SnapshotFrame, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| corrupt(e.to_string()))?;
        if frame.version != SNAPSHOT_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", frame.version)));
        }
        if frame.page_id != page_id {
            return Err(corrupt(format!("file holds page {}", frame.page_id)));
        }

        let json = lz4_flex::decompress_size_prepended(&frame.body)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let page: StoredPage =
            serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))?;

        let actual = page.consistency_hash();
        if actual != frame.content_hash {
            return Err(corrupt(format!(
                "content hash {actual:#010x} does not match recorded {:#010x}",
                frame.content_hash
            )));
        }
        Ok(page)
    }
}

impl PageStore for SnapshotStore {
    fn load(&self, page_id: Uuid) -> Result<Option<StoredPage>, StoreError> {
        let bytes = match fs::read(self.path_for(page_id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let page = Self::decode(page_id, &bytes)?;
        debug!("Loaded page {page_id} ({} bytes on disk)", bytes.len());
        Ok(Some(page))
    }

    fn save(&self, page: &StoredPage) -> Result<(), StoreError> {
        let bytes = Self::encode(page)?;
        let path = self.path_for(page.page_id());
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved page {} ({} bytes)", page.page_id(), bytes.len());
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
