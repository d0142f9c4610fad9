//! Blob storage for collaborative document snapshots.
//!
//! ```text
//! ┌──────────────────┐   put(ws, id, bytes)   ┌──────────────────┐
//! │ StorageExtension │ ─────────────────────► │ dyn BlobStore    │
//! │                  │ ◄───────────────────── │                  │
//! └──────────────────┘   read(ws, id)         └────────┬─────────┘
//!                                                      │
//!                                       ┌──────────────┴──────────────┐
//!                                       ▼                             ▼
//!                              MemoryBlobStore                 RocksBlobStore
//!                              (process-local)          (CF "blobs" + "metadata")
//! ```
//!
//! One blob per `(workspace, document_id)`. A blob is always a complete
//! snapshot; there is no incremental diff storage at this layer.

pub mod memory;
pub mod rocks;

pub use memory::MemoryBlobStore;
pub use rocks::{RocksBlobStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Content type tag stored with every document snapshot.
pub const YDOC_CONTENT_TYPE: &str = "application/ydoc";

/// Metadata kept alongside a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub content_type: String,
    /// Uncompressed blob length in bytes
    pub size: u64,
    /// Last write (milliseconds since epoch)
    pub updated_at: u64,
}

impl BlobMetadata {
    pub fn new(content_type: impl Into<String>, size: u64) -> Self {
        Self {
            content_type: content_type.into(),
            size,
            updated_at: crate::now_millis(),
        }
    }

    /// Metadata for a Yrs snapshot of `size` bytes.
    pub fn ydoc(size: u64) -> Self {
        Self::new(YDOC_CONTENT_TYPE, size)
    }
}

/// Blob storage errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob not found: {workspace}/{id}")]
    NotFound { workspace: String, id: String },
    #[error("Database error: {0}")]
    Database(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl BlobError {
    pub fn not_found(workspace: &str, id: &str) -> Self {
        BlobError::NotFound {
            workspace: workspace.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl From<rocksdb::Error> for BlobError {
    fn from(e: rocksdb::Error) -> Self {
        BlobError::Database(e.to_string())
    }
}

/// Byte storage keyed by workspace and document id.
///
/// `put` must be atomic from the caller's perspective: a concurrent or
/// subsequent `read` observes either the previous blob or the new one.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a whole blob. Absent blobs are `BlobError::NotFound`.
    async fn read(&self, workspace: &str, id: &str) -> Result<Vec<u8>, BlobError>;

    /// Write a whole blob, replacing any previous content.
    async fn put(
        &self,
        workspace: &str,
        id: &str,
        data: &[u8],
        metadata: BlobMetadata,
    ) -> Result<(), BlobError>;

    /// Metadata of a stored blob, `None` when absent.
    async fn stat(&self, workspace: &str, id: &str) -> Result<Option<BlobMetadata>, BlobError>;
}
