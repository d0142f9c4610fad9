//! Process-local blob store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BlobError, BlobMetadata, BlobStore};

type BlobKey = (String, String);

/// In-memory `BlobStore` backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, (Vec<u8>, BlobMetadata)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs across all workspaces.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, workspace: &str, id: &str) -> Result<Vec<u8>, BlobError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(&(workspace.to_string(), id.to_string()))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BlobError::not_found(workspace, id))
    }

    async fn put(
        &self,
        workspace: &str,
        id: &str,
        data: &[u8],
        metadata: BlobMetadata,
    ) -> Result<(), BlobError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert((workspace.to_string(), id.to_string()), (data.to_vec(), metadata));
        Ok(())
    }

    async fn stat(&self, workspace: &str, id: &str) -> Result<Option<BlobMetadata>, BlobError> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .get(&(workspace.to_string(), id.to_string()))
            .map(|(_, meta)| meta.clone()))
    }
}
