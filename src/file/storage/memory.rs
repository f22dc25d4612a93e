//! In-process blob store.
//!
//! Models block-blob semantics without a network: chunks are staged per
//! block and the object only becomes readable once the block list is
//! committed. Contents live for the life of the process.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{block_id, ChunkStore};
use crate::{Result, VaultError};

#[derive(Debug, Default)]
struct Blob {
    staged: HashMap<String, Vec<u8>>,
    committed: Option<Vec<u8>>,
    content_type: String,
}

/// Blob store held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks staged but not yet committed for an object.
    pub async fn staged_count(&self, object_id: &str) -> usize {
        let blobs = self.blobs.read().await;
        blobs.get(object_id).map(|b| b.staged.len()).unwrap_or(0)
    }

    /// Whether an object has been committed.
    pub async fn is_committed(&self, object_id: &str) -> bool {
        let blobs = self.blobs.read().await;
        blobs
            .get(object_id)
            .is_some_and(|b| b.committed.is_some())
    }

    /// Content type recorded at commit.
    pub async fn content_type(&self, object_id: &str) -> Option<String> {
        let blobs = self.blobs.read().await;
        blobs
            .get(object_id)
            .filter(|b| b.committed.is_some())
            .map(|b| b.content_type.clone())
    }

    /// Whether the store knows the object at all.
    pub async fn contains(&self, object_id: &str) -> bool {
        self.blobs.read().await.contains_key(object_id)
    }
}

#[async_trait]
impl ChunkStore for MemoryBlobStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_backing_object(&self, _owner_id: i64, object_id: &str) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        blobs.entry(object_id.to_string()).or_default();
        Ok(())
    }

    async fn write_chunk(
        &self,
        object_id: &str,
        index: u64,
        _chunk_size: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        let blob = blobs
            .get_mut(object_id)
            .ok_or_else(|| VaultError::NotFound(format!("object {object_id}")))?;
        blob.staged.insert(block_id(index), data.to_vec());
        Ok(())
    }

    async fn commit_staged_chunks(
        &self,
        object_id: &str,
        ordered_indexes: &[u64],
        content_type: &str,
    ) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        let blob = blobs
            .get_mut(object_id)
            .ok_or_else(|| VaultError::NotFound(format!("object {object_id}")))?;

        let mut content = Vec::new();
        for &index in ordered_indexes {
            let block = blob.staged.get(&block_id(index)).ok_or_else(|| {
                VaultError::Io(format!("block {index} of {object_id} was never staged"))
            })?;
            content.extend_from_slice(block);
        }

        blob.staged.clear();
        blob.committed = Some(content);
        blob.content_type = content_type.to_string();
        Ok(())
    }

    async fn read_chunk(&self, object_id: &str, index: u64, chunk_size: u64) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().await;
        let content = blobs
            .get(object_id)
            .and_then(|b| b.committed.as_ref())
            .ok_or_else(|| VaultError::NotFound(format!("object {object_id}")))?;

        let len = content.len() as u64;
        let start = (index * chunk_size).min(len);
        let end = start.saturating_add(chunk_size).min(len);
        Ok(content[start as usize..end as usize].to_vec())
    }

    async fn delete_backing_object(&self, object_id: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(object_id).is_some())
    }
}
