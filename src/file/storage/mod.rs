//! Chunk stores.
//!
//! A chunk store holds the bytes of every file, addressed by an opaque
//! backing-object identifier and a chunk index. Backends differ in when
//! written chunks become readable:
//!
//! - [`LocalChunkStore`] writes chunks in place; they are readable at once.
//! - [`AzureBlobStore`] and [`MemoryBlobStore`] stage each chunk as a block
//!   and only expose the object after
//!   [`commit_staged_chunks`](ChunkStore::commit_staged_chunks).
//!
//! Callers always invoke `commit_staged_chunks` when an upload finishes; it
//! is a no-op for backends that write in place.

mod azure;
mod local;
mod memory;

pub use azure::AzureBlobStore;
pub use local::LocalChunkStore;
pub use memory::MemoryBlobStore;

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::Result;

/// Byte-range storage for chunk payloads.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Allocate an empty object. Safe to retry.
    async fn create_backing_object(&self, owner_id: i64, object_id: &str) -> Result<()>;

    /// Write one chunk at byte offset `index * chunk_size`.
    async fn write_chunk(
        &self,
        object_id: &str,
        index: u64,
        chunk_size: u64,
        data: &[u8],
    ) -> Result<()>;

    /// Make staged chunks readable, in the given order.
    async fn commit_staged_chunks(
        &self,
        _object_id: &str,
        _ordered_indexes: &[u64],
        _content_type: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Read one chunk; the final chunk is clamped at end of object.
    async fn read_chunk(&self, object_id: &str, index: u64, chunk_size: u64) -> Result<Vec<u8>>;

    /// Delete an object. Returns false if it did not exist.
    async fn delete_backing_object(&self, object_id: &str) -> Result<bool>;
}

/// Generate a new backing-object identifier.
pub fn generate_object_id() -> String {
    Uuid::new_v4().to_string()
}

/// Block ID for a chunk index.
///
/// Every ID of an object must have the same length before encoding, so
/// the index is zero-padded.
pub fn block_id(index: u64) -> String {
    BASE64_STANDARD.encode(format!("{index:020}"))
}

/// Build the chunk store selected by the configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ChunkStore>> {
    let store: Arc<dyn ChunkStore> = match config.backend {
        StorageBackend::Local => Arc::new(LocalChunkStore::new(&config.path)?),
        StorageBackend::Azure => Arc::new(AzureBlobStore::new(
            &config.container_url,
            &config.sas_token,
        )?),
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };
    Ok(store)
}
