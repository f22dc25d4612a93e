//! Local filesystem chunk store.
//!
//! Each backing object is one file, written at random offsets as chunks
//! arrive. Objects are stored in a sharded directory structure:
//! ```text
//! {base_path}/
//! ├── ab/
//! │   └── ab12cd34-5678-90ab-cdef-123456789012
//! ├── cd/
//! │   └── cd90ab12-3456-7890-abcd-ef1234567890
//! └── ...
//! ```

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::ChunkStore;
use crate::{Result, VaultError};

/// Chunk store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    /// Base directory for object storage.
    base_path: PathBuf,
}

impl LocalChunkStore {
    /// Create a new store rooted at the given path.
    ///
    /// The base directory will be created if it doesn't exist.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        Ok(Self { base_path })
    }

    /// Get the base path of this store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for an object.
    ///
    /// The path is constructed as: {base_path}/{shard}/{object_id}
    /// where shard is the first 2 characters of the object id.
    pub fn object_path(&self, object_id: &str) -> PathBuf {
        self.base_path.join(Self::shard(object_id)).join(object_id)
    }

    /// Check if an object exists.
    pub async fn exists(&self, object_id: &str) -> bool {
        fs::try_exists(self.object_path(object_id))
            .await
            .unwrap_or(false)
    }

    /// Get the shard directory name for an object id.
    fn shard(object_id: &str) -> &str {
        object_id.get(..2).unwrap_or(object_id)
    }

    fn not_found(object_id: &str, e: io::Error) -> VaultError {
        if e.kind() == io::ErrorKind::NotFound {
            VaultError::NotFound(format!("object {object_id}"))
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn create_backing_object(&self, owner_id: i64, object_id: &str) -> Result<()> {
        let path = self.object_path(object_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // No truncate: a retried create keeps chunks already written
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        debug!(owner_id, object_id, "created local object");
        Ok(())
    }

    async fn write_chunk(
        &self,
        object_id: &str,
        index: u64,
        chunk_size: u64,
        data: &[u8],
    ) -> Result<()> {
        let path = self.object_path(object_id);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Self::not_found(object_id, e))?;

        file.seek(SeekFrom::Start(index * chunk_size)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn read_chunk(&self, object_id: &str, index: u64, chunk_size: u64) -> Result<Vec<u8>> {
        let path = self.object_path(object_id);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(object_id, e))?;

        let len = file.metadata().await?.len();
        let offset = index * chunk_size;
        if offset >= len {
            return Ok(Vec::new());
        }

        let to_read = chunk_size.min(len - offset) as usize;
        let mut buf = vec![0u8; to_read];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;

        Ok(buf)
    }

    async fn delete_backing_object(&self, object_id: &str) -> Result<bool> {
        match fs::remove_file(self.object_path(object_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
