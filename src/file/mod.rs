//! File storage module for filevault.
//!
//! This module provides:
//! - The directory tree with incrementally aggregated sizes
//! - Resumable chunked uploads tracked by a per-file bitmap
//! - Pluggable chunk stores (local filesystem, blob containers)
//! - Tree operations (create, rename, move, copy, delete, read)

mod aggregate;
mod bitmap;
mod cache;
mod flusher;
mod node;
mod planner;
mod session;
pub mod storage;
mod tree;
mod upload;

pub use aggregate::{AggregateReport, DirectoryAggregator, QuotaPolicy, SizeDeltaPlan};
pub use bitmap::{BitmapError, ChunkBitmap};
pub use cache::{CacheKey, FlushStats, SessionGuard, Slot, SlotClaim, UploadCache, UploadEntry};
pub use flusher::{CacheFlusher, DEFAULT_FLUSH_INTERVAL_SECS};
pub use node::{FileNode, FileNodeRepository, NewNode, NodeStatus, MAX_TREE_DEPTH};
pub use planner::{plan, ChunkConstraints, ChunkPlan};
pub use session::{UploadSession, UploadSessionRepository};
pub use storage::{ChunkStore, LocalChunkStore, MemoryBlobStore};
pub use tree::TreeService;
pub use upload::{CreatedUpload, UploadService, UploadStatus};

use crate::{Result, VaultError};

/// Maximum length for a node name (in characters).
pub const MAX_NAME_LENGTH: usize = 255;

/// Check a file or directory name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VaultError::Validation("name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(VaultError::Validation(format!(
            "name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(VaultError::Validation(format!(
            "name '{name}' contains a forbidden character"
        )));
    }
    if name == "." || name == ".." {
        return Err(VaultError::Validation(format!("'{name}' is reserved")));
    }
    Ok(())
}
