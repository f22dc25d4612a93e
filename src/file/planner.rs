//! Chunk planning.
//!
//! Decides how a file of a given size is sliced for upload.

use serde::Serialize;

use super::ChunkBitmap;

/// Limits the planner works within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConstraints {
    /// Smallest chunk size; smaller files upload as a single chunk.
    pub min_chunk_size: u64,
    /// Largest chunk size.
    pub max_chunk_size: u64,
    /// Number of chunks to aim for before clamping.
    pub preferred_chunk_count: u64,
}

impl Default for ChunkConstraints {
    fn default() -> Self {
        Self {
            min_chunk_size: 512 * 1024,
            max_chunk_size: 8 * 1024 * 1024,
            preferred_chunk_count: 64,
        }
    }
}

/// How a file is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub last_chunk_size: u64,
    pub bitmap_len: usize,
}

impl ChunkPlan {
    /// Plan for a file uploaded with a known chunk size.
    ///
    /// Returns None for an empty file or a zero chunk size.
    pub fn with_chunk_size(file_size: u64, chunk_size: u64) -> Option<Self> {
        if file_size == 0 || chunk_size == 0 {
            return None;
        }
        let chunk_count = file_size.div_ceil(chunk_size);
        let last_chunk_size = file_size - chunk_size * (chunk_count - 1);
        Some(Self {
            file_size,
            chunk_size,
            chunk_count,
            last_chunk_size,
            bitmap_len: ChunkBitmap::byte_len(chunk_count),
        })
    }

    /// Byte offset of a chunk.
    pub fn offset_of(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Expected payload length of a chunk, or None if the index is past the end.
    pub fn chunk_len(&self, index: u64) -> Option<u64> {
        if index >= self.chunk_count {
            None
        } else if index == self.chunk_count - 1 {
            Some(self.last_chunk_size)
        } else {
            Some(self.chunk_size)
        }
    }
}

/// Compute the chunk plan for a file.
///
/// Returns None for an empty file, which has no chunks and is completed on
/// creation.
pub fn plan(file_size: u64, constraints: &ChunkConstraints) -> Option<ChunkPlan> {
    if file_size == 0 {
        return None;
    }

    let chunk_size = if file_size < constraints.min_chunk_size {
        file_size
    } else {
        file_size
            .div_ceil(constraints.preferred_chunk_count.max(1))
            .clamp(constraints.min_chunk_size, constraints.max_chunk_size.max(constraints.min_chunk_size))
    };

    ChunkPlan::with_chunk_size(file_size, chunk_size)
}
