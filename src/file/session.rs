//! Upload session rows.
//!
//! An incomplete file has exactly one session recording its size, the chunk
//! size it was planned with and the persisted bitmap.

use sqlx::SqliteConnection;

use super::{ChunkBitmap, ChunkPlan};
use crate::{Result, VaultError};

/// Persisted state of an in-progress upload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UploadSession {
    /// File node this session belongs to.
    pub node_id: i64,
    /// Total file size in bytes.
    pub file_size: i64,
    /// Chunk size, fixed for the session's lifetime.
    pub chunk_size: i32,
    /// Bitmap bytes (1 = pending, 0 = written).
    pub bitmap: Vec<u8>,
    /// When the session was created.
    pub created_at: String,
    /// When the bitmap was last persisted.
    pub updated_at: String,
}

impl UploadSession {
    /// Rebuild the chunk plan this session was created with.
    pub fn plan(&self) -> Result<ChunkPlan> {
        let file_size = u64::try_from(self.file_size).ok();
        let chunk_size = u64::try_from(self.chunk_size).ok();
        let plan = file_size
            .zip(chunk_size)
            .and_then(|(size, chunk)| ChunkPlan::with_chunk_size(size, chunk))
            .ok_or_else(|| {
                VaultError::InvalidState(format!(
                    "upload session {} has an unusable layout",
                    self.node_id
                ))
            })?;

        if plan.bitmap_len != self.bitmap.len() {
            return Err(VaultError::InvalidState(format!(
                "upload session {} bitmap is {} bytes, expected {}",
                self.node_id,
                self.bitmap.len(),
                plan.bitmap_len
            )));
        }
        Ok(plan)
    }

    /// The persisted bitmap.
    pub fn chunk_bitmap(&self) -> ChunkBitmap {
        ChunkBitmap::from_bytes(self.bitmap.clone())
    }
}

const SESSION_COLUMNS: &str = "node_id, file_size, chunk_size, bitmap, created_at, updated_at";

/// Repository for upload session operations.
pub struct UploadSessionRepository;

impl UploadSessionRepository {
    /// Insert the session for a freshly planned file.
    pub async fn create(
        conn: &mut SqliteConnection,
        node_id: i64,
        plan: &ChunkPlan,
        bitmap: &ChunkBitmap,
    ) -> Result<UploadSession> {
        let file_size = i64::try_from(plan.file_size)
            .map_err(|_| VaultError::Validation("file size too large".to_string()))?;
        let chunk_size = i32::try_from(plan.chunk_size).map_err(|_| {
            VaultError::Validation(format!("chunk size {} exceeds 32 bits", plan.chunk_size))
        })?;

        sqlx::query(
            "INSERT INTO upload_sessions (node_id, file_size, chunk_size, bitmap)
             VALUES (?, ?, ?, ?)",
        )
        .bind(node_id)
        .bind(file_size)
        .bind(chunk_size)
        .bind(bitmap.as_bytes())
        .execute(&mut *conn)
        .await?;

        Self::get_by_node(conn, node_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("upload session {node_id}")))
    }

    /// Get the session of a node.
    pub async fn get_by_node(
        conn: &mut SqliteConnection,
        node_id: i64,
    ) -> Result<Option<UploadSession>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE node_id = ?");
        let session = sqlx::query_as::<_, UploadSession>(&query)
            .bind(node_id)
            .fetch_optional(conn)
            .await?;
        Ok(session)
    }

    /// Persist a new bitmap. Returns false if the session no longer exists.
    pub async fn update_bitmap(
        conn: &mut SqliteConnection,
        node_id: i64,
        bitmap: &ChunkBitmap,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET bitmap = ?, updated_at = datetime('now')
             WHERE node_id = ?",
        )
        .bind(bitmap.as_bytes())
        .bind(node_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the session of a node.
    pub async fn delete(conn: &mut SqliteConnection, node_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE node_id = ?")
            .bind(node_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
