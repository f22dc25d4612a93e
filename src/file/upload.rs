//! Upload orchestration.
//!
//! An upload moves through `Created -> InProgress -> Completed | Cancelled`:
//!
//! 1. [`create_new_file`](UploadService::create_new_file) reserves quota,
//!    plans the chunks, persists the node and its session, and allocates
//!    the backing object.
//! 2. [`upload_chunk`](UploadService::upload_chunk) writes one chunk and
//!    clears its bit, in any order, any number of times.
//! 3. [`complete_file`](UploadService::complete_file) finalizes once every
//!    bit is clear; [`cancel_upload`](UploadService::cancel_upload) throws
//!    the upload away.
//!
//! The size of a file is charged to its directory chain and account when the
//! upload is created, so later chunk writes never fail on quota.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::storage::{generate_object_id, ChunkStore};
use super::{
    plan, validate_name, ChunkBitmap, ChunkConstraints, ChunkPlan, DirectoryAggregator, FileNode,
    FileNodeRepository, NewNode, NodeStatus, QuotaPolicy, UploadCache, UploadEntry,
    UploadSessionRepository,
};
use crate::config::UploadConfig;
use crate::db::Database;
use crate::{Result, VaultError};

/// A freshly created upload.
#[derive(Debug, Clone)]
pub struct CreatedUpload {
    /// The new file node.
    pub file: FileNode,
    /// How the caller must slice the file; None for an empty file, which is
    /// completed on creation.
    pub plan: Option<ChunkPlan>,
}

/// Progress of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadStatus {
    pub chunk_count: u64,
    pub missing_count: u64,
}

/// Upload session state machine.
pub struct UploadService {
    db: Database,
    store: Arc<dyn ChunkStore>,
    cache: Arc<UploadCache>,
    constraints: ChunkConstraints,
    max_file_size: Option<u64>,
}

impl UploadService {
    /// Create a service from the upload configuration.
    pub fn new(
        db: Database,
        store: Arc<dyn ChunkStore>,
        cache: Arc<UploadCache>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            db,
            store,
            cache,
            constraints: config.constraints(),
            max_file_size: config.max_file_size(),
        }
    }

    /// Replace the chunk planning constraints.
    pub fn with_constraints(mut self, constraints: ChunkConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// The chunk store in use.
    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Start an upload of `size` bytes named `name` in `parent_id`.
    ///
    /// Uploads always go into the uploader's own tree. An empty `mime_type`
    /// is guessed from the name.
    pub async fn create_new_file(
        &self,
        owner_id: i64,
        parent_id: i64,
        name: &str,
        mime_type: &str,
        size: u64,
    ) -> Result<CreatedUpload> {
        validate_name(name)?;
        if let Some(max) = self.max_file_size {
            if size > max {
                return Err(VaultError::Validation(format!(
                    "file size {size} exceeds the {max} byte limit"
                )));
            }
        }
        let signed_size = i64::try_from(size)
            .map_err(|_| VaultError::Validation(format!("file size {size} is too large")))?;

        let plan = plan(size, &self.constraints);
        let mime_type = if mime_type.is_empty() {
            mime_guess::from_path(name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            mime_type.to_string()
        };
        let object_id = generate_object_id();

        let mut tx = self.db.begin().await?;

        let parent = FileNodeRepository::require(&mut tx, parent_id).await?;
        if !parent.is_directory {
            return Err(VaultError::InvalidState(format!(
                "node {parent_id} is not a directory"
            )));
        }
        if parent.owner_id != owner_id {
            return Err(VaultError::Unauthorized(format!(
                "directory {parent_id} belongs to another account"
            )));
        }

        DirectoryAggregator::adjust_user_used_space(
            &mut tx,
            owner_id,
            signed_size,
            QuotaPolicy::Enforce,
        )
        .await?;
        DirectoryAggregator::adjust_ancestor_sizes(&mut tx, parent_id, signed_size).await?;

        let status = if plan.is_some() {
            NodeStatus::Incomplete
        } else {
            NodeStatus::Completed
        };
        let chunk_size = plan.map(|p| p.chunk_size as i64).unwrap_or(0);
        let file = FileNodeRepository::create(
            &mut tx,
            &NewNode::file(owner_id, parent_id, name, &mime_type, signed_size, &object_id)
                .with_status(status)
                .with_chunk_size(chunk_size),
        )
        .await?;

        let bitmap = plan.map(|p| ChunkBitmap::initialize(p.chunk_count));
        let mut reserved = None;
        if let (Some(plan), Some(bitmap)) = (&plan, &bitmap) {
            UploadSessionRepository::create(&mut tx, file.id, plan, bitmap).await?;
            // Lookups racing the commit wait on this slot instead of missing it
            reserved = Some(self.cache.reserve(owner_id, file.id).await);
        }

        // From here on the backing object may exist and must not outlive a failure
        let finalized = async {
            self.store
                .create_backing_object(owner_id, &object_id)
                .await?;
            if plan.is_none() {
                self.store
                    .commit_staged_chunks(&object_id, &[], &mime_type)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, VaultError>(())
        }
        .await;
        if let Err(e) = finalized {
            if let Some(claim) = reserved {
                self.cache.release(claim).await;
            }
            self.discard_backing_object(&object_id).await;
            return Err(e);
        }

        if let (Some(claim), Some(plan), Some(bitmap)) = (reserved, plan, bitmap) {
            self.cache
                .activate(
                    claim,
                    UploadEntry {
                        node_id: file.id,
                        owner_id,
                        backing_object: object_id,
                        mime_type,
                        plan,
                        bitmap,
                        dirty: false,
                    },
                )
                .await;
        }

        info!(
            owner_id,
            file_id = file.id,
            size,
            chunks = plan.map(|p| p.chunk_count).unwrap_or(0),
            "upload created"
        );
        Ok(CreatedUpload { file, plan })
    }

    /// Store one chunk.
    ///
    /// The bit is cleared only after the chunk store accepted the bytes, so
    /// a failed write leaves the chunk pending. Rewriting a chunk that was
    /// already stored is allowed and leaves the bitmap unchanged.
    pub async fn upload_chunk(
        &self,
        owner_id: i64,
        file_id: i64,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut session = self.cache.lock(owner_id, file_id).await?;
        let entry = session.entry_mut();

        let expected = entry.plan.chunk_len(index).ok_or_else(|| {
            VaultError::Validation(format!(
                "chunk {index} out of range (file has {} chunks)",
                entry.plan.chunk_count
            ))
        })?;
        if data.len() as u64 != expected {
            return Err(VaultError::Validation(format!(
                "chunk {index} must be {expected} bytes, got {}",
                data.len()
            )));
        }

        self.store
            .write_chunk(&entry.backing_object, index, entry.plan.chunk_size, data)
            .await?;

        if entry.bitmap.get_bit(index)? {
            entry.bitmap.set_bit(index, false)?;
            entry.dirty = true;
            debug!(file_id, index, "chunk stored");
        } else {
            debug!(file_id, index, "chunk rewritten");
        }
        Ok(())
    }

    /// Finalize an upload whose chunks are all stored.
    pub async fn complete_file(&self, owner_id: i64, file_id: i64) -> Result<FileNode> {
        let session = self.cache.lock(owner_id, file_id).await?;
        let entry = session.entry();

        if !entry.bitmap.is_all_zero() {
            return Err(VaultError::InvalidState(format!(
                "file {file_id} still has {} missing chunk(s)",
                entry.bitmap.count_ones()
            )));
        }

        let indexes: Vec<u64> = (0..entry.plan.chunk_count).collect();
        self.store
            .commit_staged_chunks(&entry.backing_object, &indexes, &entry.mime_type)
            .await?;

        let mut tx = self.db.begin().await?;
        require_owned(&mut tx, owner_id, file_id).await?;
        if !FileNodeRepository::update_status(&mut tx, file_id, NodeStatus::Completed).await? {
            return Err(VaultError::NotFound(format!("file {file_id}")));
        }
        UploadSessionRepository::delete(&mut tx, file_id).await?;
        let file = FileNodeRepository::require(&mut tx, file_id).await?;
        tx.commit().await?;

        self.cache.retire(session).await;
        info!(owner_id, file_id, "upload completed");
        Ok(file)
    }

    /// Abandon an upload: the node, its session and its bytes are removed
    /// and its size is released.
    ///
    /// Waits for any chunk write in flight on the same file.
    pub async fn cancel_upload(&self, owner_id: i64, file_id: i64) -> Result<()> {
        let session = self.cache.lock(owner_id, file_id).await?;
        let backing_object = session.entry().backing_object.clone();

        let mut tx = self.db.begin().await?;
        let file = require_owned(&mut tx, owner_id, file_id).await?;
        UploadSessionRepository::delete(&mut tx, file_id).await?;
        FileNodeRepository::delete(&mut tx, file_id).await?;
        if let Some(parent_id) = file.parent_id {
            DirectoryAggregator::adjust_ancestor_sizes(&mut tx, parent_id, -file.size).await?;
        }
        DirectoryAggregator::adjust_user_used_space(
            &mut tx,
            file.owner_id,
            -file.size,
            QuotaPolicy::WarnOnly,
        )
        .await?;
        tx.commit().await?;

        self.discard_backing_object(&backing_object).await;
        self.cache.retire(session).await;
        info!(owner_id, file_id, "upload cancelled");
        Ok(())
    }

    /// Indexes of the chunks not stored yet.
    pub async fn list_missing_chunks(&self, owner_id: i64, file_id: i64) -> Result<Vec<u64>> {
        let session = self.cache.lock(owner_id, file_id).await?;
        let entry = session.entry();
        Ok(entry
            .bitmap
            .indexes_with_value_in(true, 0, entry.plan.chunk_count - 1))
    }

    /// Chunk totals of an upload.
    pub async fn upload_status(&self, owner_id: i64, file_id: i64) -> Result<UploadStatus> {
        let session = self.cache.lock(owner_id, file_id).await?;
        let entry = session.entry();
        Ok(UploadStatus {
            chunk_count: entry.plan.chunk_count,
            missing_count: entry.bitmap.count_ones(),
        })
    }

    async fn discard_backing_object(&self, object_id: &str) {
        if let Err(e) = self.store.delete_backing_object(object_id).await {
            warn!(object_id, "failed to delete backing object: {}", e);
        }
    }
}

/// Load a file and check it still belongs to `owner_id`.
///
/// The cache key only proves ownership at hydration time; the row read
/// inside the transaction is authoritative.
async fn require_owned(
    conn: &mut SqliteConnection,
    owner_id: i64,
    file_id: i64,
) -> Result<FileNode> {
    let file = FileNodeRepository::require(conn, file_id).await?;
    if file.owner_id != owner_id {
        return Err(VaultError::Unauthorized(format!(
            "file {file_id} belongs to another account"
        )));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccountRepository, NewAccount};
    use crate::file::MemoryBlobStore;

    struct Fixture {
        db: Database,
        store: Arc<MemoryBlobStore>,
        service: UploadService,
        owner: i64,
        root: i64,
    }

    async fn setup(quota: i64) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let account = AccountRepository::create(&mut conn, &NewAccount::new("alice", quota))
            .await
            .unwrap();
        drop(conn);

        let store = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(UploadCache::new(db.clone()));
        let service = UploadService::new(
            db.clone(),
            store.clone(),
            cache,
            &UploadConfig::default(),
        )
        .with_constraints(ChunkConstraints {
            min_chunk_size: 4,
            max_chunk_size: 4,
            preferred_chunk_count: 4,
        });

        Fixture {
            db,
            store,
            service,
            owner: account.id,
            root: account.root_id.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let f = setup(1000).await;
        let created = f
            .service
            .create_new_file(f.owner, f.root, "notes.txt", "", 10)
            .await
            .unwrap();
        let plan = created.plan.unwrap();
        let id = created.file.id;

        assert_eq!(plan.chunk_count, 3);
        assert_eq!(created.file.mime_type, "text/plain");
        assert_eq!(created.file.status, NodeStatus::Incomplete);

        f.service.upload_chunk(f.owner, id, 2, b"ij").await.unwrap();
        f.service.upload_chunk(f.owner, id, 0, b"abcd").await.unwrap();
        assert_eq!(f.service.list_missing_chunks(f.owner, id).await.unwrap(), vec![1]);
        assert_eq!(
            f.service.upload_status(f.owner, id).await.unwrap(),
            UploadStatus {
                chunk_count: 3,
                missing_count: 1
            }
        );

        assert!(matches!(
            f.service.complete_file(f.owner, id).await,
            Err(VaultError::InvalidState(_))
        ));

        f.service.upload_chunk(f.owner, id, 1, b"efgh").await.unwrap();
        let file = f.service.complete_file(f.owner, id).await.unwrap();
        assert!(file.is_completed());

        let object = file.backing_object.unwrap();
        assert_eq!(f.store.read_chunk(&object, 1, 4).await.unwrap(), b"efgh");

        // Terminal: no more chunks
        assert!(matches!(
            f.service.upload_chunk(f.owner, id, 0, b"abcd").await,
            Err(VaultError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_and_sizes_reserved_on_create() {
        let f = setup(100).await;
        f.service
            .create_new_file(f.owner, f.root, "a.bin", "", 60)
            .await
            .unwrap();

        let mut conn = f.db.pool().acquire().await.unwrap();
        let account = AccountRepository::require(&mut conn, f.owner).await.unwrap();
        assert_eq!(account.used_space, 60);
        let root = FileNodeRepository::require(&mut conn, f.root).await.unwrap();
        assert_eq!(root.size, 60);
        drop(conn);

        let result = f
            .service
            .create_new_file(f.owner, f.root, "b.bin", "", 41)
            .await;
        assert!(matches!(result, Err(VaultError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn test_empty_file_completed_immediately() {
        let f = setup(100).await;
        let created = f
            .service
            .create_new_file(f.owner, f.root, "empty", "application/x-empty", 0)
            .await
            .unwrap();

        assert!(created.plan.is_none());
        assert!(created.file.is_completed());
        let object = created.file.backing_object.unwrap();
        assert!(f.store.is_committed(&object).await);
        assert!(matches!(
            f.service.upload_chunk(f.owner, created.file.id, 0, b"").await,
            Err(VaultError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let f = setup(100).await;
        let id = f
            .service
            .create_new_file(f.owner, f.root, "v.bin", "", 6)
            .await
            .unwrap()
            .file
            .id;

        assert!(matches!(
            f.service.upload_chunk(f.owner, id, 1, b"abcd").await,
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.service.upload_chunk(f.owner, id, 2, b"ab").await,
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.service.upload_chunk(f.owner + 1, id, 0, b"abcd").await,
            Err(VaultError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let f = setup(100).await;
        let id = f
            .service
            .create_new_file(f.owner, f.root, "r.bin", "", 8)
            .await
            .unwrap()
            .file
            .id;

        f.service.upload_chunk(f.owner, id, 0, b"aaaa").await.unwrap();
        f.service.upload_chunk(f.owner, id, 0, b"bbbb").await.unwrap();
        assert_eq!(f.service.list_missing_chunks(f.owner, id).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_cancel_releases_everything() {
        let f = setup(100).await;
        let created = f
            .service
            .create_new_file(f.owner, f.root, "c.bin", "", 8)
            .await
            .unwrap();
        let id = created.file.id;
        let object = created.file.backing_object.unwrap();
        f.service.upload_chunk(f.owner, id, 0, b"aaaa").await.unwrap();

        f.service.cancel_upload(f.owner, id).await.unwrap();

        assert!(!f.store.contains(&object).await);
        let mut conn = f.db.pool().acquire().await.unwrap();
        assert!(FileNodeRepository::get_by_id(&mut conn, id).await.unwrap().is_none());
        assert_eq!(
            AccountRepository::require(&mut conn, f.owner).await.unwrap().used_space,
            0
        );
        assert_eq!(
            FileNodeRepository::require(&mut conn, f.root).await.unwrap().size,
            0
        );
        drop(conn);

        assert!(matches!(
            f.service.upload_chunk(f.owner, id, 1, b"bbbb").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let f = setup(100).await;

        assert!(matches!(
            f.service.create_new_file(f.owner, f.root, "a/b", "", 1).await,
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.service.create_new_file(f.owner, 999, "x", "", 1).await,
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(
            f.service.create_new_file(f.owner + 1, f.root, "x", "", 1).await,
            Err(VaultError::Unauthorized(_))
        ));

        let file = f
            .service
            .create_new_file(f.owner, f.root, "dup", "", 0)
            .await
            .unwrap()
            .file;
        assert!(matches!(
            f.service.create_new_file(f.owner, f.root, "dup", "", 0).await,
            Err(VaultError::Conflict(_))
        ));
        assert!(matches!(
            f.service.create_new_file(f.owner, file.id, "inner", "", 0).await,
            Err(VaultError::InvalidState(_))
        ));
    }

    #[test]
    fn test_status_serialization() {
        let status = UploadStatus {
            chunk_count: 5,
            missing_count: 2,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"chunk_count":5,"missing_count":2}"#);
    }

    #[tokio::test]
    async fn test_former_owner_rejected_by_live_entry() {
        let f = setup(1000).await;
        let created = f
            .service
            .create_new_file(f.owner, f.root, "handoff.bin", "", 8)
            .await
            .unwrap();
        let id = created.file.id;
        f.service.upload_chunk(f.owner, id, 0, b"abcd").await.unwrap();
        f.service.upload_chunk(f.owner, id, 1, b"efgh").await.unwrap();

        // The row changes hands while alice's entry is still cached
        let mut conn = f.db.pool().acquire().await.unwrap();
        let bob = AccountRepository::create(&mut conn, &NewAccount::new("bob", 1000))
            .await
            .unwrap();
        FileNodeRepository::update_owner(&mut conn, id, bob.id)
            .await
            .unwrap();
        drop(conn);

        assert!(matches!(
            f.service.cancel_upload(f.owner, id).await,
            Err(VaultError::Unauthorized(_))
        ));
        assert!(matches!(
            f.service.complete_file(f.owner, id).await,
            Err(VaultError::Unauthorized(_))
        ));

        let mut conn = f.db.pool().acquire().await.unwrap();
        let node = FileNodeRepository::require(&mut conn, id).await.unwrap();
        assert_eq!(node.owner_id, bob.id);
        assert_eq!(node.status, NodeStatus::Incomplete);
        assert!(UploadSessionRepository::get_by_node(&mut conn, id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_complete_after_row_removed() {
        let f = setup(1000).await;
        let created = f
            .service
            .create_new_file(f.owner, f.root, "gone.bin", "", 4)
            .await
            .unwrap();
        let id = created.file.id;
        f.service.upload_chunk(f.owner, id, 0, b"abcd").await.unwrap();

        let mut conn = f.db.pool().acquire().await.unwrap();
        FileNodeRepository::delete(&mut conn, id).await.unwrap();
        drop(conn);

        assert!(matches!(
            f.service.complete_file(f.owner, id).await,
            Err(VaultError::NotFound(_))
        ));
    }
}
