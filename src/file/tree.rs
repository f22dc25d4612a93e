//! Directory tree operations.
//!
//! Every operation checks access for the acting account, then runs as one
//! unit of work. Batch operations validate every member before the first
//! write, so a batch either applies completely or not at all.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::storage::ChunkStore;
use super::{
    validate_name, CacheKey, ChunkPlan, FileNode, FileNodeRepository, NewNode, NodeStatus,
    QuotaPolicy, SizeDeltaPlan, SlotClaim, UploadCache, UploadSessionRepository,
};
use crate::auth::{AccessGuard, AccessMode};
use crate::db::Database;
use crate::{Result, VaultError};

/// What a delete removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    /// Nodes removed from the tree.
    pub nodes_removed: usize,
    /// Backing objects deleted from the chunk store.
    pub objects_removed: usize,
}

/// Tree operations with access checks and size aggregation.
pub struct TreeService {
    db: Database,
    store: Arc<dyn ChunkStore>,
    cache: Arc<UploadCache>,
}

impl TreeService {
    pub fn new(db: Database, store: Arc<dyn ChunkStore>, cache: Arc<UploadCache>) -> Self {
        Self { db, store, cache }
    }

    /// Get a node the actor may read.
    pub async fn get_node(&self, actor_id: i64, node_id: i64) -> Result<FileNode> {
        let mut conn = self.db.pool().acquire().await?;
        let node = FileNodeRepository::require(&mut conn, node_id).await?;
        AccessGuard::require(&mut conn, actor_id, &node, AccessMode::ReadOnly).await?;
        Ok(node)
    }

    /// List a directory.
    pub async fn list_children(&self, actor_id: i64, dir_id: i64) -> Result<Vec<FileNode>> {
        let mut conn = self.db.pool().acquire().await?;
        let dir = require_directory(&mut conn, dir_id).await?;
        AccessGuard::require(&mut conn, actor_id, &dir, AccessMode::ReadOnly).await?;
        FileNodeRepository::list_children(&mut conn, dir_id).await
    }

    /// Create an empty directory, owned by the parent's owner.
    pub async fn create_directory(
        &self,
        actor_id: i64,
        parent_id: i64,
        name: &str,
    ) -> Result<FileNode> {
        validate_name(name)?;

        let mut tx = self.db.begin().await?;
        let parent = require_directory(&mut tx, parent_id).await?;
        AccessGuard::require(&mut tx, actor_id, &parent, AccessMode::ReadWrite).await?;

        let dir = FileNodeRepository::create(
            &mut tx,
            &NewNode::directory(parent.owner_id, Some(parent_id), name),
        )
        .await?;
        tx.commit().await?;

        debug!(dir_id = dir.id, parent_id, "directory created");
        Ok(dir)
    }

    /// Rename a node within its directory.
    pub async fn rename(&self, actor_id: i64, node_id: i64, new_name: &str) -> Result<FileNode> {
        validate_name(new_name)?;

        let mut tx = self.db.begin().await?;
        let node = FileNodeRepository::require(&mut tx, node_id).await?;
        if node.is_root() {
            return Err(VaultError::InvalidState(
                "a root directory cannot be renamed".to_string(),
            ));
        }
        AccessGuard::require(&mut tx, actor_id, &node, AccessMode::ReadWrite).await?;

        FileNodeRepository::update_name(&mut tx, node_id, new_name).await?;
        let node = FileNodeRepository::require(&mut tx, node_id).await?;
        tx.commit().await?;

        Ok(node)
    }

    /// Move nodes into `target_id`.
    ///
    /// Moved subtrees take the owner of the target directory; the bytes
    /// move between the accounts' usage, and the receiving account's quota
    /// is enforced.
    ///
    /// Uploads changing hands are keyed by their old owner in the cache.
    /// Their slots are claimed before the transaction and evicted after it
    /// commits, so the former owner can never act on them in between.
    pub async fn move_nodes(&self, actor_id: i64, node_ids: &[i64], target_id: i64) -> Result<()> {
        let node_ids = dedup(node_ids);

        let mut claims = Vec::new();
        for (owner_id, file_id) in self.pending_handoffs(&node_ids, target_id).await? {
            claims.push(self.cache.claim(owner_id, file_id).await);
        }

        match self.apply_move(actor_id, &node_ids, target_id, &claims).await {
            Ok(moved) => {
                for claim in claims {
                    self.cache.evict_claimed(claim).await;
                }
                info!(moved, target_id, "nodes moved by account {}", actor_id);
                Ok(())
            }
            Err(e) => {
                for claim in claims {
                    self.cache.release(claim).await;
                }
                Err(e)
            }
        }
    }

    /// Cache keys of the uploads a move into `target_id` would re-own,
    /// in lock order.
    async fn pending_handoffs(&self, node_ids: &[i64], target_id: i64) -> Result<Vec<CacheKey>> {
        let mut conn = self.db.pool().acquire().await?;
        let target = require_directory(&mut conn, target_id).await?;

        let mut keys = BTreeSet::new();
        for &id in node_ids {
            for member in FileNodeRepository::descendant_subtree(&mut conn, id).await? {
                if is_handoff(&member, target.owner_id) {
                    keys.insert((member.owner_id, member.id));
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn apply_move(
        &self,
        actor_id: i64,
        node_ids: &[i64],
        target_id: i64,
        claims: &[SlotClaim],
    ) -> Result<usize> {
        let mut tx = self.db.begin().await?;

        let target = require_directory(&mut tx, target_id).await?;
        AccessGuard::require(&mut tx, actor_id, &target, AccessMode::ReadWrite).await?;
        let target_chain = chain_ids(&mut tx, target_id).await?;

        let mut nodes = Vec::with_capacity(node_ids.len());
        for &id in node_ids {
            let node = FileNodeRepository::require(&mut tx, id).await?;
            if node.is_root() {
                return Err(VaultError::InvalidState(
                    "a root directory cannot be moved".to_string(),
                ));
            }
            if target_chain.contains(&id) {
                return Err(VaultError::InvalidState(format!(
                    "cannot move node {id} into itself"
                )));
            }
            AccessGuard::require(&mut tx, actor_id, &node, AccessMode::ReadWrite).await?;
            nodes.push(node);
        }
        reject_nested(&mut tx, &nodes).await?;

        let claimed: HashSet<CacheKey> = claims.iter().map(|c| c.key()).collect();
        let mut plan = SizeDeltaPlan::new();
        let mut reowned = Vec::new();
        let mut moving = Vec::new();
        for node in nodes {
            if node.parent_id == Some(target_id) {
                continue;
            }
            if let Some(parent_id) = node.parent_id {
                plan.add_chain(&mut tx, parent_id, -node.size).await?;
            }
            plan.add_chain(&mut tx, target_id, node.size).await?;

            for member in FileNodeRepository::descendant_subtree(&mut tx, node.id).await? {
                if member.owner_id == target.owner_id {
                    continue;
                }
                if is_handoff(&member, target.owner_id)
                    && !claimed.contains(&(member.owner_id, member.id))
                {
                    return Err(VaultError::Conflict(format!(
                        "upload of file {} started during the move, retry",
                        member.id
                    )));
                }
                if !member.is_directory {
                    plan.add_owner(member.owner_id, -member.size);
                    plan.add_owner(target.owner_id, member.size);
                }
                reowned.push(member);
            }
            moving.push(node);
        }

        plan.apply(&mut tx, QuotaPolicy::Enforce).await?;
        for node in &moving {
            FileNodeRepository::update_parent(&mut tx, node.id, target_id, &node.name).await?;
        }
        for member in &reowned {
            FileNodeRepository::update_owner(&mut tx, member.id, target.owner_id).await?;
        }
        // Progress held only in the cache goes with the file
        for entry in claims.iter().filter_map(|c| c.entry()).filter(|e| e.dirty) {
            UploadSessionRepository::update_bitmap(&mut tx, entry.node_id, &entry.bitmap).await?;
        }
        tx.commit().await?;

        Ok(moving.len())
    }

    /// Copy nodes into `target_id`.
    ///
    /// File copies share the source's backing object; no bytes are
    /// duplicated. Directories are copied recursively. Returns the new
    /// top-level nodes.
    pub async fn copy_nodes(
        &self,
        actor_id: i64,
        node_ids: &[i64],
        target_id: i64,
    ) -> Result<Vec<FileNode>> {
        let node_ids = dedup(node_ids);
        let mut tx = self.db.begin().await?;

        let target = require_directory(&mut tx, target_id).await?;
        AccessGuard::require(&mut tx, actor_id, &target, AccessMode::ReadWrite).await?;
        let target_chain = chain_ids(&mut tx, target_id).await?;

        let mut subtrees = Vec::with_capacity(node_ids.len());
        for &id in &node_ids {
            let node = FileNodeRepository::require(&mut tx, id).await?;
            if target_chain.contains(&id) {
                return Err(VaultError::InvalidState(format!(
                    "cannot copy node {id} into itself"
                )));
            }
            AccessGuard::require(&mut tx, actor_id, &node, AccessMode::ReadOnly).await?;

            let subtree = FileNodeRepository::descendant_subtree(&mut tx, id).await?;
            if let Some(pending) = subtree
                .iter()
                .find(|n| !n.is_directory && !n.is_completed())
            {
                return Err(VaultError::InvalidState(format!(
                    "file {} is still uploading",
                    pending.id
                )));
            }
            subtrees.push(subtree);
        }

        let mut plan = SizeDeltaPlan::new();
        for subtree in &subtrees {
            let bytes: i64 = subtree
                .iter()
                .filter(|n| !n.is_directory)
                .map(|n| n.size)
                .sum();
            plan.add_chain(&mut tx, target_id, bytes).await?;
            plan.add_owner(target.owner_id, bytes);
        }
        plan.apply(&mut tx, QuotaPolicy::Enforce).await?;

        let mut copies = Vec::with_capacity(subtrees.len());
        for subtree in &subtrees {
            let mut new_ids: HashMap<i64, i64> = HashMap::new();
            for (depth, node) in subtree.iter().enumerate() {
                let parent_id = if depth == 0 {
                    target_id
                } else {
                    node.parent_id
                        .and_then(|p| new_ids.get(&p).copied())
                        .ok_or_else(|| {
                            VaultError::InvalidState(format!(
                                "node {} appeared before its parent",
                                node.id
                            ))
                        })?
                };
                let copy = FileNodeRepository::create(&mut tx, &copy_of(node, target.owner_id, parent_id))
                    .await?;
                new_ids.insert(node.id, copy.id);
                if depth == 0 {
                    copies.push(copy);
                }
            }
        }
        tx.commit().await?;

        info!(
            copied = copies.len(),
            target_id, "nodes copied by account {}", actor_id
        );
        Ok(copies)
    }

    /// Delete nodes and everything below them.
    ///
    /// Uploads in progress inside the deleted subtrees are stopped, and
    /// backing objects no longer referenced by any node are removed from
    /// the chunk store.
    pub async fn delete_nodes(&self, actor_id: i64, node_ids: &[i64]) -> Result<DeleteSummary> {
        let node_ids = dedup(node_ids);
        let mut tx = self.db.begin().await?;

        let mut tops = Vec::with_capacity(node_ids.len());
        for &id in &node_ids {
            let node = FileNodeRepository::require(&mut tx, id).await?;
            if node.is_root() {
                return Err(VaultError::InvalidState(
                    "a root directory cannot be deleted".to_string(),
                ));
            }
            AccessGuard::require(&mut tx, actor_id, &node, AccessMode::FullAccess).await?;
            tops.push(node);
        }
        let tops = without_nested(&mut tx, tops).await?;

        let mut plan = SizeDeltaPlan::new();
        let mut doomed = Vec::new();
        for top in &tops {
            if let Some(parent_id) = top.parent_id {
                plan.add_chain(&mut tx, parent_id, -top.size).await?;
            }
            for member in FileNodeRepository::descendant_subtree(&mut tx, top.id).await? {
                if !member.is_directory {
                    plan.add_owner(member.owner_id, -member.size);
                }
                doomed.push(member);
            }
        }
        plan.apply(&mut tx, QuotaPolicy::WarnOnly).await?;

        // Deepest first so no node outlives its parent
        for member in doomed.iter().rev() {
            FileNodeRepository::delete(&mut tx, member.id).await?;
        }

        let candidates: BTreeSet<&str> = doomed
            .iter()
            .filter_map(|n| n.backing_object.as_deref())
            .collect();
        let mut orphaned = Vec::new();
        for object_id in candidates {
            if FileNodeRepository::count_by_backing_object(&mut tx, object_id).await? == 0 {
                orphaned.push(object_id.to_string());
            }
        }
        tx.commit().await?;

        for member in doomed.iter().filter(|n| !n.is_directory && !n.is_completed()) {
            self.cache.retire_key(member.owner_id, member.id).await;
        }

        let mut summary = DeleteSummary {
            nodes_removed: doomed.len(),
            objects_removed: 0,
        };
        let results = join_all(
            orphaned
                .iter()
                .map(|object_id| self.store.delete_backing_object(object_id)),
        )
        .await;
        for (object_id, result) in orphaned.iter().zip(results) {
            match result {
                Ok(true) => summary.objects_removed += 1,
                Ok(false) => debug!(object_id, "backing object already gone"),
                Err(e) => warn!(object_id, "failed to delete backing object: {}", e),
            }
        }

        info!(
            nodes = summary.nodes_removed,
            objects = summary.objects_removed,
            "nodes deleted by account {}",
            actor_id
        );
        Ok(summary)
    }

    /// Read one chunk of a completed file, using the chunk size it was
    /// uploaded with.
    pub async fn read_chunk(&self, actor_id: i64, file_id: i64, index: u64) -> Result<Vec<u8>> {
        let mut conn = self.db.pool().acquire().await?;
        let file = FileNodeRepository::require(&mut conn, file_id).await?;
        if file.is_directory {
            return Err(VaultError::InvalidState(format!(
                "node {file_id} is a directory"
            )));
        }
        AccessGuard::require(&mut conn, actor_id, &file, AccessMode::ReadOnly).await?;
        drop(conn);

        if file.status != NodeStatus::Completed {
            return Err(VaultError::InvalidState(format!(
                "file {file_id} is still uploading"
            )));
        }
        let object_id = file.backing_object.as_deref().ok_or_else(|| {
            VaultError::InvalidState(format!("file {file_id} has no backing object"))
        })?;

        let file_size = u64::try_from(file.size).unwrap_or(0);
        let chunk_size = u64::try_from(file.chunk_size).unwrap_or(0);
        match ChunkPlan::with_chunk_size(file_size, chunk_size) {
            None if index == 0 => Ok(Vec::new()),
            Some(plan) if index < plan.chunk_count => {
                self.store.read_chunk(object_id, index, chunk_size).await
            }
            _ => Err(VaultError::Validation(format!(
                "chunk {index} out of range for file {file_id}"
            ))),
        }
    }
}

async fn require_directory(conn: &mut SqliteConnection, id: i64) -> Result<FileNode> {
    let node = FileNodeRepository::require(conn, id).await?;
    if !node.is_directory {
        return Err(VaultError::InvalidState(format!(
            "node {id} is not a directory"
        )));
    }
    Ok(node)
}

/// Ids of a node and its ancestors.
async fn chain_ids(conn: &mut SqliteConnection, id: i64) -> Result<HashSet<i64>> {
    Ok(FileNodeRepository::ancestor_chain(conn, id)
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect())
}

/// Whether a strict ancestor of `node` is in `batch`.
async fn has_ancestor_in(
    conn: &mut SqliteConnection,
    node: &FileNode,
    batch: &HashSet<i64>,
) -> Result<bool> {
    let Some(parent_id) = node.parent_id else {
        return Ok(false);
    };
    Ok(chain_ids(conn, parent_id)
        .await?
        .iter()
        .any(|id| batch.contains(id)))
}

async fn reject_nested(conn: &mut SqliteConnection, nodes: &[FileNode]) -> Result<()> {
    let batch: HashSet<i64> = nodes.iter().map(|n| n.id).collect();
    for node in nodes {
        if has_ancestor_in(conn, node, &batch).await? {
            return Err(VaultError::InvalidState(format!(
                "node {} lies inside another node of the batch",
                node.id
            )));
        }
    }
    Ok(())
}

/// Drop nodes already covered by another node of the batch.
async fn without_nested(conn: &mut SqliteConnection, nodes: Vec<FileNode>) -> Result<Vec<FileNode>> {
    let batch: HashSet<i64> = nodes.iter().map(|n| n.id).collect();
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes {
        if !has_ancestor_in(conn, &node, &batch).await? {
            kept.push(node);
        }
    }
    Ok(kept)
}

/// Whether `member` is an upload a move would hand to `new_owner`.
fn is_handoff(member: &FileNode, new_owner: i64) -> bool {
    !member.is_directory && !member.is_completed() && member.owner_id != new_owner
}

fn dedup(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn copy_of(node: &FileNode, owner_id: i64, parent_id: i64) -> NewNode {
    NewNode {
        owner_id,
        parent_id: Some(parent_id),
        name: node.name.clone(),
        mime_type: node.mime_type.clone(),
        size: node.size,
        is_directory: node.is_directory,
        status: NodeStatus::Completed,
        backing_object: node.backing_object.clone(),
        chunk_size: node.chunk_size,
    }
}
