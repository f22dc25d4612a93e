//! File node types and repository for filevault.
//!
//! A node is either a directory or a file. Directory sizes are the sum of
//! their descendants' sizes and are maintained incrementally by
//! [`DirectoryAggregator`](super::DirectoryAggregator).

use std::fmt;
use std::str::FromStr;

use sqlx::SqliteConnection;

use crate::{Result, VaultError};

/// Upper bound on the depth walked by the recursive tree queries.
///
/// The tree never gets this deep; the cap keeps a corrupted (cyclic)
/// parent chain from recursing forever.
pub const MAX_TREE_DEPTH: i64 = 1024;

/// Completion status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    /// Upload in progress.
    Incomplete,
    /// Every byte is stored (directories are always completed).
    #[default]
    Completed,
}

impl NodeStatus {
    /// Convert status to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Incomplete => "incomplete",
            NodeStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(NodeStatus::Incomplete),
            "completed" => Ok(NodeStatus::Completed),
            _ => Err(format!("unknown node status: {s}")),
        }
    }
}

impl TryFrom<String> for NodeStatus {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// A file or directory.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileNode {
    /// Unique node ID.
    pub id: i64,
    /// Owning account.
    pub owner_id: i64,
    /// Parent directory (None for an account's root).
    pub parent_id: Option<i64>,
    /// Display name, unique among siblings.
    pub name: String,
    /// MIME type (empty for directories).
    pub mime_type: String,
    /// Size in bytes; for directories, the size of the whole subtree.
    pub size: i64,
    /// Whether this node is a directory.
    pub is_directory: bool,
    /// Completion status.
    #[sqlx(try_from = "String")]
    pub status: NodeStatus,
    /// Chunk store handle holding the file's bytes.
    pub backing_object: Option<String>,
    /// Chunk size the file was uploaded with (0 for directories).
    pub chunk_size: i64,
    /// When the node was created.
    pub created_at: String,
    /// When the node was last modified.
    pub updated_at: String,
}

impl FileNode {
    /// Whether the node is an account root.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether the file's upload has finished.
    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

/// Data for creating a new node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub owner_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub is_directory: bool,
    pub status: NodeStatus,
    pub backing_object: Option<String>,
    pub chunk_size: i64,
}

impl NewNode {
    /// A new, empty directory.
    pub fn directory(owner_id: i64, parent_id: Option<i64>, name: impl Into<String>) -> Self {
        Self {
            owner_id,
            parent_id,
            name: name.into(),
            mime_type: String::new(),
            size: 0,
            is_directory: true,
            status: NodeStatus::Completed,
            backing_object: None,
            chunk_size: 0,
        }
    }

    /// A new file backed by `backing_object`.
    pub fn file(
        owner_id: i64,
        parent_id: i64,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: i64,
        backing_object: impl Into<String>,
    ) -> Self {
        Self {
            owner_id,
            parent_id: Some(parent_id),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            is_directory: false,
            status: NodeStatus::Completed,
            backing_object: Some(backing_object.into()),
            chunk_size: 0,
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: i64) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

const NODE_COLUMNS: &str = "id, owner_id, parent_id, name, mime_type, size, is_directory, status,
     backing_object, chunk_size, created_at, updated_at";

const JOINED_NODE_COLUMNS: &str = "n.id, n.owner_id, n.parent_id, n.name, n.mime_type, n.size,
     n.is_directory, n.status, n.backing_object, n.chunk_size, n.created_at, n.updated_at";

/// Map a unique-index violation on (parent_id, name) to `Conflict`.
fn map_name_conflict(e: sqlx::Error, name: &str) -> VaultError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return VaultError::Conflict(format!("'{name}' already exists in this directory"));
        }
    }
    VaultError::Database(e.to_string())
}

/// Repository for node operations.
///
/// Every function takes the connection it runs on, so callers decide
/// whether it participates in a unit of work.
pub struct FileNodeRepository;

impl FileNodeRepository {
    /// Insert a new node.
    pub async fn create(conn: &mut SqliteConnection, node: &NewNode) -> Result<FileNode> {
        let result = sqlx::query(
            "INSERT INTO nodes (owner_id, parent_id, name, mime_type, size, is_directory, status,
                                backing_object, chunk_size)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node.owner_id)
        .bind(node.parent_id)
        .bind(&node.name)
        .bind(&node.mime_type)
        .bind(node.size)
        .bind(node.is_directory)
        .bind(node.status.as_str())
        .bind(&node.backing_object)
        .bind(node.chunk_size)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_name_conflict(e, &node.name))?;

        let id = result.last_insert_rowid();
        Self::get_by_id(conn, id)
            .await?
            .ok_or_else(|| VaultError::NotFound("node".to_string()))
    }

    /// Get a node by ID.
    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<FileNode>> {
        let query = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?");
        let node = sqlx::query_as::<_, FileNode>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(node)
    }

    /// Get a node by ID, failing with `NotFound` if absent.
    pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<FileNode> {
        Self::get_by_id(conn, id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("node {id}")))
    }

    /// List the direct children of a directory, directories first.
    pub async fn list_children(
        conn: &mut SqliteConnection,
        parent_id: i64,
    ) -> Result<Vec<FileNode>> {
        let query = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ?
             ORDER BY is_directory DESC, name, id"
        );
        let nodes = sqlx::query_as::<_, FileNode>(&query)
            .bind(parent_id)
            .fetch_all(conn)
            .await?;
        Ok(nodes)
    }

    /// Find a child of `parent_id` by name.
    pub async fn find_child(
        conn: &mut SqliteConnection,
        parent_id: i64,
        name: &str,
    ) -> Result<Option<FileNode>> {
        let query = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ? AND name = ?");
        let node = sqlx::query_as::<_, FileNode>(&query)
            .bind(parent_id)
            .bind(name)
            .fetch_optional(conn)
            .await?;
        Ok(node)
    }

    /// Rename a node.
    pub async fn update_name(conn: &mut SqliteConnection, id: i64, name: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE nodes SET name = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(name)
                .bind(id)
                .execute(conn)
                .await
                .map_err(|e| map_name_conflict(e, name))?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-parent a node.
    pub async fn update_parent(
        conn: &mut SqliteConnection,
        id: i64,
        parent_id: i64,
        name: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET parent_id = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(parent_id)
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| map_name_conflict(e, name))?;
        Ok(result.rows_affected() > 0)
    }

    /// Change the owner of a node.
    pub async fn update_owner(conn: &mut SqliteConnection, id: i64, owner_id: i64) -> Result<()> {
        sqlx::query("UPDATE nodes SET owner_id = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(owner_id)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Set the completion status.
    pub async fn update_status(
        conn: &mut SqliteConnection,
        id: i64,
        status: NodeStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE nodes SET status = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(status.as_str())
                .bind(id)
                .execute(conn)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overwrite the stored size.
    pub async fn set_size(conn: &mut SqliteConnection, id: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE nodes SET size = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(size)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Delete a node by ID. Children must already be gone.
    pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count the nodes referencing a backing object.
    pub async fn count_by_backing_object(
        conn: &mut SqliteConnection,
        backing_object: &str,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE backing_object = ?")
            .bind(backing_object)
            .fetch_one(conn)
            .await?;
        Ok(count)
    }

    /// The node followed by its ancestors, nearest first, ending at the root.
    ///
    /// Rows may repeat if the stored parent links form a cycle; callers walk
    /// the result with a visited set.
    pub async fn ancestor_chain(conn: &mut SqliteConnection, id: i64) -> Result<Vec<FileNode>> {
        let query = format!(
            "WITH RECURSIVE chain(id, parent_id, depth) AS (
                 SELECT id, parent_id, 0 FROM nodes WHERE id = ?
                 UNION ALL
                 SELECT p.id, p.parent_id, chain.depth + 1
                 FROM nodes p JOIN chain ON p.id = chain.parent_id
                 WHERE chain.depth < ?
             )
             SELECT {JOINED_NODE_COLUMNS}
             FROM chain JOIN nodes n ON n.id = chain.id
             ORDER BY chain.depth"
        );
        let nodes = sqlx::query_as::<_, FileNode>(&query)
            .bind(id)
            .bind(MAX_TREE_DEPTH)
            .fetch_all(conn)
            .await?;
        Ok(nodes)
    }

    /// The node and all of its descendants, shallowest first.
    pub async fn descendant_subtree(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Vec<FileNode>> {
        let query = format!(
            "WITH RECURSIVE subtree(id, depth) AS (
                 SELECT id, 0 FROM nodes WHERE id = ?
                 UNION ALL
                 SELECT c.id, subtree.depth + 1
                 FROM nodes c JOIN subtree ON c.parent_id = subtree.id
                 WHERE subtree.depth < ?
             )
             SELECT {JOINED_NODE_COLUMNS}
             FROM subtree JOIN nodes n ON n.id = subtree.id
             ORDER BY subtree.depth, n.id"
        );
        let nodes = sqlx::query_as::<_, FileNode>(&query)
            .bind(id)
            .bind(MAX_TREE_DEPTH)
            .fetch_all(conn)
            .await?;
        Ok(nodes)
    }
}
