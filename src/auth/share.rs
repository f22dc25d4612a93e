//! Share grants for filevault.
//!
//! A grant delegates access to a node and everything below it to another
//! account until a deadline.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::info;

use super::access::{AccessGuard, AccessMode};
use crate::db::{AccountRepository, Database};
use crate::file::{FileNodeRepository, MAX_TREE_DEPTH};
use crate::{Result, VaultError};

/// A share grant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShareGrant {
    /// Unique grant ID.
    pub id: i64,
    /// Root of the shared subtree.
    pub node_id: i64,
    /// Account that created the grant.
    pub grantor_id: i64,
    /// Account receiving access.
    pub grantee_id: i64,
    /// Granted access.
    #[sqlx(try_from = "String")]
    pub access_mode: AccessMode,
    /// The grant stops applying at this instant.
    pub expires_at: DateTime<Utc>,
    /// When the grant was created.
    pub created_at: String,
}

impl ShareGrant {
    /// Whether the grant is still valid at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Data for creating a new grant.
#[derive(Debug, Clone)]
pub struct NewShareGrant {
    pub node_id: i64,
    pub grantor_id: i64,
    pub grantee_id: i64,
    pub access_mode: AccessMode,
    pub expires_at: DateTime<Utc>,
}

const SHARE_COLUMNS: &str =
    "id, node_id, grantor_id, grantee_id, access_mode, expires_at, created_at";

/// Repository for share grants.
pub struct ShareRepository;

impl ShareRepository {
    /// Insert a grant; `Conflict` if the grantee already has one on the node.
    pub async fn create(conn: &mut SqliteConnection, grant: &NewShareGrant) -> Result<ShareGrant> {
        let result = sqlx::query(
            "INSERT INTO shares (node_id, grantor_id, grantee_id, access_mode, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(grant.node_id)
        .bind(grant.grantor_id)
        .bind(grant.grantee_id)
        .bind(grant.access_mode.as_str())
        .bind(grant.expires_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                VaultError::Conflict(format!(
                    "account {} already has a grant on node {}",
                    grant.grantee_id, grant.node_id
                ))
            }
            other => VaultError::Database(other.to_string()),
        })?;

        Self::get_by_id(conn, result.last_insert_rowid())
            .await?
            .ok_or_else(|| VaultError::NotFound("share".to_string()))
    }

    /// Get a grant by ID.
    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<ShareGrant>> {
        let query = format!("SELECT {SHARE_COLUMNS} FROM shares WHERE id = ?");
        let grant = sqlx::query_as::<_, ShareGrant>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(grant)
    }

    /// List the grants on a node.
    pub async fn list_for_node(
        conn: &mut SqliteConnection,
        node_id: i64,
    ) -> Result<Vec<ShareGrant>> {
        let query = format!("SELECT {SHARE_COLUMNS} FROM shares WHERE node_id = ? ORDER BY id");
        let grants = sqlx::query_as::<_, ShareGrant>(&query)
            .bind(node_id)
            .fetch_all(conn)
            .await?;
        Ok(grants)
    }

    /// A grantee's grants on a node and its ancestors, nearest first.
    pub async fn grants_along_chain(
        conn: &mut SqliteConnection,
        node_id: i64,
        grantee_id: i64,
    ) -> Result<Vec<ShareGrant>> {
        let query = format!(
            "WITH RECURSIVE chain(id, parent_id, depth) AS (
                 SELECT id, parent_id, 0 FROM nodes WHERE id = ?
                 UNION ALL
                 SELECT p.id, p.parent_id, chain.depth + 1
                 FROM nodes p JOIN chain ON p.id = chain.parent_id
                 WHERE chain.depth < ?
             )
             SELECT s.{}
             FROM shares s JOIN chain ON s.node_id = chain.id
             WHERE s.grantee_id = ?
             ORDER BY chain.depth",
            SHARE_COLUMNS.replace(", ", ", s.")
        );
        let grants = sqlx::query_as::<_, ShareGrant>(&query)
            .bind(node_id)
            .bind(MAX_TREE_DEPTH)
            .bind(grantee_id)
            .fetch_all(conn)
            .await?;
        Ok(grants)
    }

    /// Delete a grant by ID.
    pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM shares WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Grant management with access checks.
#[derive(Clone)]
pub struct ShareService {
    db: Database,
}

impl ShareService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Share `node_id` with `grantee_id` until `expires_at`.
    ///
    /// The actor must own the node or hold full access to it.
    pub async fn grant(
        &self,
        actor_id: i64,
        node_id: i64,
        grantee_id: i64,
        access_mode: AccessMode,
        expires_at: DateTime<Utc>,
    ) -> Result<ShareGrant> {
        if grantee_id == actor_id {
            return Err(VaultError::Validation(
                "cannot share a node with yourself".to_string(),
            ));
        }
        if expires_at <= Utc::now() {
            return Err(VaultError::Validation(
                "share expiry must be in the future".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;
        let node = FileNodeRepository::require(&mut tx, node_id).await?;
        AccessGuard::require(&mut tx, actor_id, &node, AccessMode::FullAccess).await?;
        AccountRepository::require(&mut tx, grantee_id).await?;
        if grantee_id == node.owner_id {
            return Err(VaultError::Validation(
                "the owner already has full access".to_string(),
            ));
        }

        let grant = ShareRepository::create(
            &mut tx,
            &NewShareGrant {
                node_id,
                grantor_id: actor_id,
                grantee_id,
                access_mode,
                expires_at,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            node_id,
            grantee_id,
            mode = %access_mode,
            "share granted by account {}",
            actor_id
        );
        Ok(grant)
    }

    /// Revoke a grant. The actor needs full access to the shared node.
    pub async fn revoke(&self, actor_id: i64, share_id: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let grant = ShareRepository::get_by_id(&mut tx, share_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("share {share_id}")))?;
        let node = FileNodeRepository::require(&mut tx, grant.node_id).await?;
        AccessGuard::require(&mut tx, actor_id, &node, AccessMode::FullAccess).await?;

        ShareRepository::delete(&mut tx, share_id).await?;
        tx.commit().await?;

        info!(share_id, node_id = grant.node_id, "share revoked");
        Ok(())
    }

    /// List the grants on a node. The actor needs full access to it.
    pub async fn list_for_node(&self, actor_id: i64, node_id: i64) -> Result<Vec<ShareGrant>> {
        let mut conn = self.db.pool().acquire().await?;
        let node = FileNodeRepository::require(&mut conn, node_id).await?;
        AccessGuard::require(&mut conn, actor_id, &node, AccessMode::FullAccess).await?;
        ShareRepository::list_for_node(&mut conn, node_id).await
    }
}
