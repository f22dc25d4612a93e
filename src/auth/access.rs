//! Access checks for filevault.
//!
//! The owner of a node always has full access. Anyone else needs an active
//! share grant on the node or one of its ancestors; the grant closest to
//! the node decides.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::share::{ShareGrant, ShareRepository};
use crate::file::FileNode;
use crate::{Result, VaultError};

/// Access mode of a share grant.
///
/// Modes are ordered: a grant satisfies any requirement at or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessMode {
    /// List and read.
    ReadOnly = 0,
    /// Also create directories, rename and move.
    ReadWrite = 1,
    /// Also delete and share.
    FullAccess = 2,
}

impl AccessMode {
    /// Convert mode to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read_only",
            AccessMode::ReadWrite => "read_write",
            AccessMode::FullAccess => "full_access",
        }
    }

    /// Check if this mode is at least `required`.
    ///
    /// ```
    /// use filevault::auth::AccessMode;
    ///
    /// assert!(AccessMode::FullAccess.satisfies(AccessMode::ReadWrite));
    /// assert!(!AccessMode::ReadOnly.satisfies(AccessMode::ReadWrite));
    /// ```
    pub fn satisfies(&self, required: AccessMode) -> bool {
        *self >= required
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read_only" => Ok(AccessMode::ReadOnly),
            "read_write" => Ok(AccessMode::ReadWrite),
            "full_access" => Ok(AccessMode::FullAccess),
            _ => Err(format!("unknown access mode: {s}")),
        }
    }
}

impl TryFrom<String> for AccessMode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Decide the access a user has to a node.
///
/// `grants` are the user's grants along the node's ancestor chain, nearest
/// first. Expired grants are ignored. Returns None if the user has no
/// access at all.
pub fn effective_mode(
    user_id: i64,
    owner_id: i64,
    grants: &[ShareGrant],
    now: DateTime<Utc>,
) -> Option<AccessMode> {
    if user_id == owner_id {
        return Some(AccessMode::FullAccess);
    }
    grants
        .iter()
        .filter(|g| g.grantee_id == user_id)
        .find(|g| g.is_active(now))
        .map(|g| g.access_mode)
}

/// Authorization against ownership and share grants.
pub struct AccessGuard;

impl AccessGuard {
    /// The access `user_id` has to `node`, if any.
    pub async fn effective_mode(
        conn: &mut SqliteConnection,
        user_id: i64,
        node: &FileNode,
    ) -> Result<Option<AccessMode>> {
        if node.owner_id == user_id {
            return Ok(Some(AccessMode::FullAccess));
        }
        let grants = ShareRepository::grants_along_chain(conn, node.id, user_id).await?;
        Ok(effective_mode(user_id, node.owner_id, &grants, Utc::now()))
    }

    /// Whether `user_id` may perform an operation needing `minimum` on `node`.
    pub async fn user_can_perform(
        conn: &mut SqliteConnection,
        user_id: i64,
        node: &FileNode,
        minimum: AccessMode,
    ) -> Result<bool> {
        Ok(Self::effective_mode(conn, user_id, node)
            .await?
            .is_some_and(|mode| mode.satisfies(minimum)))
    }

    /// Like [`user_can_perform`](Self::user_can_perform), failing with
    /// `Unauthorized` instead of returning false.
    pub async fn require(
        conn: &mut SqliteConnection,
        user_id: i64,
        node: &FileNode,
        minimum: AccessMode,
    ) -> Result<()> {
        if Self::user_can_perform(conn, user_id, node, minimum).await? {
            Ok(())
        } else {
            Err(VaultError::Unauthorized(format!(
                "account {} lacks {} access to node {}",
                user_id, minimum, node.id
            )))
        }
    }
}
