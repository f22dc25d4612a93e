//! Account repository for filevault.

use sqlx::SqliteConnection;

use super::account::{Account, NewAccount};
use crate::file::{FileNodeRepository, NewNode};
use crate::{Result, VaultError};

const ACCOUNT_COLUMNS: &str = "id, name, used_space, quota, root_id, created_at";

/// Repository for account operations.
pub struct AccountRepository;

impl AccountRepository {
    /// Create a new account together with its root directory.
    ///
    /// Run this inside a unit of work so the account never exists without
    /// its root.
    pub async fn create(conn: &mut SqliteConnection, new_account: &NewAccount) -> Result<Account> {
        if new_account.quota < 0 {
            return Err(VaultError::Validation(
                "quota must not be negative".to_string(),
            ));
        }

        let result = sqlx::query("INSERT INTO accounts (name, quota) VALUES (?, ?)")
            .bind(&new_account.name)
            .bind(new_account.quota)
            .execute(&mut *conn)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    VaultError::Conflict(format!("account '{}' already exists", new_account.name))
                }
                other => VaultError::Database(other.to_string()),
            })?;
        let id = result.last_insert_rowid();

        let root =
            FileNodeRepository::create(conn, &NewNode::directory(id, None, &new_account.name))
                .await?;

        sqlx::query("UPDATE accounts SET root_id = ? WHERE id = ?")
            .bind(root.id)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Self::get_by_id(conn, id)
            .await?
            .ok_or_else(|| VaultError::NotFound("account".to_string()))
    }

    /// Get an account by ID.
    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?");
        let account = sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(account)
    }

    /// Get an account by ID, failing with `NotFound` if absent.
    pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Account> {
        Self::get_by_id(conn, id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("account {id}")))
    }

    /// Get an account by name.
    pub async fn get_by_name(conn: &mut SqliteConnection, name: &str) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = ?");
        let account = sqlx::query_as::<_, Account>(&query)
            .bind(name)
            .fetch_optional(conn)
            .await?;
        Ok(account)
    }

    /// Change an account's quota.
    pub async fn set_quota(conn: &mut SqliteConnection, id: i64, quota: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET quota = ? WHERE id = ?")
            .bind(quota)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overwrite the bytes charged to an account.
    pub async fn set_used_space(conn: &mut SqliteConnection, id: i64, used: i64) -> Result<()> {
        sqlx::query("UPDATE accounts SET used_space = ? WHERE id = ?")
            .bind(used)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }
}
