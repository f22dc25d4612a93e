//! Account model for filevault.
//!
//! An account is the tenant that owns nodes and is charged for their size.

/// Account entity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    /// Unique account ID.
    pub id: i64,
    /// Account name (unique).
    pub name: String,
    /// Bytes currently charged to this account.
    pub used_space: i64,
    /// Maximum bytes this account may use.
    pub quota: i64,
    /// Root directory node of this account.
    pub root_id: Option<i64>,
    /// Creation timestamp.
    pub created_at: String,
}

impl Account {
    /// Bytes still available under the quota.
    pub fn available(&self) -> i64 {
        (self.quota - self.used_space).max(0)
    }

    /// Whether `additional` more bytes fit in the quota.
    pub fn can_allocate(&self, additional: i64) -> bool {
        additional <= 0 || self.used_space.saturating_add(additional) <= self.quota
    }
}

/// Data for creating a new account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Account name.
    pub name: String,
    /// Quota in bytes.
    pub quota: i64,
}

impl NewAccount {
    /// Create a new account request.
    pub fn new(name: impl Into<String>, quota: i64) -> Self {
        Self {
            name: name.into(),
            quota,
        }
    }
}
