//! Directory size aggregation.
//!
//! A directory's size is the total size of its subtree, kept up to date
//! incrementally: every size change of a file is pushed up its ancestor
//! chain and charged to the owning account. Sizes never go negative; an
//! underflow is clamped to zero and logged as an anomaly.

use std::collections::{BTreeMap, HashSet};

use sqlx::SqliteConnection;
use tracing::warn;

use super::FileNodeRepository;
use crate::db::AccountRepository;
use crate::{Result, VaultError};

/// How a positive used-space delta treats the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Reject with `QuotaExceeded` if the delta does not fit.
    Enforce,
    /// Apply the delta anyway and log the breach.
    WarnOnly,
}

/// Result of an ancestor walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateReport {
    /// Nodes whose size was changed.
    pub nodes_updated: usize,
    /// Nodes that would have gone negative and were clamped to zero.
    pub clamped: Vec<i64>,
}

/// Size propagation through the directory tree and account usage.
pub struct DirectoryAggregator;

impl DirectoryAggregator {
    /// Apply `delta` to `start_id` and every ancestor above it.
    pub async fn adjust_ancestor_sizes(
        conn: &mut SqliteConnection,
        start_id: i64,
        delta: i64,
    ) -> Result<AggregateReport> {
        let mut report = AggregateReport::default();
        if delta == 0 {
            return Ok(report);
        }
        for node_id in Self::chain_ids(conn, start_id).await? {
            Self::apply_node_delta(conn, node_id, delta, &mut report).await?;
        }
        Ok(report)
    }

    /// Apply `delta` to an account's used space.
    ///
    /// Negative deltas clamp at zero. Positive deltas are checked against
    /// the quota according to `policy`. Returns the new used space.
    pub async fn adjust_user_used_space(
        conn: &mut SqliteConnection,
        account_id: i64,
        delta: i64,
        policy: QuotaPolicy,
    ) -> Result<i64> {
        let account = AccountRepository::require(conn, account_id).await?;
        let mut used = account.used_space.saturating_add(delta);

        if delta > 0 && used > account.quota {
            match policy {
                QuotaPolicy::Enforce => {
                    return Err(VaultError::QuotaExceeded(format!(
                        "account {} needs {} more bytes but only {} remain",
                        account_id,
                        delta,
                        account.available()
                    )));
                }
                QuotaPolicy::WarnOnly => {
                    warn!(
                        account_id,
                        used, quota = account.quota, "account is over quota"
                    );
                }
            }
        }

        if used < 0 {
            warn!(
                account_id,
                used_space = account.used_space,
                delta,
                "used space would go negative, clamping to zero"
            );
            used = 0;
        }

        AccountRepository::set_used_space(conn, account_id, used).await?;
        Ok(used)
    }

    /// Ids of `start_id` and its ancestors, each once, nearest first.
    async fn chain_ids(conn: &mut SqliteConnection, start_id: i64) -> Result<Vec<i64>> {
        let chain = FileNodeRepository::ancestor_chain(conn, start_id).await?;
        let mut visited = HashSet::new();
        let mut ids = Vec::with_capacity(chain.len());
        for node in chain {
            if !visited.insert(node.id) {
                warn!(node_id = node.id, "cycle in ancestor chain, stopping walk");
                break;
            }
            ids.push(node.id);
        }
        Ok(ids)
    }

    async fn apply_node_delta(
        conn: &mut SqliteConnection,
        node_id: i64,
        delta: i64,
        report: &mut AggregateReport,
    ) -> Result<()> {
        let node = FileNodeRepository::require(conn, node_id).await?;
        let mut size = node.size.saturating_add(delta);
        if size < 0 {
            warn!(
                node_id,
                size = node.size,
                delta,
                "node size would go negative, clamping to zero"
            );
            report.clamped.push(node_id);
            size = 0;
        }
        FileNodeRepository::set_size(conn, node_id, size).await?;
        report.nodes_updated += 1;
        Ok(())
    }
}

/// Size changes of a batch operation, gathered before any is applied.
///
/// Every affected directory and account receives a single net update, so a
/// directory shared by the chains of several moved nodes (or by both the
/// old and the new location) is adjusted once per batch.
#[derive(Debug, Default)]
pub struct SizeDeltaPlan {
    node_deltas: BTreeMap<i64, i64>,
    owner_deltas: BTreeMap<i64, i64>,
}

impl SizeDeltaPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to `start_id` and each of its ancestors.
    pub async fn add_chain(
        &mut self,
        conn: &mut SqliteConnection,
        start_id: i64,
        delta: i64,
    ) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        for node_id in DirectoryAggregator::chain_ids(conn, start_id).await? {
            *self.node_deltas.entry(node_id).or_default() += delta;
        }
        Ok(())
    }

    /// Add `delta` to an account's used space.
    pub fn add_owner(&mut self, account_id: i64, delta: i64) {
        if delta != 0 {
            *self.owner_deltas.entry(account_id).or_default() += delta;
        }
    }

    /// Net delta recorded for a node.
    pub fn node_delta(&self, node_id: i64) -> i64 {
        self.node_deltas.get(&node_id).copied().unwrap_or(0)
    }

    /// Net delta recorded for an account.
    pub fn owner_delta(&self, account_id: i64) -> i64 {
        self.owner_deltas.get(&account_id).copied().unwrap_or(0)
    }

    /// Apply the plan. Accounts are charged first so a quota failure leaves
    /// nothing written for the caller's unit of work to commit.
    pub async fn apply(
        self,
        conn: &mut SqliteConnection,
        policy: QuotaPolicy,
    ) -> Result<AggregateReport> {
        for (&account_id, &delta) in self.owner_deltas.iter().filter(|(_, d)| **d != 0) {
            DirectoryAggregator::adjust_user_used_space(conn, account_id, delta, policy).await?;
        }

        let mut report = AggregateReport::default();
        for (&node_id, &delta) in self.node_deltas.iter().filter(|(_, d)| **d != 0) {
            DirectoryAggregator::apply_node_delta(conn, node_id, delta, &mut report).await?;
        }
        Ok(report)
    }
}
