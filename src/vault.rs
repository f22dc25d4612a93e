//! Service composition for filevault.
//!
//! A [`Vault`] owns the database, the chunk store and the upload cache, and
//! hands the same instances to every service. It is built once at startup
//! and torn down with [`Vault::shutdown`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::auth::ShareService;
use crate::config::Config;
use crate::db::{Account, AccountRepository, Database, NewAccount};
use crate::file::storage::open_store;
use crate::file::{CacheFlusher, ChunkStore, TreeService, UploadCache, UploadService};
use crate::Result;

/// The assembled storage engine.
pub struct Vault {
    pub db: Database,
    pub store: Arc<dyn ChunkStore>,
    pub cache: Arc<UploadCache>,
    pub uploads: UploadService,
    pub tree: TreeService,
    pub shares: ShareService,
    default_quota: i64,
    shutdown_tx: watch::Sender<bool>,
    flusher: Option<JoinHandle<()>>,
}

impl Vault {
    /// Open the database and chunk store named by the configuration and
    /// start the cache flusher.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.database.path).await?;
        let store = open_store(&config.storage)?;
        Ok(Self::assemble(db, store, config))
    }

    /// Build a vault over an existing database and chunk store.
    pub fn assemble(db: Database, store: Arc<dyn ChunkStore>, config: &Config) -> Self {
        let cache = Arc::new(UploadCache::new(db.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = CacheFlusher::spawn(
            Arc::clone(&cache),
            Duration::from_secs(config.upload.flush_interval_secs),
            shutdown_rx,
        );

        info!(
            "Vault ready (chunk store: {}, flush interval: {}s)",
            store.backend_name(),
            config.upload.flush_interval_secs
        );

        Self {
            uploads: UploadService::new(
                db.clone(),
                Arc::clone(&store),
                Arc::clone(&cache),
                &config.upload,
            ),
            tree: TreeService::new(db.clone(), Arc::clone(&store), Arc::clone(&cache)),
            shares: ShareService::new(db.clone()),
            default_quota: (config.accounts.default_quota_mb.saturating_mul(1024 * 1024))
                .min(i64::MAX as u64) as i64,
            db,
            store,
            cache,
            shutdown_tx,
            flusher: Some(flusher),
        }
    }

    /// Create an account with the configured default quota.
    pub async fn create_account(&self, name: &str) -> Result<Account> {
        let mut tx = self.db.begin().await?;
        let account =
            AccountRepository::create(&mut tx, &NewAccount::new(name, self.default_quota)).await?;
        tx.commit().await?;
        info!(account_id = account.id, "account '{}' created", name);
        Ok(account)
    }

    /// Stop the flusher (after its final flush) and close the database.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(flusher) = self.flusher.take() {
            if let Err(e) = flusher.await {
                warn!("cache flusher ended abnormally: {}", e);
            }
        }
        self.db.close().await;
        info!("Vault shut down");
    }
}
