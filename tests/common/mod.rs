//! Test helpers for integration tests.
//!
//! Provides vault fixtures over in-memory and on-disk backends.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use filevault::config::{StorageBackend, StorageConfig};
use filevault::file::{ChunkPlan, LocalChunkStore, MemoryBlobStore};
use filevault::{AccountRepository, Config, Database, Vault};

/// Chunking used by the tests: 16-byte chunks, aiming for 4 per file.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.database.path = dir.join("vault.db").to_string_lossy().into_owned();
    config.storage = StorageConfig {
        backend: StorageBackend::Local,
        path: dir.join("objects").to_string_lossy().into_owned(),
        ..StorageConfig::default()
    };
    config.upload.min_chunk_size = 16;
    config.upload.max_chunk_size = 16;
    config.upload.preferred_chunk_count = 4;
    config.upload.flush_interval_secs = 3600;
    config.accounts.default_quota_mb = 1;
    config
}

/// A vault plus the resources backing it.
pub struct TestEnv {
    pub vault: Vault,
    pub config: Config,
    /// Set when the vault runs on the in-memory blob store.
    pub blobs: Option<Arc<MemoryBlobStore>>,
    pub dir: TempDir,
}

impl TestEnv {
    /// In-memory database and blob store.
    pub async fn memory() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let db = Database::open_in_memory().await.unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let vault = Vault::assemble(db, blobs.clone(), &config);
        Self {
            vault,
            config,
            blobs: Some(blobs),
            dir,
        }
    }

    /// Database file and local chunk store in a temporary directory.
    pub async fn local() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let vault = Vault::open(&config).await.unwrap();
        Self {
            vault,
            config,
            blobs: None,
            dir,
        }
    }

    /// Shut the vault down and open a fresh one on the same files.
    pub async fn reopen(self) -> Self {
        let Self {
            vault, config, dir, ..
        } = self;
        vault.shutdown().await;
        let vault = Vault::open(&config).await.unwrap();
        Self {
            vault,
            config,
            blobs: None,
            dir,
        }
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.dir.path().join("objects")
    }

    /// Path of a backing object of the local store.
    pub fn object_path(&self, object_id: &str) -> PathBuf {
        LocalChunkStore::new(self.objects_dir())
            .unwrap()
            .object_path(object_id)
    }

    /// Create an account and return (account id, root directory id).
    pub async fn account(&self, name: &str) -> (i64, i64) {
        let account = self.vault.create_account(name).await.unwrap();
        (account.id, account.root_id.unwrap())
    }

    pub async fn set_quota(&self, account_id: i64, quota: i64) {
        let mut conn = self.vault.db.pool().acquire().await.unwrap();
        AccountRepository::set_quota(&mut conn, account_id, quota)
            .await
            .unwrap();
    }

    pub async fn used_space(&self, account_id: i64) -> i64 {
        let mut conn = self.vault.db.pool().acquire().await.unwrap();
        AccountRepository::require(&mut conn, account_id)
            .await
            .unwrap()
            .used_space
    }

    pub async fn size_of(&self, node_id: i64) -> i64 {
        let mut conn = self.vault.db.pool().acquire().await.unwrap();
        filevault::file::FileNodeRepository::require(&mut conn, node_id)
            .await
            .unwrap()
            .size
    }

    /// Upload a whole file and complete it. Returns the file id.
    pub async fn upload(&self, owner: i64, parent: i64, name: &str, data: &[u8]) -> i64 {
        let created = self
            .vault
            .uploads
            .create_new_file(owner, parent, name, "", data.len() as u64)
            .await
            .unwrap();
        if let Some(plan) = created.plan {
            for (index, chunk) in chunks(&plan, data) {
                self.vault
                    .uploads
                    .upload_chunk(owner, created.file.id, index, chunk)
                    .await
                    .unwrap();
            }
            self.vault
                .uploads
                .complete_file(owner, created.file.id)
                .await
                .unwrap();
        }
        created.file.id
    }

    /// Read a completed file back chunk by chunk.
    pub async fn read_all(&self, actor: i64, file_id: i64) -> Vec<u8> {
        let file = self.vault.tree.get_node(actor, file_id).await.unwrap();
        let chunk_size = file.chunk_size.max(1) as u64;
        let count = (file.size as u64).div_ceil(chunk_size);
        let mut data = Vec::with_capacity(file.size as usize);
        for index in 0..count {
            data.extend(
                self.vault
                    .tree
                    .read_chunk(actor, file_id, index)
                    .await
                    .unwrap(),
            );
        }
        data
    }
}

/// Deterministic test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Split `data` according to `plan`.
pub fn chunks<'a>(plan: &ChunkPlan, data: &'a [u8]) -> Vec<(u64, &'a [u8])> {
    data.chunks(plan.chunk_size as usize)
        .enumerate()
        .map(|(i, c)| (i as u64, c))
        .collect()
}
