//! Configuration module for filevault.

use serde::Deserialize;
use std::path::Path;

use crate::file::ChunkConstraints;
use crate::{Result, VaultError};

/// Environment variable overriding `storage.sas_token`.
pub const SAS_TOKEN_ENV: &str = "FILEVAULT_BLOB_SAS_TOKEN";

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/filevault.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Which chunk store backs file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Sharded directory on the local filesystem.
    #[default]
    Local,
    /// Azure block blobs in a container addressed by SAS URL.
    Azure,
    /// Process-local blob store (nothing survives a restart).
    Memory,
}

/// Chunk store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend kind.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Base directory for the local backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// Container URL for the azure backend
    /// (e.g. `https://account.blob.core.windows.net/uploads`).
    #[serde(default)]
    pub container_url: String,
    /// Shared access signature query string for the azure backend.
    #[serde(default)]
    pub sas_token: String,
}

fn default_storage_path() -> String {
    "data/objects".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            container_url: String::new(),
            sas_token: String::new(),
        }
    }
}

/// Upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Smallest chunk size in bytes (files below it upload as one chunk).
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// Largest chunk size in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Number of chunks the planner aims for.
    #[serde(default = "default_preferred_chunk_count")]
    pub preferred_chunk_count: u64,
    /// Seconds between cache flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Maximum file size in megabytes (0 = unlimited).
    #[serde(default)]
    pub max_file_size_mb: u64,
}

fn default_min_chunk_size() -> u64 {
    512 * 1024
}

fn default_max_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_preferred_chunk_count() -> u64 {
    64
}

fn default_flush_interval() -> u64 {
    30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            preferred_chunk_count: default_preferred_chunk_count(),
            flush_interval_secs: default_flush_interval(),
            max_file_size_mb: 0,
        }
    }
}

impl UploadConfig {
    /// Chunk planning constraints derived from this configuration.
    pub fn constraints(&self) -> ChunkConstraints {
        ChunkConstraints {
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
            preferred_chunk_count: self.preferred_chunk_count,
        }
    }

    /// Maximum file size in bytes, if limited.
    pub fn max_file_size(&self) -> Option<u64> {
        (self.max_file_size_mb > 0).then(|| self.max_file_size_mb * 1024 * 1024)
    }
}

/// Account defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
    /// Quota for newly created accounts in megabytes.
    #[serde(default = "default_quota_mb")]
    pub default_quota_mb: u64,
}

fn default_quota_mb() -> u64 {
    1024
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            default_quota_mb: default_quota_mb(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file (empty = console only).
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/filevault.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Chunk store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload configuration.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Account defaults.
    #[serde(default)]
    pub accounts: AccountsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| VaultError::Config(format!("parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FILEVAULT_BLOB_SAS_TOKEN`: Override the blob SAS token
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(SAS_TOKEN_ENV) {
            if !token.is_empty() {
                self.storage.sas_token = token;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let upload = &self.upload;
        if upload.min_chunk_size == 0 {
            return Err(VaultError::Config(
                "upload.min_chunk_size must be positive".to_string(),
            ));
        }
        if upload.min_chunk_size > upload.max_chunk_size {
            return Err(VaultError::Config(format!(
                "upload.min_chunk_size ({}) exceeds upload.max_chunk_size ({})",
                upload.min_chunk_size, upload.max_chunk_size
            )));
        }
        // chunk_size is persisted as a 32-bit column
        if upload.max_chunk_size > i32::MAX as u64 {
            return Err(VaultError::Config(format!(
                "upload.max_chunk_size must not exceed {}",
                i32::MAX
            )));
        }
        if upload.preferred_chunk_count == 0 {
            return Err(VaultError::Config(
                "upload.preferred_chunk_count must be positive".to_string(),
            ));
        }
        if upload.flush_interval_secs == 0 {
            return Err(VaultError::Config(
                "upload.flush_interval_secs must be positive".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Azure && self.storage.container_url.is_empty()
        {
            return Err(VaultError::Config(
                "storage.backend is azure but storage.container_url is not set".to_string(),
            ));
        }
        Ok(())
    }
}
