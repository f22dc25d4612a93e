//! filevault - multi-tenant file storage with resumable chunked uploads.
//!
//! Files are uploaded in chunks tracked by a per-file bitmap, so an
//! interrupted upload resumes without resending stored chunks. Directory
//! sizes and account usage are maintained incrementally, and access is
//! granted by ownership or time-limited shares.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod file;
pub mod logging;
pub mod vault;

pub use auth::{AccessGuard, AccessMode, ShareGrant, ShareService};
pub use config::Config;
pub use db::{Account, AccountRepository, Database, NewAccount};
pub use error::{ErrorKind, Result, VaultError};
pub use file::{
    ChunkBitmap, ChunkConstraints, ChunkPlan, ChunkStore, FileNode, NodeStatus, TreeService,
    UploadCache, UploadService,
};
pub use vault::Vault;
