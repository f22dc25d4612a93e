//! Authorization module for filevault.
//!
//! This module provides ownership and share-grant based access checks
//! and share management.

mod access;
mod share;

pub use access::{effective_mode, AccessGuard, AccessMode};
pub use share::{NewShareGrant, ShareGrant, ShareRepository, ShareService};
