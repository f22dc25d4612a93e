//! Upload session cache.
//!
//! Holds the live bitmap of every in-progress upload so chunk writes never
//! touch the database. Each session sits behind its own lock; the bitmap
//! update and the chunk store write for one file happen under that lock,
//! while different files proceed independently.
//!
//! Entries are hydrated lazily from the database on first access. The
//! hydrating task holds the entry's lock and re-checks it, so concurrent
//! first accesses load the session once.
//!
//! Lock order: an entry lock is always taken before a database connection,
//! never while holding one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use super::{ChunkBitmap, ChunkPlan, FileNodeRepository, UploadSessionRepository};
use crate::db::Database;
use crate::{Result, VaultError};

/// Cache key: (owner, file).
pub type CacheKey = (i64, i64);

/// Live state of one upload.
#[derive(Debug, Clone)]
pub struct UploadEntry {
    pub node_id: i64,
    pub owner_id: i64,
    pub backing_object: String,
    pub mime_type: String,
    pub plan: ChunkPlan,
    pub bitmap: ChunkBitmap,
    /// Bitmap changed since it was last persisted.
    pub dirty: bool,
}

/// State of a cache slot.
#[derive(Debug)]
pub enum Slot {
    /// Not loaded yet.
    Vacant,
    /// Hydrated or registered.
    Live(UploadEntry),
    /// Dropped from the map while the upload continues; look it up again.
    Evicted,
    /// The upload finished, was cancelled, or its file was deleted.
    Retired,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Exclusive access to a live upload entry.
pub struct SessionGuard {
    key: CacheKey,
    slot: SlotRef,
    guard: OwnedMutexGuard<Slot>,
}

impl SessionGuard {
    /// The (owner, file) this guard locks.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn entry(&self) -> &UploadEntry {
        match &*self.guard {
            Slot::Live(entry) => entry,
            // A guard is only handed out for a live slot and the slot only
            // changes state through the guard's owner.
            _ => unreachable!("session guard over a non-live slot"),
        }
    }

    pub fn entry_mut(&mut self) -> &mut UploadEntry {
        match &mut *self.guard {
            Slot::Live(entry) => entry,
            _ => unreachable!("session guard over a non-live slot"),
        }
    }
}

/// A slot locked in whatever state it is in, without hydrating it.
///
/// Held across a commit that changes who may use the slot, so nobody can
/// act through the old state in between.
pub struct SlotClaim {
    key: CacheKey,
    slot: SlotRef,
    guard: OwnedMutexGuard<Slot>,
}

impl SlotClaim {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// The cached entry, if the slot is live.
    pub fn entry(&self) -> Option<&UploadEntry> {
        match &*self.guard {
            Slot::Live(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Outcome of a flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Dirty bitmaps written to the database.
    pub flushed: usize,
    /// Bitmaps that failed to persist and stay dirty.
    pub failed: usize,
}

/// Registry of in-progress uploads.
pub struct UploadCache {
    db: Database,
    slots: RwLock<HashMap<CacheKey, SlotRef>>,
    hydrations: AtomicU64,
}

impl UploadCache {
    /// Create an empty cache over a database.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            slots: RwLock::new(HashMap::new()),
            hydrations: AtomicU64::new(0),
        }
    }

    /// Number of slots currently mapped.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Whether a live entry is cached for the key.
    pub async fn contains(&self, owner_id: i64, file_id: i64) -> bool {
        let slot = self.slots.read().await.get(&(owner_id, file_id)).cloned();
        match slot {
            Some(slot) => matches!(&*slot.lock().await, Slot::Live(_)),
            None => false,
        }
    }

    /// How many times an entry was loaded from the database.
    pub fn hydration_count(&self) -> u64 {
        self.hydrations.load(Ordering::Relaxed)
    }

    /// Map a locked, empty slot for a file that is being created.
    ///
    /// The file id is fresh, so the lock is uncontended and this may be
    /// called inside the creating transaction. Anyone who looks the file
    /// up waits until [`activate`](Self::activate) or
    /// [`release`](Self::release).
    pub async fn reserve(&self, owner_id: i64, file_id: i64) -> SlotClaim {
        let key = (owner_id, file_id);
        let slot: SlotRef = Arc::new(Mutex::new(Slot::Vacant));
        let guard = Arc::clone(&slot).lock_owned().await;
        self.slots.write().await.insert(key, Arc::clone(&slot));
        debug!(owner_id, file_id, "reserved upload session");
        SlotClaim { key, slot, guard }
    }

    /// Publish the entry of a reserved slot.
    pub async fn activate(&self, mut claim: SlotClaim, entry: UploadEntry) {
        *claim.guard = Slot::Live(entry);
        debug!(
            owner_id = claim.key.0,
            file_id = claim.key.1,
            "registered upload session"
        );
    }

    /// Lock the slot for (owner, file) as it is, without hydrating it.
    pub async fn claim(&self, owner_id: i64, file_id: i64) -> SlotClaim {
        let key = (owner_id, file_id);
        loop {
            let slot = self.slot_for(key).await;
            let guard = Arc::clone(&slot).lock_owned().await;
            if matches!(&*guard, Slot::Evicted) {
                continue;
            }
            return SlotClaim { key, slot, guard };
        }
    }

    /// Give up a claim without changing the upload.
    ///
    /// A slot that was never loaded is unmapped; waiters look it up again.
    pub async fn release(&self, mut claim: SlotClaim) {
        if matches!(&*claim.guard, Slot::Vacant) {
            *claim.guard = Slot::Evicted;
            self.unmap(claim.key, &claim.slot).await;
        }
    }

    /// Drop a claimed entry whose key is no longer valid.
    ///
    /// The caller has persisted the bitmap already. The upload stays
    /// active; the next access hydrates it under its current key.
    pub async fn evict_claimed(&self, mut claim: SlotClaim) {
        if !matches!(&*claim.guard, Slot::Retired) {
            *claim.guard = Slot::Evicted;
        }
        self.unmap(claim.key, &claim.slot).await;
        debug!(
            owner_id = claim.key.0,
            file_id = claim.key.1,
            "evicted upload session"
        );
    }

    /// Lock the entry for (owner, file), hydrating it if needed.
    ///
    /// Fails with `NotFound` if the file or its session is missing,
    /// `Unauthorized` if the file belongs to someone else, and
    /// `InvalidState` for directories and finished or deleted files.
    pub async fn lock(&self, owner_id: i64, file_id: i64) -> Result<SessionGuard> {
        let key = (owner_id, file_id);
        loop {
            let slot = self.slot_for(key).await;
            let mut guard = Arc::clone(&slot).lock_owned().await;

            match &*guard {
                Slot::Live(_) => {}
                Slot::Evicted => continue,
                Slot::Retired => {
                    return Err(VaultError::InvalidState(format!(
                        "upload of file {file_id} is no longer active"
                    )))
                }
                Slot::Vacant => match self.hydrate(owner_id, file_id).await {
                    Ok(entry) => *guard = Slot::Live(entry),
                    Err(e) => {
                        *guard = Slot::Evicted;
                        self.unmap(key, &slot).await;
                        return Err(e);
                    }
                },
            }

            return Ok(SessionGuard { key, slot, guard });
        }
    }

    /// Finish with an upload: the slot is retired and unmapped.
    ///
    /// Anyone still waiting on the slot sees `InvalidState`.
    pub async fn retire(&self, mut session: SessionGuard) {
        *session.guard = Slot::Retired;
        self.unmap(session.key, &session.slot).await;
        debug!(
            owner_id = session.key.0,
            file_id = session.key.1,
            "retired upload session"
        );
    }

    /// Retire the entry of a deleted file, waiting for its current holder.
    pub async fn retire_key(&self, owner_id: i64, file_id: i64) {
        let key = (owner_id, file_id);
        let Some(slot) = self.slots.read().await.get(&key).cloned() else {
            return;
        };
        let mut guard = slot.lock().await;
        *guard = Slot::Retired;
        self.unmap(key, &slot).await;
        debug!(owner_id, file_id, "retired upload session of deleted file");
    }

    /// Persist every dirty bitmap.
    ///
    /// Each entry is flushed under its own lock, so a flush never observes
    /// a bitmap mid-update.
    pub async fn flush_dirty(&self) -> FlushStats {
        let snapshot: Vec<(CacheKey, SlotRef)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect();

        let mut stats = FlushStats::default();
        for (key, slot) in snapshot {
            let mut guard = slot.lock().await;
            let Slot::Live(entry) = &mut *guard else {
                continue;
            };
            if !entry.dirty {
                continue;
            }
            match self.persist(entry).await {
                Ok(()) => stats.flushed += 1,
                Err(e) => {
                    warn!(owner_id = key.0, file_id = key.1, "failed to flush bitmap: {}", e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    async fn persist(&self, entry: &mut UploadEntry) -> Result<()> {
        if !entry.dirty {
            return Ok(());
        }
        let mut conn = self.db.pool().acquire().await?;
        let updated =
            UploadSessionRepository::update_bitmap(&mut conn, entry.node_id, &entry.bitmap)
                .await?;
        if !updated {
            debug!(file_id = entry.node_id, "session row gone, dropping bitmap");
        }
        entry.dirty = false;
        Ok(())
    }

    async fn slot_for(&self, key: CacheKey) -> SlotRef {
        if let Some(slot) = self.slots.read().await.get(&key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(Slot::Vacant))),
        )
    }

    /// Remove the key if it still maps to `slot`.
    async fn unmap(&self, key: CacheKey, slot: &SlotRef) {
        let mut slots = self.slots.write().await;
        if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&key);
        }
    }

    async fn hydrate(&self, owner_id: i64, file_id: i64) -> Result<UploadEntry> {
        let mut conn = self.db.pool().acquire().await?;
        let node = FileNodeRepository::require(&mut conn, file_id).await?;

        if node.owner_id != owner_id {
            return Err(VaultError::Unauthorized(format!(
                "file {file_id} belongs to another account"
            )));
        }
        if node.is_directory {
            return Err(VaultError::InvalidState(format!(
                "node {file_id} is a directory"
            )));
        }
        if node.is_completed() {
            return Err(VaultError::InvalidState(format!(
                "file {file_id} is already completed"
            )));
        }

        let session = UploadSessionRepository::get_by_node(&mut conn, file_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("upload session {file_id}")))?;
        let plan = session.plan()?;
        let backing_object = node.backing_object.ok_or_else(|| {
            VaultError::InvalidState(format!("file {file_id} has no backing object"))
        })?;

        self.hydrations.fetch_add(1, Ordering::Relaxed);
        debug!(owner_id, file_id, "hydrated upload session");

        Ok(UploadEntry {
            node_id: file_id,
            owner_id,
            backing_object,
            mime_type: node.mime_type,
            plan,
            bitmap: session.chunk_bitmap(),
            dirty: false,
        })
    }
}
