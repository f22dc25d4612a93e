//! Background bitmap flusher.
//!
//! Periodically persists the bitmaps of cached uploads that changed since
//! their last flush. Chunk writes only touch the cache, so this loop bounds
//! how much progress a crash can lose.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::UploadCache;

/// Default flush interval in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Cache flusher background task.
pub struct CacheFlusher {
    cache: Arc<UploadCache>,
    flush_interval: Duration,
}

impl CacheFlusher {
    /// Create a flusher with the default interval.
    pub fn new(cache: Arc<UploadCache>) -> Self {
        Self {
            cache,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }

    /// Create a flusher with a custom interval.
    ///
    /// A zero interval falls back to the default.
    pub fn with_interval(cache: Arc<UploadCache>, flush_interval: Duration) -> Self {
        if flush_interval.is_zero() {
            warn!(
                "Flush interval is zero, using {} seconds",
                DEFAULT_FLUSH_INTERVAL_SECS
            );
            return Self::new(cache);
        }
        Self {
            cache,
            flush_interval,
        }
    }

    /// Start the flusher on the tokio runtime.
    ///
    /// The task runs until `shutdown` turns true (or its sender is dropped),
    /// then performs one last flush and exits.
    pub fn spawn(
        cache: Arc<UploadCache>,
        flush_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let flusher = Self::with_interval(cache, flush_interval);
        tokio::spawn(async move { flusher.run(shutdown).await })
    }

    /// Run the flush loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Cache flusher started (interval: {} seconds)",
            self.flush_interval.as_secs()
        );

        let mut timer = interval(self.flush_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => self.flush_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush_once().await;
        info!("Cache flusher stopped");
    }

    /// Flush every dirty entry once.
    pub async fn flush_once(&self) {
        let stats = self.cache.flush_dirty().await;
        if stats.failed > 0 {
            error!(
                "Failed to flush {} bitmap(s); they stay dirty for the next pass",
                stats.failed
            );
        }
        if stats.flushed > 0 {
            debug!("Flushed {} bitmap(s)", stats.flushed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccountRepository, Database, NewAccount};
    use crate::file::{
        ChunkBitmap, ChunkPlan, FileNodeRepository, NewNode, NodeStatus, UploadSessionRepository,
    };

    async fn setup() -> (Database, Arc<UploadCache>, i64, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let account = AccountRepository::create(&mut conn, &NewAccount::new("alice", 1 << 30))
            .await
            .unwrap();
        let node = FileNodeRepository::create(
            &mut conn,
            &NewNode::file(account.id, account.root_id.unwrap(), "f", "", 16, "obj")
                .with_status(NodeStatus::Incomplete)
                .with_chunk_size(8),
        )
        .await
        .unwrap();
        let plan = ChunkPlan::with_chunk_size(16, 8).unwrap();
        UploadSessionRepository::create(
            &mut conn,
            node.id,
            &plan,
            &ChunkBitmap::initialize(plan.chunk_count),
        )
        .await
        .unwrap();
        drop(conn);
        let cache = Arc::new(UploadCache::new(db.clone()));
        (db, cache, account.id, node.id)
    }

    async fn persisted_bitmap(db: &Database, file: i64) -> Vec<u8> {
        let mut conn = db.pool().acquire().await.unwrap();
        UploadSessionRepository::get_by_node(&mut conn, file)
            .await
            .unwrap()
            .unwrap()
            .bitmap
    }

    #[tokio::test]
    async fn test_final_flush_on_shutdown() {
        let (db, cache, owner, file) = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = CacheFlusher::spawn(Arc::clone(&cache), Duration::from_secs(3600), rx);

        {
            let mut guard = cache.lock(owner, file).await.unwrap();
            guard.entry_mut().bitmap.set_bit(1, false).unwrap();
            guard.entry_mut().dirty = true;
        }

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(persisted_bitmap(&db, file).await, vec![0x80]);
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let (db, cache, owner, file) = setup().await;
        let (_tx, rx) = watch::channel(false);
        let handle = CacheFlusher::spawn(Arc::clone(&cache), Duration::from_millis(20), rx);

        {
            let mut guard = cache.lock(owner, file).await.unwrap();
            guard.entry_mut().bitmap.set_bit(0, false).unwrap();
            guard.entry_mut().dirty = true;
        }

        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if persisted_bitmap(&db, file).await == vec![0x40] {
                flushed = true;
                break;
            }
        }
        handle.abort();
        assert!(flushed, "bitmap never flushed");
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_flusher() {
        let (_db, cache, _, _) = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = CacheFlusher::spawn(cache, Duration::from_secs(3600), rx);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_uses_default() {
        let (db, cache, owner, file) = setup().await;
        let flusher = CacheFlusher::with_interval(Arc::clone(&cache), Duration::ZERO);
        assert_eq!(
            flusher.flush_interval,
            Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)
        );

        let (tx, rx) = watch::channel(false);
        let handle = CacheFlusher::spawn(Arc::clone(&cache), Duration::ZERO, rx);
        {
            let mut guard = cache.lock(owner, file).await.unwrap();
            guard.entry_mut().bitmap.set_bit(0, false).unwrap();
            guard.entry_mut().dirty = true;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(persisted_bitmap(&db, file).await, vec![0x40]);
    }
}
