//! Public database handle.
//!
//! A [`Database`] is one tab's view of one named database: it owns the
//! tab's VFS adapter and engine, shares the store with every other tab,
//! and sequences writes behind the writer lease. Reads work regardless of
//! leadership; writes require it unless the embedding explicitly opts
//! out. After every successful sync the handle broadcasts a change event
//! carrying the new generation, and reader tabs drop their clean cache on
//! the next access so they observe the advance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::coordination::{
    self, ChangeEvent, ChangeType, LeaderElector, Subscription,
};
use crate::engine::{EngineContext, Row, SqlEngine, SqlValue};
use crate::error::{DatabaseError, Result};
use crate::snapshot;
use crate::storage::{CacheStats, MemoryStoreHost, StoreHost};
use crate::tools::{self, Backoff};
use crate::vfs::{OpenFlags, FileId, VfsAdapter};

/// Journal mode of the engine. Cross-tab WAL is disabled by policy
/// (leader-only writes), so both modes persist only through the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Rollback,
    Wal,
}

/// Options accepted by [`Database::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Block size in bytes; 4096 or 8192, fixed at creation.
    pub block_size: u16,
    /// Soft capacity of the page cache, in blocks.
    pub cache_entries: usize,
    pub journal_mode: JournalMode,
    /// Writer lease period in milliseconds. Accepted within
    /// 50..=600_000; 5_000–10_000 is the sensible production range, the
    /// low floor exists for failover tests.
    pub lease_ms: u64,
    /// Skip the leadership gate on write locks. For tests and single-tab
    /// embeddings only.
    pub allow_non_leader_writes: bool,
    /// Sync (and broadcast) automatically after every mutating statement.
    pub auto_sync: bool,
    /// Store a trailing CRC with every block and verify it on load.
    pub verify_checksums: bool,
    /// How long the handle retries busy locks before reporting `Busy`.
    pub busy_timeout_ms: u64,
    /// Force a sync once this many blocks are dirty, even with auto-sync
    /// off.
    pub max_dirty: Option<usize>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cache_entries: 256,
            journal_mode: JournalMode::Rollback,
            lease_ms: 7_500,
            allow_non_leader_writes: false,
            auto_sync: true,
            verify_checksums: false,
            busy_timeout_ms: 5_000,
            max_dirty: None,
        }
    }
}

impl OpenOptions {
    pub fn validate(&self) -> Result<()> {
        if self.block_size != 4096 && self.block_size != 8192 {
            return Err(DatabaseError::invalid(format!(
                "block_size must be 4096 or 8192, got {}",
                self.block_size
            )));
        }
        if self.cache_entries < 8 {
            return Err(DatabaseError::invalid(format!(
                "cache_entries must be at least 8, got {}",
                self.cache_entries
            )));
        }
        if self.lease_ms < 50 || self.lease_ms > 600_000 {
            return Err(DatabaseError::invalid(format!(
                "lease_ms must be within 50..=600000, got {}",
                self.lease_ms
            )));
        }
        Ok(())
    }
}

/// Per-block line of the storage report.
#[derive(Debug, Clone, Serialize)]
pub struct BlockInfo {
    pub index: u64,
    pub dirty: bool,
}

/// Read-only snapshot of the storage state, for embedding viewers.
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub database_name: String,
    pub block_size: usize,
    pub file_size: u64,
    pub generation: u64,
    pub resident_blocks: usize,
    pub dirty_blocks: usize,
    pub blocks: Vec<BlockInfo>,
}

/// Sync observability counters.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub sync_count: u64,
    pub last_sync_duration_ms: u64,
    pub last_sync_blocks: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub emergency_flushes: u64,
}

impl From<&CacheStats> for SyncStats {
    fn from(stats: &CacheStats) -> Self {
        Self {
            sync_count: stats.sync_count,
            last_sync_duration_ms: stats.last_sync_duration_ms,
            last_sync_blocks: stats.last_sync_blocks,
            cache_hits: stats.hits,
            cache_misses: stats.misses,
            emergency_flushes: stats.emergency_flushes,
        }
    }
}

/// One tab's handle onto a named database.
pub struct Database {
    name: String,
    options: OpenOptions,
    vfs: VfsAdapter,
    main: FileId,
    engine: Box<dyn SqlEngine>,
    elector: Arc<LeaderElector>,
    /// Set by the internal bus subscription when a peer advanced the
    /// database; the next access refreshes the cache first.
    peer_changed: Arc<AtomicBool>,
    _peer_watch: Subscription,
    poisoned: bool,
    closed: bool,
}

impl Database {
    /// Open a database backed by the in-process shared store.
    pub async fn open(
        name: &str,
        options: OpenOptions,
        engine: Box<dyn SqlEngine>,
    ) -> Result<Database> {
        Self::open_with_store(name, options, engine, MemoryStoreHost::shared()).await
    }

    /// Open a database on a caller-provided store host.
    pub async fn open_with_store(
        name: &str,
        options: OpenOptions,
        engine: Box<dyn SqlEngine>,
        host: Arc<dyn StoreHost>,
    ) -> Result<Database> {
        tools::check_database_name(name)?;
        options.validate()?;

        let elector = LeaderElector::new(&host, name, options.lease_ms).await?;
        // The first tab to open a database typically becomes its writer;
        // losing this race just means opening as a reader.
        let _ = elector.try_acquire().await?;

        let mut vfs = VfsAdapter::new(
            name,
            host,
            elector.clone(),
            options.block_size as usize,
            options.cache_entries,
            options.verify_checksums,
            !options.allow_non_leader_writes,
        );
        let mut flags = OpenFlags::MAIN_DB | OpenFlags::READ_WRITE | OpenFlags::CREATE;
        if options.journal_mode == JournalMode::Wal {
            flags |= OpenFlags::WAL;
        }
        let main = vfs.open(name, flags).await?;

        let peer_changed = Arc::new(AtomicBool::new(false));
        let flag = peer_changed.clone();
        let own_id = elector.leader_id();
        let peer_watch = coordination::subscribe(name, move |event: ChangeEvent| {
            if event.origin_leader_id != own_id {
                flag.store(true, Ordering::SeqCst);
            }
        });

        log::info!(
            "opened database {:?} (leader: {}, generation {})",
            name,
            elector.is_leader(),
            vfs.generation()
        );
        Ok(Database {
            name: name.to_string(),
            options,
            vfs,
            main,
            engine,
            elector,
            peer_changed,
            _peer_watch: peer_watch,
            poisoned: false,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn generation(&self) -> u64 {
        self.vfs.generation()
    }

    /// Submit one SQL statement to the engine.
    ///
    /// Write statements fail with `NotLeader` when this tab does not hold
    /// the writer lease (unless `allow_non_leader_writes` is set). Lock
    /// contention is retried with exponential backoff up to the busy
    /// timeout. On a successful mutation with auto-sync enabled the
    /// change is made durable and broadcast before this returns.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.guard_usable()?;
        self.refresh_if_peer_changed().await?;

        let deadline = Instant::now() + Duration::from_millis(self.options.busy_timeout_ms);
        let mut backoff = Backoff::new(Duration::from_millis(2), Duration::from_millis(100));
        let outcome = loop {
            let attempt = self
                .engine
                .execute(
                    EngineContext { vfs: &mut self.vfs, main: self.main },
                    sql,
                    params,
                )
                .await;
            match attempt {
                Ok(outcome) => break outcome,
                Err(DatabaseError::Busy) if Instant::now() < deadline => {
                    backoff.sleep().await;
                }
                Err(err) => {
                    if matches!(err, DatabaseError::Corrupt { .. }) {
                        log::error!("database {:?} is corrupt, refusing further work", self.name);
                        self.poisoned = true;
                    }
                    return Err(err);
                }
            }
        };

        // The engine may have requested a checkpoint through file-control
        // mid-statement.
        if self.vfs.take_checkpoint_request() {
            self.engine
                .checkpoint(EngineContext { vfs: &mut self.vfs, main: self.main })
                .await?;
        }

        if outcome.mutated {
            if self.options.auto_sync {
                self.sync_and_broadcast(outcome.change_type).await?;
            } else if let Some(max_dirty) = self.options.max_dirty {
                let dirty = self
                    .vfs
                    .main_cache()
                    .map(|cache| cache.dirty_blocks())
                    .unwrap_or(0);
                if dirty >= max_dirty {
                    log::debug!(
                        "{} dirty blocks reached the sync threshold {}",
                        dirty,
                        max_dirty
                    );
                    self.sync_and_broadcast(outcome.change_type).await?;
                }
            }
        }
        Ok(outcome.rows)
    }

    /// Read-only convenience wrapper around [`execute`](Self::execute).
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.execute(sql, params).await
    }

    /// Force a sync of all dirty state. No-op (and no event) when nothing
    /// changed since the last sync.
    pub async fn sync(&mut self) -> Result<()> {
        self.guard_usable()?;
        self.sync_and_broadcast(ChangeType::Data).await
    }

    /// Export the database as a single self-contained image.
    pub async fn export_to_bytes(&mut self) -> Result<Vec<u8>> {
        self.guard_usable()?;
        let result = snapshot::export_to_bytes(&mut self.vfs, self.main, &mut *self.engine).await;
        self.poison_on_corruption(&result);
        result
    }

    /// Replace the database from an exported image and broadcast the
    /// replacement.
    pub async fn import_from_bytes(&mut self, image: &[u8]) -> Result<()> {
        self.guard_usable()?;
        let imported = snapshot::import_from_bytes(&mut self.vfs, self.main, image).await;
        self.poison_on_corruption(&imported);
        let generation = imported?;
        coordination::publish(&ChangeEvent {
            database_name: self.name.clone(),
            generation,
            change_type: ChangeType::SnapshotReplaced,
            origin_leader_id: self.elector.leader_id(),
        });
        Ok(())
    }

    /// Block until this tab holds the writer lease, or `Timeout`.
    pub async fn wait_for_leadership(&self, timeout: Duration) -> Result<()> {
        self.guard_open()?;
        self.elector.wait_for_leadership(timeout).await
    }

    /// Register a callback for change events from peer tabs (and this
    /// one). Dropping the returned subscription detaches it.
    pub fn on_data_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + 'static,
    {
        coordination::subscribe(&self.name, callback)
    }

    /// Storage report for embedding viewers.
    pub fn storage_info(&self) -> StorageInfo {
        let cache = self.vfs.main_cache();
        let blocks = cache
            .map(|cache| {
                cache
                    .resident_indices()
                    .into_iter()
                    .map(|index| BlockInfo { index, dirty: cache.is_dirty(index) })
                    .collect()
            })
            .unwrap_or_default();
        StorageInfo {
            database_name: self.name.clone(),
            block_size: cache.map(|c| c.block_size()).unwrap_or(0),
            file_size: cache.map(|c| c.file_size()).unwrap_or(0),
            generation: cache.map(|c| c.generation()).unwrap_or(0),
            resident_blocks: cache.map(|c| c.resident_blocks()).unwrap_or(0),
            dirty_blocks: cache.map(|c| c.dirty_blocks()).unwrap_or(0),
            blocks,
        }
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.vfs
            .main_cache()
            .map(|cache| SyncStats::from(cache.stats()))
            .unwrap_or_else(|| SyncStats {
                sync_count: 0,
                last_sync_duration_ms: 0,
                last_sync_blocks: 0,
                cache_hits: 0,
                cache_misses: 0,
                emergency_flushes: 0,
            })
    }

    /// Flush, release the writer lease and detach from the change bus.
    pub async fn close(mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.poisoned {
            if let Err(err) = self.vfs.sync(self.main).await {
                log::warn!("flush on close of {:?} failed: {}", self.name, err);
            }
        }
        if let Err(err) = self.elector.force_relinquish().await {
            log::warn!("lease release for {:?} failed: {}", self.name, err);
        }
        let _ = self.vfs.close_file(self.main);
        log::info!("closed database {:?}", self.name);
        Ok(())
    }

    /// Drop the handle the way a crashing tab would: local state is
    /// forgotten, the heartbeat stops, and the lease is left to expire so
    /// peers fail over naturally. Test support for the failover path.
    pub fn abandon(self) {
        self.elector.abandon();
    }

    async fn sync_and_broadcast(&mut self, change_type: ChangeType) -> Result<()> {
        let before = self.vfs.generation();
        let generation = self.vfs.sync(self.main).await?;
        if generation > before {
            coordination::publish(&ChangeEvent {
                database_name: self.name.clone(),
                generation,
                change_type,
                origin_leader_id: self.elector.leader_id(),
            });
        }
        Ok(())
    }

    fn poison_on_corruption<T>(&mut self, result: &Result<T>) {
        if let Err(DatabaseError::Corrupt { .. }) = result {
            log::error!("database {:?} is corrupt, refusing further work", self.name);
            self.poisoned = true;
        }
    }

    async fn refresh_if_peer_changed(&mut self) -> Result<()> {
        if self.peer_changed.swap(false, Ordering::SeqCst) {
            log::debug!("peer advanced {:?}, refreshing cache", self.name);
            self.vfs.refresh_main().await?;
        }
        Ok(())
    }

    fn guard_open(&self) -> Result<()> {
        if self.closed {
            return Err(DatabaseError::Closed);
        }
        Ok(())
    }

    fn guard_usable(&self) -> Result<()> {
        self.guard_open()?;
        if self.poisoned {
            return Err(DatabaseError::corrupt(
                "handle disabled after earlier corruption",
            ));
        }
        Ok(())
    }
}
