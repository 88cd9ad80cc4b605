use std::sync::Arc;
use std::time::Duration;

use crate::coordination::{LeaderElector, LockLevel, LockManager};
use crate::error::{DatabaseError, Result};
use crate::storage::{BlockStore, CacheConfig, PageCache, StoreHost};
use crate::vfs::{
    ControlReply, FileKind, OpenFlags, CONTROL_BUSY_TIMEOUT, CONTROL_FORCE_CHECKPOINT,
    CONTROL_GET_GENERATION, CONTROL_GET_LEADER_STATUS,
};

/// Opaque handle to a file opened through the adapter. The engine only
/// ever sees these indices; it never touches cache internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(usize);

enum FileBody {
    /// Block-cached file over its own store namespace.
    Blocks(PageCache),
    /// Process-local buffer; never persisted.
    Memory(Vec<u8>),
}

struct VfsFile {
    name: String,
    kind: FileKind,
    read_only: bool,
    body: FileBody,
}

/// Per-tab VFS adapter: owns the open-file arena, the tab's lock state
/// and the busy-polling window. One adapter serves exactly one database
/// and its auxiliary files.
pub struct VfsAdapter {
    db_name: String,
    host: Arc<dyn StoreHost>,
    elector: Arc<LeaderElector>,
    block_size: usize,
    cache_entries: usize,
    verify_checksums: bool,
    files: Vec<Option<VfsFile>>,
    lock: LockManager,
    busy_timeout: Duration,
    checkpoint_requested: bool,
}

impl VfsAdapter {
    pub fn new(
        db_name: &str,
        host: Arc<dyn StoreHost>,
        elector: Arc<LeaderElector>,
        block_size: usize,
        cache_entries: usize,
        verify_checksums: bool,
        enforce_leadership: bool,
    ) -> Self {
        let tab_id = rand::random::<u64>();
        let lock = LockManager::new(db_name, tab_id, elector.clone(), enforce_leadership);
        Self {
            db_name: db_name.to_string(),
            host,
            elector,
            block_size,
            cache_entries,
            verify_checksums,
            files: Vec::new(),
            lock,
            busy_timeout: Duration::from_millis(0),
            checkpoint_requested: false,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::new(self.block_size, self.cache_entries);
        config.verify_checksums = self.verify_checksums;
        config
    }

    /// Open a file by name. Auxiliary files are recognized by suffix and
    /// must belong to this adapter's database. Metadata is created
    /// lazily: opening and reading a never-written database sees a
    /// zero-byte file.
    pub async fn open(&mut self, name: &str, flags: OpenFlags) -> Result<FileId> {
        let kind = FileKind::of(name);
        if FileKind::base_name(name) != self.db_name {
            return Err(DatabaseError::invalid(format!(
                "file {:?} does not belong to database {:?}",
                name, self.db_name
            )));
        }
        if kind == FileKind::Main {
            let already_open = self
                .files
                .iter()
                .flatten()
                .any(|f| f.kind == FileKind::Main);
            if already_open {
                return Err(DatabaseError::invalid(format!(
                    "main file of {:?} is already open",
                    self.db_name
                )));
            }
        }
        let body = match kind {
            FileKind::Shm => FileBody::Memory(Vec::new()),
            _ => {
                let store = self.host.open_namespace(name).await?;
                FileBody::Blocks(PageCache::open(store, self.cache_config()).await?)
            }
        };
        let file = VfsFile {
            name: name.to_string(),
            kind,
            read_only: flags.contains(OpenFlags::READ_ONLY),
            body,
        };
        let id = match self.files.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                self.files[free] = Some(file);
                free
            }
            None => {
                self.files.push(Some(file));
                self.files.len() - 1
            }
        };
        log::debug!("opened {:?} as file {}", name, id);
        Ok(FileId(id))
    }

    pub fn close_file(&mut self, id: FileId) -> Result<()> {
        self.file_ref(id)?;
        self.files[id.0] = None;
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`. A range reaching past the end
    /// of the file is zero-filled and reported as a short read, which the
    /// engine treats as a valid read of the tail.
    pub async fn read_at(&mut self, id: FileId, buf: &mut [u8], offset: u64) -> Result<()> {
        for byte in buf.iter_mut() {
            *byte = 0;
        }
        if buf.is_empty() {
            return Ok(());
        }
        let file = Self::live_file(&mut self.files, id, "read on closed file handle")?;
        match &mut file.body {
            FileBody::Memory(data) => {
                let len = data.len() as u64;
                if offset >= len {
                    return Err(DatabaseError::ShortRead { offset, file_size: len });
                }
                let end = (offset + buf.len() as u64).min(len);
                let span = (end - offset) as usize;
                buf[..span].copy_from_slice(&data[offset as usize..end as usize]);
                if end < offset + buf.len() as u64 {
                    return Err(DatabaseError::ShortRead { offset, file_size: len });
                }
                Ok(())
            }
            FileBody::Blocks(cache) => {
                let block_size = cache.block_size() as u64;
                let file_size = cache.file_size();
                if offset >= file_size {
                    return Err(DatabaseError::ShortRead { offset, file_size });
                }
                let readable_end = (offset + buf.len() as u64).min(file_size);
                let first = offset / block_size;
                let last = (readable_end - 1) / block_size;

                // Load and pin the whole span first so one engine read
                // observes a single consistent snapshot of the cache.
                let mut pinned: Vec<u64> = Vec::with_capacity((last - first + 1) as usize);
                for index in first..=last {
                    match cache.read(index).await {
                        Ok(_) => {
                            cache.pin(index)?;
                            pinned.push(index);
                        }
                        Err(err) => {
                            for &index in &pinned {
                                cache.unpin(index);
                            }
                            return Err(err);
                        }
                    }
                }
                let mut buf_offset = 0usize;
                for index in first..=last {
                    let block_start = if index == first {
                        (offset % block_size) as usize
                    } else {
                        0
                    };
                    let block_end = if index == last {
                        ((readable_end - 1) % block_size + 1) as usize
                    } else {
                        block_size as usize
                    };
                    let data = cache.peek(index).expect("pinned block is resident");
                    let span = block_end - block_start;
                    buf[buf_offset..buf_offset + span]
                        .copy_from_slice(&data[block_start..block_end]);
                    buf_offset += span;
                }
                for &index in &pinned {
                    cache.unpin(index);
                }
                if readable_end < offset + buf.len() as u64 {
                    return Err(DatabaseError::ShortRead { offset, file_size });
                }
                Ok(())
            }
        }
    }

    /// Write `data` at `offset`, extending the file as needed. Writes to
    /// the main file require a reserved-or-higher lock.
    pub async fn write_at(&mut self, id: FileId, data: &[u8], offset: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let lock_level = self.lock.level();
        let file = Self::live_file(&mut self.files, id, "write on closed file handle")?;
        if file.read_only {
            return Err(DatabaseError::invalid(format!(
                "file {:?} was opened read-only",
                file.name
            )));
        }
        if file.kind == FileKind::Main && lock_level < LockLevel::Reserved {
            return Err(DatabaseError::Busy);
        }
        match &mut file.body {
            FileBody::Memory(buffer) => {
                let end = offset as usize + data.len();
                if end > buffer.len() {
                    buffer.resize(end, 0);
                }
                buffer[offset as usize..end].copy_from_slice(data);
                Ok(())
            }
            FileBody::Blocks(cache) => {
                let block_size = cache.block_size() as u64;
                let end = offset + data.len() as u64;
                let first = offset / block_size;
                let last = (end - 1) / block_size;
                let mut data_offset = 0usize;
                for index in first..=last {
                    let block_start = if index == first {
                        (offset % block_size) as usize
                    } else {
                        0
                    };
                    let block_end = if index == last {
                        ((end - 1) % block_size + 1) as usize
                    } else {
                        block_size as usize
                    };
                    let span = block_end - block_start;
                    cache
                        .write(index, block_start, &data[data_offset..data_offset + span])
                        .await?;
                    data_offset += span;
                }
                cache.extend_file_size(end);
                Ok(())
            }
        }
    }

    /// Shrink (or grow) the file. Requires a reserved-or-higher lock on
    /// the main file; store deletions are deferred to the next flush.
    pub async fn truncate(&mut self, id: FileId, size: u64) -> Result<()> {
        let lock_level = self.lock.level();
        let file = Self::live_file(&mut self.files, id, "truncate on closed file handle")?;
        if file.kind == FileKind::Main && lock_level < LockLevel::Reserved {
            return Err(DatabaseError::Busy);
        }
        match &mut file.body {
            FileBody::Memory(buffer) => {
                buffer.resize(size as usize, 0);
                Ok(())
            }
            FileBody::Blocks(cache) => cache.truncate(size).await,
        }
    }

    pub fn file_size(&self, id: FileId) -> Result<u64> {
        match &self.file_ref(id)?.body {
            FileBody::Memory(buffer) => Ok(buffer.len() as u64),
            FileBody::Blocks(cache) => Ok(cache.file_size()),
        }
    }

    /// Flush the file to the store. Returns the generation after the
    /// flush (0 for memory files). Success means durability: a fresh
    /// handle over the same namespace sees exactly this state.
    pub async fn sync(&mut self, id: FileId) -> Result<u64> {
        let last_writer = self.elector.leader_id();
        let file = Self::live_file(&mut self.files, id, "sync on closed file handle")?;
        match &mut file.body {
            FileBody::Memory(_) => Ok(0),
            FileBody::Blocks(cache) => cache.flush(last_writer).await,
        }
    }

    /// Upgrade the tab's lock on the database. Auxiliary files carry no
    /// locks of their own. Polls for up to the configured busy timeout.
    pub async fn lock(&mut self, id: FileId, level: LockLevel) -> Result<()> {
        if self.file_ref(id)?.kind != FileKind::Main {
            return Ok(());
        }
        let timeout = self.busy_timeout;
        self.lock.lock_wait(level, timeout).await
    }

    pub fn unlock(&mut self, id: FileId, level: LockLevel) -> Result<()> {
        if self.file_ref(id)?.kind != FileKind::Main {
            return Ok(());
        }
        self.lock.unlock(level)
    }

    /// Whether any tab holds a reserved-or-higher lock on the database.
    pub fn check_reserved_lock(&self, id: FileId) -> Result<bool> {
        self.file_ref(id)?;
        Ok(self.lock.someone_reserved())
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }

    /// The engine's side channel. Unknown opcodes report
    /// [`ControlReply::Unrecognized`], which the boundary translates to
    /// the NOTFOUND code.
    pub fn file_control(&mut self, id: FileId, op: u32, arg: u64) -> Result<ControlReply> {
        self.file_ref(id)?;
        match op {
            CONTROL_BUSY_TIMEOUT => {
                self.busy_timeout = Duration::from_millis(arg);
                Ok(ControlReply::Done)
            }
            CONTROL_GET_GENERATION => Ok(ControlReply::Generation(self.generation())),
            CONTROL_GET_LEADER_STATUS => {
                Ok(ControlReply::LeaderStatus(self.elector.is_leader()))
            }
            CONTROL_FORCE_CHECKPOINT => {
                self.checkpoint_requested = true;
                Ok(ControlReply::Done)
            }
            _ => Ok(ControlReply::Unrecognized),
        }
    }

    /// Consume a pending checkpoint request raised via file-control.
    pub fn take_checkpoint_request(&mut self) -> bool {
        std::mem::replace(&mut self.checkpoint_requested, false)
    }

    /// Delete a file: its namespace is cleared and, when the file is
    /// open, its cache is reset to the now-empty state. The engine uses
    /// this to discard the rollback journal after a commit.
    pub async fn delete(&mut self, name: &str) -> Result<()> {
        if FileKind::base_name(name) != self.db_name {
            return Err(DatabaseError::invalid(format!(
                "file {:?} does not belong to database {:?}",
                name, self.db_name
            )));
        }
        if FileKind::of(name) == FileKind::Shm {
            for file in self.files.iter_mut().flatten() {
                if file.name == name {
                    file.body = FileBody::Memory(Vec::new());
                }
            }
            return Ok(());
        }
        let store = self.host.open_namespace(name).await?;
        store.clear().await?;
        let config = self.cache_config();
        for file in self.files.iter_mut().flatten() {
            if file.name == name {
                file.body = FileBody::Blocks(PageCache::open(store.clone(), config.clone()).await?);
            }
        }
        log::debug!("deleted {:?}", name);
        Ok(())
    }

    /// Whether a file has any durable content.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        if FileKind::of(name) == FileKind::Shm {
            return Ok(self
                .files
                .iter()
                .flatten()
                .any(|f| f.name == name && matches!(&f.body, FileBody::Memory(b) if !b.is_empty())));
        }
        let store = self.host.open_namespace(name).await?;
        Ok(store.total_bytes().await? > 0)
    }

    /// Drop clean cached blocks of the main file and reload its metadata.
    /// Reader tabs call this after a change event.
    pub async fn refresh_main(&mut self) -> Result<()> {
        match self.main_file_mut() {
            Some(file) => match &mut file.body {
                FileBody::Blocks(cache) => cache.refresh().await,
                FileBody::Memory(_) => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Rebuild the main file's cache from the store. Used after a
    /// snapshot import replaced the namespace wholesale.
    pub async fn reset_main(&mut self) -> Result<()> {
        let config = self.cache_config();
        let store = self.main_store()?;
        let cache = PageCache::open(store, config).await?;
        match self.main_file_mut() {
            Some(file) => {
                file.body = FileBody::Blocks(cache);
                Ok(())
            }
            None => Err(DatabaseError::invalid("main file is not open")),
        }
    }

    pub fn generation(&self) -> u64 {
        self.main_cache().map(|cache| cache.generation()).unwrap_or(0)
    }

    pub fn main_store(&self) -> Result<Arc<dyn BlockStore>> {
        self.main_cache()
            .map(|cache| cache.store())
            .ok_or_else(|| DatabaseError::invalid("main file is not open"))
    }

    pub(crate) fn main_cache_mut(&mut self) -> Option<&mut PageCache> {
        self.files.iter_mut().flatten().find_map(|file| {
            if file.kind != FileKind::Main {
                return None;
            }
            match &mut file.body {
                FileBody::Blocks(cache) => Some(cache),
                FileBody::Memory(_) => None,
            }
        })
    }

    pub(crate) fn main_cache(&self) -> Option<&PageCache> {
        self.files.iter().flatten().find_map(|file| {
            if file.kind != FileKind::Main {
                return None;
            }
            match &file.body {
                FileBody::Blocks(cache) => Some(cache),
                FileBody::Memory(_) => None,
            }
        })
    }

    fn main_file_mut(&mut self) -> Option<&mut VfsFile> {
        self.files
            .iter_mut()
            .flatten()
            .find(|file| file.kind == FileKind::Main)
    }

    fn live_file<'f>(
        files: &'f mut Vec<Option<VfsFile>>,
        id: FileId,
        context: &str,
    ) -> Result<&'f mut VfsFile> {
        files
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| DatabaseError::invalid(context))
    }

    fn file_ref(&self, id: FileId) -> Result<&VfsFile> {
        self.files
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| DatabaseError::invalid("operation on closed file handle"))
    }
}
