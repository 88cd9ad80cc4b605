use std::collections::{BTreeSet, HashMap};
use std::convert::TryInto;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DatabaseError, Result};
use crate::storage::block_store::{block_error_context, block_key, BlockStore, META_KEY};
use crate::storage::metadata::DatabaseMetadata;
use crate::tools;

/// Tuning knobs of a [`PageCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    /// Soft capacity: past this many resident blocks the cache starts
    /// evicting clean entries, falling back to writing back the oldest
    /// dirty block when nothing clean remains.
    pub soft_capacity: usize,
    /// When set, every stored block carries a trailing CRC32 and a
    /// mismatch on load surfaces as a corruption error.
    pub verify_checksums: bool,
}

impl CacheConfig {
    pub fn new(block_size: usize, soft_capacity: usize) -> Self {
        Self { block_size, soft_capacity: soft_capacity.max(4), verify_checksums: false }
    }
}

/// Counters reported through the storage info surface.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sync_count: u64,
    pub last_sync_duration_ms: u64,
    pub last_sync_blocks: usize,
    pub emergency_flushes: u64,
}

struct Slot {
    index: u64,
    data: Vec<u8>,
    dirty: bool,
    /// Clock bit: set on access, cleared by the sweep hand.
    referenced: bool,
    pin_count: u32,
    /// Monotone stamp of the write that dirtied this slot; the smallest
    /// stamp is the oldest dirty block and the first write-back victim.
    dirtied_at: u64,
}

/// Write-back block cache between the VFS and the store.
///
/// Entries live in a slot arena addressed by index; the block map and the
/// clock hand refer to slots, never to owning pointers. A dirty or pinned
/// slot is never evicted. At most one slot exists per block index.
pub struct PageCache {
    store: Arc<dyn BlockStore>,
    config: CacheConfig,
    meta: DatabaseMetadata,
    meta_dirty: bool,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    map: HashMap<u64, usize>,
    hand: usize,
    dirty_epoch: u64,
    /// Block indices whose store entries became garbage (truncation);
    /// deleted right after the next successful flush.
    deferred_deletes: BTreeSet<u64>,
    stats: CacheStats,
}

impl PageCache {
    /// Attach a cache to a namespace, loading the metadata record when one
    /// exists. A namespace that was never synced reads as an empty file.
    pub async fn open(store: Arc<dyn BlockStore>, config: CacheConfig) -> Result<Self> {
        let meta = match store.get(META_KEY).await? {
            Some(raw) => {
                let meta = DatabaseMetadata::decode(&raw)?;
                if meta.block_size as usize != config.block_size {
                    return Err(DatabaseError::invalid(format!(
                        "namespace {:?} was created with block size {}, opened with {}",
                        store.namespace(),
                        meta.block_size,
                        config.block_size
                    )));
                }
                meta
            }
            None => DatabaseMetadata::new(config.block_size as u16),
        };
        log::debug!(
            "page cache attached to {:?}: file_size={} generation={}",
            store.namespace(),
            meta.file_size,
            meta.generation
        );
        Ok(Self {
            store,
            config,
            meta,
            meta_dirty: false,
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            hand: 0,
            dirty_epoch: 0,
            deferred_deletes: BTreeSet::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Handle onto the namespace this cache writes through to.
    pub fn store(&self) -> Arc<dyn BlockStore> {
        self.store.clone()
    }

    pub fn file_size(&self) -> u64 {
        self.meta.file_size
    }

    pub fn generation(&self) -> u64 {
        self.meta.generation
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn resident_blocks(&self) -> usize {
        self.map.len()
    }

    pub fn dirty_blocks(&self) -> usize {
        self.map
            .values()
            .filter(|&&slot| self.slots[slot].as_ref().map_or(false, |s| s.dirty))
            .count()
    }

    pub fn is_resident(&self, index: u64) -> bool {
        self.map.contains_key(&index)
    }

    pub fn is_dirty(&self, index: u64) -> bool {
        self.map
            .get(&index)
            .and_then(|&slot| self.slots[slot].as_ref())
            .map_or(false, |s| s.dirty)
    }

    /// Indices of all resident blocks, ascending. Used by the storage
    /// info report.
    pub fn resident_indices(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.map.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Overwrite the generation counter. Only the snapshot import path
    /// uses this, to carry the pre-import generation across the namespace
    /// swap so the post-import flush lands on `previous + 1`.
    pub fn reset_generation(&mut self, generation: u64) {
        self.meta.generation = generation;
        self.meta_dirty = true;
    }

    /// Grow the recorded file size after a write extended the file.
    pub fn extend_file_size(&mut self, end: u64) {
        if end > self.meta.file_size {
            self.meta.file_size = end;
            self.meta_dirty = true;
        }
    }

    /// Ensure a block is resident and return its bytes.
    ///
    /// A block the store has never seen reads as all zeros; the tail
    /// beyond `file_size` is the caller's concern.
    pub async fn read(&mut self, index: u64) -> Result<&[u8]> {
        if let Some(&slot) = self.map.get(&index) {
            self.stats.hits += 1;
            let entry = self.slots[slot].as_mut().expect("mapped slot is live");
            entry.referenced = true;
            return Ok(&self.slots[slot].as_ref().unwrap().data);
        }
        self.stats.misses += 1;
        let data = self.load_block(index).await?;
        let slot = self.admit(index, data, false).await?;
        Ok(&self.slots[slot].as_ref().unwrap().data)
    }

    /// Borrow a resident block without touching clock state. Returns
    /// `None` when the block is not cached.
    pub fn peek(&self, index: u64) -> Option<&[u8]> {
        self.map
            .get(&index)
            .and_then(|&slot| self.slots[slot].as_ref())
            .map(|s| s.data.as_slice())
    }

    /// Keep a block resident until the matching [`unpin`](Self::unpin).
    pub fn pin(&mut self, index: u64) -> Result<()> {
        let slot = *self
            .map
            .get(&index)
            .ok_or_else(|| DatabaseError::invalid(format!("pin of absent block {}", index)))?;
        self.slots[slot].as_mut().unwrap().pin_count += 1;
        Ok(())
    }

    pub fn unpin(&mut self, index: u64) {
        if let Some(&slot) = self.map.get(&index) {
            let entry = self.slots[slot].as_mut().unwrap();
            if entry.pin_count > 0 {
                entry.pin_count -= 1;
            }
        }
    }

    /// Overlay `data` into a block at `offset_in_block` and mark it dirty.
    ///
    /// Partial writes load the previous image first (read-modify-write);
    /// whole-block writes skip the load.
    pub async fn write(&mut self, index: u64, offset_in_block: usize, data: &[u8]) -> Result<()> {
        let block_size = self.config.block_size;
        if offset_in_block + data.len() > block_size {
            return Err(DatabaseError::invalid(format!(
                "write of {} bytes at block offset {} exceeds block size {}",
                data.len(),
                offset_in_block,
                block_size
            )));
        }
        // A write resurrects a block scheduled for deletion by an earlier
        // truncate.
        self.deferred_deletes.remove(&index);

        let slot = match self.map.get(&index).copied() {
            Some(slot) => slot,
            None => {
                let whole_block = offset_in_block == 0 && data.len() == block_size;
                let initial = if whole_block {
                    vec![0u8; block_size]
                } else {
                    self.load_block(index).await?
                };
                self.admit(index, initial, false).await?
            }
        };
        self.dirty_epoch += 1;
        let dirty_epoch = self.dirty_epoch;
        let entry = self.slots[slot].as_mut().expect("mapped slot is live");
        entry.data[offset_in_block..offset_in_block + data.len()].copy_from_slice(data);
        entry.referenced = true;
        if !entry.dirty {
            entry.dirty = true;
            entry.dirtied_at = dirty_epoch;
        }
        Ok(())
    }

    /// Shrink the file. Blocks past the new boundary leave the cache at
    /// once; their store entries are deleted after the next flush.
    pub async fn truncate(&mut self, new_size: u64) -> Result<()> {
        let block_size = self.config.block_size as u64;
        if new_size >= self.meta.file_size {
            self.extend_file_size(new_size);
            return Ok(());
        }
        let boundary = (new_size + block_size - 1) / block_size;
        let old_blocks = (self.meta.file_size + block_size - 1) / block_size;

        let doomed: Vec<u64> = self.map.keys().copied().filter(|&i| i >= boundary).collect();
        for index in doomed {
            let slot = self.map.remove(&index).unwrap();
            self.slots[slot] = None;
            self.free.push(slot);
        }
        for index in boundary..old_blocks {
            self.deferred_deletes.insert(index);
        }

        // Zero the cut-off tail of the boundary block so stale bytes past
        // the new end can never resurface through a later extension.
        if new_size % block_size != 0 {
            let tail_block = new_size / block_size;
            let tail_offset = (new_size % block_size) as usize;
            self.read(tail_block).await?;
            self.dirty_epoch += 1;
            let dirty_epoch = self.dirty_epoch;
            let slot = self.map[&tail_block];
            let entry = self.slots[slot].as_mut().unwrap();
            for byte in &mut entry.data[tail_offset..] {
                *byte = 0;
            }
            if !entry.dirty {
                entry.dirty = true;
                entry.dirtied_at = dirty_epoch;
            }
        }

        self.meta.file_size = new_size;
        self.meta_dirty = true;
        Ok(())
    }

    /// Write back every dirty block together with the updated metadata in
    /// one atomic batch, then apply deferred deletions.
    ///
    /// On success the store durably reflects the cache and the returned
    /// generation is exactly one above the previous one. On failure the
    /// cache stays dirty and the error surfaces unchanged.
    pub async fn flush(&mut self, last_writer: u128) -> Result<u64> {
        let started = tools::now_millis();
        let mut dirty: Vec<(u64, usize)> = self
            .map
            .iter()
            .filter(|(_, &slot)| self.slots[slot].as_ref().unwrap().dirty)
            .map(|(&index, &slot)| (index, slot))
            .collect();
        if dirty.is_empty() && !self.meta_dirty && self.deferred_deletes.is_empty() {
            return Ok(self.meta.generation);
        }
        dirty.sort_unstable_by_key(|(index, _)| *index);

        let mut committed = self.meta.clone();
        committed.generation += 1;
        committed.last_writer = last_writer;

        let mut batch: Vec<(Vec<u8>, Bytes)> = Vec::with_capacity(dirty.len() + 1);
        for (index, slot) in &dirty {
            let data = &self.slots[*slot].as_ref().unwrap().data;
            batch.push((block_key(*index), self.encode_block(data)));
        }
        batch.push((META_KEY.to_vec(), committed.encode()));

        self.store.put_batch(batch).await.map_err(|err| {
            log::error!(
                "flush of {} blocks to {:?} failed: {}",
                dirty.len(),
                self.store.namespace(),
                err
            );
            err
        })?;

        for (_, slot) in &dirty {
            self.slots[*slot].as_mut().unwrap().dirty = false;
        }
        self.meta = committed;
        self.meta_dirty = false;

        if !self.deferred_deletes.is_empty() {
            // A write after a truncate can punch holes into the set, so
            // delete it as contiguous index runs.
            match self.delete_deferred_runs().await {
                Ok(()) => self.deferred_deletes.clear(),
                // The batch is already durable and readers ignore blocks
                // past file_size; retry the deletion on the next flush.
                Err(err) => log::warn!(
                    "deferred block deletion in {:?} failed, will retry: {}",
                    self.store.namespace(),
                    err
                ),
            }
        }

        self.stats.sync_count += 1;
        self.stats.last_sync_blocks = dirty.len();
        self.stats.last_sync_duration_ms =
            (tools::now_millis() - started).max(0) as u64;
        log::debug!(
            "synced {} blocks of {:?}, generation {}",
            dirty.len(),
            self.store.namespace(),
            self.meta.generation
        );
        Ok(self.meta.generation)
    }

    /// Drop clean entries and re-read the metadata record. Reader tabs
    /// call this after a change event so later reads observe the new
    /// generation.
    pub async fn refresh(&mut self) -> Result<()> {
        let stale: Vec<u64> = self
            .map
            .iter()
            .filter(|(_, &slot)| {
                let entry = self.slots[slot].as_ref().unwrap();
                !entry.dirty && entry.pin_count == 0
            })
            .map(|(&index, _)| index)
            .collect();
        for index in stale {
            let slot = self.map.remove(&index).unwrap();
            self.slots[slot] = None;
            self.free.push(slot);
        }
        if let Some(raw) = self.store.get(META_KEY).await? {
            let meta = DatabaseMetadata::decode(&raw)?;
            if meta.generation > self.meta.generation || !self.meta_dirty {
                self.meta = meta;
                self.meta_dirty = false;
            }
        }
        Ok(())
    }

    /// Issue one store range deletion per contiguous run of deferred
    /// block indices. Deletion is idempotent, so retrying a partially
    /// applied set on the next flush is safe.
    async fn delete_deferred_runs(&self) -> Result<()> {
        let mut runs: Vec<(u64, u64)> = Vec::new();
        let mut current: Option<(u64, u64)> = None;
        for &index in &self.deferred_deletes {
            current = match current {
                Some((start, end)) if index == end + 1 => Some((start, index)),
                Some(run) => {
                    runs.push(run);
                    Some((index, index))
                }
                None => Some((index, index)),
            };
        }
        if let Some(run) = current {
            runs.push(run);
        }
        for (start, end) in runs {
            self.store
                .delete_range(&block_key(start), &block_key(end + 1))
                .await?;
        }
        Ok(())
    }

    async fn load_block(&mut self, index: u64) -> Result<Vec<u8>> {
        let loaded = self
            .store
            .get(&block_key(index))
            .await
            .map_err(|err| block_error_context(err, self.store.namespace(), index))?;
        match loaded {
            Some(raw) => self.decode_block(&raw, index),
            None => Ok(vec![0u8; self.config.block_size]),
        }
    }

    fn encode_block(&self, data: &[u8]) -> Bytes {
        if !self.config.verify_checksums {
            return Bytes::copy_from_slice(data);
        }
        let mut framed = Vec::with_capacity(data.len() + 4);
        framed.extend_from_slice(data);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        framed.extend_from_slice(&hasher.finalize().to_le_bytes());
        Bytes::from(framed)
    }

    fn decode_block(&self, raw: &[u8], index: u64) -> Result<Vec<u8>> {
        let block_size = self.config.block_size;
        if !self.config.verify_checksums {
            if raw.len() != block_size {
                return Err(DatabaseError::corrupt(format!(
                    "block {} has {} bytes, expected {}",
                    index,
                    raw.len(),
                    block_size
                )));
            }
            return Ok(raw.to_vec());
        }
        if raw.len() != block_size + 4 {
            return Err(DatabaseError::corrupt(format!(
                "block {} has {} bytes, expected {} + CRC",
                index,
                raw.len(),
                block_size
            )));
        }
        let expected = u32::from_le_bytes(raw[block_size..].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[..block_size]);
        if hasher.finalize() != expected {
            return Err(DatabaseError::corrupt(format!(
                "block {} failed CRC check",
                index
            )));
        }
        Ok(raw[..block_size].to_vec())
    }

    /// Install a block into a free slot, making room first if the soft
    /// capacity is reached.
    async fn admit(&mut self, index: u64, data: Vec<u8>, dirty: bool) -> Result<usize> {
        self.make_room().await?;
        self.dirty_epoch += 1;
        let entry = Slot {
            index,
            data,
            dirty,
            referenced: true,
            pin_count: 0,
            dirtied_at: if dirty { self.dirty_epoch } else { 0 },
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.map.insert(index, slot);
        Ok(slot)
    }

    async fn make_room(&mut self) -> Result<()> {
        let soft = self.config.soft_capacity;
        let hard = soft * 2;
        if self.map.len() >= hard {
            // Reaching the hard limit means admission pressure outran the
            // write-back path; flush everything and log loudly.
            self.stats.emergency_flushes += 1;
            log::warn!(
                "page cache for {:?} hit hard capacity {}, emergency write-back",
                self.store.namespace(),
                hard
            );
            self.write_back_all().await?;
        }
        let mut attempts = 0;
        while self.map.len() >= soft && attempts < 3 {
            if self.evict_one() {
                return Ok(());
            }
            // Nothing clean to evict: push out the oldest dirty block and
            // sweep again.
            if !self.write_back_oldest().await? {
                break; // everything resident is pinned
            }
            attempts += 1;
        }
        Ok(())
    }

    /// One clock sweep: clear referenced bits, evict the first clean,
    /// unpinned, unreferenced block.
    fn evict_one(&mut self) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let len = self.slots.len();
        for _ in 0..len * 2 {
            let position = self.hand % len;
            self.hand = self.hand.wrapping_add(1);
            let evict = match &mut self.slots[position] {
                Some(slot) => {
                    if slot.dirty || slot.pin_count > 0 {
                        continue;
                    }
                    if slot.referenced {
                        slot.referenced = false;
                        continue;
                    }
                    true
                }
                None => continue,
            };
            if evict {
                let index = self.slots[position].as_ref().unwrap().index;
                self.slots[position] = None;
                self.map.remove(&index);
                self.free.push(position);
                return true;
            }
        }
        false
    }

    /// Write back the oldest dirty block (without advancing the
    /// generation; that only happens on a full flush). Returns false when
    /// no dirty block exists.
    async fn write_back_oldest(&mut self) -> Result<bool> {
        let oldest = self
            .map
            .values()
            .filter_map(|&slot| self.slots[slot].as_ref())
            .filter(|s| s.dirty)
            .min_by_key(|s| s.dirtied_at)
            .map(|s| s.index);
        let index = match oldest {
            Some(index) => index,
            None => return Ok(false),
        };
        let slot = self.map[&index];
        let payload = self.encode_block(&self.slots[slot].as_ref().unwrap().data);
        self.store.put_batch(vec![(block_key(index), payload)]).await?;
        self.slots[slot].as_mut().unwrap().dirty = false;
        log::debug!(
            "wrote back block {} of {:?} under cache pressure",
            index,
            self.store.namespace()
        );
        Ok(true)
    }

    async fn write_back_all(&mut self) -> Result<()> {
        let dirty: Vec<(u64, usize)> = self
            .map
            .iter()
            .filter(|(_, &slot)| self.slots[slot].as_ref().unwrap().dirty)
            .map(|(&index, &slot)| (index, slot))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let batch: Vec<(Vec<u8>, Bytes)> = dirty
            .iter()
            .map(|(index, slot)| {
                (
                    block_key(*index),
                    self.encode_block(&self.slots[*slot].as_ref().unwrap().data),
                )
            })
            .collect();
        self.store.put_batch(batch).await?;
        for (_, slot) in dirty {
            self.slots[slot].as_mut().unwrap().dirty = false;
        }
        Ok(())
    }
}
