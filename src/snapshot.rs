//! Atomic snapshot export and import.
//!
//! An export is a single contiguous byte buffer holding the database file
//! exactly as the engine would lay it out on disk — no framing of our
//! own, so external tooling can read the image directly. Both directions
//! run under an exclusive lock and are therefore leader-only: a snapshot
//! taken mid-write or applied under a reader's feet would be garbage.

use crate::coordination::LockLevel;
use crate::engine::{EngineContext, SqlEngine};
use crate::error::{DatabaseError, Result};
use crate::storage::{parse_block_key, BLOCK_KEY_PREFIX};
use crate::vfs::{FileId, VfsAdapter};

/// Read chunk used while assembling the image, in blocks.
const EXPORT_CHUNK_BLOCKS: u64 = 16;

/// Hard ceiling on accepted snapshot images (the block index is 32-bit).
const MAX_IMPORT_BYTES: u64 = (u32::MAX as u64) * 4096;

/// Export the database into a self-contained byte buffer.
///
/// Protocol: exclusive lock (leader only), checkpoint the write-ahead
/// log, flush the cache, then walk the blocks in index order. Fails with
/// `Busy` when the caller cannot reach the exclusive lock, `Corrupt` when
/// the block inventory disagrees with the recorded file size, and `Io` on
/// store failures.
pub async fn export_to_bytes(
    vfs: &mut VfsAdapter,
    main: FileId,
    engine: &mut dyn SqlEngine,
) -> Result<Vec<u8>> {
    lock_exclusive(vfs, main).await?;
    let result = export_locked(vfs, main, engine).await;
    let _ = vfs.unlock(main, LockLevel::Unlocked);
    result
}

async fn export_locked(
    vfs: &mut VfsAdapter,
    main: FileId,
    engine: &mut dyn SqlEngine,
) -> Result<Vec<u8>> {
    engine
        .checkpoint(EngineContext { vfs: &mut *vfs, main })
        .await?;
    vfs.sync(main).await?;

    let file_size = vfs.file_size(main)?;
    let block_size = vfs
        .main_cache()
        .map(|cache| cache.block_size() as u64)
        .ok_or_else(|| DatabaseError::invalid("main file is not open"))?;

    // Inventory check: after the flush above, no durable block may sit at
    // or past the declared end of the file.
    let store = vfs.main_store()?;
    let allowed_blocks = (file_size + block_size - 1) / block_size;
    for (key, _) in store.scan(BLOCK_KEY_PREFIX).await? {
        if let Some(index) = parse_block_key(&key) {
            if index >= allowed_blocks {
                return Err(DatabaseError::corrupt(format!(
                    "block {} exists past declared file size {}",
                    index, file_size
                )));
            }
        }
    }

    let mut image = vec![0u8; file_size as usize];
    let chunk = (EXPORT_CHUNK_BLOCKS * block_size) as usize;
    let mut offset = 0u64;
    while offset < file_size {
        let end = (offset + chunk as u64).min(file_size) as usize;
        vfs.read_at(main, &mut image[offset as usize..end], offset)
            .await?;
        offset = end as u64;
    }
    log::info!(
        "exported {} bytes ({} blocks)",
        file_size,
        allowed_blocks
    );
    Ok(image)
}

/// Replace the database wholesale from a snapshot image.
///
/// The namespace is cleared (overwrite mode), the image is split back
/// into blocks, and the metadata is rewritten with the generation bumped
/// past the pre-import one. Returns the new generation; the caller emits
/// the `snapshot_replaced` change event.
pub async fn import_from_bytes(
    vfs: &mut VfsAdapter,
    main: FileId,
    image: &[u8],
) -> Result<u64> {
    if image.is_empty() {
        return Err(DatabaseError::invalid("snapshot image is empty"));
    }
    if image.len() as u64 > MAX_IMPORT_BYTES {
        return Err(DatabaseError::invalid(format!(
            "snapshot image of {} bytes exceeds the addressable range",
            image.len()
        )));
    }
    lock_exclusive(vfs, main).await?;
    let result = import_locked(vfs, main, image).await;
    let _ = vfs.unlock(main, LockLevel::Unlocked);
    result
}

async fn import_locked(vfs: &mut VfsAdapter, main: FileId, image: &[u8]) -> Result<u64> {
    let previous_generation = vfs.generation();

    let store = vfs.main_store()?;
    store.clear().await?;
    vfs.reset_main().await?;
    match vfs.main_cache_mut() {
        Some(cache) => cache.reset_generation(previous_generation),
        None => return Err(DatabaseError::invalid("main file is not open")),
    }

    vfs.write_at(main, image, 0).await?;
    let generation = vfs.sync(main).await?;
    log::info!(
        "imported {} bytes, generation {} -> {}",
        image.len(),
        previous_generation,
        generation
    );
    Ok(generation)
}

/// Climb the ladder to an exclusive lock. A missing writer lease reports
/// `Busy` here: snapshot operations are defined for the leader only.
async fn lock_exclusive(vfs: &mut VfsAdapter, main: FileId) -> Result<()> {
    for level in &[
        LockLevel::Shared,
        LockLevel::Reserved,
        LockLevel::Pending,
        LockLevel::Exclusive,
    ] {
        match vfs.lock(main, *level).await {
            Ok(()) => {}
            Err(DatabaseError::NotLeader) => {
                let _ = vfs.unlock(main, LockLevel::Unlocked);
                return Err(DatabaseError::Busy);
            }
            Err(err) => {
                let _ = vfs.unlock(main, LockLevel::Unlocked);
                return Err(err);
            }
        }
    }
    Ok(())
}
