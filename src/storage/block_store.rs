use std::convert::TryInto;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{DatabaseError, Result};

/// Prefix for block keys. The block index follows as 4 big-endian bytes,
/// so a lexicographic key scan visits blocks in index order.
pub const BLOCK_KEY_PREFIX: &[u8] = b"blk:";

/// Key of the single metadata record of a namespace.
pub const META_KEY: &[u8] = b"meta:db";

/// Key of the writer lease inside a lock namespace.
pub const LEASE_KEY: &[u8] = b"lease:writer";

/// Encode the store key of a block.
pub fn block_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_KEY_PREFIX.len() + 4);
    key.extend_from_slice(BLOCK_KEY_PREFIX);
    key.extend_from_slice(&(index as u32).to_be_bytes());
    key
}

/// Decode a block key back to its index. Returns `None` for non-block keys
/// (metadata lives in the same namespace).
pub fn parse_block_key(key: &[u8]) -> Option<u64> {
    if key.len() != BLOCK_KEY_PREFIX.len() + 4 || !key.starts_with(BLOCK_KEY_PREFIX) {
        return None;
    }
    let raw: [u8; 4] = key[BLOCK_KEY_PREFIX.len()..].try_into().ok()?;
    Some(u32::from_be_bytes(raw) as u64)
}

/// Sibling namespace holding the writer lease of a database.
pub fn lock_namespace(db_name: &str) -> String {
    format!("{}__locks", db_name)
}

/// Namespace of the rollback journal file of a database.
pub fn journal_namespace(db_name: &str) -> String {
    format!("{}-journal", db_name)
}

/// Namespace of the write-ahead log file of a database.
pub fn wal_namespace(db_name: &str) -> String {
    format!("{}-wal", db_name)
}

/// Asynchronous keyed byte storage for one namespace.
///
/// This is the only interface the core has to the host's persistence
/// fabric. Implementations must guarantee that [`put_batch`] is atomic
/// with respect to observers (all pairs durable, or none) and returns only
/// after durability, and that a `get` issued afterwards observes the
/// written value.
///
/// [`put_batch`]: BlockStore::put_batch
pub trait BlockStore: Send + Sync {
    /// Namespace this store is bound to.
    fn namespace(&self) -> &str;

    /// Fetch a value. `Ok(None)` means the key was never written.
    fn get<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<Option<Bytes>>>;

    /// Atomically persist a batch of key/value pairs.
    fn put_batch<'a>(
        &'a self,
        batch: Vec<(Vec<u8>, Bytes)>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Remove a single key. Deleting an absent key is not an error.
    fn delete<'a>(&'a self, key: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Remove every key in the half-open range `[start, end)`. Idempotent;
    /// an empty or absent range is not an error. Block keys sort by index,
    /// so a run of truncated blocks is one range.
    fn delete_range<'a>(
        &'a self,
        start: &'a [u8],
        end: &'a [u8],
    ) -> BoxFuture<'a, Result<()>>;

    /// All `(key, value)` pairs under `prefix`, in key order. The returned
    /// view is read-consistent at call time.
    fn scan<'a>(&'a self, prefix: &'a [u8]) -> BoxFuture<'a, Result<Vec<(Vec<u8>, Bytes)>>>;

    /// Total durable payload bytes in the namespace.
    fn total_bytes<'a>(&'a self) -> BoxFuture<'a, Result<u64>>;

    /// Drop every key in the namespace. Used when a snapshot import
    /// reopens the namespace in overwrite mode.
    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<()>>;

    /// Close the namespace. Later operations fail with an I/O error.
    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
}

/// Host-provided factory for store namespaces.
///
/// The embedding environment decides what backs a namespace (an object
/// store per database in the browser, shared memory in tests). Opening the
/// same namespace twice must yield handles onto the same durable state;
/// that property is what makes cross-tab coordination observable.
pub trait StoreHost: Send + Sync {
    fn open_namespace<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn BlockStore>>>;
}

/// Attach the accessed block to a store-level I/O failure on its way up.
/// Corruption and the other variants already carry their own context.
pub fn block_error_context(err: DatabaseError, namespace: &str, index: u64) -> DatabaseError {
    match err {
        DatabaseError::Io { context } => DatabaseError::Io {
            context: format!("{} (namespace {:?}, block {})", context, namespace, index),
        },
        other => other,
    }
}
