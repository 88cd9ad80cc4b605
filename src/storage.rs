//! Block persistence layer.
//!
//! # Data layout
//!
//! A database file is an ordered sequence of fixed-size blocks persisted
//! in a host key-value namespace. Block keys are `blk:` followed by the
//! block index as four big-endian bytes, so a plain key scan walks the
//! file front to back. A single `meta:db` record per namespace carries the
//! file size, the block size, the generation counter and the identity of
//! the last writer, packed little-endian with a trailing CRC.
//!
//! The file size need not be a whole number of blocks; the tail is
//! tracked in the metadata record and readers zero everything past it.
//!
//! # Write-back
//!
//! All engine I/O goes through the [`PageCache`]: reads populate it from
//! the store, writes dirty it, and a sync drains every dirty block plus
//! the bumped metadata record in one atomic `put_batch`. Until that batch
//! is durable the store keeps the previous committed state, which is what
//! makes a crash before the batch invisible to other tabs.
//!
//! Blocks removed by truncation are deleted from the store only after the
//! next successful flush; readers never look past `file_size`, so the
//! stale keys are inert in the meantime.
//!
//! # Hosts
//!
//! The store itself is host-provided through [`StoreHost`]. The bundled
//! [`MemoryStore`] keeps namespaces in a process-global registry so that
//! several handles in one process observe each other exactly like several
//! tabs over one origin store.

pub(crate) mod block_store;
pub use block_store::*;

pub(crate) mod memory_store;
pub use memory_store::*;

mod metadata;
pub use metadata::*;

mod page_cache;
pub use page_cache::*;
