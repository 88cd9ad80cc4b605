//! Persistent block-oriented VFS and multi-tab coordination core for an
//! in-browser SQL database.
//!
//! The embedded SQL engine sees ordinary files; underneath, file I/O is
//! split into fixed-size blocks, cached with write-back semantics, and
//! persisted into a host-provided key-value store. On top of that sit a
//! writer election (one writing tab per database, lease-based, with
//! failover), the engine's five-level lock ladder, an atomic snapshot
//! export/import path, and a change broadcast so reader tabs learn about
//! committed writes.
//!
//! Component map:
//!
//! * [`storage`] — block store interface, the shared in-process store,
//!   the persisted metadata record and the write-back page cache.
//! * [`coordination`] — lock manager, writer lease and elector, change
//!   bus.
//! * [`vfs`] — the file surface the engine drives (open/read/write/
//!   truncate/sync/lock/file-control), auxiliary journal and WAL files.
//! * [`snapshot`] — whole-database export and import under an exclusive
//!   lock.
//! * [`engine`] — the trait boundary to the black-box SQL engine.
//! * [`db`] — the public [`Database`] handle tying the above together.

pub mod error;
pub mod tools;

pub mod storage;

pub mod coordination;

pub mod vfs;

pub mod engine;

pub mod snapshot;

pub mod db;

pub use crate::coordination::{ChangeEvent, ChangeType, LockLevel, Subscription};
pub use crate::db::{Database, JournalMode, OpenOptions, StorageInfo, SyncStats};
pub use crate::engine::{EngineContext, Row, SqlEngine, SqlValue, StatementOutcome};
pub use crate::error::{DatabaseError, Result};
pub use crate::storage::{BlockStore, MemoryStore, MemoryStoreHost, StoreHost};
