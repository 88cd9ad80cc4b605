//! The file-system surface the SQL engine drives.
//!
//! The engine sees ordinary files: a main database file, a rollback
//! journal, a write-ahead log and a shared-memory region, all addressed
//! by name. Underneath, the main, journal and WAL files are block caches
//! over store namespaces segregated by name suffix (`a.db`,
//! `a.db-journal`, `a.db-wal`), while the shared-memory file is a plain
//! process-local buffer that is never persisted — cross-tab WAL is
//! disabled by policy, so nothing outside this process ever needs it.
//!
//! Every hook mirrors the engine's VFS contract: reads past the end of
//! the file zero-fill and report a short read, writes to the main file
//! require a reserved-or-higher lock, sync is the durability point, and
//! the lock hooks drive the five-level ladder in the coordination layer.

mod adapter;
pub use adapter::*;

use bitflags::bitflags;

bitflags! {
    /// Open flags passed by the engine to [`VfsAdapter::open`].
    pub struct OpenFlags: u32 {
        const READ_ONLY  = 0x0000_0001;
        const READ_WRITE = 0x0000_0002;
        const CREATE     = 0x0000_0004;
        const MAIN_DB    = 0x0000_0100;
        const JOURNAL    = 0x0000_0800;
        const WAL        = 0x0008_0000;
    }
}

/// Name suffixes of the auxiliary files, shared with the key layout.
pub const JOURNAL_SUFFIX: &str = "-journal";
pub const WAL_SUFFIX: &str = "-wal";
pub const SHM_SUFFIX: &str = "-shm";

/// File-control opcodes understood by [`VfsAdapter::file_control`].
pub const CONTROL_BUSY_TIMEOUT: u32 = 1;
pub const CONTROL_GET_GENERATION: u32 = 2;
pub const CONTROL_GET_LEADER_STATUS: u32 = 3;
pub const CONTROL_FORCE_CHECKPOINT: u32 = 4;

/// Reply of a file-control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    Generation(u64),
    LeaderStatus(bool),
    /// Unknown opcode; maps to the engine's NOTFOUND code.
    Unrecognized,
}

/// Role of an open file, derived from its name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Main,
    Journal,
    Wal,
    Shm,
}

impl FileKind {
    pub fn of(name: &str) -> FileKind {
        if name.ends_with(JOURNAL_SUFFIX) {
            FileKind::Journal
        } else if name.ends_with(WAL_SUFFIX) {
            FileKind::Wal
        } else if name.ends_with(SHM_SUFFIX) {
            FileKind::Shm
        } else {
            FileKind::Main
        }
    }

    /// Strip the auxiliary suffix, yielding the base database name.
    pub fn base_name(name: &str) -> &str {
        for suffix in &[JOURNAL_SUFFIX, WAL_SUFFIX, SHM_SUFFIX] {
            if let Some(base) = name.strip_suffix(suffix) {
                return base;
            }
        }
        name
    }
}
