//! The boundary to the embedded SQL engine.
//!
//! The engine itself is an external collaborator: it parses, plans and
//! executes SQL, and drives its file I/O exclusively through the
//! [`VfsAdapter`](crate::vfs::VfsAdapter) handed to it in an
//! [`EngineContext`]. This crate never inspects SQL text; it only
//! sequences engine calls behind the writer lease and turns the engine's
//! mutation reports into syncs and change events.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::coordination::ChangeType;
use crate::error::Result;
use crate::vfs::{FileId, VfsAdapter};

/// A single SQL value crossing the engine boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One result row.
pub type Row = Vec<SqlValue>;

/// What a statement did, as reported by the engine.
#[derive(Debug, Clone)]
pub struct StatementOutcome {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    /// True when the statement modified the database; the handle syncs
    /// and broadcasts after mutations (when auto-sync is on).
    pub mutated: bool,
    /// How peers should classify the mutation.
    pub change_type: ChangeType,
}

impl StatementOutcome {
    pub fn read_only(rows: Vec<Row>) -> Self {
        Self {
            rows,
            rows_affected: 0,
            mutated: false,
            change_type: ChangeType::Data,
        }
    }

    pub fn mutation(rows_affected: u64, change_type: ChangeType) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            mutated: true,
            change_type,
        }
    }
}

/// Everything the engine may touch while executing one statement: the
/// VFS adapter of its tab and the id of the open main file.
pub struct EngineContext<'a> {
    pub vfs: &'a mut VfsAdapter,
    pub main: FileId,
}

/// The black-box SQL engine.
///
/// Implementations are expected to honor the VFS contract: take the lock
/// ladder through [`VfsAdapter::lock`] before writing, keep rollback
/// state in the `-journal` (or `-wal`) file, and never assume reads past
/// the end of the file succeed.
pub trait SqlEngine: Send {
    /// Execute one statement against the database file.
    fn execute<'a>(
        &'a mut self,
        ctx: EngineContext<'a>,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, Result<StatementOutcome>>;

    /// Move committed write-ahead-log frames into the main file. A no-op
    /// for engines running in rollback-journal mode.
    fn checkpoint<'a>(&'a mut self, ctx: EngineContext<'a>) -> BoxFuture<'a, Result<()>>;
}
