//! Shared test harness: a miniature record engine that drives the VFS
//! the way a real SQL engine would (lock ladder, rollback journal, WAL,
//! short-read handling), plus namespace hygiene helpers.
#![allow(dead_code)]

use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;

use absurder_sql::coordination::ChangeType;
use absurder_sql::engine::{EngineContext, Row, SqlEngine, SqlValue, StatementOutcome};
use absurder_sql::error::{DatabaseError, Result};
use absurder_sql::storage::{journal_namespace, lock_namespace, wal_namespace, MemoryStore};
use absurder_sql::vfs::{FileId, OpenFlags, VfsAdapter};
use absurder_sql::{JournalMode, LockLevel, OpenOptions};

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fresh database name per test, so the process-global store registry
/// never bleeds state between tests.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}.db", prefix, NAME_COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub fn wipe_database(name: &str) {
    MemoryStore::wipe(name);
    MemoryStore::wipe(&journal_namespace(name));
    MemoryStore::wipe(&wal_namespace(name));
    MemoryStore::wipe(&lock_namespace(name));
}

/// Options tuned for tests: short lease, short busy timeout.
pub fn test_options() -> OpenOptions {
    let mut options = OpenOptions::default();
    options.lease_ms = 150;
    options.busy_timeout_ms = 200;
    options.cache_entries = 32;
    options
}

const HEADER_MAGIC: &[u8; 8] = b"ABSQREC1";
const HEADER_LEN: u64 = 32;

struct Header {
    row_count: u64,
    data_end: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(HEADER_MAGIC);
        buf[8..16].copy_from_slice(&self.row_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_end.to_le_bytes());
        buf
    }

    fn decode(raw: &[u8; HEADER_LEN as usize]) -> Result<Header> {
        if &raw[0..8] != HEADER_MAGIC {
            return Err(DatabaseError::corrupt("record file magic mismatch"));
        }
        Ok(Header {
            row_count: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            data_end: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
        })
    }
}

/// A deliberately tiny "SQL engine": it understands just enough
/// statements to exercise every VFS hook. Rows are stored as
/// length-prefixed JSON records behind a fixed header.
///
/// Statements: `CREATE TABLE`, `INSERT` (row = params),
/// `SELECT COUNT(*)`, `SELECT *`.
pub struct RecordEngine {
    mode: JournalMode,
}

impl RecordEngine {
    pub fn new() -> Box<RecordEngine> {
        Box::new(RecordEngine { mode: JournalMode::Rollback })
    }

    pub fn wal() -> Box<RecordEngine> {
        Box::new(RecordEngine { mode: JournalMode::Wal })
    }

    async fn read_header(vfs: &mut VfsAdapter, main: FileId) -> Result<Option<Header>> {
        let mut buf = [0u8; HEADER_LEN as usize];
        match vfs.read_at(main, &mut buf, 0).await {
            Ok(()) => Header::decode(&buf).map(Some),
            Err(DatabaseError::ShortRead { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write_journal_preimage(
        vfs: &mut VfsAdapter,
        header: Option<&Header>,
    ) -> Result<FileId> {
        let name = format!("{}-journal", vfs.db_name());
        let journal = vfs
            .open(&name, OpenFlags::JOURNAL | OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .await?;
        if let Some(header) = header {
            vfs.write_at(journal, &header.encode(), 0).await?;
        }
        vfs.sync(journal).await?;
        Ok(journal)
    }

    async fn drop_journal(vfs: &mut VfsAdapter, journal: FileId) -> Result<()> {
        let name = format!("{}-journal", vfs.db_name());
        vfs.close_file(journal)?;
        vfs.delete(&name).await
    }

    /// Mirror a main-file write into the WAL as an (offset, len, payload)
    /// frame, appended at the current end of the log.
    async fn append_wal_frame(
        vfs: &mut VfsAdapter,
        wal: FileId,
        offset: u64,
        payload: &[u8],
    ) -> Result<()> {
        let end = vfs.file_size(wal)?;
        let mut frame = Vec::with_capacity(12 + payload.len());
        frame.extend_from_slice(&offset.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        vfs.write_at(wal, &frame, end).await
    }

    async fn create_table(vfs: &mut VfsAdapter, main: FileId) -> Result<StatementOutcome> {
        if Self::read_header(vfs, main).await?.is_some() {
            return Ok(StatementOutcome::read_only(Vec::new()));
        }
        vfs.lock(main, LockLevel::Shared).await?;
        let result = async {
            vfs.lock(main, LockLevel::Reserved).await?;
            let journal = Self::write_journal_preimage(vfs, None).await?;
            let header = Header { row_count: 0, data_end: HEADER_LEN };
            vfs.write_at(main, &header.encode(), 0).await?;
            vfs.lock(main, LockLevel::Pending).await?;
            vfs.lock(main, LockLevel::Exclusive).await?;
            Self::drop_journal(vfs, journal).await?;
            Ok(StatementOutcome {
                rows: Vec::new(),
                rows_affected: 0,
                mutated: true,
                change_type: ChangeType::Schema,
            })
        }
        .await;
        let _ = vfs.unlock(main, LockLevel::Unlocked);
        result
    }

    async fn insert(
        mode: JournalMode,
        vfs: &mut VfsAdapter,
        main: FileId,
        params: &[SqlValue],
    ) -> Result<StatementOutcome> {
        vfs.lock(main, LockLevel::Shared).await?;
        let result = async {
            vfs.lock(main, LockLevel::Reserved).await?;
            let header = Self::read_header(vfs, main)
                .await?
                .ok_or_else(|| DatabaseError::invalid("no table; run CREATE TABLE first"))?;

            let journal = if mode == JournalMode::Rollback {
                Some(Self::write_journal_preimage(vfs, Some(&header)).await?)
            } else {
                None
            };
            let wal = if mode == JournalMode::Wal {
                let name = format!("{}-wal", vfs.db_name());
                Some(
                    vfs.open(&name, OpenFlags::WAL | OpenFlags::CREATE | OpenFlags::READ_WRITE)
                        .await?,
                )
            } else {
                None
            };

            let payload = serde_json::to_vec(&params.to_vec())
                .map_err(|err| DatabaseError::invalid(format!("unencodable row: {}", err)))?;
            let mut record = Vec::with_capacity(4 + payload.len());
            record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            record.extend_from_slice(&payload);

            vfs.write_at(main, &record, header.data_end).await?;
            let updated = Header {
                row_count: header.row_count + 1,
                data_end: header.data_end + record.len() as u64,
            };
            vfs.write_at(main, &updated.encode(), 0).await?;

            if let Some(wal) = wal {
                Self::append_wal_frame(vfs, wal, header.data_end, &record).await?;
                Self::append_wal_frame(vfs, wal, 0, &updated.encode()).await?;
                // Commit point of WAL mode: the log itself is synced.
                vfs.sync(wal).await?;
                vfs.close_file(wal)?;
            }

            vfs.lock(main, LockLevel::Pending).await?;
            vfs.lock(main, LockLevel::Exclusive).await?;
            if let Some(journal) = journal {
                Self::drop_journal(vfs, journal).await?;
            }
            Ok(StatementOutcome::mutation(1, ChangeType::Data))
        }
        .await;
        let _ = vfs.unlock(main, LockLevel::Unlocked);
        result
    }

    async fn select_all(vfs: &mut VfsAdapter, main: FileId) -> Result<Vec<Row>> {
        let header = match Self::read_header(vfs, main).await? {
            Some(header) => header,
            None => return Err(DatabaseError::invalid("no table; run CREATE TABLE first")),
        };
        let mut rows = Vec::with_capacity(header.row_count as usize);
        let mut offset = HEADER_LEN;
        while offset < header.data_end {
            let mut len_buf = [0u8; 4];
            vfs.read_at(main, &mut len_buf, offset).await?;
            let len = u32::from_le_bytes(len_buf) as u64;
            let mut payload = vec![0u8; len as usize];
            vfs.read_at(main, &mut payload, offset + 4).await?;
            let row: Row = serde_json::from_slice(&payload)
                .map_err(|err| DatabaseError::corrupt(format!("undecodable record: {}", err)))?;
            rows.push(row);
            offset += 4 + len;
        }
        Ok(rows)
    }
}

impl SqlEngine for RecordEngine {
    fn execute<'a>(
        &'a mut self,
        ctx: EngineContext<'a>,
        sql: &'a str,
        params: &'a [SqlValue],
    ) -> BoxFuture<'a, Result<StatementOutcome>> {
        let mode = self.mode;
        Box::pin(async move {
            let EngineContext { vfs, main } = ctx;
            let statement = sql.trim().to_ascii_uppercase();
            if statement.starts_with("CREATE TABLE") {
                Self::create_table(vfs, main).await
            } else if statement.starts_with("INSERT") {
                Self::insert(mode, vfs, main, params).await
            } else if statement.starts_with("SELECT COUNT(*)") {
                vfs.lock(main, LockLevel::Shared).await?;
                let result = Self::read_header(vfs, main).await;
                let _ = vfs.unlock(main, LockLevel::Unlocked);
                let count = result?.map(|h| h.row_count).unwrap_or(0);
                Ok(StatementOutcome::read_only(vec![vec![SqlValue::Integer(
                    count as i64,
                )]]))
            } else if statement.starts_with("SELECT *") {
                vfs.lock(main, LockLevel::Shared).await?;
                let result = Self::select_all(vfs, main).await;
                let _ = vfs.unlock(main, LockLevel::Unlocked);
                Ok(StatementOutcome::read_only(result?))
            } else {
                Err(DatabaseError::invalid(format!(
                    "unsupported statement: {}",
                    sql
                )))
            }
        })
    }

    fn checkpoint<'a>(&'a mut self, ctx: EngineContext<'a>) -> BoxFuture<'a, Result<()>> {
        let mode = self.mode;
        Box::pin(async move {
            let EngineContext { vfs, main: _ } = ctx;
            if mode != JournalMode::Wal {
                return Ok(());
            }
            let name = format!("{}-wal", vfs.db_name());
            if !vfs.exists(&name).await? {
                return Ok(());
            }
            // Main-file writes went through write-through mirroring, so a
            // checkpoint only has to empty the log.
            let wal = vfs
                .open(&name, OpenFlags::WAL | OpenFlags::READ_WRITE)
                .await?;
            vfs.truncate(wal, 0).await?;
            vfs.sync(wal).await?;
            vfs.close_file(wal)?;
            Ok(())
        })
    }
}
