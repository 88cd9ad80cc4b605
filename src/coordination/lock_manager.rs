use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::coordination::leader_elector::LeaderElector;
use crate::error::{DatabaseError, Result};
use crate::tools::Backoff;

/// The engine's five-level file lock ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Unlocked = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

/// Whether the ladder permits stepping from `from` up to `to` in one
/// transition. Downgrades go through [`LockManager::unlock`].
pub fn upgrade_allowed(from: LockLevel, to: LockLevel) -> bool {
    use LockLevel::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Unlocked, Shared) => true,
        (Shared, Reserved) => true,
        (Shared, Pending) => true,
        (Reserved, Pending) => true,
        (Pending, Exclusive) => true,
        _ => false,
    }
}

#[derive(Default)]
struct LockTable {
    shared_tabs: HashSet<u64>,
    reserved: Option<u64>,
    pending: Option<u64>,
    exclusive: Option<u64>,
}

impl LockTable {
    fn is_empty(&self) -> bool {
        self.shared_tabs.is_empty()
            && self.reserved.is_none()
            && self.pending.is_none()
            && self.exclusive.is_none()
    }

    fn writer_other_than(&self, tab: u64) -> bool {
        let blocks = |holder: Option<u64>| holder.map_or(false, |t| t != tab);
        blocks(self.reserved) || blocks(self.pending) || blocks(self.exclusive)
    }
}

lazy_static! {
    // One table per database name, shared by every tab in the process.
    // This is the in-process image of the cluster-wide invariant: at most
    // one Reserved-or-higher holder, any number of Shared holders.
    static ref LOCK_TABLES: Mutex<HashMap<String, LockTable>> = Mutex::new(HashMap::new());
}

/// Per-tab lock state for one database, enforcing the ladder locally and
/// consulting the writer lease for Reserved and above.
pub struct LockManager {
    db_name: String,
    tab_id: u64,
    level: LockLevel,
    elector: Arc<LeaderElector>,
    /// When false, leadership is not required for write locks. Only tests
    /// and single-tab embeddings enable this.
    enforce_leadership: bool,
}

impl LockManager {
    pub fn new(db_name: &str, tab_id: u64, elector: Arc<LeaderElector>, enforce_leadership: bool) -> Self {
        Self {
            db_name: db_name.to_string(),
            tab_id,
            level: LockLevel::Unlocked,
            elector,
            enforce_leadership,
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// True when any tab holds Reserved, Pending or Exclusive.
    pub fn someone_reserved(&self) -> bool {
        let tables = LOCK_TABLES.lock().unwrap();
        tables.get(&self.db_name).map_or(false, |t| {
            t.reserved.is_some() || t.pending.is_some() || t.exclusive.is_some()
        })
    }

    /// Single upgrade attempt. Contention and disallowed transitions
    /// surface as `Busy`; a missing writer lease surfaces as `NotLeader`.
    pub async fn lock(&mut self, to: LockLevel) -> Result<()> {
        if to == self.level {
            return Ok(());
        }
        if to < self.level {
            return Err(DatabaseError::invalid(format!(
                "lock() cannot downgrade {:?} -> {:?}",
                self.level, to
            )));
        }
        if !upgrade_allowed(self.level, to) {
            return Err(DatabaseError::Busy);
        }
        // The lease check happens outside the table lock; a lease stolen
        // between here and the table update is caught by the next
        // confirmation, which is the documented double-leader window.
        if to >= LockLevel::Reserved && self.enforce_leadership {
            self.elector.confirm_leadership().await?;
        }

        let mut tables = LOCK_TABLES.lock().unwrap();
        let table = tables.entry(self.db_name.clone()).or_default();
        match to {
            LockLevel::Shared => {
                // A pending writer blocks new readers; existing readers
                // keep their locks until they drop.
                if table.pending.map_or(false, |t| t != self.tab_id)
                    || table.exclusive.map_or(false, |t| t != self.tab_id)
                {
                    return Err(DatabaseError::Busy);
                }
                table.shared_tabs.insert(self.tab_id);
            }
            LockLevel::Reserved => {
                if table.writer_other_than(self.tab_id) {
                    return Err(DatabaseError::Busy);
                }
                table.reserved = Some(self.tab_id);
            }
            LockLevel::Pending => {
                if table.writer_other_than(self.tab_id) {
                    return Err(DatabaseError::Busy);
                }
                table.pending = Some(self.tab_id);
            }
            LockLevel::Exclusive => {
                if table.writer_other_than(self.tab_id) {
                    return Err(DatabaseError::Busy);
                }
                let other_readers = table
                    .shared_tabs
                    .iter()
                    .any(|&t| t != self.tab_id);
                if other_readers {
                    return Err(DatabaseError::Busy);
                }
                table.exclusive = Some(self.tab_id);
            }
            LockLevel::Unlocked => unreachable!("upgrade to Unlocked"),
        }
        log::trace!(
            "tab {:016x} locked {:?} at {:?}",
            self.tab_id,
            self.db_name,
            to
        );
        self.level = to;
        Ok(())
    }

    /// Retry an upgrade with exponential backoff until `timeout` runs out,
    /// then report `Busy`. `NotLeader` is never retried here.
    pub async fn lock_wait(&mut self, to: LockLevel, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(Duration::from_millis(2), Duration::from_millis(100));
        loop {
            match self.lock(to).await {
                Err(DatabaseError::Busy) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DatabaseError::Busy);
                    }
                    let delay = backoff.next_delay().min(deadline - now);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Downgrade to `Shared` or `Unlocked`. Downgrades always succeed.
    pub fn unlock(&mut self, to: LockLevel) -> Result<()> {
        if to != LockLevel::Shared && to != LockLevel::Unlocked {
            return Err(DatabaseError::invalid(format!(
                "unlock() target must be Shared or Unlocked, got {:?}",
                to
            )));
        }
        if to >= self.level {
            return Ok(());
        }
        let mut tables = LOCK_TABLES.lock().unwrap();
        if let Some(table) = tables.get_mut(&self.db_name) {
            Self::release_writer_entries(table, self.tab_id);
            if to == LockLevel::Unlocked {
                table.shared_tabs.remove(&self.tab_id);
            }
            if table.is_empty() {
                tables.remove(&self.db_name);
            }
        }
        log::trace!(
            "tab {:016x} unlocked {:?} to {:?}",
            self.tab_id,
            self.db_name,
            to
        );
        self.level = to;
        Ok(())
    }

    fn release_writer_entries(table: &mut LockTable, tab: u64) {
        if table.reserved == Some(tab) {
            table.reserved = None;
        }
        if table.pending == Some(tab) {
            table.pending = None;
        }
        if table.exclusive == Some(tab) {
            table.exclusive = None;
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        // A dying tab releases its in-process locks; only the lease in
        // the store outlives it.
        let _ = self.unlock(LockLevel::Unlocked);
    }
}
