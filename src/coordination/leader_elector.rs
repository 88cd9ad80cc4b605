use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::coordination::lease::Lease;
use crate::error::{DatabaseError, Result};
use crate::storage::block_store::{lock_namespace, BlockStore, StoreHost, LEASE_KEY};
use crate::tools::{self, Backoff};

/// Bounded attempts of one acquisition round before giving up and letting
/// the caller back off.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// Designates at most one writer tab per database name.
///
/// The lease lives in the store, which offers no true compare-and-set, so
/// installs are read / check-epoch / write / read-back. Two racing tabs
/// can therefore both believe they won for up to one heartbeat; the lock
/// manager re-reads the lease at every Reserved acquisition and settles
/// the conflict there.
pub struct LeaderElector {
    db_name: String,
    leader_id: u128,
    lease_ms: i64,
    store: Arc<dyn BlockStore>,
    state: Mutex<ElectorState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct ElectorState {
    is_leader: bool,
    last_lease: Option<Lease>,
}

impl LeaderElector {
    /// Create an elector for `db_name`, bound to the sibling lock
    /// namespace. Does not attempt acquisition.
    pub async fn new(
        host: &Arc<dyn StoreHost>,
        db_name: &str,
        lease_ms: u64,
    ) -> Result<Arc<Self>> {
        let store = host.open_namespace(&lock_namespace(db_name)).await?;
        Ok(Arc::new(Self {
            db_name: db_name.to_string(),
            leader_id: rand::random::<u128>(),
            lease_ms: lease_ms as i64,
            store,
            state: Mutex::new(ElectorState::default()),
            heartbeat: Mutex::new(None),
        }))
    }

    pub fn leader_id(&self) -> u128 {
        self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().is_leader
    }

    /// The lease currently visible in the store, if any.
    pub async fn lease_info(&self) -> Result<Option<Lease>> {
        self.read_lease().await
    }

    /// One acquisition round. Returns whether this tab is now the leader.
    pub async fn try_acquire(self: &Arc<Self>) -> Result<bool> {
        if self.is_leader() {
            return Ok(true);
        }
        let mut backoff = Backoff::new(
            Duration::from_millis(5),
            Duration::from_millis((self.lease_ms / 4).max(5) as u64),
        );
        for _ in 0..ACQUIRE_ATTEMPTS {
            let now = tools::now_millis();
            let current = self.read_lease().await?;
            if let Some(lease) = current {
                if lease.leader_id != self.leader_id && !lease.is_expired(now) {
                    return Ok(false);
                }
            }
            let lease = Lease {
                leader_id: self.leader_id,
                acquired_at: now,
                expires_at: now + self.lease_ms,
                epoch: current.map(|l| l.epoch).unwrap_or(0) + 1,
            };
            self.store
                .put_batch(vec![(LEASE_KEY.to_vec(), lease.encode())])
                .await?;

            // Read back: with no real compare-and-set the last durable
            // write wins, so only believe the install after seeing it.
            match self.read_lease().await? {
                Some(seen)
                    if seen.leader_id == self.leader_id && seen.epoch == lease.epoch =>
                {
                    self.become_leader(seen);
                    return Ok(true);
                }
                _ => backoff.sleep().await,
            }
        }
        Ok(false)
    }

    /// Block until this tab holds the lease or the timeout expires.
    ///
    /// Polls lease expiry with exponential backoff capped at a quarter of
    /// the lease period. Expiry of the wait leaves leader state unchanged.
    pub async fn wait_for_leadership(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis((self.lease_ms / 4).max(10) as u64),
        );
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DatabaseError::Timeout);
            }
            let delay = backoff.next_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Cheap gate consulted on every Reserved-or-higher lock acquisition.
    ///
    /// Re-reads the lease so that a tab which lost a double-install race
    /// steps down here instead of writing.
    pub async fn confirm_leadership(&self) -> Result<()> {
        if !self.is_leader() {
            return Err(DatabaseError::NotLeader);
        }
        let now = tools::now_millis();
        match self.read_lease().await? {
            Some(lease) if lease.leader_id == self.leader_id && !lease.is_expired(now) => Ok(()),
            _ => {
                log::warn!(
                    "writer lease for {:?} was lost, stepping down",
                    self.db_name
                );
                self.step_down();
                Err(DatabaseError::NotLeader)
            }
        }
    }

    /// Give up leadership and delete the lease so peers fail over fast.
    /// Called on clean shutdown.
    pub async fn force_relinquish(&self) -> Result<()> {
        self.stop_heartbeat();
        let was_leader = {
            let mut state = self.state.lock().unwrap();
            let was = state.is_leader;
            state.is_leader = false;
            state.last_lease = None;
            was
        };
        if was_leader {
            if let Some(lease) = self.read_lease().await? {
                if lease.leader_id == self.leader_id {
                    self.store.delete(LEASE_KEY).await?;
                    log::info!("released writer lease for {:?}", self.db_name);
                }
            }
        }
        Ok(())
    }

    /// Drop leadership locally without touching the store. Used when the
    /// store itself fails mid-heartbeat, and by tests that model a tab
    /// crashing: the lease stays behind and peers take over on expiry.
    pub fn abandon(&self) {
        self.stop_heartbeat();
        self.step_down();
    }

    fn become_leader(self: &Arc<Self>, lease: Lease) {
        {
            let mut state = self.state.lock().unwrap();
            state.is_leader = true;
            state.last_lease = Some(lease);
        }
        log::info!(
            "tab {:032x} became writer for {:?} (epoch {})",
            self.leader_id,
            self.db_name,
            lease.epoch
        );
        self.spawn_heartbeat();
    }

    fn step_down(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_leader = false;
        state.last_lease = None;
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak: Weak<LeaderElector> = Arc::downgrade(self);
        let period = Duration::from_millis((self.lease_ms / 3).max(1) as u64);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let elector = match weak.upgrade() {
                    Some(elector) => elector,
                    None => return,
                };
                if !elector.heartbeat_tick().await {
                    return;
                }
            }
        }));
    }

    /// Refresh the lease. Returns false when leadership is gone and the
    /// heartbeat should stop.
    async fn heartbeat_tick(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let now = tools::now_millis();
        let current = match self.read_lease().await {
            Ok(current) => current,
            Err(err) => {
                log::error!(
                    "heartbeat for {:?} could not read lease, stepping down: {}",
                    self.db_name,
                    err
                );
                self.step_down();
                return false;
            }
        };
        let lease = match current {
            Some(lease) if lease.leader_id == self.leader_id => lease,
            _ => {
                log::warn!(
                    "writer lease for {:?} was taken over, stepping down",
                    self.db_name
                );
                self.step_down();
                return false;
            }
        };
        let refreshed = Lease {
            leader_id: self.leader_id,
            acquired_at: lease.acquired_at,
            expires_at: now + self.lease_ms,
            epoch: lease.epoch + 1,
        };
        match self
            .store
            .put_batch(vec![(LEASE_KEY.to_vec(), refreshed.encode())])
            .await
        {
            Ok(()) => {
                self.state.lock().unwrap().last_lease = Some(refreshed);
                true
            }
            Err(err) => {
                log::error!(
                    "heartbeat refresh for {:?} failed, stepping down: {}",
                    self.db_name,
                    err
                );
                self.step_down();
                false
            }
        }
    }

    async fn read_lease(&self) -> Result<Option<Lease>> {
        match self.store.get(LEASE_KEY).await? {
            Some(raw) => match Lease::decode(&raw) {
                Ok(lease) => Ok(Some(lease)),
                Err(err) => {
                    // A mangled lease must not wedge the database forever;
                    // treat it as absent so the next acquisition rewrites it.
                    log::warn!(
                        "discarding undecodable lease for {:?}: {}",
                        self.db_name,
                        err
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory_store::{MemoryStore, MemoryStoreHost};

    async fn elector(db: &str, lease_ms: u64) -> Arc<LeaderElector> {
        let host = MemoryStoreHost::shared();
        LeaderElector::new(&host, db, lease_ms).await.unwrap()
    }

    fn wipe(db: &str) {
        MemoryStore::wipe(&lock_namespace(db));
    }

    #[tokio::test]
    async fn first_acquirer_wins() {
        wipe("el-first");
        let a = elector("el-first", 5000).await;
        let b = elector("el-first", 5000).await;
        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
        wipe("el-first");
    }

    #[tokio::test]
    async fn release_hands_over_immediately() {
        wipe("el-release");
        let a = elector("el-release", 5000).await;
        let b = elector("el-release", 5000).await;
        assert!(a.try_acquire().await.unwrap());
        a.force_relinquish().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
        wipe("el-release");
    }

    #[tokio::test]
    async fn failover_after_abandoned_lease_expires() {
        wipe("el-crash");
        let a = elector("el-crash", 150).await;
        let b = elector("el-crash", 150).await;
        assert!(a.try_acquire().await.unwrap());
        a.abandon();
        // The lease is still in the store, so the takeover has to wait
        // for natural expiry.
        assert!(!b.try_acquire().await.unwrap());
        b.wait_for_leadership(Duration::from_millis(450)).await.unwrap();
        assert!(b.is_leader());
        wipe("el-crash");
    }

    #[tokio::test]
    async fn wait_times_out_while_leader_is_healthy() {
        wipe("el-timeout");
        let a = elector("el-timeout", 5000).await;
        let b = elector("el-timeout", 5000).await;
        assert!(a.try_acquire().await.unwrap());
        match b.wait_for_leadership(Duration::from_millis(80)).await {
            Err(DatabaseError::Timeout) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert!(a.is_leader());
        assert!(!b.is_leader());
        wipe("el-timeout");
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_fresh() {
        wipe("el-heartbeat");
        let a = elector("el-heartbeat", 120).await;
        assert!(a.try_acquire().await.unwrap());
        let first = a.lease_info().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let later = a.lease_info().await.unwrap().unwrap();
        assert!(later.epoch > first.epoch);
        assert!(later.expires_at > first.expires_at);
        assert!(a.is_leader());
        wipe("el-heartbeat");
    }

    #[tokio::test]
    async fn stolen_lease_detected_at_confirmation() {
        wipe("el-stolen");
        let a = elector("el-stolen", 5000).await;
        assert!(a.try_acquire().await.unwrap());
        // Another tab stomps the lease (modeling the last-write-wins
        // window of the emulated compare-and-set).
        let thief = Lease {
            leader_id: rand::random(),
            acquired_at: tools::now_millis(),
            expires_at: tools::now_millis() + 5000,
            epoch: 99,
        };
        let store = MemoryStore::open(&lock_namespace("el-stolen"));
        store
            .put_batch(vec![(LEASE_KEY.to_vec(), thief.encode())])
            .await
            .unwrap();
        match a.confirm_leadership().await {
            Err(DatabaseError::NotLeader) => {}
            other => panic!("expected NotLeader, got {:?}", other),
        }
        assert!(!a.is_leader());
        wipe("el-stolen");
    }
}
