//! Multi-tab coordination: locks, writer election, change broadcast.
//!
//! # Locking
//!
//! The engine's five-level lock ladder (unlocked, shared, reserved,
//! pending, exclusive) is enforced at two scopes. Within a process, a
//! shared table per database name tracks every tab's holdings, so the
//! classic invariants hold across all in-process tabs: any number of
//! shared holders, at most one reserved-or-higher holder, and exclusive
//! only once every other shared holder has drained. Across processes the
//! writer side of the ladder is carried by the lease: reserved and above
//! additionally require the caller to hold the writer lease, which is
//! re-read from the store at acquisition time.
//!
//! Readers never coordinate across tabs. Shared locks are purely local
//! because block reads are consistent snapshots of the store.
//!
//! # Writer election
//!
//! One lease record per database, in a sibling `<name>__locks` namespace.
//! The store offers no true compare-and-set, so installs are read /
//! check-epoch / write / read-back and the last durable write wins. The
//! price is a double-leader window of at most one heartbeat, which is
//! why the lock manager re-confirms the lease before every write
//! transaction. Leaders refresh the lease at a third of its period,
//! release it on clean shutdown, and simply stop heartbeating on crash,
//! after which peers take over on expiry.
//!
//! # Change broadcast
//!
//! After every durable sync the writer publishes a change event carrying
//! the new generation on the database's broadcast channel. Delivery is
//! best-effort and at-most-once per peer; receivers act on generation
//! advancement, so a duplicated or dropped event never corrupts them.

mod lease;
pub use lease::*;

mod leader_elector;
pub use leader_elector::*;

mod lock_manager;
pub use lock_manager::*;

mod change_bus;
pub use change_bus::*;
