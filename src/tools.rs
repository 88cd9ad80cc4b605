//! Small shared helpers: wall clock, retry backoff, name validation.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{DatabaseError, Result};

lazy_static! {
    static ref DATABASE_NAME_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap();
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0, // clock before 1970, treat as epoch
    }
}

/// Validate a database name before it becomes a store namespace.
///
/// Names feed directly into store namespaces and broadcast channel names,
/// so the character set is restricted. Reserved suffixes are rejected to
/// keep the auxiliary file keyspaces unambiguous.
pub fn check_database_name(name: &str) -> Result<()> {
    if !DATABASE_NAME_REGEX.is_match(name) {
        return Err(DatabaseError::invalid(format!(
            "illegal database name {:?}",
            name
        )));
    }
    for suffix in &["-journal", "-wal", "-shm", "__locks"] {
        if name.ends_with(suffix) {
            return Err(DatabaseError::invalid(format!(
                "database name {:?} uses reserved suffix {:?}",
                name, suffix
            )));
        }
    }
    Ok(())
}

/// Exponential backoff with a fixed cap, for lock and lease polling.
pub struct Backoff {
    current: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Self { current: start.max(Duration::from_millis(1)), cap }
    }

    /// Next delay to sleep. Doubles until the cap is reached.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.cap);
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub async fn sleep(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
