use std::convert::TryInto;

use bytes::Bytes;

use crate::error::{DatabaseError, Result};

/// Packed size of a lease record: leader_id + acquired_at + expires_at +
/// epoch.
pub const LEASE_LEN: usize = 16 + 8 + 8 + 8;

/// The writer lease stored under `lease:writer` in a database's lock
/// namespace.
///
/// At any instant at most one unexpired lease exists per database. The
/// epoch is a sequence number bumped by every install and refresh; it is
/// what the emulated compare-and-set checks against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub leader_id: u128,
    /// Milliseconds since epoch at first acquisition.
    pub acquired_at: i64,
    /// Milliseconds since epoch after which the lease is dead.
    pub expires_at: i64,
    pub epoch: u64,
}

impl Lease {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(LEASE_LEN);
        buf.extend_from_slice(&self.leader_id.to_le_bytes());
        buf.extend_from_slice(&self.acquired_at.to_le_bytes());
        buf.extend_from_slice(&self.expires_at.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        Bytes::from(buf)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != LEASE_LEN {
            return Err(DatabaseError::corrupt(format!(
                "lease record has {} bytes, expected {}",
                raw.len(),
                LEASE_LEN
            )));
        }
        Ok(Self {
            leader_id: u128::from_le_bytes(raw[0..16].try_into().unwrap()),
            acquired_at: i64::from_le_bytes(raw[16..24].try_into().unwrap()),
            expires_at: i64::from_le_bytes(raw[24..32].try_into().unwrap()),
            epoch: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
        })
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}
