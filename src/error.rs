use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Error taxonomy surfaced by the database core.
///
/// Each failure class is a distinct variant so callers can branch on the
/// kind instead of parsing messages. Context (block index, store key) is
/// attached to the variant and never swallowed on the way up.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The underlying store failed (quota exceeded, store closed, or a
    /// transient persistence error).
    #[error("store I/O error: {context}")]
    Io { context: String },

    /// A lock could not be acquired right now. Retryable.
    #[error("database is locked")]
    Busy,

    /// A write was attempted by a tab that does not hold the writer lease.
    #[error("write requires the writer lease")]
    NotLeader,

    /// Metadata and block inventory disagree, or a block checksum failed.
    /// Fatal to the handle.
    #[error("database image is malformed: {reason}")]
    Corrupt { reason: String },

    /// Malformed snapshot image or out-of-range parameter.
    #[error("invalid argument: {reason}")]
    Invalid { reason: String },

    /// A deadline-bounded wait expired.
    #[error("operation timed out")]
    Timeout,

    /// The persisted metadata was written by an unknown version.
    #[error("metadata version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },

    /// Operation on a closed handle.
    #[error("database handle is closed")]
    Closed,

    /// A read extended past the end of the file. The output buffer is
    /// zero-filled past the valid range, as the engine contract requires.
    #[error("short read at offset {offset} (file size {file_size})")]
    ShortRead { offset: u64, file_size: u64 },
}

/// Error codes of the engine's VFS contract. The engine never sees the
/// structured taxonomy above; the adapter translates at the boundary.
pub const ENGINE_OK: i32 = 0;
pub const ENGINE_BUSY: i32 = 5;
pub const ENGINE_IOERR: i32 = 10;
pub const ENGINE_CORRUPT: i32 = 11;
pub const ENGINE_NOTFOUND: i32 = 12;
pub const ENGINE_IOERR_SHORT_READ: i32 = ENGINE_IOERR | (2 << 8);

impl DatabaseError {
    pub fn io<S: Into<String>>(context: S) -> Self {
        DatabaseError::Io { context: context.into() }
    }

    pub fn corrupt<S: Into<String>>(reason: S) -> Self {
        DatabaseError::Corrupt { reason: reason.into() }
    }

    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        DatabaseError::Invalid { reason: reason.into() }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only lock contention and store I/O qualify; everything else is
    /// either fatal or a caller bug.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatabaseError::Busy | DatabaseError::Io { .. })
    }

    /// Translate to the numeric code the engine expects from its VFS.
    pub fn engine_code(&self) -> i32 {
        match self {
            DatabaseError::Busy | DatabaseError::NotLeader => ENGINE_BUSY,
            DatabaseError::Corrupt { .. } => ENGINE_CORRUPT,
            DatabaseError::ShortRead { .. } => ENGINE_IOERR_SHORT_READ,
            DatabaseError::Invalid { .. } => ENGINE_NOTFOUND,
            _ => ENGINE_IOERR,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(DatabaseError::Busy.is_retryable());
        assert!(DatabaseError::io("quota exceeded").is_retryable());
        assert!(!DatabaseError::NotLeader.is_retryable());
        assert!(!DatabaseError::corrupt("bad crc").is_retryable());
        assert!(!DatabaseError::Timeout.is_retryable());
    }

    #[test]
    fn engine_code_mapping() {
        assert_eq!(DatabaseError::Busy.engine_code(), ENGINE_BUSY);
        assert_eq!(DatabaseError::NotLeader.engine_code(), ENGINE_BUSY);
        assert_eq!(
            DatabaseError::ShortRead { offset: 4096, file_size: 100 }.engine_code(),
            ENGINE_IOERR_SHORT_READ,
        );
        assert_eq!(DatabaseError::corrupt("x").engine_code(), ENGINE_CORRUPT);
    }
}
