// chronicle_core/src/error.rs
//
// Typed errors for the storage core.
//
// Every public API returns `Result<T>`; no panics cross the storage
// boundary. Internal assertions are reserved for true invariant
// violations (a sealed block observed mutating, a codec disagreeing
// with its own length prefix).

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChronicleError>;

/// Storage-core errors.
#[derive(Error, Debug)]
pub enum ChronicleError {
    /// Malformed caller input: empty label name, bad matcher pattern,
    /// non-positive query step.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A lookup that cannot produce an empty-but-successful result.
    /// Note: `label_values` for an unknown name is NOT an error; it
    /// returns an empty list.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Append of a timestamp older than the head block's start beyond
    /// the configured tolerance.
    #[error("timestamp {timestamp} out of range (min allowed {min_allowed})")]
    OutOfRange { timestamp: i64, min_allowed: i64 },

    /// Mutation attempted on a sealed block.
    #[error("block {block_id} is sealed")]
    Sealed { block_id: u64 },

    /// CRC mismatch or magic/version mismatch on deserialize.
    #[error("corrupt block: {reason}")]
    Corrupt { reason: String },

    /// The caller's deadline expired before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Codec or invariant violation.
    #[error("internal error: {reason}")]
    Internal { reason: String },

    /// Persistence substrate failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    OutOfRange,
    Sealed,
    Corrupt,
    DeadlineExceeded,
    Internal,
    Io,
}

impl ChronicleError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument { reason: reason.into() }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt { reason: reason.into() }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal { reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::Sealed { .. } => ErrorKind::Sealed,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// True for errors the caller can retry after fixing its input.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::OutOfRange | ErrorKind::Sealed
        )
    }
}
