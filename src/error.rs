//! Error types for the replication core.

use thiserror::Error;

/// Result type alias for replication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the replication core.
///
/// `Io`, `Protocol`, and `AuthFailure` tear down the offending connection
/// and go no further; `CorruptFile` and `Parse` are returned to the caller
/// of the load operation. Skew-graph inconsistencies are programmer errors
/// and panic instead of appearing here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt plot dump: trailing partial record of {0} bytes")]
    CorruptFile(usize),

    #[error("malformed plot CSV at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer failed authentication")]
    AuthFailure,
}

impl Error {
    /// True when the error should tear down the connection it occurred on
    /// rather than be reported to the caller.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::AuthFailure
        )
    }
}
