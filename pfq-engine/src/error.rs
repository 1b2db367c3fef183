//! Control-plane error type.
//!
//! Every control request either succeeds or fails with exactly one of these
//! variants; operations are atomic and never partially applied. Data-plane
//! failures are never surfaced as errors — they are counted (see the
//! `Statistics` counters).

use thiserror::Error;

/// Typed control-plane failure. `errno` gives the POSIX code that the
/// socket-level ABI reports for each variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PfqError {
    /// The endpoint is enabled and the requested mutation is frozen.
    #[error("resource busy")]
    Busy,

    /// Malformed request: bad descriptor, bad argument, out-of-range id.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Group policy forbids the operation for this caller.
    #[error("access denied")]
    AccessDenied,

    /// Unknown interface, group or endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource exhaustion: no free id, no memory for rings.
    #[error("out of memory")]
    NoMemory,

    /// The operation was cancelled by a signal or a stop request.
    #[error("interrupted")]
    Interrupted,

    /// The resource already exists (double open, double enable).
    #[error("already exists")]
    AlreadyExists,

    /// The endpoint is not open/enabled for the requested operation.
    #[error("not enabled")]
    NotEnabled,

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PfqError {
    /// Shorthand for an `Invalid` error with a formatted reason.
    pub fn invalid(msg: impl Into<String>) -> Self {
        PfqError::Invalid(msg.into())
    }

    /// POSIX errno reported at the socket ABI for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            PfqError::Busy => libc::EBUSY,
            PfqError::Invalid(_) => libc::EINVAL,
            PfqError::AccessDenied => libc::EPERM,
            PfqError::NotFound(_) => libc::ENODEV,
            PfqError::NoMemory => libc::ENOMEM,
            PfqError::Interrupted => libc::EINTR,
            PfqError::AlreadyExists => libc::EEXIST,
            PfqError::NotEnabled => libc::EPERM,
            PfqError::Internal(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, PfqError>;
