use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`LockClient`](crate::LockClient) operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// `acquire` exceeded its configured wall-clock budget.
    #[error("acquire timed out after {0:?}")]
    Timeout(Duration),

    /// `acquire` exhausted its attempts against live contention.
    #[error("lock \"{0}\" is contended and attempts were exhausted")]
    Unavailable(String),

    /// An owner-facing operation found the lock no longer held.
    #[error("lock \"{0}\" is no longer held")]
    LockLost(String),

    /// The caller's cancellation signal fired.
    #[error("operation canceled")]
    Canceled,

    /// This client already owns the lock; reentry is not supported.
    #[error("lock \"{0}\" is already held by this client")]
    AlreadyHeld(String),

    /// A write outcome could not be determined within the retry budget.
    /// The remote state is indeterminate; the local record is terminal and
    /// the local deadline still bounds any ownership claim.
    #[error("write outcome unknown: {0}")]
    Unknown(String),

    /// The payload exceeds the configured per-item limit.
    #[error("payload of {got} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { got: usize, limit: usize },

    /// Authorization, schema, or configuration failure. Not retryable.
    #[error("fatal error: {0}")]
    Fatal(String),
}
