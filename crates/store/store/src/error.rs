use thiserror::Error;

/// Errors surfaced by backing-store adapters.
///
/// A failed CAS predicate is not an error; adapters report it through
/// [`WriteOutcome::Conflict`](crate::store::WriteOutcome).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network failures, throttling, server hiccups. Retryable.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Authorization, schema, or request construction failures. Not retryable.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether the failed operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
