use async_trait::async_trait;

use crate::error::StoreError;
use crate::item::LockItem;

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The predicate held and the write committed.
    Ok,
    /// The predicate failed and nothing was mutated. Carries the item the
    /// backend observed after the failure where it can provide one; `None`
    /// means no item with that name exists.
    Conflict { current: Option<LockItem> },
}

impl WriteOutcome {
    /// Whether the write committed.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Capability set a backing store must provide for the lock protocol.
///
/// Implementations must be `Send + Sync` and must evaluate every predicate
/// atomically with the write it guards. Reads must be strongly consistent;
/// an eventually consistent read can report a stale `(owner, version)` pair
/// and break mutual exclusion.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Strongly consistent read of the item named `name`.
    async fn get(&self, name: &str) -> Result<Option<LockItem>, StoreError>;

    /// Write `item` only if no item with `item.name` exists.
    async fn put_if_absent(&self, item: &LockItem) -> Result<WriteOutcome, StoreError>;

    /// Replace the existing item only if its stored `(owner, version)`
    /// equals `(expected_owner, expected_version)`. An empty
    /// `expected_owner` matches an item whose ownership has been cleared.
    async fn put_if_matches(
        &self,
        expected_owner: &str,
        expected_version: u64,
        item: &LockItem,
    ) -> Result<WriteOutcome, StoreError>;

    /// Delete the item only if its stored `(owner, version)` matches.
    /// Deleting an absent item is a conflict, not an error.
    async fn delete_if_matches(
        &self,
        name: &str,
        expected_owner: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify object safety.
    fn _assert_dyn_lock_store(_: &dyn LockStore) {}
}
