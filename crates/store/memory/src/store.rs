use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use dynamolock_store::{LockItem, LockStore, StoreError, WriteOutcome};

/// In-memory [`LockStore`] backed by a [`DashMap`].
///
/// Cloning is cheap and clones share the same underlying map, so one
/// instance can stand in for the remote store across many simulated
/// clients. Every compare-and-write runs under the map's per-key entry
/// lock, which makes the predicate atomic with the write per name.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    items: Arc<DashMap<String, LockItem>>,
}

impl MemoryLockStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, name: &str) -> Result<Option<LockItem>, StoreError> {
        Ok(self.items.get(name).map(|entry| entry.clone()))
    }

    async fn put_if_absent(&self, item: &LockItem) -> Result<WriteOutcome, StoreError> {
        match self.items.entry(item.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Ok(WriteOutcome::Conflict {
                current: Some(occupied.get().clone()),
            }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(item.clone());
                Ok(WriteOutcome::Ok)
            }
        }
    }

    async fn put_if_matches(
        &self,
        expected_owner: &str,
        expected_version: u64,
        item: &LockItem,
    ) -> Result<WriteOutcome, StoreError> {
        match self.items.entry(item.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.owner == expected_owner && current.version == expected_version {
                    occupied.insert(item.clone());
                    Ok(WriteOutcome::Ok)
                } else {
                    Ok(WriteOutcome::Conflict {
                        current: Some(current.clone()),
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => {
                Ok(WriteOutcome::Conflict { current: None })
            }
        }
    }

    async fn delete_if_matches(
        &self,
        name: &str,
        expected_owner: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        match self.items.entry(name.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let current = occupied.get();
                if current.owner == expected_owner && current.version == expected_version {
                    occupied.remove();
                    Ok(WriteOutcome::Ok)
                } else {
                    Ok(WriteOutcome::Conflict {
                        current: Some(current.clone()),
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => {
                Ok(WriteOutcome::Conflict { current: None })
            }
        }
    }
}
