//! Release engine: explicit unlock and delete through a CAS on the
//! `(owner, version)` pair the client last wrote.

use std::time::Duration;

use tracing::{debug, warn};

use dynamolock_store::{LockItem, LockStore, StoreError, WriteOutcome};

use crate::error::LockError;
use crate::record::{LockRecord, LockState};

/// How a record leaves the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseMode {
    /// Clear ownership but keep the item, payload included.
    Unlock,
    /// Delete the item outright.
    Delete,
}

/// Bounded attempts against transient store failures.
const RELEASE_ATTEMPTS: u32 = 3;

/// Release `record`. Idempotent: a terminal record returns `Ok` without
/// any network effect. The caller must have stopped the renewal task
/// already, so the version we CAS on cannot move under us.
pub(crate) async fn run(
    store: &dyn LockStore,
    record: &LockRecord,
    mode: ReleaseMode,
    retry_initial: Duration,
    retry_max: Duration,
) -> Result<(), LockError> {
    record.expire_if_past_deadline();
    match record.state() {
        LockState::Lost | LockState::Released => return Ok(()),
        LockState::Held => {}
    }

    let version = record.version_seen();
    let mut backoff = retry_initial;
    let mut last_transient = String::new();

    for attempt in 0..RELEASE_ATTEMPTS {
        let outcome = match mode {
            ReleaseMode::Unlock => {
                let mut item = LockItem::new(
                    record.name().to_owned(),
                    String::new(),
                    version + 1,
                    record.lease(),
                );
                item.payload = record.payload().cloned();
                store.put_if_matches(record.owner(), version, &item).await
            }
            ReleaseMode::Delete => {
                store
                    .delete_if_matches(record.name(), record.owner(), version)
                    .await
            }
        };

        match outcome {
            Ok(WriteOutcome::Ok) => {
                record.mark_released();
                debug!(name = %record.name(), ?mode, "lock released");
                return Ok(());
            }
            Ok(WriteOutcome::Conflict { .. }) => {
                // The lock moved on without us; releasing a lost lock is
                // still a success.
                record.mark_lost();
                debug!(name = %record.name(), "lock was already lost at release time");
                return Ok(());
            }
            Err(StoreError::Transient(msg)) => {
                warn!(name = %record.name(), attempt, error = %msg, "release failed transiently");
                last_transient = msg;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(retry_max);
            }
            Err(StoreError::Fatal(msg)) => {
                record.mark_released();
                return Err(LockError::Fatal(msg));
            }
        }
    }

    // The write never resolved. Renewal is already stopped, so the local
    // deadline bounds any ownership claim that might remain remotely.
    record.mark_released();
    Err(LockError::Unknown(last_transient))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use dynamolock_store_memory::MemoryLockStore;

    use super::*;

    fn held_record(name: &str, owner: &str, version: u64) -> LockRecord {
        let lease = Duration::from_secs(10);
        LockRecord::new(
            name.to_owned(),
            owner.to_owned(),
            lease,
            None,
            version,
            Instant::now() + lease,
        )
    }

    #[tokio::test]
    async fn unlock_clears_ownership_and_keeps_the_item() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "me", 1, Duration::from_secs(10)))
            .await
            .unwrap();

        let record = held_record("job", "me", 1);
        run(
            &store,
            &record,
            ReleaseMode::Unlock,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .expect("unlock should succeed");

        assert_eq!(record.state(), LockState::Released);
        let item = store.get("job").await.unwrap().unwrap();
        assert!(!item.is_owned());
        assert_eq!(item.version, 2);
    }

    #[tokio::test]
    async fn delete_removes_the_item() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "me", 1, Duration::from_secs(10)))
            .await
            .unwrap();

        let record = held_record("job", "me", 1);
        run(
            &store,
            &record,
            ReleaseMode::Delete,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .expect("delete should succeed");

        assert_eq!(record.state(), LockState::Released);
        assert!(store.get("job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn releasing_a_lost_record_is_a_local_no_op() {
        let store = MemoryLockStore::new();
        // The thief's item is the only remote state.
        store
            .put_if_absent(&LockItem::new("job", "thief", 6, Duration::from_secs(10)))
            .await
            .unwrap();

        let record = held_record("job", "me", 5);
        record.mark_lost();

        run(
            &store,
            &record,
            ReleaseMode::Unlock,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .expect("release after loss should succeed");

        let item = store.get("job").await.unwrap().unwrap();
        assert_eq!(
            (item.owner.as_str(), item.version),
            ("thief", 6),
            "no write may land against the thief's version"
        );
    }

    #[tokio::test]
    async fn release_conflict_is_success_and_marks_lost() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "thief", 6, Duration::from_secs(10)))
            .await
            .unwrap();

        // The record still believes it holds version 5.
        let record = held_record("job", "me", 5);
        run(
            &store,
            &record,
            ReleaseMode::Unlock,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .expect("conflicted release should still report success");

        assert_eq!(record.state(), LockState::Lost);
    }

    /// Store whose writes always fail transiently.
    struct UnreachableStore;

    #[async_trait]
    impl LockStore for UnreachableStore {
        async fn get(&self, _name: &str) -> Result<Option<LockItem>, StoreError> {
            Err(StoreError::Transient("network unreachable".to_owned()))
        }

        async fn put_if_absent(&self, _item: &LockItem) -> Result<WriteOutcome, StoreError> {
            Err(StoreError::Transient("network unreachable".to_owned()))
        }

        async fn put_if_matches(
            &self,
            _expected_owner: &str,
            _expected_version: u64,
            _item: &LockItem,
        ) -> Result<WriteOutcome, StoreError> {
            Err(StoreError::Transient("network unreachable".to_owned()))
        }

        async fn delete_if_matches(
            &self,
            _name: &str,
            _expected_owner: &str,
            _expected_version: u64,
        ) -> Result<WriteOutcome, StoreError> {
            Err(StoreError::Transient("network unreachable".to_owned()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_unknown_but_terminate_locally() {
        let store = Arc::new(UnreachableStore);
        let record = held_record("job", "me", 1);

        let result = run(
            store.as_ref(),
            &record,
            ReleaseMode::Unlock,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(LockError::Unknown(_))));
        assert_eq!(
            record.state(),
            LockState::Released,
            "the record must be terminal even when the outcome is unknown"
        );
    }
}
