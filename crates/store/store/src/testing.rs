use std::time::Duration;

use bytes::Bytes;

use crate::error::StoreError;
use crate::item::LockItem;
use crate::store::{LockStore, WriteOutcome};

fn lease() -> Duration {
    Duration::from_secs(10)
}

/// Run the full backing-store conformance test suite.
///
/// Call this from a backend's test module with a fresh store instance.
/// The suite verifies the CAS semantics the lock protocol depends on:
/// predicates evaluate atomically with their writes, failed predicates
/// mutate nothing, and versions only move through explicit writes.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_store_conformance_tests(store: &dyn LockStore) -> Result<(), StoreError> {
    test_get_missing(store).await?;
    test_put_if_absent_creates(store).await?;
    test_put_if_absent_conflicts(store).await?;
    test_put_if_matches_takeover(store).await?;
    test_put_if_matches_wrong_version(store).await?;
    test_put_if_matches_wrong_owner(store).await?;
    test_put_if_matches_absent(store).await?;
    test_delete_if_matches(store).await?;
    test_ownership_clear_and_retake(store).await?;
    test_payload_round_trip(store).await?;
    Ok(())
}

async fn test_get_missing(store: &dyn LockStore) -> Result<(), StoreError> {
    let item = store.get("conf-missing").await?;
    assert!(item.is_none(), "get on a missing name should return None");
    Ok(())
}

async fn test_put_if_absent_creates(store: &dyn LockStore) -> Result<(), StoreError> {
    let item = LockItem::new("conf-create", "owner-a", 1, lease());
    let outcome = store.put_if_absent(&item).await?;
    assert!(outcome.is_ok(), "put_if_absent on a missing name should commit");

    let stored = store.get("conf-create").await?;
    assert_eq!(stored.as_ref(), Some(&item), "stored item should round-trip");
    Ok(())
}

async fn test_put_if_absent_conflicts(store: &dyn LockStore) -> Result<(), StoreError> {
    let first = LockItem::new("conf-race", "owner-a", 1, lease());
    store.put_if_absent(&first).await?;

    let second = LockItem::new("conf-race", "owner-b", 1, lease());
    let outcome = store.put_if_absent(&second).await?;
    match outcome {
        WriteOutcome::Conflict { current } => {
            assert_eq!(
                current.as_ref().map(|c| c.owner.as_str()),
                Some("owner-a"),
                "conflict should expose the winning item"
            );
        }
        WriteOutcome::Ok => panic!("put_if_absent on an existing name should conflict"),
    }

    let stored = store.get("conf-race").await?;
    assert_eq!(stored, Some(first), "losing write must not mutate the item");
    Ok(())
}

async fn test_put_if_matches_takeover(store: &dyn LockStore) -> Result<(), StoreError> {
    let first = LockItem::new("conf-takeover", "owner-a", 1, lease());
    store.put_if_absent(&first).await?;

    let taken = LockItem::new("conf-takeover", "owner-b", 2, lease());
    let outcome = store.put_if_matches("owner-a", 1, &taken).await?;
    assert!(outcome.is_ok(), "matching (owner, version) should commit");

    let stored = store.get("conf-takeover").await?;
    assert_eq!(stored, Some(taken));
    Ok(())
}

async fn test_put_if_matches_wrong_version(store: &dyn LockStore) -> Result<(), StoreError> {
    let first = LockItem::new("conf-stale-version", "owner-a", 1, lease());
    store.put_if_absent(&first).await?;

    let stale = LockItem::new("conf-stale-version", "owner-b", 8, lease());
    let outcome = store.put_if_matches("owner-a", 7, &stale).await?;
    assert!(
        matches!(outcome, WriteOutcome::Conflict { .. }),
        "stale version should conflict"
    );

    let stored = store.get("conf-stale-version").await?;
    assert_eq!(stored, Some(first), "failed CAS must not mutate the item");
    Ok(())
}

async fn test_put_if_matches_wrong_owner(store: &dyn LockStore) -> Result<(), StoreError> {
    let first = LockItem::new("conf-stale-owner", "owner-a", 1, lease());
    store.put_if_absent(&first).await?;

    let stale = LockItem::new("conf-stale-owner", "owner-b", 2, lease());
    let outcome = store.put_if_matches("owner-z", 1, &stale).await?;
    assert!(
        matches!(outcome, WriteOutcome::Conflict { .. }),
        "wrong expected owner should conflict"
    );

    let stored = store.get("conf-stale-owner").await?;
    assert_eq!(stored, Some(first));
    Ok(())
}

async fn test_put_if_matches_absent(store: &dyn LockStore) -> Result<(), StoreError> {
    let item = LockItem::new("conf-never-written", "owner-a", 2, lease());
    let outcome = store.put_if_matches("owner-a", 1, &item).await?;
    match outcome {
        WriteOutcome::Conflict { current } => {
            assert!(current.is_none(), "absent items conflict with current = None");
        }
        WriteOutcome::Ok => panic!("put_if_matches against a missing name should conflict"),
    }
    Ok(())
}

async fn test_delete_if_matches(store: &dyn LockStore) -> Result<(), StoreError> {
    let item = LockItem::new("conf-delete", "owner-a", 1, lease());
    store.put_if_absent(&item).await?;

    let outcome = store.delete_if_matches("conf-delete", "owner-a", 9).await?;
    assert!(
        matches!(outcome, WriteOutcome::Conflict { .. }),
        "delete with a stale version should conflict"
    );
    let stored = store.get("conf-delete").await?;
    assert!(stored.is_some(), "failed delete must not remove the item");

    let outcome = store.delete_if_matches("conf-delete", "owner-a", 1).await?;
    assert!(outcome.is_ok(), "matching delete should commit");
    let stored = store.get("conf-delete").await?;
    assert!(stored.is_none(), "deleted item should be gone");

    let outcome = store.delete_if_matches("conf-delete", "owner-a", 1).await?;
    match outcome {
        WriteOutcome::Conflict { current } => assert!(current.is_none()),
        WriteOutcome::Ok => panic!("deleting a missing item should conflict"),
    }
    Ok(())
}

async fn test_ownership_clear_and_retake(store: &dyn LockStore) -> Result<(), StoreError> {
    let item = LockItem::new("conf-clear", "owner-a", 1, lease());
    store.put_if_absent(&item).await?;

    // Release by clearing ownership rather than deleting the row.
    let cleared = LockItem::new("conf-clear", "", 2, lease());
    let outcome = store.put_if_matches("owner-a", 1, &cleared).await?;
    assert!(outcome.is_ok());

    let stored = store.get("conf-clear").await?;
    assert!(
        stored.as_ref().is_some_and(|s| !s.is_owned()),
        "cleared item should exist but be unowned"
    );

    // A contender retakes the row by matching the empty owner.
    let retaken = LockItem::new("conf-clear", "owner-b", 3, lease());
    let outcome = store.put_if_matches("", 2, &retaken).await?;
    assert!(outcome.is_ok(), "empty expected owner should match a cleared item");

    let stored = store.get("conf-clear").await?;
    assert_eq!(stored, Some(retaken));
    Ok(())
}

async fn test_payload_round_trip(store: &dyn LockStore) -> Result<(), StoreError> {
    let item = LockItem::new("conf-payload", "owner-a", 1, lease())
        .with_payload(Bytes::from_static(b"fence-token-1"));
    store.put_if_absent(&item).await?;

    let stored = store.get("conf-payload").await?;
    assert_eq!(
        stored.as_ref().and_then(|s| s.payload.as_deref()),
        Some(b"fence-token-1".as_slice())
    );

    let replaced = LockItem::new("conf-payload", "owner-b", 2, lease())
        .with_payload(Bytes::from_static(b"fence-token-2"));
    store.put_if_matches("owner-a", 1, &replaced).await?;

    let stored = store.get("conf-payload").await?;
    assert_eq!(stored, Some(replaced), "payload should follow the write");
    Ok(())
}
