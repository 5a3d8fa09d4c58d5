//! Acquisition engine: the read, wait-out-lease, CAS-takeover round loop.
//!
//! Contention is resolved without synchronized clocks: a contender sleeps
//! the full lease the current owner advertises, measured on its own
//! monotonic clock from the moment of its read, and only a lock that sat
//! unchanged through that whole window may be taken over.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dynamolock_store::{LockItem, LockStore, StoreError, WriteOutcome};

use crate::error::LockError;
use crate::record::LockRecord;

/// Everything one `acquire` call needs, with per-call options already
/// resolved against the client defaults.
pub(crate) struct AcquirePlan {
    pub name: String,
    pub owner: String,
    pub lease: Duration,
    pub payload: Option<Bytes>,
    pub max_attempts: u32,
    pub acquire_timeout: Option<Duration>,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub cancel: CancellationToken,
}

impl AcquirePlan {
    /// The remote item this acquisition writes at `version`.
    fn item(&self, version: u64) -> LockItem {
        let mut item = LockItem::new(self.name.clone(), self.owner.clone(), version, self.lease);
        item.payload = self.payload.clone();
        item
    }
}

/// Why a takeover round ended without the lock.
enum RoundLoss {
    /// Another client won a race or the current owner is alive.
    Contended,
    /// The backing store failed transiently.
    Transient(String),
}

enum Round {
    Acquired(Arc<LockRecord>),
    Lost(RoundLoss),
}

/// Run the acquisition protocol to completion.
pub(crate) async fn run(
    store: &dyn LockStore,
    plan: AcquirePlan,
) -> Result<Arc<LockRecord>, LockError> {
    let deadline = plan.acquire_timeout.map(|t| Instant::now() + t);
    let mut backoff = plan.retry_initial;
    let mut last_loss = RoundLoss::Contended;

    for attempt in 0..plan.max_attempts {
        if plan.cancel.is_cancelled() {
            return Err(LockError::Canceled);
        }

        match round(store, &plan, deadline).await? {
            Round::Acquired(record) => {
                debug!(
                    name = %plan.name,
                    attempt,
                    version = record.version_seen(),
                    "lock acquired"
                );
                return Ok(record);
            }
            Round::Lost(loss) => {
                if let RoundLoss::Transient(msg) = &loss {
                    warn!(
                        name = %plan.name,
                        attempt,
                        error = %msg,
                        "takeover round hit a transient store error"
                    );
                }
                last_loss = loss;
            }
        }

        // Hold back before the next round, except after the final one.
        if attempt + 1 < plan.max_attempts {
            let wake_at = Instant::now() + jittered(backoff);
            sleep_until_cancellable(wake_at, deadline, &plan.cancel, plan.acquire_timeout).await?;
            backoff = (backoff * 2).min(plan.retry_max);
        }
    }

    match last_loss {
        RoundLoss::Contended => Err(LockError::Unavailable(plan.name)),
        RoundLoss::Transient(msg) => Err(LockError::Unknown(msg)),
    }
}

/// One takeover round: read, wait out the advertised lease, re-read, CAS.
async fn round(
    store: &dyn LockStore,
    plan: &AcquirePlan,
    deadline: Option<Instant>,
) -> Result<Round, LockError> {
    let read_issued_at = Instant::now();
    let observed = match store.get(&plan.name).await {
        Ok(observed) => observed,
        Err(StoreError::Transient(msg)) => return Ok(Round::Lost(RoundLoss::Transient(msg))),
        Err(StoreError::Fatal(msg)) => return Err(LockError::Fatal(msg)),
    };

    let Some(current) = observed else {
        return create(store, plan).await;
    };

    if current.owner == plan.owner {
        // Reentry is not modeled; a second record would shadow the live one.
        return Err(LockError::AlreadyHeld(plan.name.clone()));
    }

    if !current.is_owned() {
        // A previous owner cleared ownership instead of deleting the item.
        return takeover(store, plan, &current).await;
    }

    // Wait out the advertised lease, measured on our own monotonic clock
    // from the moment the read was issued.
    let wait_until = read_issued_at + current.lease;
    sleep_until_cancellable(wait_until, deadline, &plan.cancel, plan.acquire_timeout).await?;

    // Only an item that sat unchanged through the full lease may be taken
    // over; any movement means the owner is alive or the lock changed hands.
    let reread = match store.get(&plan.name).await {
        Ok(reread) => reread,
        Err(StoreError::Transient(msg)) => return Ok(Round::Lost(RoundLoss::Transient(msg))),
        Err(StoreError::Fatal(msg)) => return Err(LockError::Fatal(msg)),
    };

    match reread {
        None => create(store, plan).await,
        Some(item) if item.owner == current.owner && item.version == current.version => {
            takeover(store, plan, &item).await
        }
        Some(item) => {
            debug!(
                name = %plan.name,
                owner = %item.owner,
                version = item.version,
                "lock moved during the lease wait"
            );
            Ok(Round::Lost(RoundLoss::Contended))
        }
    }
}

/// Create the item fresh at version 1.
async fn create(store: &dyn LockStore, plan: &AcquirePlan) -> Result<Round, LockError> {
    let item = plan.item(1);
    let issued_at = Instant::now();
    match store.put_if_absent(&item).await {
        Ok(WriteOutcome::Ok) => finish(store, plan, item.version, issued_at).await,
        Ok(WriteOutcome::Conflict { .. }) => Ok(Round::Lost(RoundLoss::Contended)),
        Err(StoreError::Transient(msg)) => Ok(Round::Lost(RoundLoss::Transient(msg))),
        Err(StoreError::Fatal(msg)) => Err(LockError::Fatal(msg)),
    }
}

/// CAS the observed `(owner, version)` pair over to us.
async fn takeover(
    store: &dyn LockStore,
    plan: &AcquirePlan,
    observed: &LockItem,
) -> Result<Round, LockError> {
    let item = plan.item(observed.version + 1);
    let issued_at = Instant::now();
    match store
        .put_if_matches(&observed.owner, observed.version, &item)
        .await
    {
        Ok(WriteOutcome::Ok) => finish(store, plan, item.version, issued_at).await,
        Ok(WriteOutcome::Conflict { .. }) => Ok(Round::Lost(RoundLoss::Contended)),
        Err(StoreError::Transient(msg)) => Ok(Round::Lost(RoundLoss::Transient(msg))),
        Err(StoreError::Fatal(msg)) => Err(LockError::Fatal(msg)),
    }
}

/// A write committed. Hand back the record, unless the caller canceled
/// while the write was in flight: ownership won by a canceled call must be
/// given back before reporting `Canceled`.
///
/// The local deadline is stamped from the instant the write was issued,
/// not from its return, so the client stops asserting ownership before any
/// contender that observed our write can finish its own lease wait.
async fn finish(
    store: &dyn LockStore,
    plan: &AcquirePlan,
    version: u64,
    issued_at: Instant,
) -> Result<Round, LockError> {
    if plan.cancel.is_cancelled() {
        release_ghost(store, plan, version).await;
        return Err(LockError::Canceled);
    }
    Ok(Round::Acquired(Arc::new(LockRecord::new(
        plan.name.clone(),
        plan.owner.clone(),
        plan.lease,
        plan.payload.clone(),
        version,
        issued_at + plan.lease,
    ))))
}

/// Best-effort compensating write that clears ownership won by a canceled
/// call. On failure the item simply lapses after its lease.
async fn release_ghost(store: &dyn LockStore, plan: &AcquirePlan, version: u64) {
    let mut item = plan.item(version + 1);
    item.owner = String::new();
    match store.put_if_matches(&plan.owner, version, &item).await {
        Ok(_) => debug!(name = %plan.name, "released ownership won by a canceled acquire"),
        Err(e) => warn!(
            name = %plan.name,
            error = %e,
            "failed to release ownership won by a canceled acquire"
        ),
    }
}

/// Sleep until `target`, waking early for cancellation or the overall
/// acquire deadline.
async fn sleep_until_cancellable(
    target: Instant,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(), LockError> {
    let (wake_at, timed_out) = match deadline {
        Some(d) if d < target => (d, true),
        _ => (target, false),
    };
    tokio::select! {
        () = cancel.cancelled() => Err(LockError::Canceled),
        () = tokio::time::sleep_until(wake_at) => {
            if timed_out {
                Err(LockError::Timeout(timeout.unwrap_or_default()))
            } else {
                Ok(())
            }
        }
    }
}

/// Add clock-nanosecond jitter on top of a backoff step so contenders that
/// lost the same race do not wake in lockstep.
fn jittered(base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let nanos = u64::from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    Duration::from_millis(base_ms.saturating_add(nanos % base_ms.saturating_add(1)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use dynamolock_store_memory::MemoryLockStore;

    use super::*;

    fn plan(name: &str, owner: &str, lease: Duration) -> AcquirePlan {
        AcquirePlan {
            name: name.to_owned(),
            owner: owner.to_owned(),
            lease,
            payload: None,
            max_attempts: 3,
            acquire_timeout: None,
            retry_initial: Duration::from_millis(50),
            retry_max: Duration::from_secs(2),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn cold_acquire_creates_version_one() {
        let store = MemoryLockStore::new();
        let record = run(&store, plan("job", "me", Duration::from_secs(1)))
            .await
            .expect("empty store should acquire immediately");

        assert_eq!(record.version_seen(), 1);
        assert!(record.is_currently_held());

        let item = store.get("job").await.unwrap().unwrap();
        assert_eq!(item.owner, "me");
        assert_eq!(item.version, 1);
    }

    #[tokio::test]
    async fn self_owned_item_is_rejected() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "me", 4, Duration::from_secs(1)))
            .await
            .unwrap();

        let result = run(&store, plan("job", "me", Duration::from_secs(1))).await;
        assert!(matches!(result, Err(LockError::AlreadyHeld(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unowned_item_is_retaken_without_waiting() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "", 5, Duration::from_secs(60)))
            .await
            .unwrap();

        let started = Instant::now();
        let record = run(&store, plan("job", "me", Duration::from_secs(1)))
            .await
            .expect("cleared item should be retaken immediately");

        assert_eq!(record.version_seen(), 6);
        assert_eq!(Instant::now(), started, "no lease wait should have happened");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_during_the_lease_wait() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "other", 1, Duration::from_secs(60)))
            .await
            .unwrap();

        let mut p = plan("job", "me", Duration::from_secs(1));
        p.acquire_timeout = Some(Duration::from_secs(1));

        let result = run(&store, p).await;
        assert!(matches!(result, Err(LockError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_issues_no_write() {
        let store = MemoryLockStore::new();
        store
            .put_if_absent(&LockItem::new("job", "other", 1, Duration::from_secs(60)))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut p = plan("job", "me", Duration::from_secs(1));
        p.cancel = cancel.clone();

        let shared = store.clone();
        let task = tokio::spawn(async move { run(&shared, p).await });

        tokio::time::advance(Duration::from_secs(5)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(LockError::Canceled)));

        let item = store.get("job").await.unwrap().unwrap();
        assert_eq!((item.owner.as_str(), item.version), ("other", 1));
    }

    /// Store whose first `put_if_matches` parks until the gate opens,
    /// holding the CAS in flight.
    struct GateStore {
        inner: MemoryLockStore,
        gate: Arc<Notify>,
        gated: AtomicBool,
    }

    #[async_trait]
    impl LockStore for GateStore {
        async fn get(&self, name: &str) -> Result<Option<LockItem>, StoreError> {
            self.inner.get(name).await
        }

        async fn put_if_absent(&self, item: &LockItem) -> Result<WriteOutcome, StoreError> {
            self.inner.put_if_absent(item).await
        }

        async fn put_if_matches(
            &self,
            expected_owner: &str,
            expected_version: u64,
            item: &LockItem,
        ) -> Result<WriteOutcome, StoreError> {
            if self.gated.swap(false, Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.inner
                .put_if_matches(expected_owner, expected_version, item)
                .await
        }

        async fn delete_if_matches(
            &self,
            name: &str,
            expected_owner: &str,
            expected_version: u64,
        ) -> Result<WriteOutcome, StoreError> {
            self.inner
                .delete_if_matches(name, expected_owner, expected_version)
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_landing_after_cas_commit_releases_the_ghost() {
        let mem = MemoryLockStore::new();
        mem.put_if_absent(&LockItem::new("job", "dead-owner", 1, Duration::from_millis(100)))
            .await
            .unwrap();

        let gate = Arc::new(Notify::new());
        let store = Arc::new(GateStore {
            inner: mem.clone(),
            gate: Arc::clone(&gate),
            gated: AtomicBool::new(true),
        });

        let cancel = CancellationToken::new();
        let mut p = plan("job", "me", Duration::from_millis(100));
        p.cancel = cancel.clone();

        let engine = Arc::clone(&store);
        let task = tokio::spawn(async move { run(engine.as_ref(), p).await });

        // Let the engine wait out the dead owner's lease, re-read, and park
        // inside the takeover CAS.
        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        gate.notify_one();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(LockError::Canceled)));

        // The CAS committed at version 2; the compensating write cleared
        // ownership at version 3. No ghost remains.
        let item = mem.get("job").await.unwrap().unwrap();
        assert_eq!(item.version, 3);
        assert!(!item.is_owned());
    }
}
