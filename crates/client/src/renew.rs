//! Renewal engine: a background task per held lock that refreshes the
//! lease ahead of the local deadline.
//!
//! Renewal is an optimization. Correctness never depends on it running:
//! every owner-facing operation re-checks the record state and the local
//! deadline, and a record whose deadline lapses without a successful
//! renewal is `Lost` no matter what the task was doing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use dynamolock_store::{LockItem, LockStore, StoreError, WriteOutcome};

use crate::record::LockRecord;

/// Handle to a spawned renewal task.
///
/// Dropping it closes the shutdown channel, which stops the task on its
/// next poll; [`stop`](RenewTask::stop) stops it synchronously.
#[derive(Debug)]
pub(crate) struct RenewTask {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RenewTask {
    /// Signal shutdown and wait for the task to finish, so no renewal can
    /// overlap a release write that follows.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Spawn the renewal loop for `record`.
pub(crate) fn spawn(
    store: Arc<dyn LockStore>,
    record: Arc<LockRecord>,
    renew_factor: u32,
) -> RenewTask {
    let interval = record.lease() / renew_factor.max(3);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; the lease
        // was just written, so skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(name = %record.name(), "renewal task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if !renew_once(store.as_ref(), &record, interval).await {
                        break;
                    }
                }
            }
        }
    });

    RenewTask { shutdown_tx, task }
}

/// One renewal attempt. Returns false when the task should stop.
async fn renew_once(store: &dyn LockStore, record: &LockRecord, interval: Duration) -> bool {
    if record.expire_if_past_deadline() {
        warn!(name = %record.name(), "local deadline passed before renewal; lock lost");
        return false;
    }
    if record.state().is_terminal() {
        return false;
    }

    let version = record.version_seen();
    let mut item = LockItem::new(
        record.name().to_owned(),
        record.owner().to_owned(),
        version + 1,
        record.lease(),
    );
    item.payload = record.payload().cloned();

    let issued_at = Instant::now();
    match store.put_if_matches(record.owner(), version, &item).await {
        Ok(WriteOutcome::Ok) => {
            record.mark_renewed(version + 1, issued_at);
            debug!(name = %record.name(), version = version + 1, "lease renewed");
            true
        }
        Ok(WriteOutcome::Conflict { current }) => {
            // The item moved under us: stolen, or released and retaken.
            // A conflict is never retried.
            warn!(
                name = %record.name(),
                new_owner = current.as_ref().map_or("", |c| c.owner.as_str()),
                "renewal lost the lock"
            );
            record.mark_lost();
            false
        }
        Err(StoreError::Transient(msg)) => {
            // Ride the next tick while enough deadline margin remains for
            // another attempt; inside that margin, give up.
            if record.deadline_margin() > interval {
                warn!(name = %record.name(), error = %msg, "renewal failed transiently; will retry");
                true
            } else {
                warn!(
                    name = %record.name(),
                    error = %msg,
                    "renewal failed transiently inside the safety margin; lock lost"
                );
                record.mark_lost();
                false
            }
        }
        Err(StoreError::Fatal(msg)) => {
            error!(name = %record.name(), error = %msg, "renewal failed fatally; lock lost");
            record.mark_lost();
            false
        }
    }
}
