use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

/// Observable states of a lock record.
///
/// `Lost` and `Released` are terminal; a record never re-enters `Held`.
/// A fresh acquisition always creates a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The client holds the lock and the local deadline has not passed.
    Held,
    /// The lock was stolen, released elsewhere, or the local deadline
    /// lapsed without a successful renewal.
    Lost,
    /// The client released the lock.
    Released,
}

impl LockState {
    /// Whether the record can never return to `Held`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Held)
    }
}

#[derive(Debug)]
struct RecordInner {
    version_seen: u64,
    local_deadline: Instant,
    state: LockState,
}

/// Client-side record of one held lock.
///
/// Mutated only by the renewal and release engines; callers observe it
/// through [`LockHandle`](crate::LockHandle). The mutex guards plain field
/// access and is never held across an await.
#[derive(Debug)]
pub(crate) struct LockRecord {
    name: String,
    owner: String,
    lease: Duration,
    payload: Option<Bytes>,
    inner: Mutex<RecordInner>,
    state_tx: watch::Sender<LockState>,
}

impl LockRecord {
    /// Create a freshly acquired record in `Held` state.
    pub(crate) fn new(
        name: String,
        owner: String,
        lease: Duration,
        payload: Option<Bytes>,
        version_seen: u64,
        local_deadline: Instant,
    ) -> Self {
        let (state_tx, _) = watch::channel(LockState::Held);
        Self {
            name,
            owner,
            lease,
            payload,
            inner: Mutex::new(RecordInner {
                version_seen,
                local_deadline,
                state: LockState::Held,
            }),
            state_tx,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn lease(&self) -> Duration {
        self.lease
    }

    pub(crate) fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub(crate) fn state(&self) -> LockState {
        self.lock().state
    }

    pub(crate) fn version_seen(&self) -> u64 {
        self.lock().version_seen
    }

    pub(crate) fn local_deadline(&self) -> Instant {
        self.lock().local_deadline
    }

    /// Remaining time before the local deadline; zero once it has passed.
    pub(crate) fn deadline_margin(&self) -> Duration {
        self.lock()
            .local_deadline
            .saturating_duration_since(Instant::now())
    }

    /// Whether this record is `Held` with an unexpired deadline. Enforces
    /// the deadline first so callers never observe a stale `Held`.
    pub(crate) fn is_currently_held(&self) -> bool {
        self.expire_if_past_deadline();
        self.state() == LockState::Held
    }

    /// Enforce the local deadline: a `Held` record whose deadline passed
    /// becomes `Lost`. Returns true if this call performed the transition.
    pub(crate) fn expire_if_past_deadline(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == LockState::Held && inner.local_deadline <= Instant::now() {
            inner.state = LockState::Lost;
            drop(inner);
            self.state_tx.send_replace(LockState::Lost);
            return true;
        }
        false
    }

    /// Record a successful renewal: bump the version and extend the
    /// deadline from the instant the renewal write was issued.
    pub(crate) fn mark_renewed(&self, new_version: u64, issued_at: Instant) {
        let mut inner = self.lock();
        debug_assert!(new_version > inner.version_seen, "version_seen never decreases");
        inner.version_seen = new_version;
        inner.local_deadline = issued_at + self.lease;
    }

    /// Transition to `Lost`. No effect on an already terminal record.
    pub(crate) fn mark_lost(&self) {
        self.transition(LockState::Lost);
    }

    /// Transition to `Released`. No effect on an already terminal record.
    pub(crate) fn mark_released(&self) {
        self.transition(LockState::Released);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, target: LockState) {
        let mut inner = self.lock();
        if inner.state == LockState::Held {
            inner.state = target;
            drop(inner);
            self.state_tx.send_replace(target);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().expect("record mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(deadline_in: Duration) -> LockRecord {
        LockRecord::new(
            "job".to_owned(),
            "client-a".to_owned(),
            Duration::from_secs(1),
            None,
            1,
            Instant::now() + deadline_in,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_lapse_forces_lost() {
        let rec = record(Duration::from_millis(100));
        assert!(rec.is_currently_held());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!rec.is_currently_held());
        assert_eq!(rec.state(), LockState::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_deadline_and_bumps_version() {
        let rec = record(Duration::from_millis(100));

        let issued_at = Instant::now();
        rec.mark_renewed(2, issued_at);
        assert_eq!(rec.version_seen(), 2);
        assert_eq!(rec.local_deadline(), issued_at + Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rec.is_currently_held(), "renewed record outlives old deadline");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_states_are_never_revived() {
        let rec = record(Duration::from_secs(10));
        rec.mark_released();
        assert_eq!(rec.state(), LockState::Released);

        // A late loss signal must not overwrite the release.
        rec.mark_lost();
        assert_eq!(rec.state(), LockState::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_observe_loss() {
        let rec = record(Duration::from_secs(10));
        let mut rx = rec.subscribe();

        rec.mark_lost();
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), LockState::Lost);
    }
}
