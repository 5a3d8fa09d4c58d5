use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use dynamolock_store::{LockItem, LockStore, StoreError};

use crate::acquire::{self, AcquirePlan};
use crate::config::{AcquireOptions, ClientConfig};
use crate::error::LockError;
use crate::record::{LockRecord, LockState};
use crate::release::{self, ReleaseMode};
use crate::renew::{self, RenewTask};

/// Client facade for distributed advisory locks.
///
/// A client owns one identity; every lock it acquires is owned under that
/// identity. Cloning is cheap and clones share the identity, so one client
/// per process (or per logical participant) is the usual shape.
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn LockStore>,
    owner: String,
    config: ClientConfig,
}

impl LockClient {
    /// Create a client with default configuration and a fresh random
    /// identity.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            owner: Uuid::new_v4().to_string(),
            config: ClientConfig::default(),
        }
    }

    /// Create a client with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Fatal`] if the configuration is inconsistent
    /// (renewal factor below 3, zero lease or retry values, empty
    /// identity).
    pub fn with_config(
        store: Arc<dyn LockStore>,
        config: ClientConfig,
    ) -> Result<Self, LockError> {
        config.validate().map_err(LockError::Fatal)?;
        let owner = config
            .identity
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            store,
            owner,
            config,
        })
    }

    /// The identity this client writes as `owner`.
    pub fn owner_id(&self) -> &str {
        &self.owner
    }

    /// Acquire the lock named `name`.
    ///
    /// An unowned name is taken immediately. A held name is contended per
    /// the takeover protocol: the current owner's full advertised lease is
    /// waited out locally, and only an item that sat unchanged through
    /// that window is CASed over. On success a background task renews the
    /// lease until the lock is released, lost, or the handle is dropped.
    ///
    /// # Errors
    ///
    /// [`Timeout`](LockError::Timeout) past the configured budget,
    /// [`Unavailable`](LockError::Unavailable) when attempts run out
    /// against live contention, [`Canceled`](LockError::Canceled) when the
    /// caller's token fires, [`AlreadyHeld`](LockError::AlreadyHeld) when
    /// this client already owns the item,
    /// [`PayloadTooLarge`](LockError::PayloadTooLarge),
    /// [`Unknown`](LockError::Unknown) when attempts run out on transient
    /// store failures, and [`Fatal`](LockError::Fatal) on non-retryable
    /// ones.
    pub async fn acquire(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> Result<LockHandle, LockError> {
        if let Some(payload) = &options.payload
            && payload.len() > self.config.max_payload_bytes
        {
            return Err(LockError::PayloadTooLarge {
                got: payload.len(),
                limit: self.config.max_payload_bytes,
            });
        }

        let plan = AcquirePlan {
            name: name.to_owned(),
            owner: self.owner.clone(),
            lease: options.lease.unwrap_or(self.config.default_lease),
            payload: options.payload,
            max_attempts: options.max_attempts.unwrap_or(self.config.max_attempts),
            acquire_timeout: options.acquire_timeout.or(self.config.acquire_timeout),
            retry_initial: options.retry_initial.unwrap_or(self.config.retry_initial),
            retry_max: options.retry_max.unwrap_or(self.config.retry_max),
            cancel: options.cancel.unwrap_or_default(),
        };

        let record = acquire::run(self.store.as_ref(), plan).await?;
        let renew = renew::spawn(
            Arc::clone(&self.store),
            Arc::clone(&record),
            self.config.renew_factor,
        );
        Ok(LockHandle {
            record,
            renew: Some(renew),
        })
    }

    /// Release `handle`, clearing ownership but leaving the item (and its
    /// payload) in place for inspection.
    ///
    /// Idempotent against loss: releasing a lock that was already stolen
    /// or expired returns `Ok` without writing against the new version.
    ///
    /// # Errors
    ///
    /// [`Unknown`](LockError::Unknown) when the write never resolved
    /// within the retry budget, [`Fatal`](LockError::Fatal) on
    /// non-retryable store failures. Either way the record is terminal
    /// locally and renewal has stopped.
    pub async fn unlock(&self, handle: LockHandle) -> Result<(), LockError> {
        self.release(handle, ReleaseMode::Unlock).await
    }

    /// Release `handle` and delete the item outright.
    ///
    /// Same disposition as [`unlock`](Self::unlock).
    pub async fn delete(&self, handle: LockHandle) -> Result<(), LockError> {
        self.release(handle, ReleaseMode::Delete).await
    }

    async fn release(&self, mut handle: LockHandle, mode: ReleaseMode) -> Result<(), LockError> {
        // Stop renewal before touching the store, so no renewal can bump
        // the version between our read of `version_seen` and the CAS.
        if let Some(renew) = handle.renew.take() {
            renew.stop().await;
        }
        release::run(
            self.store.as_ref(),
            &handle.record,
            mode,
            self.config.retry_initial,
            self.config.retry_max,
        )
        .await
    }

    /// Diagnostic strongly consistent read of the remote item for `name`.
    ///
    /// # Errors
    ///
    /// [`Unknown`](LockError::Unknown) on transient store failures,
    /// [`Fatal`](LockError::Fatal) otherwise.
    pub async fn inspect(&self, name: &str) -> Result<Option<LockItem>, LockError> {
        match self.store.get(name).await {
            Ok(item) => Ok(item),
            Err(StoreError::Transient(msg)) => Err(LockError::Unknown(msg)),
            Err(StoreError::Fatal(msg)) => Err(LockError::Fatal(msg)),
        }
    }
}

/// A held lock.
///
/// The handle reads the client-side record; mutation flows through the
/// background renewal task and the client's [`unlock`](LockClient::unlock)
/// / [`delete`](LockClient::delete). Dropping the handle without unlocking
/// stops renewal and lets the lease lapse, after which other clients can
/// take the lock over; an explicit unlock hands it over promptly.
#[derive(Debug)]
pub struct LockHandle {
    pub(crate) record: Arc<LockRecord>,
    pub(crate) renew: Option<RenewTask>,
}

impl LockHandle {
    /// The lock name.
    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Whether this client still holds the lock: the record is `Held` and
    /// the local deadline has not passed. A `false` is definitive; a
    /// `true` is only as fresh as the local deadline.
    pub fn is_held(&self) -> bool {
        self.record.is_currently_held()
    }

    /// Fail with [`LockLost`](LockError::LockLost) unless the lock is
    /// still held. Call this before relying on the lock to guard a side
    /// effect.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        if self.record.is_currently_held() {
            Ok(())
        } else {
            Err(LockError::LockLost(self.record.name().to_owned()))
        }
    }

    /// Current record state, with the local deadline enforced first.
    pub fn state(&self) -> LockState {
        self.record.expire_if_past_deadline();
        self.record.state()
    }

    /// The payload written with this acquisition.
    pub fn payload(&self) -> Option<&Bytes> {
        self.record.payload()
    }

    /// The last version this client wrote. Usable as a fencing token.
    pub fn version(&self) -> u64 {
        self.record.version_seen()
    }

    /// Lease length used for renewals.
    pub fn lease(&self) -> Duration {
        self.record.lease()
    }

    /// Wait until the lock is no longer held (lost or released). Resolves
    /// immediately on a record that is already terminal.
    pub async fn lost(&self) {
        let mut rx = self.record.subscribe();
        loop {
            self.record.expire_if_past_deadline();
            if self.record.state().is_terminal() {
                return;
            }
            let deadline = self.record.local_deadline();
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                // Re-check when the current deadline lapses, in case the
                // renewal task is gone and no transition will be signaled.
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.renew.is_some() && self.record.state() == LockState::Held {
            debug!(name = %self.record.name(), "lock handle dropped while held; lease will lapse");
        }
    }
}
