//! Distributed advisory locks over a conditionally-updatable key-value
//! store.
//!
//! A lock is a named item in a backing store that offers strongly
//! consistent reads and compare-and-set writes on an `(owner, version)`
//! pair. Contenders resolve ownership through conditional writes; a
//! presumed-dead owner's lock is taken over only after its full advertised
//! lease has been waited out on the contender's own monotonic clock, so no
//! clock synchronization between clients is required. A background task
//! renews each held lease, and a local deadline guarantees a client stops
//! asserting ownership before any contender can complete a takeover.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dynamolock::{AcquireOptions, LockClient};
//! use dynamolock_store_memory::MemoryLockStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dynamolock::LockError> {
//!     let client = LockClient::new(Arc::new(MemoryLockStore::new()));
//!
//!     // Take the lock; a one-second lease is renewed in the background.
//!     let handle = client
//!         .acquire(
//!             "nightly-report",
//!             AcquireOptions::new().with_lease(Duration::from_secs(1)),
//!         )
//!         .await?;
//!
//!     assert!(handle.is_held());
//!
//!     // Hand the lock back so other clients can take it immediately.
//!     client.unlock(handle).await?;
//!     Ok(())
//! }
//! ```
//!
//! Any store implementing the four-operation
//! [`LockStore`] capability works: `dynamolock-store-dynamodb` for
//! DynamoDB, `dynamolock-store-memory` for tests and single-process use.
//!
//! # Safety model
//!
//! Mutual exclusion holds under arbitrary network delay, provided every
//! participant honors its local deadline and monotonic clock rates stay
//! within roughly ±10% of each other over a single lease window. It does
//! not depend on wall clocks, on the renewal task staying scheduled, or on
//! the backing store retaining items past a deletion.

mod acquire;
mod client;
mod config;
mod error;
mod record;
mod release;
mod renew;

pub use client::{LockClient, LockHandle};
pub use config::{
    AcquireOptions, ClientConfig, DEFAULT_LEASE, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_PAYLOAD_BYTES,
    DEFAULT_RENEW_FACTOR, DEFAULT_RETRY_INITIAL, DEFAULT_RETRY_MAX,
};
pub use error::LockError;
pub use record::LockState;

pub use dynamolock_store::{LockItem, LockStore, StoreError, WriteOutcome};
