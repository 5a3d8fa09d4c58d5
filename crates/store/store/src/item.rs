use std::time::Duration;

use bytes::Bytes;

/// A lock item as the backing store holds it, one per lock name.
///
/// `version` is the CAS witness: it strictly increases across successful
/// writes to the same name, and every conditional write names the exact
/// `(owner, version)` pair it expects to replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockItem {
    /// Primary key, chosen by the caller.
    pub name: String,
    /// Identity of the holding client. Empty means unowned; a release may
    /// clear ownership without deleting the item.
    pub owner: String,
    /// Monotonic version used as the CAS witness.
    pub version: u64,
    /// Lease length the current owner advertises.
    pub lease: Duration,
    /// Opaque application bytes carried with the lock.
    pub payload: Option<Bytes>,
}

impl LockItem {
    /// Create an item with no payload.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        version: u64,
        lease: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            version,
            lease,
            payload: None,
        }
    }

    /// Attach an application payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether the item currently has an owner in the protocol sense.
    pub fn is_owned(&self) -> bool {
        !self.owner.is_empty()
    }
}
