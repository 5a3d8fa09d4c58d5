use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Default lease length.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(10);

/// Default renewal factor: the lease is refreshed `K` times per window, so
/// two consecutive failed renewals still leave margin before the deadline.
pub const DEFAULT_RENEW_FACTOR: u32 = 3;

/// Default initial backoff between takeover rounds.
pub const DEFAULT_RETRY_INITIAL: Duration = Duration::from_millis(50);

/// Default backoff ceiling.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(2);

/// Default number of takeover rounds per `acquire`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default payload ceiling, kept under DynamoDB's 400 KB item limit.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 350 * 1024;

/// Tuning defaults for a [`LockClient`](crate::LockClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Lease length used when an acquire does not specify one.
    pub default_lease: Duration,
    /// How many renewals fit in one lease window. Must be at least 3, so
    /// two consecutive failed renewals still leave margin before the
    /// deadline.
    pub renew_factor: u32,
    /// Initial backoff between takeover rounds.
    pub retry_initial: Duration,
    /// Backoff ceiling.
    pub retry_max: Duration,
    /// Wall-clock budget for a single `acquire`; `None` means unbounded.
    pub acquire_timeout: Option<Duration>,
    /// Takeover rounds per `acquire` before giving up.
    pub max_attempts: u32,
    /// Client identity override. When unset every client gets a fresh
    /// random identity, so a restarted process never collides with its
    /// former self.
    pub identity: Option<String>,
    /// Largest accepted payload, in bytes.
    pub max_payload_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_lease: DEFAULT_LEASE,
            renew_factor: DEFAULT_RENEW_FACTOR,
            retry_initial: DEFAULT_RETRY_INITIAL,
            retry_max: DEFAULT_RETRY_MAX,
            acquire_timeout: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            identity: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ClientConfig {
    /// Check internal consistency.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.renew_factor < 3 {
            return Err(format!(
                "renew_factor must be at least 3, got {}",
                self.renew_factor
            ));
        }
        if self.default_lease.is_zero() {
            return Err("default_lease must be nonzero".to_owned());
        }
        if self.retry_initial.is_zero() {
            return Err("retry_initial must be nonzero".to_owned());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_owned());
        }
        if let Some(identity) = &self.identity
            && identity.is_empty()
        {
            return Err("identity must be nonempty; an empty owner marks an unowned item".to_owned());
        }
        Ok(())
    }
}

/// Per-call options for [`LockClient::acquire`](crate::LockClient::acquire).
///
/// Unset fields fall back to the client's [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub lease: Option<Duration>,
    pub payload: Option<Bytes>,
    pub max_attempts: Option<u32>,
    pub acquire_timeout: Option<Duration>,
    pub retry_initial: Option<Duration>,
    pub retry_max: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease length for this acquisition.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Bytes written into the item on successful acquisition.
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Takeover rounds before giving up.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Wall-clock budget for the whole call.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Initial backoff between takeover rounds.
    #[must_use]
    pub fn with_retry_initial(mut self, retry_initial: Duration) -> Self {
        self.retry_initial = Some(retry_initial);
        self
    }

    /// Backoff ceiling.
    #[must_use]
    pub fn with_retry_max(mut self, retry_max: Duration) -> Self {
        self.retry_max = Some(retry_max);
        self
    }

    /// Cancellation signal observed during waits and backoff sleeps.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.default_lease, Duration::from_secs(10));
        assert_eq!(cfg.renew_factor, 3);
        assert_eq!(cfg.max_attempts, 3);
        assert!(cfg.acquire_timeout.is_none());
        assert!(cfg.identity.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn renew_factor_below_three_is_invalid() {
        // 2 is the boundary: a single failed renewal would already eat the
        // whole safety margin.
        let cfg = ClientConfig {
            renew_factor: 2,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            renew_factor: 1,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            renew_factor: 3,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_identity_is_invalid() {
        let cfg = ClientConfig {
            identity: Some(String::new()),
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn options_fall_back_when_unset() {
        let opts = AcquireOptions::new()
            .with_lease(Duration::from_millis(500))
            .with_max_attempts(5);
        assert_eq!(opts.lease, Some(Duration::from_millis(500)));
        assert_eq!(opts.max_attempts, Some(5));
        assert!(opts.acquire_timeout.is_none());
        assert!(opts.cancel.is_none());
    }
}
