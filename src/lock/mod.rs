//! Distributed mutual exclusion with time-bounded leases.
//!
//! A lease that is not refreshed before its TTL elapses is lost; a holder that
//! fails to refresh must stop writing on behalf of the key.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryLocker;
pub use self::redis::RedisLocker;

#[derive(Debug, Error)]
pub enum LockError {
    /// Somebody else holds the key (or our lease expired).
    #[error("lock `{0}` not obtained")]
    NotObtained(String),
    /// The lock service itself failed.
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

/// Proof of ownership of a key until the lease expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: String,
}

impl Lease {
    pub(crate) fn new(key: &str, token: String) -> Self {
        Self {
            key: key.to_string(),
            token,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Take `key` for `ttl`. `LockError::NotObtained` when it is already held.
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Lease, LockError>;

    /// Extend a lease. `LockError::NotObtained` when it is no longer ours.
    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LockError>;

    /// Give the key up. Releasing a lease that already expired is not an error.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}
