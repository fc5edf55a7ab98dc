//! In-process locker for single-node deployments and tests.

use super::{Lease, LockError, Locker};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Holder {
    token: String,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct MemoryLocker {
    holders: Arc<DashMap<String, Holder>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.holders
            .get(key)
            .map(|holder| holder.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Lease, LockError> {
        let now = Instant::now();
        let token = Uuid::new_v4().to_string();
        let holder = Holder {
            token: token.clone(),
            expires_at: now + ttl,
        };
        match self.holders.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Err(LockError::NotObtained(key.to_string()));
                }
                occupied.insert(holder);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
            }
        }
        Ok(Lease::new(key, token))
    }

    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        match self.holders.get_mut(lease.key()) {
            Some(mut holder) if holder.token == lease.token() && holder.expires_at > now => {
                holder.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LockError::NotObtained(lease.key().to_string())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        self.holders
            .remove_if(lease.key(), |_, holder| holder.token == lease.token());
        Ok(())
    }
}
