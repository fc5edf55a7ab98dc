//! Redis-backed locker: `SET key token NX PX ttl`, with refresh and release
//! done by token-checking Lua scripts so a holder can never touch a lease
//! somebody else took over.

use super::{Lease, LockError, Locker};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use uuid::Uuid;

const KEY_PREFIX: &str = "object-meta:lock:";

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLocker {
    connection: ConnectionManager,
    refresh: Script,
    release: Script,
}

impl RedisLocker {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(unavailable)?;
        Ok(Self {
            connection,
            refresh: Script::new(REFRESH_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

fn unavailable(err: redis::RedisError) -> LockError {
    LockError::Unavailable(err.to_string())
}

fn redis_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Locker for RedisLocker {
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Lease, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(redis_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        match reply {
            Some(_) => Ok(Lease::new(key, token)),
            None => Err(LockError::NotObtained(key.to_string())),
        }
    }

    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self.connection.clone();
        let extended: i64 = self
            .refresh
            .key(redis_key(lease.key()))
            .arg(lease.token())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if extended == 1 {
            Ok(())
        } else {
            Err(LockError::NotObtained(lease.key().to_string()))
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .release
            .key(redis_key(lease.key()))
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
