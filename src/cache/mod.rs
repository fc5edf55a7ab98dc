//! Read-through metadata cache.
//!
//! Best effort only: a commit followed by an explicit `remove` is the only
//! invalidation, so readers may briefly see a version that was just
//! superseded. Cache failures degrade to store reads and are never surfaced.

use crate::errors::{MetaError, MetaResult};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Namespace of a cached entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheTable {
    Object,
    Bucket,
}

impl CacheTable {
    fn prefix(self) -> &'static str {
        match self {
            CacheTable::Object => "object",
            CacheTable::Bucket => "bucket",
        }
    }

    fn key(self, key: &str) -> String {
        format!("{}:{}", self.prefix(), key)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    None,
    #[default]
    Memory,
    Redis,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(CacheMode::None),
            "memory" => Ok(CacheMode::Memory),
            "redis" => Ok(CacheMode::Redis),
            other => Err(format!("unknown cache mode `{other}`")),
        }
    }
}

#[derive(Clone)]
pub enum MetaCache {
    Disabled,
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl MetaCache {
    pub async fn new(mode: CacheMode, redis_url: Option<&str>, ttl: Duration) -> MetaResult<Self> {
        match (mode, redis_url) {
            (CacheMode::None, _) => Ok(MetaCache::Disabled),
            (CacheMode::Memory, _) => Ok(MetaCache::Memory(MemoryCache::new(ttl))),
            (CacheMode::Redis, Some(url)) => Ok(MetaCache::Redis(RedisCache::new(url, ttl).await?)),
            (CacheMode::Redis, None) => Err(MetaError::Cache(
                "redis cache mode requires a redis url".into(),
            )),
        }
    }

    /// Cached value of `key`, or `loader`'s result on a miss. With `will_need`
    /// the loaded value is stored for later readers.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        table: CacheTable,
        key: &str,
        will_need: bool,
        loader: F,
    ) -> MetaResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = MetaResult<T>>,
    {
        let full_key = table.key(key);
        if let Some(raw) = self.get_raw(&full_key).await {
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!("dropping undecodable cache entry {}: {}", full_key, err);
                    self.remove_raw(&full_key).await;
                }
            }
        }

        let value = loader().await?;
        if will_need {
            match serde_json::to_string(&value) {
                Ok(raw) => self.set_raw(&full_key, &raw).await,
                Err(err) => warn!("failed to encode cache entry {}: {}", full_key, err),
            }
        }
        Ok(value)
    }

    pub async fn remove(&self, table: CacheTable, key: &str) {
        self.remove_raw(&table.key(key)).await;
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        match self {
            MetaCache::Disabled => None,
            MetaCache::Memory(cache) => cache.get(key),
            MetaCache::Redis(cache) => cache.get(key).await,
        }
    }

    async fn set_raw(&self, key: &str, value: &str) {
        match self {
            MetaCache::Disabled => {}
            MetaCache::Memory(cache) => cache.set(key, value),
            MetaCache::Redis(cache) => {
                if let Err(err) = cache.set(key, value).await {
                    warn!("cache set {} failed: {}", key, err);
                }
            }
        }
    }

    async fn remove_raw(&self, key: &str) {
        match self {
            MetaCache::Disabled => {}
            MetaCache::Memory(cache) => cache.remove(key),
            MetaCache::Redis(cache) => {
                if let Err(err) = cache.remove(key).await {
                    warn!("cache remove {} failed: {}", key, err);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryCache {
    values: Arc<DashMap<String, MemoryEntry>>,
    ttl: Duration,
}

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            values: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.values.get(key) {
            if Instant::now() <= entry.expires_at {
                return Some(entry.value.clone());
            }
        }
        self.values.remove(key);
        None
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.values.remove(key);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone)]
pub struct RedisCache {
    connection: Arc<Mutex<redis::aio::ConnectionManager>>,
    ttl: Duration,
}

impl RedisCache {
    pub async fn new(url: &str, ttl: Duration) -> MetaResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| MetaError::Cache(format!("redis error: {err}")))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| MetaError::Cache(format!("redis connect failed: {err}")))?;
        Ok(Self {
            connection: Arc::new(Mutex::new(manager)),
            ttl,
        })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection.lock().await;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                debug!("redis get {} failed: {}", key, err);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let mut conn = self.connection.lock().await;
        conn.set_ex::<_, _, ()>(key, value, self.ttl.as_secs().max(1))
            .await
            .map_err(|err| format!("redis set failed: {err}"))
    }

    pub async fn remove(&self, key: &str) -> Result<(), String> {
        let mut conn = self.connection.lock().await;
        conn.del::<_, ()>(key)
            .await
            .map_err(|err| format!("redis del failed: {err}"))
    }
}
