//! Sortable, reversible object version keys.
//!
//! A [`VersionKey`] is `u64::MAX - creation_nanos`, so a newer version always
//! compares *smaller* and appears first in an ascending `(bucket, name, version)`
//! range scan. Keys are persisted as zero-padded decimal strings so that the
//! textual order of the column matches the numeric order.
//!
//! Clients never see the raw key: [`VersionKey::external_id`] encrypts it with a
//! fixed AES-128 key into an opaque hex string that [`VersionKey::decode`] inverts.

use crate::errors::{MetaError, MetaResult};
use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, str::FromStr};

/// External spelling of the null version.
pub const NULL_VERSION_ID: &str = "null";

const VERSION_CIPHER_KEY: [u8; 16] = *b"obj-meta-version";
const VERSION_ID_TAG: [u8; 8] = *b"version\0";
const STORED_WIDTH: usize = 20;

/// Smallest key handed out by [`VersionKey::fresh`] so far.
static LAST_FRESH: AtomicU64 = AtomicU64::new(u64::MAX);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionKey(u64);

impl VersionKey {
    /// Distinguished identity of the unversioned object. `encode` never yields
    /// it because it only accepts strictly positive timestamps.
    pub const NULL: VersionKey = VersionKey(u64::MAX);

    /// Encode a creation time. Fails for instants at or before the Unix epoch
    /// or outside the nanosecond-representable range.
    pub fn encode(created: DateTime<Utc>) -> MetaResult<Self> {
        let nanos = created
            .timestamp_nanos_opt()
            .filter(|n| *n > 0)
            .ok_or(MetaError::InvalidVersion)?;
        Ok(Self(u64::MAX - nanos as u64))
    }

    /// Key for the current instant, strictly newer than every key this
    /// process issued through `fresh` before. Two calls within one clock tick
    /// get distinct keys.
    pub fn fresh() -> MetaResult<Self> {
        let now = Self::encode(Utc::now())?.0;
        let mut last = LAST_FRESH.load(Ordering::Relaxed);
        loop {
            let next = now.min(last.saturating_sub(1));
            match LAST_FRESH.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(Self(next)),
                Err(current) => last = current,
            }
        }
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Creation time this key was derived from. `None` for the null sentinel.
    pub fn created_at(self) -> Option<DateTime<Utc>> {
        if self.is_null() {
            return None;
        }
        let nanos = i64::try_from(u64::MAX - self.0).ok()?;
        Some(DateTime::from_timestamp_nanos(nanos))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Opaque, client-facing identifier.
    pub fn external_id(self) -> String {
        if self.is_null() {
            return NULL_VERSION_ID.to_string();
        }
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&self.0.to_be_bytes());
        block[8..].copy_from_slice(&VERSION_ID_TAG);
        let mut block = GenericArray::from(block);
        cipher().encrypt_block(&mut block);
        hex::encode(block)
    }

    /// Inverse of [`VersionKey::external_id`].
    pub fn decode(external: &str) -> MetaResult<Self> {
        if external == NULL_VERSION_ID {
            return Ok(Self::NULL);
        }
        let raw = hex::decode(external).map_err(|_| MetaError::InvalidVersion)?;
        let raw: [u8; 16] = raw.try_into().map_err(|_| MetaError::InvalidVersion)?;
        let mut block = GenericArray::from(raw);
        cipher().decrypt_block(&mut block);
        if block[8..] != VERSION_ID_TAG {
            return Err(MetaError::InvalidVersion);
        }
        let mut key = [0u8; 8];
        key.copy_from_slice(&block[..8]);
        let key = Self(u64::from_be_bytes(key));
        if key.is_null() {
            return Err(MetaError::InvalidVersion);
        }
        Ok(key)
    }
}

fn cipher() -> Aes128 {
    Aes128::new(&GenericArray::from(VERSION_CIPHER_KEY))
}

/// Stored form: zero-padded decimal.
impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = STORED_WIDTH)
    }
}

impl fmt::Debug for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionKey({})", self)
    }
}

impl FromStr for VersionKey {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| MetaError::InvalidVersion)
    }
}

/// Which version of a key a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Null,
    Exact(VersionKey),
}

impl VersionSelector {
    /// Parse a client-supplied version id: empty means latest.
    pub fn parse(version_id: &str) -> MetaResult<Self> {
        match version_id {
            "" => Ok(Self::Latest),
            NULL_VERSION_ID => Ok(Self::Null),
            other => VersionKey::decode(other).map(Self::Exact),
        }
    }

    /// Suffix used in read-through cache keys (`bucket:name:version`).
    pub fn cache_suffix(&self) -> String {
        match self {
            Self::Latest => String::new(),
            Self::Null => NULL_VERSION_ID.to_string(),
            Self::Exact(key) => key.external_id(),
        }
    }
}
