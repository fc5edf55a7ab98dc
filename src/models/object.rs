//! Represents an object version stored in a bucket, plus the small side
//! records that track it (null-version map, hot-tier bookkeeping).

use crate::errors::MetaResult;
use crate::models::multipart::{Part, PartsIndex};
use crate::models::version::VersionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

/// Pool of the low-latency (small file) tier.
pub const FAST_POOL: &str = "rabbit";
/// Pool of the capacity (big file) tier.
pub const CAPACITY_POOL: &str = "tiger";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Acl {
    pub canned_acl: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjectType {
    #[default]
    Normal,
    Appendable,
    Multipart,
}

impl ObjectType {
    pub fn as_i64(self) -> i64 {
        match self {
            ObjectType::Normal => 0,
            ObjectType::Appendable => 1,
            ObjectType::Multipart => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ObjectType::Appendable,
            2 => ObjectType::Multipart,
            _ => ObjectType::Normal,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageClass {
    #[default]
    Standard,
    StandardIa,
    Glacier,
}

impl StorageClass {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::Glacier => "GLACIER",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDARD" => Ok(StorageClass::Standard),
            "STANDARD_IA" => Ok(StorageClass::StandardIa),
            "GLACIER" => Ok(StorageClass::Glacier),
            other => Err(format!("unknown storage class `{other}`")),
        }
    }
}

/// Metadata of one object version. The bytes live in a blob cluster addressed
/// by `(location, pool, blob_id)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Object {
    pub bucket_name: String,
    pub name: String,

    /// Row identity within `(bucket_name, name)`; derived from the creation time.
    pub version: VersionKey,

    /// Which blob cluster holds the bytes.
    pub location: String,

    /// Which pool of that cluster.
    pub pool: String,

    pub owner_id: String,
    pub size: i64,

    /// Blob name inside the cluster pool. Empty for delete markers and for
    /// multipart objects, whose bytes live in their parts.
    pub blob_id: String,

    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub content_type: String,
    pub custom_attributes: BTreeMap<String, String>,
    pub acl: Acl,

    /// This row is the bucket's unversioned ("null") identity for the key.
    pub null_version: bool,
    pub delete_marker: bool,

    pub sse_type: String,
    pub encryption_key: Vec<u8>,
    pub initialization_vector: Vec<u8>,

    pub object_type: ObjectType,
    pub storage_class: StorageClass,

    /// Multipart objects only, keyed by part number.
    pub parts: BTreeMap<u32, Part>,

    #[serde(skip)]
    pub parts_index: Option<PartsIndex>,
}

impl Object {
    /// A fresh normal object created now.
    pub fn new(bucket_name: &str, name: &str) -> MetaResult<Self> {
        Self::created_at(bucket_name, name, Utc::now())
    }

    pub fn created_at(bucket_name: &str, name: &str, created: DateTime<Utc>) -> MetaResult<Self> {
        Ok(Self {
            bucket_name: bucket_name.to_string(),
            name: name.to_string(),
            version: VersionKey::encode(created)?,
            location: String::new(),
            pool: String::new(),
            owner_id: String::new(),
            size: 0,
            blob_id: String::new(),
            last_modified: created,
            etag: String::new(),
            content_type: String::new(),
            custom_attributes: BTreeMap::new(),
            acl: Acl::default(),
            null_version: false,
            delete_marker: false,
            sse_type: String::new(),
            encryption_key: Vec::new(),
            initialization_vector: Vec::new(),
            object_type: ObjectType::Normal,
            storage_class: StorageClass::Standard,
            parts: BTreeMap::new(),
            parts_index: None,
        })
    }

    /// Client-facing version id.
    pub fn version_id(&self) -> String {
        if self.null_version {
            VersionKey::NULL.external_id()
        } else {
            self.version.external_id()
        }
    }

    /// Pack per-part offsets for range lookups.
    pub fn build_parts_index(&mut self) {
        self.parts_index = if self.parts.is_empty() {
            None
        } else {
            Some(PartsIndex::from_parts(&self.parts))
        };
    }

    /// `bucket:name:` key of the latest-version cache entry.
    pub fn latest_cache_key(&self) -> String {
        format!("{}:{}:", self.bucket_name, self.name)
    }

    /// `bucket:name:version` key of this exact version's cache entry.
    pub fn version_cache_key(&self) -> String {
        format!("{}:{}:{}", self.bucket_name, self.name, self.version_id())
    }

    /// Every cache key this version may be stored under.
    pub fn cache_keys(&self) -> Vec<String> {
        let mut keys = vec![self.latest_cache_key(), self.version_cache_key()];
        if self.null_version {
            keys.push(format!(
                "{}:{}:{}",
                self.bucket_name,
                self.name,
                self.version.external_id()
            ));
        }
        keys
    }

    pub fn is_hot(&self) -> bool {
        self.pool == FAST_POOL && !self.delete_marker
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} version={} location={} pool={} blob={} type={:?} class={}",
            self.bucket_name,
            self.name,
            self.version,
            self.location,
            self.pool,
            self.blob_id,
            self.object_type,
            self.storage_class
        )
    }
}

/// Null-version counter of a key: the creation nanos of the row that
/// currently plays the "null" identity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjMap {
    pub bucket_name: String,
    pub name: String,
    pub null_ver_num: u64,
}

impl ObjMap {
    pub fn for_object(object: &Object) -> Self {
        Self {
            bucket_name: object.bucket_name.clone(),
            name: object.name.clone(),
            null_ver_num: object
                .last_modified
                .timestamp_nanos_opt()
                .map(|n| n as u64)
                .unwrap_or_default(),
        }
    }

    /// Row key of the version this map points at.
    pub fn version_key(&self) -> Option<VersionKey> {
        let nanos = i64::try_from(self.null_ver_num).ok()?;
        VersionKey::encode(DateTime::from_timestamp_nanos(nanos)).ok()
    }
}

/// A migration candidate still resident on the fast tier.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HotObject {
    pub bucket_name: String,
    pub name: String,
    pub version: VersionKey,
    pub location: String,
    pub pool: String,
    pub blob_id: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

impl HotObject {
    pub fn from_object(object: &Object) -> Self {
        Self {
            bucket_name: object.bucket_name.clone(),
            name: object.name.clone(),
            version: object.version,
            location: object.location.clone(),
            pool: object.pool.clone(),
            blob_id: object.blob_id.clone(),
            size: object.size,
            last_modified: object.last_modified,
        }
    }

    /// Key of the per-object distributed lock.
    pub fn mutex_key(&self) -> String {
        format!("{}:{}:{}", self.bucket_name, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_version_objects_report_null_id() {
        let mut object = Object::new("photos", "cat.jpg").unwrap();
        assert_ne!(object.version_id(), "null");
        object.null_version = true;
        assert_eq!(object.version_id(), "null");
        assert_eq!(object.version_cache_key(), "photos:cat.jpg:null");
        assert_eq!(object.latest_cache_key(), "photos:cat.jpg:");
        let exact = format!("photos:cat.jpg:{}", object.version.external_id());
        assert!(object.cache_keys().contains(&exact));
    }

    #[test]
    fn objmap_points_back_at_its_row() {
        let object = Object::new("photos", "cat.jpg").unwrap();
        let map = ObjMap::for_object(&object);
        assert_eq!(map.version_key(), Some(object.version));
    }

    #[test]
    fn only_fast_pool_payloads_are_hot() {
        let mut object = Object::new("photos", "cat.jpg").unwrap();
        object.pool = FAST_POOL.into();
        assert!(object.is_hot());
        object.delete_marker = true;
        assert!(!object.is_hot());
        object.delete_marker = false;
        object.pool = CAPACITY_POOL.into();
        assert!(!object.is_hot());
    }

    #[test]
    fn storage_class_parses_its_own_spelling() {
        for class in [
            StorageClass::Standard,
            StorageClass::StandardIa,
            StorageClass::Glacier,
        ] {
            assert_eq!(class.as_str().parse::<StorageClass>().unwrap(), class);
        }
        assert!("COLD".parse::<StorageClass>().is_err());
    }
}
