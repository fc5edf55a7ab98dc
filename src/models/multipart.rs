//! Represents multipart upload sessions and parts.

use crate::errors::MetaResult;
use crate::models::object::{Acl, StorageClass};
use crate::models::version::VersionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single uploaded part, either pending inside an upload session or owned
/// by a completed multipart object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// Part number (1-based).
    pub part_number: u32,

    /// Size in bytes.
    pub size: i64,

    /// Blob holding this part's bytes.
    pub blob_id: String,

    /// Byte offset inside the assembled object. Assigned on completion.
    pub offset: i64,

    /// Hex MD5 of the part's bytes.
    pub etag: String,

    pub last_modified: DateTime<Utc>,
    pub initialization_vector: Vec<u8>,
}

/// Sorted part offsets of a multipart object, for O(log n) range lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartsIndex {
    offsets: Vec<i64>,
    part_numbers: Vec<u32>,
}

impl PartsIndex {
    pub fn from_parts(parts: &BTreeMap<u32, Part>) -> Self {
        let mut pairs: Vec<(i64, u32)> = parts
            .values()
            .map(|part| (part.offset, part.part_number))
            .collect();
        pairs.sort_unstable();
        let (offsets, part_numbers) = pairs.into_iter().unzip();
        Self {
            offsets,
            part_numbers,
        }
    }

    /// Part number containing byte `offset`, if any part starts at or before it.
    pub fn search(&self, offset: i64) -> Option<u32> {
        let idx = self.offsets.partition_point(|start| *start <= offset);
        idx.checked_sub(1).map(|i| self.part_numbers[i])
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Shared metadata chosen when the upload was initiated.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MultipartMetadata {
    pub initiator_id: String,
    pub owner_id: String,
    pub content_type: String,
    pub location: String,
    pub pool: String,
    pub acl: Acl,
    pub sse_type: String,
    pub cipher_key: Vec<u8>,
    pub attrs: BTreeMap<String, String>,
    pub storage_class: StorageClass,
}

/// A multipart upload session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Multipart {
    pub bucket_name: String,
    pub object_name: String,

    /// Initiation time. The upload id is derived from it.
    pub initiated: DateTime<Utc>,

    pub metadata: MultipartMetadata,

    /// Uploaded parts keyed by part number.
    pub parts: BTreeMap<u32, Part>,
}

impl Multipart {
    pub fn new(bucket_name: &str, object_name: &str, metadata: MultipartMetadata) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            object_name: object_name.to_string(),
            initiated: Utc::now(),
            metadata,
            parts: BTreeMap::new(),
        }
    }

    /// Storage key of the session.
    pub fn upload_key(&self) -> MetaResult<VersionKey> {
        VersionKey::encode(self.initiated)
    }

    /// Client-facing upload id.
    pub fn upload_id(&self) -> MetaResult<String> {
        Ok(self.upload_key()?.external_id())
    }

    pub fn total_size(&self) -> i64 {
        self.parts.values().map(|part| part.size).sum()
    }
}

/// One `<Part>` element of a CompleteMultipartUpload request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}
