//! Garbage collection ledger entries: blobs that lost their last metadata
//! reference and must be removed from their cluster.

use crate::errors::{MetaError, MetaResult};
use crate::models::freezer::Freezer;
use crate::models::multipart::{Multipart, Part};
use crate::models::object::Object;
use crate::models::version::VersionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

const CURSOR_SEPARATOR: char = '\n';

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GcStatus {
    #[default]
    Pending,
}

impl GcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GcStatus::Pending => "Pending",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GarbageCollection {
    pub bucket_name: String,
    pub object_name: String,
    pub version: VersionKey,
    pub location: String,
    pub pool: String,

    /// Whole-object blob. Empty when only parts need removal.
    pub blob_id: String,

    pub status: GcStatus,
    pub mtime: DateTime<Utc>,
    pub tried_times: u32,
    pub parts: BTreeMap<u32, Part>,
}

impl GarbageCollection {
    pub fn from_object(object: &Object) -> Self {
        Self {
            bucket_name: object.bucket_name.clone(),
            object_name: object.name.clone(),
            version: object.version,
            location: object.location.clone(),
            pool: object.pool.clone(),
            blob_id: object.blob_id.clone(),
            status: GcStatus::Pending,
            mtime: Utc::now(),
            tried_times: 0,
            parts: object.parts.clone(),
        }
    }

    /// A blob the object row no longer points at while the row itself lives
    /// on. Keyed by a fresh version so it never collides with the entry the
    /// row gets once it is deleted.
    pub fn from_replaced_object(object: &Object) -> MetaResult<Self> {
        Ok(Self {
            version: VersionKey::fresh()?,
            ..Self::from_object(object)
        })
    }

    /// A restored copy's blob. Keyed by a fresh version so it never collides
    /// with the entry of the archived version itself.
    pub fn from_freezer(freezer: &Freezer) -> MetaResult<Self> {
        Ok(Self {
            bucket_name: freezer.bucket_name.clone(),
            object_name: freezer.name.clone(),
            version: VersionKey::fresh()?,
            location: freezer.location.clone(),
            pool: freezer.pool.clone(),
            blob_id: freezer.blob_id.clone(),
            status: GcStatus::Pending,
            mtime: Utc::now(),
            tried_times: 0,
            parts: BTreeMap::new(),
        })
    }

    /// Every part blob of an aborted upload, under the upload's own key.
    pub fn from_multipart(multipart: &Multipart) -> MetaResult<Self> {
        Ok(Self {
            bucket_name: multipart.bucket_name.clone(),
            object_name: multipart.object_name.clone(),
            version: multipart.upload_key()?,
            location: multipart.metadata.location.clone(),
            pool: multipart.metadata.pool.clone(),
            blob_id: String::new(),
            status: GcStatus::Pending,
            mtime: Utc::now(),
            tried_times: 0,
            parts: multipart.parts.clone(),
        })
    }

    /// A single part blob replaced by a re-upload or left out of the final
    /// part list. Keyed by a fresh version, one per part.
    pub fn from_replaced_part(multipart: &Multipart, part: &Part) -> MetaResult<Self> {
        Ok(Self {
            bucket_name: multipart.bucket_name.clone(),
            object_name: multipart.object_name.clone(),
            version: VersionKey::fresh()?,
            location: multipart.metadata.location.clone(),
            pool: multipart.metadata.pool.clone(),
            blob_id: part.blob_id.clone(),
            status: GcStatus::Pending,
            mtime: Utc::now(),
            tried_times: 0,
            parts: BTreeMap::new(),
        })
    }

    pub fn cursor(&self) -> GcCursor {
        GcCursor {
            bucket_name: self.bucket_name.clone(),
            object_name: self.object_name.clone(),
            version: self.version,
        }
    }

    /// Every blob id this entry is responsible for.
    pub fn blob_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(self.parts.len() + 1);
        if !self.blob_id.is_empty() {
            ids.push(&self.blob_id);
        }
        ids.extend(self.parts.values().map(|part| part.blob_id.as_str()));
        ids
    }
}

/// Position in the `(bucket, object, version)` ordered ledger. Scans return
/// entries strictly after the cursor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GcCursor {
    pub bucket_name: String,
    pub object_name: String,
    pub version: VersionKey,
}

impl fmt::Display for GcCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.bucket_name,
            self.object_name,
            self.version,
            sep = CURSOR_SEPARATOR
        )
    }
}

impl FromStr for GcCursor {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(3, CURSOR_SEPARATOR);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(bucket), Some(object), Some(version)) => Ok(Self {
                bucket_name: bucket.to_string(),
                object_name: object.to_string(),
                version: version.parse()?,
            }),
            _ => Err(MetaError::Conflict(format!("malformed gc cursor `{s}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_text_form_parses_back() {
        let object = Object::new("logs", "2024/01/app.log").unwrap();
        let cursor = GarbageCollection::from_object(&object).cursor();
        let parsed: GcCursor = cursor.to_string().parse().unwrap();
        assert_eq!(parsed, cursor);
        assert!("only-bucket".parse::<GcCursor>().is_err());
    }

    #[test]
    fn blob_ids_cover_object_and_parts() {
        let mut object = Object::new("b", "k").unwrap();
        object.blob_id = "whole".into();
        object.parts.insert(
            1,
            Part {
                part_number: 1,
                size: 1,
                blob_id: "p1".into(),
                offset: 0,
                etag: String::new(),
                last_modified: Utc::now(),
                initialization_vector: Vec::new(),
            },
        );
        let entry = GarbageCollection::from_object(&object);
        assert_eq!(entry.blob_ids(), vec!["whole", "p1"]);
        assert_eq!(entry.tried_times, 0);
        assert_eq!(entry.status, GcStatus::Pending);
    }
}
