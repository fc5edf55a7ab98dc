//! Restore staging records for archived (Glacier-class) objects.

use crate::models::version::VersionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest restore lifetime a client may request, in days.
pub const MAX_RESTORE_DAYS: i32 = 30;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FreezerStatus {
    #[default]
    Init,
    Restoring,
    Finished,
}

impl FreezerStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            FreezerStatus::Init => 0,
            FreezerStatus::Restoring => 1,
            FreezerStatus::Finished => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => FreezerStatus::Restoring,
            2 => FreezerStatus::Finished,
            _ => FreezerStatus::Init,
        }
    }
}

/// A temporary restored copy of an archived object version.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Freezer {
    pub bucket_name: String,
    pub name: String,
    pub version: VersionKey,
    pub status: FreezerStatus,

    /// Days the restored copy stays readable.
    pub life_time: i32,

    pub location: String,
    pub pool: String,
    pub owner_id: String,
    pub size: i64,

    /// Restored copy's blob. Empty until the restore finished.
    pub blob_id: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl Freezer {
    pub fn new(bucket_name: &str, name: &str, version: VersionKey, life_time: i32) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            name: name.to_string(),
            version,
            status: FreezerStatus::Init,
            life_time,
            location: String::new(),
            pool: String::new(),
            owner_id: String::new(),
            size: 0,
            blob_id: String::new(),
            etag: String::new(),
            last_modified: Utc::now(),
        }
    }
}
