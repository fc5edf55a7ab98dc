//! Represents a logical bucket: a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Versioning {
    #[default]
    Disabled,
    Enabled,
    Suspended,
}

impl Versioning {
    pub fn as_str(self) -> &'static str {
        match self {
            Versioning::Disabled => "Disabled",
            Versioning::Enabled => "Enabled",
            Versioning::Suspended => "Suspended",
        }
    }
}

impl fmt::Display for Versioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Versioning {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Disabled" | "" => Ok(Versioning::Disabled),
            "Enabled" => Ok(Versioning::Enabled),
            "Suspended" => Ok(Versioning::Suspended),
            other => Err(format!("unknown versioning state `{other}`")),
        }
    }
}

/// A storage bucket and its byte usage counter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Bucket {
    /// Globally unique bucket name.
    pub name: String,

    /// ID of the user or account that owns this bucket.
    pub owner_id: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    pub versioning: Versioning,

    /// Bytes referenced by live metadata. Only ever changed by signed deltas
    /// applied inside a metadata transaction.
    pub usage: i64,
}

impl Bucket {
    pub fn new(name: &str, owner_id: &str) -> Self {
        Self {
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
            versioning: Versioning::Disabled,
            usage: 0,
        }
    }
}
