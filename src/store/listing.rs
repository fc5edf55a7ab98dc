//! Bucket listing on top of [`MetaStore::scan_objects`].
//!
//! Both listings walk object rows in `(name, version)` order. The plain
//! listing keeps only the first row of every key (its latest version) and
//! hides keys whose latest version is a delete marker; the versioned listing
//! reports every row. Rows that disappear between the scan and the fetch are
//! skipped.

use super::{MetaStore, ScanPosition};
use crate::errors::MetaResult;
use crate::models::{object::Object, version::VersionKey};
use std::collections::BTreeSet;
use tracing::debug;

pub const MAX_LIST_KEYS: usize = 1000;
const SCAN_BATCH: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct ListObjectsParams {
    pub prefix: String,
    pub delimiter: String,
    /// Keys at or before this one are skipped.
    pub marker: String,
    /// Versioned listing only: resume inside `marker` after this version.
    pub version_marker: Option<VersionKey>,
    pub max_keys: usize,
}

#[derive(Debug, Default)]
pub struct ListObjectsResult {
    pub objects: Vec<Object>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
    pub next_version_marker: Option<VersionKey>,
    pub key_count: usize,
}

/// Latest visible version of every key.
pub async fn list_objects(
    store: &dyn MetaStore,
    bucket: &str,
    params: &ListObjectsParams,
) -> MetaResult<ListObjectsResult> {
    list(store, bucket, params, false).await
}

/// Every version of every key, delete markers included.
pub async fn list_object_versions(
    store: &dyn MetaStore,
    bucket: &str,
    params: &ListObjectsParams,
) -> MetaResult<ListObjectsResult> {
    list(store, bucket, params, true).await
}

async fn list(
    store: &dyn MetaStore,
    bucket: &str,
    params: &ListObjectsParams,
    versioned: bool,
) -> MetaResult<ListObjectsResult> {
    let max_keys = params.max_keys.clamp(1, MAX_LIST_KEYS);
    let mut result = ListObjectsResult::default();
    let mut seen_prefixes = BTreeSet::new();
    let mut previous_name: Option<String> = None;

    let mut after = if params.marker.is_empty() {
        None
    } else {
        match (versioned, params.version_marker) {
            (true, Some(version)) => Some(ScanPosition::after_version(&params.marker, version)),
            _ => Some(ScanPosition::after_key(&params.marker)),
        }
    };

    'scan: loop {
        let batch = store
            .scan_objects(bucket, &params.prefix, after.as_ref(), SCAN_BATCH)
            .await?;
        let exhausted = batch.len() < SCAN_BATCH;

        for entry in batch {
            after = Some(ScanPosition::after_version(&entry.name, entry.version));

            if !versioned {
                if previous_name.as_deref() == Some(entry.name.as_str()) {
                    continue;
                }
                previous_name = Some(entry.name.clone());
                if entry.delete_marker {
                    continue;
                }
            }

            if !params.delimiter.is_empty() {
                if let Some(common) =
                    compute_common_prefix(&entry.name, &params.prefix, &params.delimiter)
                {
                    if common == params.marker || seen_prefixes.contains(&common) {
                        continue;
                    }
                    if result.key_count == max_keys {
                        result.is_truncated = true;
                        break 'scan;
                    }
                    seen_prefixes.insert(common.clone());
                    result.common_prefixes.push(common.clone());
                    result.key_count += 1;
                    result.next_marker = Some(common);
                    result.next_version_marker = None;
                    continue;
                }
            }

            if result.key_count == max_keys {
                result.is_truncated = true;
                break 'scan;
            }
            let object = match store
                .get_object(bucket, &entry.name, Some(entry.version))
                .await
            {
                Ok(object) => object,
                Err(err) if err.is_not_found() => {
                    debug!(
                        "{}/{} version {} vanished while listing",
                        bucket, entry.name, entry.version
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            result.next_marker = Some(entry.name.clone());
            result.next_version_marker = versioned.then_some(entry.version);
            result.objects.push(object);
            result.key_count += 1;
        }

        if exhausted {
            break;
        }
    }

    if !result.is_truncated {
        result.next_marker = None;
        result.next_version_marker = None;
    }
    Ok(result)
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Returns `Some(prefix)` when the part of `key` after `requested_prefix`
/// contains `delimiter`.
pub fn compute_common_prefix(key: &str, requested_prefix: &str, delimiter: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(requested_prefix)?;
    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::with_capacity(requested_prefix.len() + pos + delimiter.len());
    combined.push_str(requested_prefix);
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}
