//! src/services/object_service.rs
//!
//! ObjectService: reads and writes object metadata on top of a [`MetaStore`].
//! Every mutation runs in one store transaction so that the object row, its
//! parts, the bucket usage delta and any GC ledger entry become visible
//! together. The read-through cache is invalidated after each commit.

use crate::cache::{CacheTable, MetaCache};
use crate::errors::{MetaError, MetaResult};
use crate::models::{
    bucket::{Bucket, Versioning},
    freezer::{Freezer, MAX_RESTORE_DAYS},
    gc::GarbageCollection,
    multipart::Multipart,
    object::{ObjMap, Object},
    version::{VersionKey, VersionSelector},
};
use crate::store::{self, ListObjectsParams, ListObjectsResult, MetaStore, MetaTxn};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(Clone)]
pub struct ObjectService {
    store: Arc<dyn MetaStore>,
    cache: MetaCache,
    update_usage: bool,
}

impl ObjectService {
    pub fn new(store: Arc<dyn MetaStore>, cache: MetaCache) -> Self {
        Self {
            store,
            cache,
            update_usage: true,
        }
    }

    /// With `false` no operation touches bucket usage counters.
    pub fn with_usage_updates(mut self, enabled: bool) -> Self {
        self.update_usage = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    pub(crate) fn updates_usage(&self) -> bool {
        self.update_usage
    }

    pub async fn get_bucket(&self, name: &str, will_need: bool) -> MetaResult<Bucket> {
        self.cache
            .get_or_load(CacheTable::Bucket, name, will_need, || {
                self.store.get_bucket(name)
            })
            .await
    }

    pub async fn put_bucket(&self, bucket: &Bucket) -> MetaResult<()> {
        ensure_bucket_name_safe(&bucket.name)?;
        self.store.put_bucket(bucket).await?;
        self.cache.remove(CacheTable::Bucket, &bucket.name).await;
        Ok(())
    }

    /// Resolve `version_id` (empty for latest, `"null"`, or an external id) to
    /// an object version. Multipart objects come back with their part index
    /// built.
    pub async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        version_id: &str,
        will_need: bool,
    ) -> MetaResult<Object> {
        let selector = VersionSelector::parse(version_id)?;
        let key = format!("{}:{}:{}", bucket, name, selector.cache_suffix());
        let mut object: Object = self
            .cache
            .get_or_load(CacheTable::Object, &key, will_need, || {
                load_object(self.store.as_ref(), bucket, name, selector)
            })
            .await?;

        if object.bucket_name != bucket || object.name != name {
            debug!(
                "lookup of {}/{} returned {}/{}",
                bucket, name, object.bucket_name, object.name
            );
            return Err(MetaError::NoSuchKey);
        }
        object.build_parts_index();
        Ok(object)
    }

    /// Write an object row with its parts. A finalized `multipart` upload is
    /// removed and `objmap` recorded in the same transaction.
    pub async fn put_object(
        &self,
        object: &Object,
        multipart: Option<&Multipart>,
        objmap: Option<&ObjMap>,
        update_usage: bool,
    ) -> MetaResult<()> {
        ensure_key_safe(&object.name)?;
        let mut tx = self.store.begin().await?;
        tx.put_object(object).await?;
        if let Some(objmap) = objmap {
            tx.put_objmap(objmap).await?;
        }
        if let Some(multipart) = multipart {
            tx.delete_multipart(multipart).await?;
        }
        if update_usage && self.update_usage {
            tx.update_usage(&object.bucket_name, object.size).await?;
        }
        tx.commit().await?;

        self.invalidate(object).await;
        Ok(())
    }

    /// Write a new version the way the bucket's versioning state asks for.
    ///
    /// Enabled buckets keep every earlier version. Otherwise the object
    /// becomes the null version and replaces the previous null version, whose
    /// blob goes to the GC ledger in the same commit.
    pub async fn put_object_versioned(
        &self,
        object: &mut Object,
        versioning: Versioning,
    ) -> MetaResult<()> {
        ensure_key_safe(&object.name)?;
        object.null_version = versioning != Versioning::Enabled;

        let mut tx = self.store.begin().await?;
        let replaced = if object.null_version {
            self.replace_null_version(tx.as_mut(), &object.bucket_name, &object.name)
                .await?
        } else {
            None
        };

        tx.put_object(object).await?;
        if versioning == Versioning::Suspended {
            tx.put_objmap(&ObjMap::for_object(object)).await?;
        }
        if self.update_usage {
            tx.update_usage(&object.bucket_name, object.size).await?;
        }
        tx.commit().await?;

        if let Some(old) = &replaced {
            debug!("{} replaced null version {}", object, old.version);
            self.invalidate(old).await;
        }
        self.invalidate(object).await;
        Ok(())
    }

    /// Drop the current null version of `(bucket, name)`, if any, queuing its
    /// blob for collection. A restore record of that version goes with it.
    pub(crate) async fn replace_null_version(
        &self,
        tx: &mut dyn MetaTxn,
        bucket: &str,
        name: &str,
    ) -> MetaResult<Option<Object>> {
        let old = match tx.get_null_version_object(bucket, name).await {
            Ok(old) => old,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        tx.delete_object(&old).await?;
        match tx.get_freezer(bucket, name, old.version).await {
            Ok(freezer) => {
                tx.delete_freezer(&freezer).await?;
                if !freezer.blob_id.is_empty() {
                    tx.put_garbage_collection(&GarbageCollection::from_freezer(&freezer)?)
                        .await?;
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if !old.delete_marker {
            tx.put_garbage_collection(&GarbageCollection::from_object(&old))
                .await?;
            if self.update_usage {
                tx.update_usage(bucket, -old.size).await?;
            }
        }
        Ok(Some(old))
    }

    /// Remove an object version. Unless the removed row is a delete marker,
    /// its blob is queued for collection and its size leaves the bucket usage
    /// in the same commit.
    pub async fn delete_object(
        &self,
        object: &Object,
        is_delete_marker: bool,
        objmap: Option<&ObjMap>,
    ) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.delete_object(object).await?;
        if let Some(objmap) = objmap {
            tx.delete_objmap(&objmap.bucket_name, &objmap.name).await?;
        }
        if !is_delete_marker {
            tx.put_garbage_collection(&GarbageCollection::from_object(object))
                .await?;
            if self.update_usage {
                tx.update_usage(&object.bucket_name, -object.size).await?;
            }
        }
        tx.commit().await?;

        self.invalidate(object).await;
        Ok(())
    }

    /// Record an append of `appended` bytes. The first append inserts the row,
    /// later ones grow it.
    pub async fn append_object(
        &self,
        object: &Object,
        is_exist: bool,
        appended: i64,
    ) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        if is_exist {
            tx.update_append_object(object).await?;
        } else {
            ensure_key_safe(&object.name)?;
            tx.put_object(object).await?;
        }
        if self.update_usage {
            tx.update_usage(&object.bucket_name, appended).await?;
        }
        tx.commit().await?;

        self.invalidate(object).await;
        Ok(())
    }

    pub async fn update_object_acl(&self, object: &Object) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.update_object_acl(object).await?;
        tx.commit().await?;
        self.invalidate(object).await;
        Ok(())
    }

    /// Replace only the custom attributes of a stored version.
    pub async fn update_object_attrs(&self, object: &Object) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        let mut stored = tx
            .get_object(&object.bucket_name, &object.name, Some(object.version))
            .await?;
        stored.custom_attributes = object.custom_attributes.clone();
        tx.update_object_attrs(&stored).await?;
        tx.commit().await?;
        self.invalidate(object).await;
        Ok(())
    }

    /// Replace content type, custom attributes and storage class.
    pub async fn replace_object_metas(&self, object: &Object) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.update_object_attrs(object).await?;
        tx.commit().await?;
        self.invalidate(object).await;
        Ok(())
    }

    pub async fn rename_object(&self, object: &Object, new_name: &str) -> MetaResult<()> {
        ensure_key_safe(new_name)?;
        let mut tx = self.store.begin().await?;
        tx.rename_object(object, new_name).await?;
        tx.commit().await?;

        self.invalidate(object).await;
        let mut renamed = object.clone();
        renamed.name = new_name.to_string();
        self.invalidate(&renamed).await;
        Ok(())
    }

    pub async fn create_freezer(&self, freezer: &Freezer) -> MetaResult<()> {
        ensure_restore_days(freezer.life_time)?;
        let mut tx = self.store.begin().await?;
        tx.put_freezer(freezer).await?;
        tx.commit().await
    }

    pub async fn get_freezer(
        &self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer> {
        self.store.get_freezer(bucket, name, version).await
    }

    /// Set (or with `is_increment`, extend) the restore lifetime of a freezer.
    pub async fn update_freezer_date(
        &self,
        bucket: &str,
        name: &str,
        version: VersionKey,
        days: i32,
        is_increment: bool,
    ) -> MetaResult<Freezer> {
        ensure_restore_days(days)?;
        let mut tx = self.store.begin().await?;
        let mut freezer = tx.get_freezer(bucket, name, version).await?;
        freezer.life_time = if is_increment {
            freezer.life_time.saturating_add(days)
        } else {
            days
        };
        ensure_restore_days(freezer.life_time)?;
        tx.put_freezer(&freezer).await?;
        tx.commit().await?;
        Ok(freezer)
    }

    /// Remove a restore record. A restored copy's blob goes to the GC ledger.
    pub async fn delete_freezer(&self, freezer: &Freezer) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.delete_freezer(freezer).await?;
        if !freezer.blob_id.is_empty() {
            tx.put_garbage_collection(&GarbageCollection::from_freezer(freezer)?)
                .await?;
        }
        tx.commit().await
    }

    /// Repoint an archived object at its restored bytes.
    ///
    /// With a `freezer` the existing row is overwritten and the restore record
    /// dropped; without one `target` is inserted as a new row. Either way the
    /// blob of `source` is queued for collection.
    pub async fn update_glacier_object(
        &self,
        target: &Object,
        source: &Object,
        freezer: Option<&Freezer>,
    ) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        match freezer {
            Some(freezer) => {
                tx.update_object(target).await?;
                tx.delete_freezer(freezer).await?;
            }
            None => tx.put_object(target).await?,
        }
        tx.put_garbage_collection(&GarbageCollection::from_replaced_object(source)?)
            .await?;
        tx.commit().await?;

        info!("{} restored from {}", target, source.blob_id);
        self.invalidate(source).await;
        self.invalidate(target).await;
        Ok(())
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> MetaResult<ListObjectsResult> {
        store::list_objects(self.store.as_ref(), bucket, params).await
    }

    pub async fn list_object_versions(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> MetaResult<ListObjectsResult> {
        store::list_object_versions(self.store.as_ref(), bucket, params).await
    }

    /// Drop every cached view of `object`.
    pub async fn invalidate(&self, object: &Object) {
        for key in object.cache_keys() {
            self.cache.remove(CacheTable::Object, &key).await;
        }
    }
}

async fn load_object(
    store: &dyn MetaStore,
    bucket: &str,
    name: &str,
    selector: VersionSelector,
) -> MetaResult<Object> {
    match selector {
        VersionSelector::Latest => store.get_object(bucket, name, None).await,
        VersionSelector::Exact(version) => store.get_object(bucket, name, Some(version)).await,
        VersionSelector::Null => match store.get_objmap(bucket, name).await {
            Ok(objmap) => {
                let version = objmap.version_key().ok_or(MetaError::NoSuchKey)?;
                store.get_object(bucket, name, Some(version)).await
            }
            Err(err) if err.is_not_found() => {
                let mut tx = store.begin().await?;
                let found = tx.get_null_version_object(bucket, name).await;
                tx.abort().await?;
                found
            }
            Err(err) => Err(err),
        },
    }
}

fn ensure_restore_days(days: i32) -> MetaResult<()> {
    if (1..=MAX_RESTORE_DAYS).contains(&days) {
        Ok(())
    } else {
        Err(MetaError::InvalidRestoreDate(days))
    }
}

/// Reject keys that are empty, oversized, absolute, contain `..` or control
/// characters.
pub(crate) fn ensure_key_safe(key: &str) -> MetaResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(MetaError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(MetaError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(MetaError::InvalidObjectKey);
    }
    Ok(())
}

/// S3-like bucket naming: 3–63 characters of lowercase letters, digits, dots
/// and hyphens, alphanumeric at both ends, and not shaped like an IPv4
/// address.
fn ensure_bucket_name_safe(name: &str) -> MetaResult<()> {
    let invalid = |reason: &str| MetaError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DEFAULT_TTL, MemoryCache};
    use crate::models::multipart::MultipartMetadata;
    use crate::models::object::FAST_POOL;
    use crate::store::{KvStore, SqliteStore};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn object(name: &str, secs: i64, size: i64) -> Object {
        let mut object = Object::created_at("photos", name, at(secs)).unwrap();
        object.size = size;
        object.location = "local".into();
        object.pool = "tiger".into();
        object.blob_id = format!("blob-{name}-{secs}");
        object
    }

    async fn kv_service() -> ObjectService {
        let store = Arc::new(KvStore::new());
        store.put_bucket(&Bucket::new("photos", "owner")).await.unwrap();
        ObjectService::new(store, MetaCache::Memory(MemoryCache::new(DEFAULT_TTL)))
    }

    async fn sqlite_service() -> ObjectService {
        let store = Arc::new(SqliteStore::connect_in_memory().await.unwrap());
        store.put_bucket(&Bucket::new("photos", "owner")).await.unwrap();
        ObjectService::new(store, MetaCache::Disabled)
    }

    async fn usage(service: &ObjectService) -> i64 {
        service.store().get_bucket("photos").await.unwrap().usage
    }

    #[tokio::test]
    async fn enabled_versioning_keeps_older_versions() {
        for service in [kv_service().await, sqlite_service().await] {
            let mut first = object("cat.jpg", 1, 10);
            let mut second = object("cat.jpg", 2, 20);
            service
                .put_object_versioned(&mut first, Versioning::Enabled)
                .await
                .unwrap();
            service
                .put_object_versioned(&mut second, Versioning::Enabled)
                .await
                .unwrap();

            let latest = service.get_object("photos", "cat.jpg", "", true).await.unwrap();
            assert_eq!(latest.version, second.version);
            let older = service
                .get_object("photos", "cat.jpg", &first.version_id(), false)
                .await
                .unwrap();
            assert_eq!(older.blob_id, first.blob_id);

            let params = ListObjectsParams {
                max_keys: 10,
                ..Default::default()
            };
            let listed = service.list_objects("photos", &params).await.unwrap();
            assert_eq!(listed.objects.len(), 1);
            assert_eq!(listed.objects[0].version, second.version);
            let versions = service.list_object_versions("photos", &params).await.unwrap();
            assert_eq!(versions.objects.len(), 2);

            assert_eq!(usage(&service).await, 30);
            let gc = service.store().scan_garbage_collection(10, None).await.unwrap();
            assert!(gc.is_empty());
        }
    }

    #[tokio::test]
    async fn unversioned_overwrite_collects_previous_null_version() {
        for service in [kv_service().await, sqlite_service().await] {
            let mut first = object("cat.jpg", 1, 10);
            let mut second = object("cat.jpg", 2, 25);
            service
                .put_object_versioned(&mut first, Versioning::Disabled)
                .await
                .unwrap();
            service
                .put_object_versioned(&mut second, Versioning::Disabled)
                .await
                .unwrap();

            let err = service
                .store()
                .get_object("photos", "cat.jpg", Some(first.version))
                .await
                .unwrap_err();
            assert!(err.is_not_found());

            let null = service.get_object("photos", "cat.jpg", "null", false).await.unwrap();
            assert_eq!(null.version, second.version);
            assert_eq!(null.version_id(), "null");

            let gc = service.store().scan_garbage_collection(10, None).await.unwrap();
            assert_eq!(gc.len(), 1);
            assert_eq!(gc[0].blob_id, first.blob_id);
            assert_eq!(usage(&service).await, 25);
        }
    }

    #[tokio::test]
    async fn racing_unversioned_puts_leave_one_null_version() {
        let service = kv_service().await;
        let mut first = object("race", 1, 5);
        first.null_version = true;
        let mut second = object("race", 2, 7);
        second.null_version = true;

        let mut tx_a = service.store().begin().await.unwrap();
        let mut tx_b = service.store().begin().await.unwrap();
        for (tx, object) in [(&mut tx_a, &first), (&mut tx_b, &second)] {
            let replaced = service
                .replace_null_version(tx.as_mut(), "photos", "race")
                .await
                .unwrap();
            assert!(replaced.is_none());
            tx.put_object(object).await.unwrap();
        }
        tx_a.commit().await.unwrap();
        let err = tx_b.commit().await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Conflict);

        let mut tx = service.store().begin().await.unwrap();
        let null = tx.get_null_version_object("photos", "race").await.unwrap();
        assert_eq!(null.version, first.version);
        assert!(
            tx.get_object("photos", "race", Some(second.version))
                .await
                .unwrap_err()
                .is_not_found()
        );
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn suspended_bucket_resolves_null_through_objmap() {
        let service = kv_service().await;
        let mut versioned = object("doc", 1, 5);
        service
            .put_object_versioned(&mut versioned, Versioning::Enabled)
            .await
            .unwrap();
        let mut null = object("doc", 2, 7);
        service
            .put_object_versioned(&mut null, Versioning::Suspended)
            .await
            .unwrap();

        let objmap = service.store().get_objmap("photos", "doc").await.unwrap();
        assert_eq!(objmap.version_key(), Some(null.version));
        let found = service.get_object("photos", "doc", "null", false).await.unwrap();
        assert_eq!(found.version, null.version);
        let kept = service
            .get_object("photos", "doc", &versioned.version_id(), false)
            .await
            .unwrap();
        assert!(!kept.null_version);
    }

    #[tokio::test]
    async fn delete_enqueues_gc_unless_delete_marker() {
        for service in [kv_service().await, sqlite_service().await] {
            let live = object("a", 1, 40);
            service.put_object(&live, None, None, true).await.unwrap();
            let mut marker = object("b", 1, 0);
            marker.delete_marker = true;
            marker.blob_id.clear();
            service.put_object(&marker, None, None, true).await.unwrap();

            service.delete_object(&marker, true, None).await.unwrap();
            assert!(service
                .store()
                .scan_garbage_collection(10, None)
                .await
                .unwrap()
                .is_empty());

            service.delete_object(&live, false, None).await.unwrap();
            let gc = service.store().scan_garbage_collection(10, None).await.unwrap();
            assert_eq!(gc.len(), 1);
            assert_eq!(gc[0].cursor(), GarbageCollection::from_object(&live).cursor());
            assert_eq!(usage(&service).await, 0);
            assert!(
                service
                    .get_object("photos", "a", "", false)
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
        }
    }

    #[tokio::test]
    async fn failed_step_leaves_nothing_behind() {
        for service in [kv_service().await, sqlite_service().await] {
            let ghost = Multipart::new("photos", "big", MultipartMetadata::default());
            let big = object("big", 1, 100);
            let err = service
                .put_object(&big, Some(&ghost), None, true)
                .await
                .unwrap_err();
            assert!(matches!(err, MetaError::NoSuchUpload));
            assert!(
                service
                    .store()
                    .get_object("photos", "big", None)
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
            assert_eq!(usage(&service).await, 0);
        }
    }

    #[tokio::test]
    async fn fast_pool_writes_register_hot_rows() {
        let service = sqlite_service().await;
        let mut hot = object("hot", 1, 3);
        hot.pool = FAST_POOL.into();
        service.put_object(&hot, None, None, true).await.unwrap();
        let rows = service.store().scan_hot_objects(None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].blob_id, hot.blob_id);

        service.delete_object(&hot, false, None).await.unwrap();
        assert!(service.store().scan_hot_objects(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cached_reads_are_invalidated_by_writes() {
        let service = kv_service().await;
        let mut original = object("note", 1, 1);
        original.content_type = "text/plain".into();
        service.put_object(&original, None, None, true).await.unwrap();
        let cached = service.get_object("photos", "note", "", true).await.unwrap();
        assert_eq!(cached.content_type, "text/plain");

        let mut changed = original.clone();
        changed.content_type = "text/markdown".into();
        changed.custom_attributes.insert("k".into(), "v".into());
        service.replace_object_metas(&changed).await.unwrap();
        let fresh = service.get_object("photos", "note", "", true).await.unwrap();
        assert_eq!(fresh.content_type, "text/markdown");

        let mut attrs_only = original.clone();
        attrs_only.content_type = "ignored".into();
        attrs_only.custom_attributes.insert("x".into(), "y".into());
        service.update_object_attrs(&attrs_only).await.unwrap();
        let fresh = service.get_object("photos", "note", "", true).await.unwrap();
        assert_eq!(fresh.content_type, "text/markdown");
        assert_eq!(fresh.custom_attributes.get("x").map(String::as_str), Some("y"));
        assert!(!fresh.custom_attributes.contains_key("k"));
    }

    #[tokio::test]
    async fn append_grows_usage_by_appended_bytes() {
        for service in [kv_service().await, sqlite_service().await] {
            let mut log = object("log", 1, 4);
            log.object_type = crate::models::object::ObjectType::Appendable;
            service.append_object(&log, false, 4).await.unwrap();
            log.size = 10;
            service.append_object(&log, true, 6).await.unwrap();

            let stored = service.get_object("photos", "log", "", false).await.unwrap();
            assert_eq!(stored.size, 10);
            assert_eq!(usage(&service).await, 10);
        }
    }

    #[tokio::test]
    async fn rename_moves_the_row() {
        let service = sqlite_service().await;
        let original = object("old-name", 1, 2);
        service.put_object(&original, None, None, true).await.unwrap();
        service.rename_object(&original, "new-name").await.unwrap();
        assert!(
            service
                .get_object("photos", "old-name", "", false)
                .await
                .unwrap_err()
                .is_not_found()
        );
        let moved = service.get_object("photos", "new-name", "", false).await.unwrap();
        assert_eq!(moved.blob_id, original.blob_id);
    }

    #[tokio::test]
    async fn freezer_lifetime_is_bounded() {
        let service = kv_service().await;
        let archived = object("cold", 1, 9);
        let mut freezer = Freezer::new("photos", "cold", archived.version, 10);
        freezer.blob_id = "restored".into();
        service.create_freezer(&freezer).await.unwrap();

        let extended = service
            .update_freezer_date("photos", "cold", archived.version, 15, true)
            .await
            .unwrap();
        assert_eq!(extended.life_time, 25);
        let err = service
            .update_freezer_date("photos", "cold", archived.version, 10, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidRestoreDate(35)));
        assert!(matches!(
            service
                .update_freezer_date("photos", "cold", archived.version, 0, false)
                .await,
            Err(MetaError::InvalidRestoreDate(0))
        ));

        service.delete_freezer(&extended).await.unwrap();
        let gc = service.store().scan_garbage_collection(10, None).await.unwrap();
        assert_eq!(gc.len(), 1);
        assert_eq!(gc[0].blob_id, "restored");
    }

    #[tokio::test]
    async fn glacier_restore_repoints_and_collects_source() {
        for service in [kv_service().await, sqlite_service().await] {
            let mut source = object("cold", 1, 9);
            source.storage_class = crate::models::object::StorageClass::Glacier;
            service.put_object(&source, None, None, true).await.unwrap();
            let freezer = Freezer::new("photos", "cold", source.version, 3);
            service.create_freezer(&freezer).await.unwrap();

            let mut target = source.clone();
            target.blob_id = "thawed".into();
            target.storage_class = crate::models::object::StorageClass::Standard;
            service
                .update_glacier_object(&target, &source, Some(&freezer))
                .await
                .unwrap();

            let stored = service.get_object("photos", "cold", "", false).await.unwrap();
            assert_eq!(stored.blob_id, "thawed");
            assert!(
                service
                    .get_freezer("photos", "cold", source.version)
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
            let gc = service.store().scan_garbage_collection(10, None).await.unwrap();
            assert_eq!(gc.len(), 1);
            assert_eq!(gc[0].blob_id, source.blob_id);
            assert_ne!(gc[0].version, source.version);

            // the restored row still owns the identity of its version
            service.delete_object(&stored, false, None).await.unwrap();
            let gc = service.store().scan_garbage_collection(10, None).await.unwrap();
            let mut blobs: Vec<&str> = gc.iter().map(|entry| entry.blob_id.as_str()).collect();
            blobs.sort_unstable();
            assert_eq!(blobs, vec![source.blob_id.as_str(), "thawed"]);
        }
    }

    #[test]
    fn key_and_bucket_names_are_validated() {
        assert!(ensure_key_safe("a/b/c.txt").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/abs").is_err());
        assert!(ensure_key_safe("a/../b").is_err());
        assert!(ensure_bucket_name_safe("my-bucket.1").is_ok());
        assert!(ensure_bucket_name_safe("ab").is_err());
        assert!(ensure_bucket_name_safe("Upper").is_err());
        assert!(ensure_bucket_name_safe("-dash").is_err());
        assert!(ensure_bucket_name_safe("192.168.1.1").is_err());
    }
}
