//! Ordered transactional key-value backend.
//!
//! Every entity is a JSON value under a string key whose byte order matches
//! the entity's identity order:
//!
//! | prefix | key                              | value               |
//! |--------|----------------------------------|---------------------|
//! | `b/`   | bucket                           | [`Bucket`]          |
//! | `o/`   | bucket `\0` name `\0` version    | [`Object`] + parts  |
//! | `m/`   | bucket `\0` name                 | [`ObjMap`]          |
//! | `g/`   | bucket `\0` object `\0` version  | [`GarbageCollection`] |
//! | `u/`   | bucket `\0` object `\0` upload   | [`Multipart`] + parts |
//! | `f/`   | bucket `\0` name `\0` version    | [`Freezer`]         |
//! | `h/`   | bucket `\0` name `\0` version    | [`HotObject`]       |
//!
//! Transactions buffer their writes and usage deltas and apply them under the
//! map's write lock on commit. Each entry carries a revision; a commit fails
//! with `Conflict` when any key the transaction read was changed since, or
//! when a key appeared in or vanished from a prefix it scanned.

use super::{MetaStore, MetaTxn, ObjectEntry, ScanPosition};
use crate::errors::{MetaError, MetaResult};
use crate::models::{
    bucket::Bucket,
    freezer::Freezer,
    gc::{GarbageCollection, GcCursor},
    multipart::{Multipart, Part},
    object::{HotObject, ObjMap, Object},
    version::VersionKey,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

const SEP: char = '\0';

#[derive(Debug, Clone)]
struct Entry {
    revision: u64,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    revision: u64,
}

impl Inner {
    fn revision_of(&self, key: &str) -> u64 {
        self.entries.get(key).map(|e| e.revision).unwrap_or(0)
    }

    /// Revision of every key under `prefix`.
    fn revisions_under(&self, prefix: &str) -> BTreeMap<String, u64> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.revision))
            .collect()
    }

    /// Values under `prefix`, strictly after `after` when given.
    fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Vec<(String, Vec<u8>)> {
        let start = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        self.entries
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

fn bucket_key(name: &str) -> String {
    format!("b/{name}")
}

fn object_key(bucket: &str, name: &str, version: VersionKey) -> String {
    format!("o/{bucket}{SEP}{name}{SEP}{version}")
}

fn object_versions_prefix(bucket: &str, name: &str) -> String {
    format!("o/{bucket}{SEP}{name}{SEP}")
}

fn objmap_key(bucket: &str, name: &str) -> String {
    format!("m/{bucket}{SEP}{name}")
}

fn gc_key(cursor: &GcCursor) -> String {
    format!(
        "g/{}{SEP}{}{SEP}{}",
        cursor.bucket_name, cursor.object_name, cursor.version
    )
}

fn multipart_key(bucket: &str, object: &str, upload_key: VersionKey) -> String {
    format!("u/{bucket}{SEP}{object}{SEP}{upload_key}")
}

fn freezer_key(bucket: &str, name: &str, version: VersionKey) -> String {
    format!("f/{bucket}{SEP}{name}{SEP}{version}")
}

fn hot_key(hot: &HotObject) -> String {
    format!(
        "h/{}{SEP}{}{SEP}{}",
        hot.bucket_name, hot.name, hot.version
    )
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> MetaResult<T> {
    Ok(serde_json::from_slice(raw)?)
}

fn entry_of(object: &Object) -> ObjectEntry {
    ObjectEntry {
        name: object.name.clone(),
        version: object.version,
        null_version: object.null_version,
        delete_marker: object.delete_marker,
    }
}

#[derive(Clone, Default)]
pub struct KvStore {
    inner: Arc<RwLock<Inner>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> MetaResult<Option<T>> {
        let inner = self.inner.read();
        inner
            .entries
            .get(key)
            .map(|entry| decode(&entry.value))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> MetaResult<Vec<T>> {
        let rows = self.inner.read().scan(prefix, after, limit);
        rows.iter().map(|(_, raw)| decode(raw)).collect()
    }
}

#[async_trait]
impl MetaStore for KvStore {
    async fn begin(&self) -> MetaResult<Box<dyn MetaTxn>> {
        Ok(Box::new(KvTxn {
            inner: self.inner.clone(),
            reads: BTreeMap::new(),
            ranges: BTreeMap::new(),
            writes: BTreeMap::new(),
            usage: BTreeMap::new(),
        }))
    }

    async fn ping(&self) -> MetaResult<()> {
        Ok(())
    }

    async fn get_bucket(&self, name: &str) -> MetaResult<Bucket> {
        self.get(&bucket_key(name))?
            .ok_or_else(|| MetaError::NoSuchBucket(name.to_string()))
    }

    async fn put_bucket(&self, bucket: &Bucket) -> MetaResult<()> {
        let value = serde_json::to_vec(bucket)?;
        let mut inner = self.inner.write();
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(bucket_key(&bucket.name), Entry { revision, value });
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        version: Option<VersionKey>,
    ) -> MetaResult<Object> {
        let found = match version {
            Some(version) => self.get(&object_key(bucket, name, version))?,
            None => self
                .scan(&object_versions_prefix(bucket, name), None, 1)?
                .into_iter()
                .next(),
        };
        found.ok_or(MetaError::NoSuchKey)
    }

    async fn get_objmap(&self, bucket: &str, name: &str) -> MetaResult<ObjMap> {
        self.get(&objmap_key(bucket, name))?
            .ok_or(MetaError::NoSuchKey)
    }

    async fn scan_objects(
        &self,
        bucket: &str,
        prefix: &str,
        after: Option<&ScanPosition>,
        limit: usize,
    ) -> MetaResult<Vec<ObjectEntry>> {
        let scan_prefix = format!("o/{bucket}{SEP}{prefix}");
        let after_key = after.map(|pos| {
            object_key(bucket, &pos.name, pos.version.unwrap_or(VersionKey::NULL))
        });
        let objects: Vec<Object> = self.scan(&scan_prefix, after_key.as_deref(), limit)?;
        Ok(objects.iter().map(entry_of).collect())
    }

    async fn get_multipart(
        &self,
        bucket: &str,
        object: &str,
        upload_key: VersionKey,
    ) -> MetaResult<Multipart> {
        self.get(&multipart_key(bucket, object, upload_key))?
            .ok_or(MetaError::NoSuchUpload)
    }

    async fn list_multiparts(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> MetaResult<Vec<Multipart>> {
        self.scan(&format!("u/{bucket}{SEP}{prefix}"), None, limit)
    }

    async fn get_freezer(
        &self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer> {
        self.get(&freezer_key(bucket, name, version))?
            .ok_or(MetaError::NoSuchKey)
    }

    async fn scan_garbage_collection(
        &self,
        limit: usize,
        after: Option<&GcCursor>,
    ) -> MetaResult<Vec<GarbageCollection>> {
        let after_key = after.map(gc_key);
        self.scan("g/", after_key.as_deref(), limit)
    }

    async fn scan_hot_objects(
        &self,
        after: Option<&HotObject>,
        limit: usize,
    ) -> MetaResult<Vec<HotObject>> {
        let after_key = after.map(hot_key);
        self.scan("h/", after_key.as_deref(), limit)
    }
}

pub struct KvTxn {
    inner: Arc<RwLock<Inner>>,
    /// Revision of every key observed, for commit-time validation.
    reads: BTreeMap<String, u64>,
    /// Keys and revisions under every scanned prefix, as first seen.
    ranges: BTreeMap<String, BTreeMap<String, u64>>,
    /// `None` marks a deletion.
    writes: BTreeMap<String, Option<Vec<u8>>>,
    usage: BTreeMap<String, i64>,
}

impl KvTxn {
    fn read_raw(&mut self, key: &str) -> Option<Vec<u8>> {
        if let Some(pending) = self.writes.get(key) {
            return pending.clone();
        }
        let inner = self.inner.read();
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| inner.revision_of(key));
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    fn read<T: DeserializeOwned>(&mut self, key: &str) -> MetaResult<Option<T>> {
        self.read_raw(key).map(|raw| decode(&raw)).transpose()
    }

    /// Committed entries under `prefix` overlaid with this transaction's
    /// pending writes, in key order.
    fn scan<T: DeserializeOwned>(&mut self, prefix: &str) -> MetaResult<Vec<T>> {
        let mut merged: BTreeMap<String, Vec<u8>> = {
            let inner = self.inner.read();
            self.ranges
                .entry(prefix.to_string())
                .or_insert_with(|| inner.revisions_under(prefix));
            inner.scan(prefix, None, usize::MAX).into_iter().collect()
        };
        for (key, pending) in self
            .writes
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match pending {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        merged.values().map(|raw| decode(raw)).collect()
    }

    fn write<T: Serialize>(&mut self, key: String, value: &T) -> MetaResult<()> {
        self.writes.insert(key, Some(serde_json::to_vec(value)?));
        Ok(())
    }

    fn remove(&mut self, key: String) {
        self.writes.insert(key, None);
    }

    fn existing_object(&mut self, object: &Object) -> MetaResult<Object> {
        self.read(&object_key(&object.bucket_name, &object.name, object.version))?
            .ok_or(MetaError::NoSuchKey)
    }

    fn store_object(&mut self, object: &Object) -> MetaResult<()> {
        self.write(
            object_key(&object.bucket_name, &object.name, object.version),
            object,
        )
    }
}

#[async_trait]
impl MetaTxn for KvTxn {
    async fn get_object(
        &mut self,
        bucket: &str,
        name: &str,
        version: Option<VersionKey>,
    ) -> MetaResult<Object> {
        let found = match version {
            Some(version) => self.read(&object_key(bucket, name, version))?,
            None => self
                .scan::<Object>(&object_versions_prefix(bucket, name))?
                .into_iter()
                .next(),
        };
        found.ok_or(MetaError::NoSuchKey)
    }

    async fn get_null_version_object(&mut self, bucket: &str, name: &str) -> MetaResult<Object> {
        self.scan::<Object>(&object_versions_prefix(bucket, name))?
            .into_iter()
            .find(|object| object.null_version)
            .ok_or(MetaError::NoSuchKey)
    }

    async fn put_object(&mut self, object: &Object) -> MetaResult<()> {
        let key = object_key(&object.bucket_name, &object.name, object.version);
        if self.read_raw(&key).is_some() {
            return Err(MetaError::Conflict(format!(
                "object {}/{} version {} already exists",
                object.bucket_name, object.name, object.version
            )));
        }
        self.write(key, object)?;
        if object.is_hot() {
            let hot = HotObject::from_object(object);
            self.write(hot_key(&hot), &hot)?;
        }
        Ok(())
    }

    async fn update_object(&mut self, object: &Object) -> MetaResult<()> {
        let existing = self.existing_object(object)?;
        let mut updated = object.clone();
        updated.null_version = existing.null_version;
        updated.parts_index = None;
        self.store_object(&updated)
    }

    async fn update_append_object(&mut self, object: &Object) -> MetaResult<()> {
        let mut existing = self.existing_object(object)?;
        existing.size = object.size;
        existing.etag = object.etag.clone();
        existing.last_modified = object.last_modified;
        self.store_object(&existing)
    }

    async fn update_object_acl(&mut self, object: &Object) -> MetaResult<()> {
        let mut existing = self.existing_object(object)?;
        existing.acl = object.acl.clone();
        self.store_object(&existing)
    }

    async fn update_object_attrs(&mut self, object: &Object) -> MetaResult<()> {
        let mut existing = self.existing_object(object)?;
        existing.content_type = object.content_type.clone();
        existing.custom_attributes = object.custom_attributes.clone();
        existing.storage_class = object.storage_class;
        self.store_object(&existing)
    }

    async fn rename_object(&mut self, object: &Object, new_name: &str) -> MetaResult<()> {
        let mut existing = self.existing_object(object)?;
        let target = object_key(&existing.bucket_name, new_name, existing.version);
        if self.read_raw(&target).is_some() {
            return Err(MetaError::Conflict(format!(
                "object {}/{} version {} already exists",
                existing.bucket_name, new_name, existing.version
            )));
        }
        self.remove(object_key(&existing.bucket_name, &existing.name, existing.version));
        let old_hot = HotObject::from_object(&existing);
        let was_hot = self.read_raw(&hot_key(&old_hot)).is_some();
        existing.name = new_name.to_string();
        self.write(target, &existing)?;
        if was_hot {
            self.remove(hot_key(&old_hot));
            let hot = HotObject::from_object(&existing);
            self.write(hot_key(&hot), &hot)?;
        }
        Ok(())
    }

    async fn delete_object(&mut self, object: &Object) -> MetaResult<()> {
        let existing = self.existing_object(object)?;
        self.remove(object_key(
            &existing.bucket_name,
            &existing.name,
            existing.version,
        ));
        self.remove(hot_key(&HotObject::from_object(&existing)));
        Ok(())
    }

    async fn migrate_object(&mut self, object: &Object, previous: &Object) -> MetaResult<()> {
        let mut existing = self.existing_object(object)?;
        if existing.blob_id != previous.blob_id
            || existing.size != previous.size
            || existing.etag != previous.etag
        {
            return Err(MetaError::NoSuchKey);
        }
        existing.location = object.location.clone();
        existing.pool = object.pool.clone();
        existing.blob_id = object.blob_id.clone();
        self.store_object(&existing)?;
        self.remove(hot_key(&HotObject::from_object(&existing)));
        Ok(())
    }

    async fn update_usage(&mut self, bucket: &str, delta: i64) -> MetaResult<()> {
        *self.usage.entry(bucket.to_string()).or_default() += delta;
        Ok(())
    }

    async fn put_objmap(&mut self, objmap: &ObjMap) -> MetaResult<()> {
        self.write(objmap_key(&objmap.bucket_name, &objmap.name), objmap)
    }

    async fn delete_objmap(&mut self, bucket: &str, name: &str) -> MetaResult<()> {
        self.remove(objmap_key(bucket, name));
        Ok(())
    }

    async fn put_garbage_collection(&mut self, entry: &GarbageCollection) -> MetaResult<()> {
        let key = gc_key(&entry.cursor());
        if let Some(existing) = self.read::<GarbageCollection>(&key)? {
            if existing.blob_ids() == entry.blob_ids() {
                return Ok(());
            }
            return Err(MetaError::Conflict(format!(
                "gc entry {}/{} version {} already holds other blobs",
                entry.bucket_name, entry.object_name, entry.version
            )));
        }
        self.write(key, entry)
    }

    async fn remove_garbage_collection(&mut self, cursor: &GcCursor) -> MetaResult<()> {
        self.remove(gc_key(cursor));
        Ok(())
    }

    async fn increment_gc_tries(&mut self, cursor: &GcCursor) -> MetaResult<()> {
        let key = gc_key(cursor);
        if let Some(mut entry) = self.read::<GarbageCollection>(&key)? {
            entry.tried_times += 1;
            self.write(key, &entry)?;
        }
        Ok(())
    }

    async fn put_multipart(&mut self, multipart: &Multipart) -> MetaResult<()> {
        let key = multipart_key(
            &multipart.bucket_name,
            &multipart.object_name,
            multipart.upload_key()?,
        );
        let mut session = multipart.clone();
        session.parts.clear();
        self.write(key, &session)
    }

    async fn get_multipart(
        &mut self,
        bucket: &str,
        object: &str,
        upload_key: VersionKey,
    ) -> MetaResult<Multipart> {
        self.read(&multipart_key(bucket, object, upload_key))?
            .ok_or(MetaError::NoSuchUpload)
    }

    async fn put_multipart_part(&mut self, multipart: &Multipart, part: &Part) -> MetaResult<()> {
        let key = multipart_key(
            &multipart.bucket_name,
            &multipart.object_name,
            multipart.upload_key()?,
        );
        let mut session: Multipart = self.read(&key)?.ok_or(MetaError::NoSuchUpload)?;
        session.parts.insert(part.part_number, part.clone());
        self.write(key, &session)
    }

    async fn delete_multipart(&mut self, multipart: &Multipart) -> MetaResult<()> {
        let key = multipart_key(
            &multipart.bucket_name,
            &multipart.object_name,
            multipart.upload_key()?,
        );
        if self.read_raw(&key).is_none() {
            return Err(MetaError::NoSuchUpload);
        }
        self.remove(key);
        Ok(())
    }

    async fn get_freezer(
        &mut self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer> {
        self.read(&freezer_key(bucket, name, version))?
            .ok_or(MetaError::NoSuchKey)
    }

    async fn put_freezer(&mut self, freezer: &Freezer) -> MetaResult<()> {
        self.write(
            freezer_key(&freezer.bucket_name, &freezer.name, freezer.version),
            freezer,
        )
    }

    async fn delete_freezer(&mut self, freezer: &Freezer) -> MetaResult<()> {
        self.remove(freezer_key(
            &freezer.bucket_name,
            &freezer.name,
            freezer.version,
        ));
        Ok(())
    }

    async fn put_hot_object(&mut self, hot: &HotObject) -> MetaResult<()> {
        self.write(hot_key(hot), hot)
    }

    async fn remove_hot_object(&mut self, hot: &HotObject) -> MetaResult<()> {
        self.remove(hot_key(hot));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MetaResult<()> {
        let KvTxn {
            inner,
            reads,
            ranges,
            writes,
            usage,
        } = *self;
        let mut inner = inner.write();

        for (key, revision) in &reads {
            if inner.revision_of(key) != *revision {
                return Err(MetaError::Conflict(format!(
                    "key `{}` changed during transaction",
                    key.replace(SEP, "/")
                )));
            }
        }
        for (prefix, seen) in &ranges {
            if inner.revisions_under(prefix) != *seen {
                return Err(MetaError::Conflict(format!(
                    "range `{}` changed during transaction",
                    prefix.replace(SEP, "/")
                )));
            }
        }

        let mut buckets = Vec::with_capacity(usage.len());
        for (name, delta) in usage {
            let key = bucket_key(&name);
            let Some(entry) = inner.entries.get(&key) else {
                debug!("usage delta {} for unknown bucket {}", delta, name);
                continue;
            };
            let mut bucket: Bucket = decode(&entry.value)?;
            bucket.usage += delta;
            buckets.push((key, serde_json::to_vec(&bucket)?));
        }

        inner.revision += 1;
        let revision = inner.revision;
        for (key, pending) in writes {
            match pending {
                Some(value) => {
                    inner.entries.insert(key, Entry { revision, value });
                }
                None => {
                    inner.entries.remove(&key);
                }
            }
        }
        for (key, value) in buckets {
            inner.entries.insert(key, Entry { revision, value });
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MetaResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object::FAST_POOL;
    use chrono::{Duration, Utc};

    fn object(name: &str, offset_secs: i64) -> Object {
        let created = Utc::now() - Duration::seconds(100) + Duration::seconds(offset_secs);
        let mut object = Object::created_at("bkt", name, created).unwrap();
        object.location = "local".into();
        object.pool = FAST_POOL.into();
        object.blob_id = format!("blob-{name}-{offset_secs}");
        object.size = 10;
        object
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_dropped() {
        let store = KvStore::new();
        let obj = object("k", 0);

        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        assert_eq!(tx.get_object("bkt", "k", None).await.unwrap().version, obj.version);
        assert!(store.get_object("bkt", "k", None).await.unwrap_err().is_not_found());
        drop(tx);

        assert!(store.get_object("bkt", "k", None).await.unwrap_err().is_not_found());
        assert!(store.scan_hot_objects(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_applies_rows_usage_and_ledger_together() {
        let store = KvStore::new();
        store.put_bucket(&Bucket::new("bkt", "owner")).await.unwrap();
        let obj = object("k", 0);

        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.update_usage("bkt", obj.size).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get_bucket("bkt").await.unwrap().usage, 10);
        assert_eq!(store.scan_hot_objects(None, 10).await.unwrap().len(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.delete_object(&obj).await.unwrap();
        tx.put_garbage_collection(&GarbageCollection::from_object(&obj))
            .await
            .unwrap();
        tx.update_usage("bkt", -obj.size).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.get_bucket("bkt").await.unwrap().usage, 0);
        let ledger = store.scan_garbage_collection(10, None).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].blob_id, obj.blob_id);
        assert!(store.scan_hot_objects(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writers_to_one_key_conflict() {
        let store = KvStore::new();
        let obj = object("k", 0);
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut a = first.get_object("bkt", "k", None).await.unwrap();
        let mut b = second.get_object("bkt", "k", None).await.unwrap();
        a.acl.canned_acl = "private".into();
        b.acl.canned_acl = "public-read".into();
        first.update_object_acl(&a).await.unwrap();
        second.update_object_acl(&b).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, MetaError::Conflict(_)));
        let stored = store.get_object("bkt", "k", None).await.unwrap();
        assert_eq!(stored.acl.canned_acl, "private");
    }

    #[tokio::test]
    async fn rows_inserted_under_a_scanned_prefix_conflict() {
        let store = KvStore::new();
        let mine = object("k", 1);
        let mut reader = store.begin().await.unwrap();
        assert!(
            reader
                .get_null_version_object("bkt", "k")
                .await
                .unwrap_err()
                .is_not_found()
        );
        reader.put_object(&mine).await.unwrap();

        let mut writer = store.begin().await.unwrap();
        writer.put_object(&object("k", 2)).await.unwrap();
        writer.commit().await.unwrap();

        let err = reader.commit().await.unwrap_err();
        assert!(matches!(err, MetaError::Conflict(_)));
        assert!(
            store
                .get_object("bkt", "k", Some(mine.version))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn gc_enqueue_is_idempotent_but_never_overwrites() {
        let store = KvStore::new();
        let obj = object("k", 0);
        let entry = GarbageCollection::from_object(&obj);

        let mut tx = store.begin().await.unwrap();
        tx.put_garbage_collection(&entry).await.unwrap();
        tx.put_garbage_collection(&entry).await.unwrap();
        let mut other = entry.clone();
        other.blob_id = "somebody-else".into();
        let err = tx.put_garbage_collection(&other).await.unwrap_err();
        assert!(matches!(err, MetaError::Conflict(_)));
        tx.commit().await.unwrap();

        store
            .mark_garbage_collection_failed(&entry.cursor())
            .await
            .unwrap();
        let ledger = store.scan_garbage_collection(10, None).await.unwrap();
        assert_eq!(ledger[0].tried_times, 1);
        assert_eq!(ledger[0].blob_id, obj.blob_id);
    }

    #[tokio::test]
    async fn migrate_requires_the_expected_blob() {
        let store = KvStore::new();
        let obj = object("k", 0);
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.commit().await.unwrap();

        let mut moved = obj.clone();
        moved.pool = "tiger".into();
        moved.blob_id = "new-blob".into();

        let mut stale = obj.clone();
        stale.blob_id = "not-the-blob".into();
        let mut grown = obj.clone();
        grown.size -= 4;

        let mut tx = store.begin().await.unwrap();
        let err = tx.migrate_object(&moved, &stale).await.unwrap_err();
        assert!(err.is_not_found());
        let err = tx.migrate_object(&moved, &grown).await.unwrap_err();
        assert!(err.is_not_found());
        tx.migrate_object(&moved, &obj).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_object("bkt", "k", None).await.unwrap();
        assert_eq!(stored.blob_id, "new-blob");
        assert_eq!(stored.pool, "tiger");
        assert!(store.scan_hot_objects(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_version_is_first_in_scan_order() {
        let store = KvStore::new();
        let old = object("k", 0);
        let new = object("k", 5);
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&old).await.unwrap();
        tx.put_object(&new).await.unwrap();
        tx.commit().await.unwrap();

        let latest = store.get_object("bkt", "k", None).await.unwrap();
        assert_eq!(latest.version, new.version);
        let entries = store.scan_objects("bkt", "", None, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].version, new.version);

        let after = ScanPosition::after_key("k");
        assert!(store
            .scan_objects("bkt", "", Some(&after), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
