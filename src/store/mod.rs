//! The metadata store contract.
//!
//! [`MetaStore`] hands out transactions and serves reads that need no
//! isolation. Every mutation goes through a [`MetaTxn`]: object and part rows,
//! usage deltas and GC-ledger entries written through one transaction become
//! visible together on [`MetaTxn::commit`] or not at all. A transaction that is
//! dropped without committing is rolled back.
//!
//! Two backends implement the contract: [`sqlite::SqliteStore`] (relational)
//! and [`kv::KvStore`] (ordered transactional key-value map).

pub mod kv;
pub mod listing;
pub mod sqlite;

use crate::errors::MetaResult;
use crate::models::{
    bucket::Bucket,
    freezer::Freezer,
    gc::{GarbageCollection, GcCursor},
    multipart::{Multipart, Part},
    object::{HotObject, ObjMap, Object},
    version::VersionKey,
};
use async_trait::async_trait;

pub use kv::KvStore;
pub use listing::{ListObjectsParams, ListObjectsResult, list_object_versions, list_objects};
pub use sqlite::SqliteStore;

/// One row of an object key scan, without the payload attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub version: VersionKey,
    pub null_version: bool,
    pub delete_marker: bool,
}

/// Exclusive resume point of an object key scan. Without a version every
/// version of `name` is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPosition {
    pub name: String,
    pub version: Option<VersionKey>,
}

impl ScanPosition {
    pub fn after_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn after_version(name: impl Into<String>, version: VersionKey) -> Self {
        Self {
            name: name.into(),
            version: Some(version),
        }
    }

    /// Whether `(name, version)` lies strictly after this position.
    pub fn precedes(&self, name: &str, version: VersionKey) -> bool {
        match self.version {
            None => name > self.name.as_str(),
            Some(after) => (name, version) > (self.name.as_str(), after),
        }
    }
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Start a transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> MetaResult<Box<dyn MetaTxn>>;

    async fn ping(&self) -> MetaResult<()>;

    async fn get_bucket(&self, name: &str) -> MetaResult<Bucket>;

    async fn put_bucket(&self, bucket: &Bucket) -> MetaResult<()>;

    /// An object version with its parts. `None` selects the latest version.
    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        version: Option<VersionKey>,
    ) -> MetaResult<Object>;

    async fn get_objmap(&self, bucket: &str, name: &str) -> MetaResult<ObjMap>;

    /// Object rows of `bucket` whose name starts with `prefix`, ordered by
    /// `(name, version)`, strictly after `after`.
    async fn scan_objects(
        &self,
        bucket: &str,
        prefix: &str,
        after: Option<&ScanPosition>,
        limit: usize,
    ) -> MetaResult<Vec<ObjectEntry>>;

    async fn get_multipart(
        &self,
        bucket: &str,
        object: &str,
        upload_key: VersionKey,
    ) -> MetaResult<Multipart>;

    /// Open uploads of `bucket` under `prefix`, ordered by object name then
    /// upload key.
    async fn list_multiparts(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> MetaResult<Vec<Multipart>>;

    async fn get_freezer(
        &self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer>;

    /// Up to `limit` ledger entries strictly after `after`, in identity order.
    async fn scan_garbage_collection(
        &self,
        limit: usize,
        after: Option<&GcCursor>,
    ) -> MetaResult<Vec<GarbageCollection>>;

    /// Fast-tier residents ordered by `(bucket, name, version)`, strictly
    /// after `after`.
    async fn scan_hot_objects(
        &self,
        after: Option<&HotObject>,
        limit: usize,
    ) -> MetaResult<Vec<HotObject>>;

    async fn remove_from_garbage_collection(&self, cursor: &GcCursor) -> MetaResult<()> {
        let mut tx = self.begin().await?;
        tx.remove_garbage_collection(cursor).await?;
        tx.commit().await
    }

    async fn mark_garbage_collection_failed(&self, cursor: &GcCursor) -> MetaResult<()> {
        let mut tx = self.begin().await?;
        tx.increment_gc_tries(cursor).await?;
        tx.commit().await
    }
}

#[async_trait]
pub trait MetaTxn: Send {
    /// Same as [`MetaStore::get_object`], reading through this transaction.
    async fn get_object(
        &mut self,
        bucket: &str,
        name: &str,
        version: Option<VersionKey>,
    ) -> MetaResult<Object>;

    /// The row flagged as the null version of `(bucket, name)`.
    async fn get_null_version_object(&mut self, bucket: &str, name: &str) -> MetaResult<Object>;

    /// Insert an object row with its parts. Fast-tier objects also get a hot
    /// row.
    async fn put_object(&mut self, object: &Object) -> MetaResult<()>;

    /// Overwrite the payload columns of an existing row and replace its parts.
    async fn update_object(&mut self, object: &Object) -> MetaResult<()>;

    /// Grow an appendable object: size, etag and timestamp only.
    async fn update_append_object(&mut self, object: &Object) -> MetaResult<()>;

    async fn update_object_acl(&mut self, object: &Object) -> MetaResult<()>;

    /// Content type, custom attributes and storage class.
    async fn update_object_attrs(&mut self, object: &Object) -> MetaResult<()>;

    /// Move a row and its parts to `new_name`.
    async fn rename_object(&mut self, object: &Object, new_name: &str) -> MetaResult<()>;

    /// Remove a row, its parts and its hot row.
    async fn delete_object(&mut self, object: &Object) -> MetaResult<()>;

    /// Repoint an object to a new blob. Fails with `NoSuchKey` unless the row
    /// still has the blob id, size and etag of `previous`, the state the new
    /// blob was copied from. Also drops the hot row.
    async fn migrate_object(&mut self, object: &Object, previous: &Object) -> MetaResult<()>;

    /// Apply a signed delta to the bucket usage counter.
    async fn update_usage(&mut self, bucket: &str, delta: i64) -> MetaResult<()>;

    async fn put_objmap(&mut self, objmap: &ObjMap) -> MetaResult<()>;

    async fn delete_objmap(&mut self, bucket: &str, name: &str) -> MetaResult<()>;

    /// Enqueue an orphaned blob. Re-enqueuing the same blob under the same
    /// identity is a no-op; a different blob under the same identity is a
    /// `Conflict`.
    async fn put_garbage_collection(&mut self, entry: &GarbageCollection) -> MetaResult<()>;

    async fn remove_garbage_collection(&mut self, cursor: &GcCursor) -> MetaResult<()>;

    async fn increment_gc_tries(&mut self, cursor: &GcCursor) -> MetaResult<()>;

    /// Upload session row, without its parts.
    async fn put_multipart(&mut self, multipart: &Multipart) -> MetaResult<()>;

    async fn get_multipart(
        &mut self,
        bucket: &str,
        object: &str,
        upload_key: VersionKey,
    ) -> MetaResult<Multipart>;

    /// Insert or replace one part of an upload.
    async fn put_multipart_part(&mut self, multipart: &Multipart, part: &Part) -> MetaResult<()>;

    /// Remove an upload session and its standalone parts.
    async fn delete_multipart(&mut self, multipart: &Multipart) -> MetaResult<()>;

    async fn get_freezer(
        &mut self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer>;

    async fn put_freezer(&mut self, freezer: &Freezer) -> MetaResult<()>;

    async fn delete_freezer(&mut self, freezer: &Freezer) -> MetaResult<()>;

    async fn put_hot_object(&mut self, hot: &HotObject) -> MetaResult<()>;

    async fn remove_hot_object(&mut self, hot: &HotObject) -> MetaResult<()>;

    async fn commit(self: Box<Self>) -> MetaResult<()>;

    async fn abort(self: Box<Self>) -> MetaResult<()>;
}
