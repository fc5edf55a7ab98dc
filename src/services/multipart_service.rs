//! Multipart upload bookkeeping and completion.

use super::object_service::{ObjectService, ensure_key_safe};
use crate::errors::{MetaError, MetaResult};
use crate::models::{
    bucket::{Bucket, Versioning},
    gc::GarbageCollection,
    multipart::{CompletePart, Multipart, MultipartMetadata, Part},
    object::{ObjMap, Object, ObjectType},
    version::VersionKey,
};
use crate::store::listing::MAX_LIST_KEYS;
use md5::Context;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Smallest size every part but the last must reach.
pub const MIN_PART_SIZE: i64 = 5 << 20;
pub const MAX_PART_NUMBER: u32 = 10_000;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct MultipartService {
    objects: ObjectService,
    min_part_size: i64,
}

impl MultipartService {
    pub fn new(objects: ObjectService) -> Self {
        Self {
            objects,
            min_part_size: MIN_PART_SIZE,
        }
    }

    pub fn with_min_part_size(mut self, min_part_size: i64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        mut metadata: MultipartMetadata,
    ) -> MetaResult<Multipart> {
        ensure_key_safe(object)?;
        if metadata.content_type.is_empty() {
            metadata.content_type = DEFAULT_CONTENT_TYPE.to_string();
        }
        let upload = Multipart::new(bucket, object, metadata);

        let mut tx = self.objects.store().begin().await?;
        tx.put_multipart(&upload).await?;
        tx.commit().await?;

        debug!("{}/{} upload {} started", bucket, object, upload.upload_id()?);
        Ok(upload)
    }

    pub async fn get_multipart(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> MetaResult<Multipart> {
        let upload_key = decode_upload_id(upload_id)?;
        self.objects
            .store()
            .get_multipart(bucket, object, upload_key)
            .await
    }

    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        max_uploads: usize,
    ) -> MetaResult<Vec<Multipart>> {
        self.objects
            .store()
            .list_multiparts(bucket, prefix, max_uploads.clamp(1, MAX_LIST_KEYS))
            .await
    }

    /// Record an uploaded part. Re-uploading a part number replaces the earlier
    /// part, whose blob is queued for collection in the same commit. Returns
    /// the replaced part.
    pub async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part: Part,
    ) -> MetaResult<Option<Part>> {
        if !(1..=MAX_PART_NUMBER).contains(&part.part_number) {
            return Err(MetaError::InvalidPart);
        }
        let upload_key = decode_upload_id(upload_id)?;

        let mut tx = self.objects.store().begin().await?;
        let multipart = tx.get_multipart(bucket, object, upload_key).await?;
        let replaced = multipart.parts.get(&part.part_number).cloned();
        tx.put_multipart_part(&multipart, &part).await?;

        let mut delta = part.size;
        if let Some(old) = &replaced {
            delta -= old.size;
            if old.blob_id != part.blob_id {
                tx.put_garbage_collection(&GarbageCollection::from_replaced_part(&multipart, old)?)
                    .await?;
            }
        }
        if self.objects.updates_usage() && delta != 0 {
            tx.update_usage(bucket, delta).await?;
        }
        tx.commit().await?;
        Ok(replaced)
    }

    /// Drop an upload; every uploaded part goes to the GC ledger.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> MetaResult<()> {
        let upload_key = decode_upload_id(upload_id)?;

        let mut tx = self.objects.store().begin().await?;
        let multipart = tx.get_multipart(bucket, object, upload_key).await?;
        tx.delete_multipart(&multipart).await?;
        if !multipart.parts.is_empty() {
            tx.put_garbage_collection(&GarbageCollection::from_multipart(&multipart)?)
                .await?;
            if self.objects.updates_usage() {
                tx.update_usage(bucket, -multipart.total_size()).await?;
            }
        }
        tx.commit().await?;

        info!(
            "{}/{} upload {} aborted, {} parts queued for collection",
            bucket,
            object,
            upload_id,
            multipart.parts.len()
        );
        Ok(())
    }

    /// Fold an upload into an object built from the listed `parts`.
    ///
    /// Part numbers must run 1, 2, 3, ...; each must exist with a matching
    /// etag, and all but the last must reach the minimum part size. Stored
    /// parts the client left out are queued for collection.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &Bucket,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> MetaResult<Object> {
        let upload_key = decode_upload_id(upload_id)?;
        let mut tx = self.objects.store().begin().await?;
        let multipart = tx.get_multipart(&bucket.name, object_name, upload_key).await?;

        let assembled = assemble_parts(&multipart, parts, self.min_part_size)?;
        let metadata = &multipart.metadata;
        let mut object = Object::new(&bucket.name, object_name)?;
        object.location = metadata.location.clone();
        object.pool = metadata.pool.clone();
        object.owner_id = metadata.owner_id.clone();
        object.size = assembled.size;
        object.etag = assembled.etag;
        object.content_type = metadata.content_type.clone();
        object.custom_attributes = metadata.attrs.clone();
        object.acl = metadata.acl.clone();
        object.sse_type = metadata.sse_type.clone();
        object.encryption_key = metadata.cipher_key.clone();
        object.object_type = ObjectType::Multipart;
        object.storage_class = metadata.storage_class;
        object.null_version = bucket.versioning != Versioning::Enabled;
        object.parts = assembled.parts;

        let replaced = if object.null_version {
            self.objects
                .replace_null_version(tx.as_mut(), &bucket.name, object_name)
                .await?
        } else {
            None
        };

        let mut unused = 0;
        for part in multipart.parts.values() {
            if object.parts.contains_key(&part.part_number) {
                continue;
            }
            tx.put_garbage_collection(&GarbageCollection::from_replaced_part(&multipart, part)?)
                .await?;
            unused += part.size;
        }
        if unused != 0 && self.objects.updates_usage() {
            tx.update_usage(&bucket.name, -unused).await?;
        }

        tx.put_object(&object).await?;
        if bucket.versioning == Versioning::Suspended {
            tx.put_objmap(&ObjMap::for_object(&object)).await?;
        }
        tx.delete_multipart(&multipart).await?;
        tx.commit().await?;

        if let Some(old) = &replaced {
            self.objects.invalidate(old).await;
        }
        self.objects.invalidate(&object).await;
        info!(
            "{} completed from {} parts, etag {}",
            object,
            object.parts.len(),
            object.etag
        );
        object.build_parts_index();
        Ok(object)
    }
}

struct AssembledParts {
    parts: BTreeMap<u32, Part>,
    size: i64,
    etag: String,
}

fn assemble_parts(
    multipart: &Multipart,
    requested: &[CompletePart],
    min_part_size: i64,
) -> MetaResult<AssembledParts> {
    if requested.is_empty() {
        return Err(MetaError::InvalidPart);
    }

    let mut digest = Context::new();
    let mut parts = BTreeMap::new();
    let mut offset = 0;
    for (idx, wanted) in requested.iter().enumerate() {
        if wanted.part_number as usize != idx + 1 {
            return Err(MetaError::InvalidPart);
        }
        let stored = multipart
            .parts
            .get(&wanted.part_number)
            .ok_or(MetaError::InvalidPart)?;
        let is_last = idx + 1 == requested.len();
        if !is_last && stored.size < min_part_size {
            return Err(MetaError::PartTooSmall {
                part_number: stored.part_number,
                size: stored.size,
                etag: stored.etag.clone(),
            });
        }
        if wanted.etag.trim_matches('"') != stored.etag {
            return Err(MetaError::InvalidPart);
        }
        let raw = hex::decode(&stored.etag).map_err(|_| MetaError::InvalidPart)?;
        digest.consume(&raw);

        let mut part = stored.clone();
        part.offset = offset;
        offset += part.size;
        parts.insert(part.part_number, part);
    }

    Ok(AssembledParts {
        parts,
        size: offset,
        etag: format!("{:x}-{}", digest.compute(), requested.len()),
    })
}

fn decode_upload_id(upload_id: &str) -> MetaResult<VersionKey> {
    match VersionKey::decode(upload_id) {
        Ok(key) if !key.is_null() => Ok(key),
        _ => Err(MetaError::NoSuchUpload),
    }
}
