//! SQLite metadata backend.
//!
//! Version keys are stored as their 20-digit zero-padded text form, so the
//! column's text order is the key order and newer versions come first.
//! Queries are written once against `&mut SqliteConnection` and run either on
//! a pooled connection or inside a transaction.

use super::{MetaStore, MetaTxn, ObjectEntry, ScanPosition};
use crate::errors::{MetaError, MetaResult};
use crate::models::{
    bucket::Bucket,
    freezer::{Freezer, FreezerStatus},
    gc::{GarbageCollection, GcCursor, GcStatus},
    multipart::{Multipart, MultipartMetadata, Part},
    object::{Acl, HotObject, ObjMap, Object, ObjectType},
    version::VersionKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "bucket_name, name, version, location, pool, owner_id, size, \
     blob_id, last_modified, etag, content_type, custom_attributes, acl, null_version, \
     delete_marker, sse_type, encryption_key, initialization_vector, object_type, storage_class";

const PART_COLUMNS: &str =
    "part_number, size, blob_id, part_offset, etag, last_modified, initialization_vector";

/// Part rows live in three tables that differ only in their parent key column.
#[derive(Clone, Copy)]
enum PartTable {
    Object,
    Multipart,
    Gc,
}

impl PartTable {
    fn table(self) -> &'static str {
        match self {
            PartTable::Object => "object_parts",
            PartTable::Multipart => "multipart_parts",
            PartTable::Gc => "gc_parts",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            PartTable::Multipart => "upload_key",
            PartTable::Object | PartTable::Gc => "version",
        }
    }
}

#[derive(FromRow)]
struct BucketRow {
    name: String,
    owner_id: String,
    created_at: DateTime<Utc>,
    versioning: String,
    usage_bytes: i64,
}

impl BucketRow {
    fn into_bucket(self) -> MetaResult<Bucket> {
        Ok(Bucket {
            versioning: self.versioning.parse().map_err(MetaError::Conflict)?,
            name: self.name,
            owner_id: self.owner_id,
            created_at: self.created_at,
            usage: self.usage_bytes,
        })
    }
}

#[derive(FromRow)]
struct ObjectRow {
    bucket_name: String,
    name: String,
    version: String,
    location: String,
    pool: String,
    owner_id: String,
    size: i64,
    blob_id: String,
    last_modified: DateTime<Utc>,
    etag: String,
    content_type: String,
    custom_attributes: String,
    acl: String,
    null_version: bool,
    delete_marker: bool,
    sse_type: String,
    encryption_key: Vec<u8>,
    initialization_vector: Vec<u8>,
    object_type: i64,
    storage_class: String,
}

impl ObjectRow {
    fn into_object(self) -> MetaResult<Object> {
        Ok(Object {
            version: self.version.parse()?,
            custom_attributes: serde_json::from_str(&self.custom_attributes)?,
            acl: serde_json::from_str::<Acl>(&self.acl)?,
            object_type: ObjectType::from_i64(self.object_type),
            storage_class: self.storage_class.parse().map_err(MetaError::Conflict)?,
            bucket_name: self.bucket_name,
            name: self.name,
            location: self.location,
            pool: self.pool,
            owner_id: self.owner_id,
            size: self.size,
            blob_id: self.blob_id,
            last_modified: self.last_modified,
            etag: self.etag,
            content_type: self.content_type,
            null_version: self.null_version,
            delete_marker: self.delete_marker,
            sse_type: self.sse_type,
            encryption_key: self.encryption_key,
            initialization_vector: self.initialization_vector,
            parts: BTreeMap::new(),
            parts_index: None,
        })
    }
}

#[derive(FromRow)]
struct PartRow {
    part_number: i64,
    size: i64,
    blob_id: String,
    part_offset: i64,
    etag: String,
    last_modified: DateTime<Utc>,
    initialization_vector: Vec<u8>,
}

impl PartRow {
    fn into_part(self) -> MetaResult<Part> {
        Ok(Part {
            part_number: u32::try_from(self.part_number).map_err(|_| MetaError::InvalidPart)?,
            size: self.size,
            blob_id: self.blob_id,
            offset: self.part_offset,
            etag: self.etag,
            last_modified: self.last_modified,
            initialization_vector: self.initialization_vector,
        })
    }
}

#[derive(FromRow)]
struct EntryRow {
    name: String,
    version: String,
    null_version: bool,
    delete_marker: bool,
}

#[derive(FromRow)]
struct MultipartRow {
    bucket_name: String,
    object_name: String,
    initiated: DateTime<Utc>,
    metadata: String,
}

impl MultipartRow {
    fn into_multipart(self) -> MetaResult<Multipart> {
        Ok(Multipart {
            metadata: serde_json::from_str::<MultipartMetadata>(&self.metadata)?,
            bucket_name: self.bucket_name,
            object_name: self.object_name,
            initiated: self.initiated,
            parts: BTreeMap::new(),
        })
    }
}

#[derive(FromRow)]
struct GcRow {
    bucket_name: String,
    object_name: String,
    version: String,
    location: String,
    pool: String,
    blob_id: String,
    mtime: DateTime<Utc>,
    tried_times: i64,
}

impl GcRow {
    fn into_entry(self) -> MetaResult<GarbageCollection> {
        Ok(GarbageCollection {
            version: self.version.parse()?,
            bucket_name: self.bucket_name,
            object_name: self.object_name,
            location: self.location,
            pool: self.pool,
            blob_id: self.blob_id,
            status: GcStatus::Pending,
            mtime: self.mtime,
            tried_times: u32::try_from(self.tried_times).unwrap_or(u32::MAX),
            parts: BTreeMap::new(),
        })
    }
}

#[derive(FromRow)]
struct FreezerRow {
    bucket_name: String,
    object_name: String,
    version: String,
    status: i64,
    life_time: i32,
    location: String,
    pool: String,
    owner_id: String,
    size: i64,
    blob_id: String,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl FreezerRow {
    fn into_freezer(self) -> MetaResult<Freezer> {
        Ok(Freezer {
            version: self.version.parse()?,
            status: FreezerStatus::from_i64(self.status),
            bucket_name: self.bucket_name,
            name: self.object_name,
            life_time: self.life_time,
            location: self.location,
            pool: self.pool,
            owner_id: self.owner_id,
            size: self.size,
            blob_id: self.blob_id,
            etag: self.etag,
            last_modified: self.last_modified,
        })
    }
}

#[derive(FromRow)]
struct HotRow {
    bucket_name: String,
    name: String,
    version: String,
    location: String,
    pool: String,
    blob_id: String,
    size: i64,
    last_modified: DateTime<Utc>,
}

impl HotRow {
    fn into_hot(self) -> MetaResult<HotObject> {
        Ok(HotObject {
            version: self.version.parse()?,
            bucket_name: self.bucket_name,
            name: self.name,
            location: self.location,
            pool: self.pool,
            blob_id: self.blob_id,
            size: self.size,
            last_modified: self.last_modified,
        })
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// --- shared queries -------------------------------------------------------

async fn fetch_parts(
    conn: &mut SqliteConnection,
    table: PartTable,
    bucket: &str,
    object: &str,
    key: VersionKey,
) -> MetaResult<BTreeMap<u32, Part>> {
    let sql = format!(
        "SELECT {PART_COLUMNS} FROM {} WHERE bucket_name = ? AND object_name = ? AND {} = ? \
         ORDER BY part_number",
        table.table(),
        table.key_column()
    );
    let rows: Vec<PartRow> = sqlx::query_as(&sql)
        .bind(bucket)
        .bind(object)
        .bind(key.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter()
        .map(|row| row.into_part().map(|part| (part.part_number, part)))
        .collect()
}

async fn insert_part(
    conn: &mut SqliteConnection,
    table: PartTable,
    bucket: &str,
    object: &str,
    key: VersionKey,
    part: &Part,
) -> MetaResult<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} (bucket_name, object_name, {}, {PART_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        table.table(),
        table.key_column()
    );
    sqlx::query(&sql)
        .bind(bucket)
        .bind(object)
        .bind(key.to_string())
        .bind(i64::from(part.part_number))
        .bind(part.size)
        .bind(&part.blob_id)
        .bind(part.offset)
        .bind(&part.etag)
        .bind(part.last_modified)
        .bind(&part.initialization_vector)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_parts(
    conn: &mut SqliteConnection,
    table: PartTable,
    bucket: &str,
    object: &str,
    key: VersionKey,
) -> MetaResult<()> {
    let sql = format!(
        "DELETE FROM {} WHERE bucket_name = ? AND object_name = ? AND {} = ?",
        table.table(),
        table.key_column()
    );
    sqlx::query(&sql)
        .bind(bucket)
        .bind(object)
        .bind(key.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fetch_object(
    conn: &mut SqliteConnection,
    bucket: &str,
    name: &str,
    version: Option<VersionKey>,
) -> MetaResult<Object> {
    let row: Option<ObjectRow> = match version {
        Some(version) => {
            sqlx::query_as(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects \
                 WHERE bucket_name = ? AND name = ? AND version = ?"
            ))
            .bind(bucket)
            .bind(name)
            .bind(version.to_string())
            .fetch_optional(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects \
                 WHERE bucket_name = ? AND name = ? ORDER BY version ASC LIMIT 1"
            ))
            .bind(bucket)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
        }
    };
    let mut object = row.ok_or(MetaError::NoSuchKey)?.into_object()?;
    object.parts = fetch_parts(conn, PartTable::Object, bucket, name, object.version).await?;
    Ok(object)
}

async fn fetch_multipart(
    conn: &mut SqliteConnection,
    bucket: &str,
    object: &str,
    upload_key: VersionKey,
) -> MetaResult<Multipart> {
    let row: Option<MultipartRow> = sqlx::query_as(
        "SELECT bucket_name, object_name, initiated, metadata FROM multiparts \
         WHERE bucket_name = ? AND object_name = ? AND upload_key = ?",
    )
    .bind(bucket)
    .bind(object)
    .bind(upload_key.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    let mut multipart = row.ok_or(MetaError::NoSuchUpload)?.into_multipart()?;
    multipart.parts = fetch_parts(conn, PartTable::Multipart, bucket, object, upload_key).await?;
    Ok(multipart)
}

async fn fetch_gc(
    conn: &mut SqliteConnection,
    cursor: &GcCursor,
) -> MetaResult<Option<GarbageCollection>> {
    let row: Option<GcRow> = sqlx::query_as(
        "SELECT bucket_name, object_name, version, location, pool, blob_id, mtime, tried_times \
         FROM gc WHERE bucket_name = ? AND object_name = ? AND version = ?",
    )
    .bind(&cursor.bucket_name)
    .bind(&cursor.object_name)
    .bind(cursor.version.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut entry = row.into_entry()?;
    entry.parts = fetch_parts(
        conn,
        PartTable::Gc,
        &entry.bucket_name,
        &entry.object_name,
        entry.version,
    )
    .await?;
    Ok(Some(entry))
}

async fn fetch_freezer(
    conn: &mut SqliteConnection,
    bucket: &str,
    name: &str,
    version: VersionKey,
) -> MetaResult<Freezer> {
    let row: Option<FreezerRow> = sqlx::query_as(
        "SELECT bucket_name, object_name, version, status, life_time, location, pool, owner_id, \
         size, blob_id, etag, last_modified FROM restore_objects \
         WHERE bucket_name = ? AND object_name = ? AND version = ?",
    )
    .bind(bucket)
    .bind(name)
    .bind(version.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or(MetaError::NoSuchKey)?.into_freezer()
}

async fn insert_hot(conn: &mut SqliteConnection, hot: &HotObject) -> MetaResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO hot_objects \
         (bucket_name, name, version, location, pool, blob_id, size, last_modified) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&hot.bucket_name)
    .bind(&hot.name)
    .bind(hot.version.to_string())
    .bind(&hot.location)
    .bind(&hot.pool)
    .bind(&hot.blob_id)
    .bind(hot.size)
    .bind(hot.last_modified)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_hot(
    conn: &mut SqliteConnection,
    bucket: &str,
    name: &str,
    version: VersionKey,
) -> MetaResult<()> {
    sqlx::query("DELETE FROM hot_objects WHERE bucket_name = ? AND name = ? AND version = ?")
        .bind(bucket)
        .bind(name)
        .bind(version.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- store ------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> MetaResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database with the schema applied. A single connection
    /// that never idles out, so the database lives as long as the pool.
    pub async fn connect_in_memory() -> MetaResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> MetaResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for SqliteStore {
    async fn begin(&self) -> MetaResult<Box<dyn MetaTxn>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTxn { tx }))
    }

    async fn ping(&self) -> MetaResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_bucket(&self, name: &str) -> MetaResult<Bucket> {
        let row: Option<BucketRow> = sqlx::query_as(
            "SELECT name, owner_id, created_at, versioning, usage_bytes FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| MetaError::NoSuchBucket(name.to_string()))?
            .into_bucket()
    }

    async fn put_bucket(&self, bucket: &Bucket) -> MetaResult<()> {
        sqlx::query(
            "INSERT INTO buckets (name, owner_id, created_at, versioning, usage_bytes) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                owner_id = excluded.owner_id, \
                versioning = excluded.versioning",
        )
        .bind(&bucket.name)
        .bind(&bucket.owner_id)
        .bind(bucket.created_at)
        .bind(bucket.versioning.as_str())
        .bind(bucket.usage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        version: Option<VersionKey>,
    ) -> MetaResult<Object> {
        let mut conn = self.pool.acquire().await?;
        fetch_object(&mut conn, bucket, name, version).await
    }

    async fn get_objmap(&self, bucket: &str, name: &str) -> MetaResult<ObjMap> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT null_ver_num FROM objmap WHERE bucket_name = ? AND object_name = ?",
        )
        .bind(bucket)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let (null_ver_num,) = row.ok_or(MetaError::NoSuchKey)?;
        Ok(ObjMap {
            bucket_name: bucket.to_string(),
            name: name.to_string(),
            null_ver_num: u64::try_from(null_ver_num).unwrap_or_default(),
        })
    }

    async fn scan_objects(
        &self,
        bucket: &str,
        prefix: &str,
        after: Option<&ScanPosition>,
        limit: usize,
    ) -> MetaResult<Vec<ObjectEntry>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT name, version, null_version, delete_marker FROM objects WHERE bucket_name = ",
        );
        builder.push_bind(bucket);
        if !prefix.is_empty() {
            builder.push(" AND substr(name, 1, length(");
            builder.push_bind(prefix);
            builder.push(")) = ");
            builder.push_bind(prefix);
        }
        match after {
            Some(ScanPosition {
                name,
                version: Some(version),
            }) => {
                builder.push(" AND (name, version) > (");
                builder.push_bind(name.as_str());
                builder.push(", ");
                builder.push_bind(version.to_string());
                builder.push(")");
            }
            Some(ScanPosition {
                name,
                version: None,
            }) => {
                builder.push(" AND name > ");
                builder.push_bind(name.as_str());
            }
            None => {}
        }
        builder.push(" ORDER BY name ASC, version ASC LIMIT ");
        builder.push_bind(sql_limit(limit));

        let rows: Vec<EntryRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                Ok(ObjectEntry {
                    version: row.version.parse()?,
                    name: row.name,
                    null_version: row.null_version,
                    delete_marker: row.delete_marker,
                })
            })
            .collect()
    }

    async fn get_multipart(
        &self,
        bucket: &str,
        object: &str,
        upload_key: VersionKey,
    ) -> MetaResult<Multipart> {
        let mut conn = self.pool.acquire().await?;
        fetch_multipart(&mut conn, bucket, object, upload_key).await
    }

    async fn list_multiparts(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> MetaResult<Vec<Multipart>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<MultipartRow> = sqlx::query_as(
            "SELECT bucket_name, object_name, initiated, metadata FROM multiparts \
             WHERE bucket_name = ? AND substr(object_name, 1, length(?)) = ? \
             ORDER BY object_name ASC, upload_key ASC LIMIT ?",
        )
        .bind(bucket)
        .bind(prefix)
        .bind(prefix)
        .bind(sql_limit(limit))
        .fetch_all(&mut *conn)
        .await?;

        let mut uploads = Vec::with_capacity(rows.len());
        for row in rows {
            let mut multipart = row.into_multipart()?;
            multipart.parts = fetch_parts(
                &mut conn,
                PartTable::Multipart,
                bucket,
                &multipart.object_name,
                multipart.upload_key()?,
            )
            .await?;
            uploads.push(multipart);
        }
        Ok(uploads)
    }

    async fn get_freezer(
        &self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer> {
        let mut conn = self.pool.acquire().await?;
        fetch_freezer(&mut conn, bucket, name, version).await
    }

    async fn scan_garbage_collection(
        &self,
        limit: usize,
        after: Option<&GcCursor>,
    ) -> MetaResult<Vec<GarbageCollection>> {
        let mut conn = self.pool.acquire().await?;
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT bucket_name, object_name, version, location, pool, blob_id, mtime, tried_times \
             FROM gc",
        );
        if let Some(cursor) = after {
            builder.push(" WHERE (bucket_name, object_name, version) > (");
            builder.push_bind(cursor.bucket_name.as_str());
            builder.push(", ");
            builder.push_bind(cursor.object_name.as_str());
            builder.push(", ");
            builder.push_bind(cursor.version.to_string());
            builder.push(")");
        }
        builder.push(" ORDER BY bucket_name ASC, object_name ASC, version ASC LIMIT ");
        builder.push_bind(sql_limit(limit));
        let rows: Vec<GcRow> = builder.build_query_as().fetch_all(&mut *conn).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = row.into_entry()?;
            entry.parts = fetch_parts(
                &mut conn,
                PartTable::Gc,
                &entry.bucket_name,
                &entry.object_name,
                entry.version,
            )
            .await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn scan_hot_objects(
        &self,
        after: Option<&HotObject>,
        limit: usize,
    ) -> MetaResult<Vec<HotObject>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT bucket_name, name, version, location, pool, blob_id, size, last_modified \
             FROM hot_objects",
        );
        if let Some(hot) = after {
            builder.push(" WHERE (bucket_name, name, version) > (");
            builder.push_bind(hot.bucket_name.as_str());
            builder.push(", ");
            builder.push_bind(hot.name.as_str());
            builder.push(", ");
            builder.push_bind(hot.version.to_string());
            builder.push(")");
        }
        builder.push(" ORDER BY bucket_name ASC, name ASC, version ASC LIMIT ");
        builder.push_bind(sql_limit(limit));
        let rows: Vec<HotRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(HotRow::into_hot).collect()
    }
}

// --- transaction ------------------------------------------------------------

pub struct SqliteTxn {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteTxn {
    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[async_trait]
impl MetaTxn for SqliteTxn {
    async fn get_object(
        &mut self,
        bucket: &str,
        name: &str,
        version: Option<VersionKey>,
    ) -> MetaResult<Object> {
        fetch_object(self.conn(), bucket, name, version).await
    }

    async fn get_null_version_object(&mut self, bucket: &str, name: &str) -> MetaResult<Object> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT version FROM objects \
             WHERE bucket_name = ? AND name = ? AND null_version = 1 \
             ORDER BY version ASC LIMIT 1",
        )
        .bind(bucket)
        .bind(name)
        .fetch_optional(self.conn())
        .await?;
        let (version,) = row.ok_or(MetaError::NoSuchKey)?;
        fetch_object(self.conn(), bucket, name, Some(version.parse()?)).await
    }

    async fn put_object(&mut self, object: &Object) -> MetaResult<()> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO objects ({OBJECT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(object.version.to_string())
        .bind(&object.location)
        .bind(&object.pool)
        .bind(&object.owner_id)
        .bind(object.size)
        .bind(&object.blob_id)
        .bind(object.last_modified)
        .bind(&object.etag)
        .bind(&object.content_type)
        .bind(serde_json::to_string(&object.custom_attributes)?)
        .bind(serde_json::to_string(&object.acl)?)
        .bind(object.null_version)
        .bind(object.delete_marker)
        .bind(&object.sse_type)
        .bind(&object.encryption_key)
        .bind(&object.initialization_vector)
        .bind(object.object_type.as_i64())
        .bind(object.storage_class.as_str())
        .execute(self.conn())
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(MetaError::Conflict(format!(
                    "object {}/{} version {} already exists",
                    object.bucket_name, object.name, object.version
                )));
            }
            Err(err) => return Err(err.into()),
        }

        for part in object.parts.values() {
            insert_part(
                self.conn(),
                PartTable::Object,
                &object.bucket_name,
                &object.name,
                object.version,
                part,
            )
            .await?;
        }
        if object.is_hot() {
            insert_hot(self.conn(), &HotObject::from_object(object)).await?;
        }
        Ok(())
    }

    async fn update_object(&mut self, object: &Object) -> MetaResult<()> {
        let updated = sqlx::query(
            "UPDATE objects SET location = ?, pool = ?, owner_id = ?, size = ?, blob_id = ?, \
             last_modified = ?, etag = ?, content_type = ?, custom_attributes = ?, acl = ?, \
             delete_marker = ?, sse_type = ?, encryption_key = ?, initialization_vector = ?, \
             object_type = ?, storage_class = ? \
             WHERE bucket_name = ? AND name = ? AND version = ?",
        )
        .bind(&object.location)
        .bind(&object.pool)
        .bind(&object.owner_id)
        .bind(object.size)
        .bind(&object.blob_id)
        .bind(object.last_modified)
        .bind(&object.etag)
        .bind(&object.content_type)
        .bind(serde_json::to_string(&object.custom_attributes)?)
        .bind(serde_json::to_string(&object.acl)?)
        .bind(object.delete_marker)
        .bind(&object.sse_type)
        .bind(&object.encryption_key)
        .bind(&object.initialization_vector)
        .bind(object.object_type.as_i64())
        .bind(object.storage_class.as_str())
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(object.version.to_string())
        .execute(self.conn())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MetaError::NoSuchKey);
        }

        delete_parts(
            self.conn(),
            PartTable::Object,
            &object.bucket_name,
            &object.name,
            object.version,
        )
        .await?;
        for part in object.parts.values() {
            insert_part(
                self.conn(),
                PartTable::Object,
                &object.bucket_name,
                &object.name,
                object.version,
                part,
            )
            .await?;
        }
        Ok(())
    }

    async fn update_append_object(&mut self, object: &Object) -> MetaResult<()> {
        let updated = sqlx::query(
            "UPDATE objects SET size = ?, etag = ?, last_modified = ? \
             WHERE bucket_name = ? AND name = ? AND version = ?",
        )
        .bind(object.size)
        .bind(&object.etag)
        .bind(object.last_modified)
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(object.version.to_string())
        .execute(self.conn())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MetaError::NoSuchKey);
        }
        Ok(())
    }

    async fn update_object_acl(&mut self, object: &Object) -> MetaResult<()> {
        let updated = sqlx::query(
            "UPDATE objects SET acl = ? WHERE bucket_name = ? AND name = ? AND version = ?",
        )
        .bind(serde_json::to_string(&object.acl)?)
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(object.version.to_string())
        .execute(self.conn())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MetaError::NoSuchKey);
        }
        Ok(())
    }

    async fn update_object_attrs(&mut self, object: &Object) -> MetaResult<()> {
        let updated = sqlx::query(
            "UPDATE objects SET content_type = ?, custom_attributes = ?, storage_class = ? \
             WHERE bucket_name = ? AND name = ? AND version = ?",
        )
        .bind(&object.content_type)
        .bind(serde_json::to_string(&object.custom_attributes)?)
        .bind(object.storage_class.as_str())
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(object.version.to_string())
        .execute(self.conn())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MetaError::NoSuchKey);
        }
        Ok(())
    }

    async fn rename_object(&mut self, object: &Object, new_name: &str) -> MetaResult<()> {
        let version = object.version.to_string();
        let renamed = sqlx::query(
            "UPDATE objects SET name = ? WHERE bucket_name = ? AND name = ? AND version = ?",
        )
        .bind(new_name)
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(&version)
        .execute(self.conn())
        .await;
        match renamed {
            Ok(done) if done.rows_affected() == 0 => return Err(MetaError::NoSuchKey),
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(MetaError::Conflict(format!(
                    "object {}/{} version {} already exists",
                    object.bucket_name, new_name, object.version
                )));
            }
            Err(err) => return Err(err.into()),
        }

        sqlx::query(
            "UPDATE object_parts SET object_name = ? \
             WHERE bucket_name = ? AND object_name = ? AND version = ?",
        )
        .bind(new_name)
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(&version)
        .execute(self.conn())
        .await?;
        sqlx::query(
            "UPDATE hot_objects SET name = ? WHERE bucket_name = ? AND name = ? AND version = ?",
        )
        .bind(new_name)
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(&version)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn delete_object(&mut self, object: &Object) -> MetaResult<()> {
        let deleted =
            sqlx::query("DELETE FROM objects WHERE bucket_name = ? AND name = ? AND version = ?")
                .bind(&object.bucket_name)
                .bind(&object.name)
                .bind(object.version.to_string())
                .execute(self.conn())
                .await?;
        if deleted.rows_affected() == 0 {
            return Err(MetaError::NoSuchKey);
        }
        delete_parts(
            self.conn(),
            PartTable::Object,
            &object.bucket_name,
            &object.name,
            object.version,
        )
        .await?;
        delete_hot(self.conn(), &object.bucket_name, &object.name, object.version).await
    }

    async fn migrate_object(&mut self, object: &Object, previous: &Object) -> MetaResult<()> {
        let updated = sqlx::query(
            "UPDATE objects SET location = ?, pool = ?, blob_id = ? \
             WHERE bucket_name = ? AND name = ? AND version = ? \
             AND blob_id = ? AND size = ? AND etag = ?",
        )
        .bind(&object.location)
        .bind(&object.pool)
        .bind(&object.blob_id)
        .bind(&object.bucket_name)
        .bind(&object.name)
        .bind(object.version.to_string())
        .bind(&previous.blob_id)
        .bind(previous.size)
        .bind(&previous.etag)
        .execute(self.conn())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MetaError::NoSuchKey);
        }
        delete_hot(self.conn(), &object.bucket_name, &object.name, object.version).await
    }

    async fn update_usage(&mut self, bucket: &str, delta: i64) -> MetaResult<()> {
        sqlx::query("UPDATE buckets SET usage_bytes = usage_bytes + ? WHERE name = ?")
            .bind(delta)
            .bind(bucket)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn put_objmap(&mut self, objmap: &ObjMap) -> MetaResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO objmap (bucket_name, object_name, null_ver_num) VALUES (?, ?, ?)",
        )
        .bind(&objmap.bucket_name)
        .bind(&objmap.name)
        .bind(i64::try_from(objmap.null_ver_num).unwrap_or(i64::MAX))
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn delete_objmap(&mut self, bucket: &str, name: &str) -> MetaResult<()> {
        sqlx::query("DELETE FROM objmap WHERE bucket_name = ? AND object_name = ?")
            .bind(bucket)
            .bind(name)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn put_garbage_collection(&mut self, entry: &GarbageCollection) -> MetaResult<()> {
        let inserted = sqlx::query(
            "INSERT INTO gc (bucket_name, object_name, version, location, pool, blob_id, status, \
             mtime, tried_times) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(bucket_name, object_name, version) DO NOTHING",
        )
        .bind(&entry.bucket_name)
        .bind(&entry.object_name)
        .bind(entry.version.to_string())
        .bind(&entry.location)
        .bind(&entry.pool)
        .bind(&entry.blob_id)
        .bind(entry.status.as_str())
        .bind(entry.mtime)
        .bind(i64::from(entry.tried_times))
        .execute(self.conn())
        .await?;

        if inserted.rows_affected() == 0 {
            let existing = fetch_gc(self.conn(), &entry.cursor()).await?;
            return match existing {
                Some(existing) if existing.blob_ids() == entry.blob_ids() => Ok(()),
                _ => Err(MetaError::Conflict(format!(
                    "gc entry {}/{} version {} already holds other blobs",
                    entry.bucket_name, entry.object_name, entry.version
                ))),
            };
        }

        for part in entry.parts.values() {
            insert_part(
                self.conn(),
                PartTable::Gc,
                &entry.bucket_name,
                &entry.object_name,
                entry.version,
                part,
            )
            .await?;
        }
        Ok(())
    }

    async fn remove_garbage_collection(&mut self, cursor: &GcCursor) -> MetaResult<()> {
        sqlx::query("DELETE FROM gc WHERE bucket_name = ? AND object_name = ? AND version = ?")
            .bind(&cursor.bucket_name)
            .bind(&cursor.object_name)
            .bind(cursor.version.to_string())
            .execute(self.conn())
            .await?;
        delete_parts(
            self.conn(),
            PartTable::Gc,
            &cursor.bucket_name,
            &cursor.object_name,
            cursor.version,
        )
        .await
    }

    async fn increment_gc_tries(&mut self, cursor: &GcCursor) -> MetaResult<()> {
        sqlx::query(
            "UPDATE gc SET tried_times = tried_times + 1, mtime = ? \
             WHERE bucket_name = ? AND object_name = ? AND version = ?",
        )
        .bind(Utc::now())
        .bind(&cursor.bucket_name)
        .bind(&cursor.object_name)
        .bind(cursor.version.to_string())
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn put_multipart(&mut self, multipart: &Multipart) -> MetaResult<()> {
        let inserted = sqlx::query(
            "INSERT INTO multiparts (bucket_name, object_name, upload_key, initiated, metadata) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&multipart.bucket_name)
        .bind(&multipart.object_name)
        .bind(multipart.upload_key()?.to_string())
        .bind(multipart.initiated)
        .bind(serde_json::to_string(&multipart.metadata)?)
        .execute(self.conn())
        .await;
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(MetaError::Conflict(format!(
                "upload {}/{} initiated at {} already exists",
                multipart.bucket_name, multipart.object_name, multipart.initiated
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_multipart(
        &mut self,
        bucket: &str,
        object: &str,
        upload_key: VersionKey,
    ) -> MetaResult<Multipart> {
        fetch_multipart(self.conn(), bucket, object, upload_key).await
    }

    async fn put_multipart_part(&mut self, multipart: &Multipart, part: &Part) -> MetaResult<()> {
        let upload_key = multipart.upload_key()?;
        let exists: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM multiparts WHERE bucket_name = ? AND object_name = ? AND upload_key = ?",
        )
        .bind(&multipart.bucket_name)
        .bind(&multipart.object_name)
        .bind(upload_key.to_string())
        .fetch_optional(self.conn())
        .await?;
        if exists.is_none() {
            return Err(MetaError::NoSuchUpload);
        }
        insert_part(
            self.conn(),
            PartTable::Multipart,
            &multipart.bucket_name,
            &multipart.object_name,
            upload_key,
            part,
        )
        .await
    }

    async fn delete_multipart(&mut self, multipart: &Multipart) -> MetaResult<()> {
        let upload_key = multipart.upload_key()?;
        let deleted = sqlx::query(
            "DELETE FROM multiparts WHERE bucket_name = ? AND object_name = ? AND upload_key = ?",
        )
        .bind(&multipart.bucket_name)
        .bind(&multipart.object_name)
        .bind(upload_key.to_string())
        .execute(self.conn())
        .await?;
        if deleted.rows_affected() == 0 {
            return Err(MetaError::NoSuchUpload);
        }
        delete_parts(
            self.conn(),
            PartTable::Multipart,
            &multipart.bucket_name,
            &multipart.object_name,
            upload_key,
        )
        .await
    }

    async fn get_freezer(
        &mut self,
        bucket: &str,
        name: &str,
        version: VersionKey,
    ) -> MetaResult<Freezer> {
        fetch_freezer(self.conn(), bucket, name, version).await
    }

    async fn put_freezer(&mut self, freezer: &Freezer) -> MetaResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO restore_objects (bucket_name, object_name, version, status, \
             life_time, location, pool, owner_id, size, blob_id, etag, last_modified) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&freezer.bucket_name)
        .bind(&freezer.name)
        .bind(freezer.version.to_string())
        .bind(freezer.status.as_i64())
        .bind(freezer.life_time)
        .bind(&freezer.location)
        .bind(&freezer.pool)
        .bind(&freezer.owner_id)
        .bind(freezer.size)
        .bind(&freezer.blob_id)
        .bind(&freezer.etag)
        .bind(freezer.last_modified)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn delete_freezer(&mut self, freezer: &Freezer) -> MetaResult<()> {
        sqlx::query(
            "DELETE FROM restore_objects WHERE bucket_name = ? AND object_name = ? AND version = ?",
        )
        .bind(&freezer.bucket_name)
        .bind(&freezer.name)
        .bind(freezer.version.to_string())
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn put_hot_object(&mut self, hot: &HotObject) -> MetaResult<()> {
        insert_hot(self.conn(), hot).await
    }

    async fn remove_hot_object(&mut self, hot: &HotObject) -> MetaResult<()> {
        delete_hot(self.conn(), &hot.bucket_name, &hot.name, hot.version).await
    }

    async fn commit(self: Box<Self>) -> MetaResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MetaResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::multipart::MultipartMetadata;
    use crate::models::object::{CAPACITY_POOL, FAST_POOL};
    use chrono::Duration;

    fn object(name: &str, offset_secs: i64) -> Object {
        let created = Utc::now() - Duration::seconds(100) + Duration::seconds(offset_secs);
        let mut object = Object::created_at("bkt", name, created).unwrap();
        object.location = "local".into();
        object.pool = FAST_POOL.into();
        object.blob_id = format!("blob-{name}-{offset_secs}");
        object.size = 10;
        object.etag = "etag".into();
        object.custom_attributes.insert("x-amz-meta-a".into(), "1".into());
        object
    }

    fn part(number: u32, size: i64) -> Part {
        Part {
            part_number: number,
            size,
            blob_id: format!("part-{number}"),
            offset: 0,
            etag: format!("etag-{number}"),
            last_modified: Utc::now(),
            initialization_vector: Vec::new(),
        }
    }

    async fn store_with_bucket() -> SqliteStore {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        store.put_bucket(&Bucket::new("bkt", "owner")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn object_round_trips_with_parts_and_hot_row() {
        let store = store_with_bucket().await;
        let mut obj = object("k", 0);
        obj.parts.insert(1, part(1, 6));
        obj.parts.insert(2, part(2, 4));

        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.update_usage("bkt", obj.size).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_object("bkt", "k", None).await.unwrap();
        assert_eq!(stored.version, obj.version);
        assert_eq!(stored.custom_attributes, obj.custom_attributes);
        assert_eq!(stored.parts.len(), 2);
        assert_eq!(stored.parts[&2].blob_id, "part-2");
        assert_eq!(store.get_bucket("bkt").await.unwrap().usage, 10);

        let hot = store.scan_hot_objects(None, 10).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].blob_id, obj.blob_id);
        assert!(store.scan_hot_objects(Some(&hot[0]), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_version_is_a_conflict() {
        let store = store_with_bucket().await;
        let obj = object("k", 0);
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        let err = tx.put_object(&obj).await.unwrap_err();
        assert!(matches!(err, MetaError::Conflict(_)));
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_nothing_behind() {
        let store = store_with_bucket().await;
        let obj = object("k", 0);

        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.update_usage("bkt", obj.size).await.unwrap();
        tx.put_garbage_collection(&GarbageCollection::from_object(&obj))
            .await
            .unwrap();
        tx.abort().await.unwrap();

        assert!(store.get_object("bkt", "k", None).await.unwrap_err().is_not_found());
        assert_eq!(store.get_bucket("bkt").await.unwrap().usage, 0);
        assert!(store.scan_garbage_collection(10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gc_ledger_pages_by_cursor_and_keeps_parts() {
        let store = store_with_bucket().await;
        let mut first = object("a", 0);
        first.parts.insert(1, part(1, 5));
        let second = object("b", 0);

        let mut tx = store.begin().await.unwrap();
        tx.put_garbage_collection(&GarbageCollection::from_object(&second))
            .await
            .unwrap();
        tx.put_garbage_collection(&GarbageCollection::from_object(&first))
            .await
            .unwrap();
        // same blobs again: no-op
        tx.put_garbage_collection(&GarbageCollection::from_object(&first))
            .await
            .unwrap();
        let mut clash = GarbageCollection::from_object(&first);
        clash.blob_id = "other".into();
        assert!(matches!(
            tx.put_garbage_collection(&clash).await,
            Err(MetaError::Conflict(_))
        ));
        tx.commit().await.unwrap();

        let page = store.scan_garbage_collection(1, None).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].object_name, "a");
        assert_eq!(page[0].blob_ids(), vec!["blob-a-0", "part-1"]);

        let cursor = page[0].cursor();
        store.mark_garbage_collection_failed(&cursor).await.unwrap();
        let page = store.scan_garbage_collection(10, Some(&cursor)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].object_name, "b");

        store.remove_from_garbage_collection(&cursor).await.unwrap();
        let all = store.scan_garbage_collection(10, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tried_times, 0);
    }

    #[tokio::test]
    async fn migrate_object_checks_previous_blob() {
        let store = store_with_bucket().await;
        let obj = object("k", 0);
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.commit().await.unwrap();

        let mut moved = obj.clone();
        moved.pool = CAPACITY_POOL.into();
        moved.blob_id = "fresh".into();
        let mut stale = obj.clone();
        stale.blob_id = "stale".into();
        let mut appended_since = obj.clone();
        appended_since.size -= 4;
        let mut tx = store.begin().await.unwrap();
        assert!(tx.migrate_object(&moved, &stale).await.unwrap_err().is_not_found());
        assert!(
            tx.migrate_object(&moved, &appended_since)
                .await
                .unwrap_err()
                .is_not_found()
        );
        tx.migrate_object(&moved, &obj).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_object("bkt", "k", Some(obj.version)).await.unwrap();
        assert_eq!(stored.pool, CAPACITY_POOL);
        assert_eq!(stored.blob_id, "fresh");
        assert!(store.scan_hot_objects(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multipart_parts_are_replaced_in_place() {
        let store = store_with_bucket().await;
        let upload = Multipart::new("bkt", "big", MultipartMetadata::default());
        let mut tx = store.begin().await.unwrap();
        tx.put_multipart(&upload).await.unwrap();
        tx.put_multipart_part(&upload, &part(1, 5)).await.unwrap();
        let mut replacement = part(1, 7);
        replacement.blob_id = "part-1-again".into();
        tx.put_multipart_part(&upload, &replacement).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store
            .get_multipart("bkt", "big", upload.upload_key().unwrap())
            .await
            .unwrap();
        assert_eq!(stored.parts.len(), 1);
        assert_eq!(stored.parts[&1].blob_id, "part-1-again");
        assert_eq!(store.list_multiparts("bkt", "b", 10).await.unwrap().len(), 1);
        assert!(store.list_multiparts("bkt", "x", 10).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.delete_multipart(&stored).await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            store
                .get_multipart("bkt", "big", upload.upload_key().unwrap())
                .await,
            Err(MetaError::NoSuchUpload)
        ));
    }

    #[tokio::test]
    async fn rename_moves_row_and_parts() {
        let store = store_with_bucket().await;
        let mut obj = object("old", 0);
        obj.parts.insert(1, part(1, 10));
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&obj).await.unwrap();
        tx.rename_object(&obj, "new").await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.get_object("bkt", "old", None).await.unwrap_err().is_not_found());
        let renamed = store.get_object("bkt", "new", None).await.unwrap();
        assert_eq!(renamed.parts.len(), 1);
        assert_eq!(store.scan_hot_objects(None, 10).await.unwrap()[0].name, "new");
    }

    #[tokio::test]
    async fn scan_objects_filters_prefix_in_order() {
        let store = store_with_bucket().await;
        let mut tx = store.begin().await.unwrap();
        for (name, secs) in [("dir/a", 0), ("dir/a", 5), ("dir/b", 0), ("other", 0)] {
            tx.put_object(&object(name, secs)).await.unwrap();
        }
        tx.commit().await.unwrap();

        let entries = store.scan_objects("bkt", "dir/", None, 10).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dir/a", "dir/a", "dir/b"]);
        assert!(entries[0].version < entries[1].version);

        let after = ScanPosition::after_version("dir/a", entries[0].version);
        let rest = store.scan_objects("bkt", "dir/", Some(&after), 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].version, entries[1].version);
    }
}
