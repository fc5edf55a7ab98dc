//! Read-only operator endpoints.
//!
//! Ledger pages are addressed by an opaque `cursor` token: the base64 form of
//! the last entry's `bucket \n object \n version` identity.

use crate::{
    errors::AppError,
    models::gc::{GarbageCollection, GcCursor},
    routes::AppState,
    services::migration_service::MigrationStatsSnapshot,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};

const DEFAULT_GC_PAGE: usize = 100;
const MAX_GC_PAGE: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct GcQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GcPage {
    pub entries: Vec<GarbageCollection>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct BucketUsage {
    pub bucket: String,
    pub usage: i64,
}

/// `GET /admin/gc?limit&cursor`
pub async fn list_garbage(
    State(state): State<AppState>,
    Query(query): Query<GcQuery>,
) -> Result<Json<GcPage>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_GC_PAGE).clamp(1, MAX_GC_PAGE);
    let after = query.cursor.as_deref().map(decode_cursor).transpose()?;

    let entries = state
        .store()
        .scan_garbage_collection(limit, after.as_ref())
        .await?;
    let next_cursor = (entries.len() == limit)
        .then(|| entries.last().map(|entry| encode_cursor(&entry.cursor())))
        .flatten();
    Ok(Json(GcPage {
        entries,
        next_cursor,
    }))
}

/// `GET /admin/buckets/{bucket}/usage`
///
/// Always read from the store, never from the metadata cache.
pub async fn bucket_usage(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketUsage>, AppError> {
    let stored = state.store().get_bucket(&bucket).await?;
    Ok(Json(BucketUsage {
        bucket: stored.name,
        usage: stored.usage,
    }))
}

/// `GET /admin/migration`
pub async fn migration_stats(
    State(state): State<AppState>,
) -> Result<Json<MigrationStatsSnapshot>, AppError> {
    match &state.migration {
        Some(engine) => Ok(Json(engine.stats())),
        None => Err(AppError::new(
            StatusCode::NOT_FOUND,
            "migration engine is not running in this process",
        )),
    }
}

fn encode_cursor(cursor: &GcCursor) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(cursor.to_string())
}

fn decode_cursor(token: &str) -> Result<GcCursor, AppError> {
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| AppError::bad_request("invalid cursor"))?;
    let raw = String::from_utf8(raw).map_err(|_| AppError::bad_request("invalid cursor"))?;
    raw.parse::<GcCursor>()
        .map_err(|err| AppError::bad_request(err.to_string()))
}
