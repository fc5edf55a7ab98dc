//! Admin and health routes of the metadata daemon.
//!
//! ## Structure
//! - `GET /healthz` liveness
//! - `GET /readyz` store ping plus a write probe on every blob cluster
//! - `GET /admin/gc?limit&cursor` pending garbage collection entries
//! - `GET /admin/buckets/{bucket}/usage` stored usage counter of a bucket
//! - `GET /admin/migration` migration engine counters

use crate::{
    backend::ClusterRegistry,
    handlers::{
        admin_handlers::{bucket_usage, list_garbage, migration_stats},
        health_handlers::{healthz, readyz},
    },
    services::{migration_service::MigrationEngine, object_service::ObjectService},
    store::MetaStore,
};
use axum::{Router, routing::get};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub objects: ObjectService,
    pub clusters: ClusterRegistry,
    /// `None` when this process does not run the migration engine.
    pub migration: Option<Arc<MigrationEngine>>,
}

impl AppState {
    pub fn store(&self) -> &Arc<dyn MetaStore> {
        self.objects.store()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/gc", get(list_garbage))
        .route("/admin/buckets/{bucket}/usage", get(bucket_usage))
        .route("/admin/migration", get(migration_stats))
}
