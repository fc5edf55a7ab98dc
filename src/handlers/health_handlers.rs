//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and every blob cluster

use crate::{
    backend::{BlobCluster, reader_from_bytes},
    models::object::FAST_POOL,
    routes::AppState,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;

const PROBE: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Pings the metadata store.
/// 2. Writes, reads back and removes a small blob on every registered cluster.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert(
        "store".to_string(),
        match state.store().ping().await {
            Ok(()) => CheckStatus::ok(),
            Err(err) => CheckStatus::failed(format!("error: {err}")),
        },
    );

    if state.clusters.is_empty() {
        checks.insert(
            "clusters".to_string(),
            CheckStatus::failed("no blob cluster configured".into()),
        );
    }
    for id in state.clusters.ids() {
        let status = match state.clusters.get(&id) {
            Ok(cluster) => probe_cluster(cluster.as_ref()).await,
            Err(err) => CheckStatus::failed(err.to_string()),
        };
        checks.insert(format!("cluster:{id}"), status);
    }

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_cluster(cluster: &dyn BlobCluster) -> CheckStatus {
    let written = match cluster.put(FAST_POOL, reader_from_bytes(PROBE)).await {
        Ok(written) => written,
        Err(err) => return CheckStatus::failed(format!("could not write probe: {err}")),
    };

    let read_back = async {
        let mut reader = cluster
            .get_reader(FAST_POOL, &written.blob_id, 0, PROBE.len() as u64)
            .await?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        Ok::<_, crate::backend::BlobError>(bytes)
    };
    let check = match read_back.await {
        Ok(bytes) if bytes == PROBE => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("probe content mismatch".into()),
        Err(err) => CheckStatus::failed(format!("could not read probe: {err}")),
    };

    match cluster.remove(FAST_POOL, &written.blob_id).await {
        Ok(()) => check,
        Err(err) if check.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe: {err}")),
        },
        Err(_) => check,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
