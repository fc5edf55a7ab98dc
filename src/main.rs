use anyhow::{Context, Result};
use axum::Router;
use object_meta::{
    backend::{ClusterRegistry, FsCluster},
    cache::{DEFAULT_TTL, MetaCache},
    config::AppConfig,
    lock::{Locker, MemoryLocker, RedisLocker},
    routes::{self, AppState},
    services::{
        gc_service::GcReaper,
        migration_service::{MigrationConfig, MigrationEngine},
        object_service::ObjectService,
    },
    store::{MetaStore, SqliteStore},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting object-meta with config: {:?}", cfg);

    // --- Ensure blob and database directories exist ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let sqlite = SqliteStore::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    // --- Handle migration mode ---
    if migrate {
        sqlite.migrate().await.context("applying schema")?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    let store: Arc<dyn MetaStore> = Arc::new(sqlite);

    // --- Shared infrastructure ---
    let clusters = ClusterRegistry::new().with_cluster(Arc::new(FsCluster::new(
        cfg.cluster_id.clone(),
        cfg.storage_dir.clone(),
    )));
    let cache = MetaCache::new(cfg.cache_mode, cfg.redis_url.as_deref(), DEFAULT_TTL).await?;
    let locker: Arc<dyn Locker> = match cfg.redis_url.as_deref() {
        Some(url) => Arc::new(RedisLocker::connect(url).await?),
        None => {
            tracing::warn!("no redis configured, locks only exclude within this process");
            Arc::new(MemoryLocker::new())
        }
    };

    let objects = ObjectService::new(store.clone(), cache.clone())
        .with_usage_updates(cfg.piggyback_update_usage);
    let reaper = GcReaper::new(store.clone(), clusters.clone())
        .with_scan_limit(cfg.gc_scan_limit)
        .with_interval(cfg.gc_interval);
    let engine = MigrationEngine::new(
        store.clone(),
        clusters.clone(),
        locker,
        cache,
        MigrationConfig {
            workers: cfg.mg_workers,
            cooldown: cfg.mg_object_cooldown,
            scan_interval: cfg.mg_scan_interval,
            ..MigrationConfig::default()
        },
    );

    // --- Background loops ---
    let shutdown = CancellationToken::new();
    let fatal = engine.fatal_signal();
    let migration = tokio::spawn(engine.clone().run(shutdown.clone()));
    let gc = tokio::spawn(reaper.run(shutdown.clone()));

    // --- Build router ---
    let app: Router = routes::routes().with_state(AppState {
        objects,
        clusters,
        migration: Some(engine),
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received, shutting down"),
                _ = fatal.cancelled() => tracing::error!("migration engine failed, shutting down"),
                _ = server_shutdown.cancelled() => {}
            }
            server_shutdown.cancel();
        })
        .await?;

    // --- Drain background work ---
    shutdown.cancel();
    gc.await.context("gc reaper task")?;
    migration
        .await
        .context("migration engine task")?
        .context("migration engine")?;
    tracing::info!("object-meta stopped");
    Ok(())
}
