use crate::cache::CacheMode;
use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Root directory of the local filesystem blob cluster.
    pub storage_dir: String,
    pub cluster_id: String,
    /// Absent means in-process locking and no shared cache.
    pub redis_url: Option<String>,
    pub cache_mode: CacheMode,
    pub mg_workers: usize,
    pub mg_object_cooldown: Duration,
    pub mg_scan_interval: Duration,
    pub gc_interval: Duration,
    pub gc_scan_limit: usize,
    pub min_part_size: i64,
    pub piggyback_update_usage: bool,
    pub debug_mode: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object metadata engine daemon")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_META_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_META_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides OBJECT_META_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Blob cluster root directory (overrides OBJECT_META_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Redis URL for locks and cache (overrides OBJECT_META_REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// none | memory | redis (overrides OBJECT_META_CACHE_MODE)
    #[arg(long)]
    pub cache_mode: Option<CacheMode>,

    /// Migration workers (overrides OBJECT_META_MG_WORKERS)
    #[arg(long)]
    pub mg_workers: Option<usize>,

    /// Short cooldown and scan interval for testing
    #[arg(long)]
    pub debug_mode: bool,

    /// Apply the schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        let redis_url = args.redis_url.or_else(|| env::var("OBJECT_META_REDIS_URL").ok());
        let default_cache = if redis_url.is_some() {
            CacheMode::Redis
        } else {
            CacheMode::Memory
        };
        let cache_mode = match args.cache_mode {
            Some(mode) => mode,
            None => env_or("OBJECT_META_CACHE_MODE", default_cache)?,
        };
        let debug_mode = args.debug_mode || env_or("OBJECT_META_DEBUG_MODE", false)?;

        let mut cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("OBJECT_META_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_or("OBJECT_META_PORT", 3000)?,
            },
            database_url: args.database_url.unwrap_or_else(|| {
                env_string("OBJECT_META_DATABASE_URL", "sqlite://./data/meta/object_meta.db")
            }),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_string("OBJECT_META_STORAGE_DIR", "./data/blobs")),
            cluster_id: env_string("OBJECT_META_CLUSTER_ID", "local"),
            redis_url,
            cache_mode,
            mg_workers: match args.mg_workers {
                Some(workers) => workers,
                None => env_or("OBJECT_META_MG_WORKERS", 4)?,
            },
            mg_object_cooldown: Duration::from_secs(env_or("OBJECT_META_MG_OBJECT_COOLDOWN", 3600)?),
            mg_scan_interval: Duration::from_secs(env_or("OBJECT_META_MG_SCAN_INTERVAL", 600)?),
            gc_interval: Duration::from_secs(env_or("OBJECT_META_GC_INTERVAL", 60)?),
            gc_scan_limit: env_or("OBJECT_META_GC_SCAN_LIMIT", 100)?,
            min_part_size: env_or("OBJECT_META_MIN_PART_SIZE", 5 << 20)?,
            piggyback_update_usage: env_or("OBJECT_META_PIGGYBACK_UPDATE_USAGE", true)?,
            debug_mode,
        };

        if cfg.debug_mode {
            cfg.mg_object_cooldown = Duration::from_secs(1);
            cfg.mg_scan_interval = Duration::from_secs(5);
        }
        if cfg.cache_mode == CacheMode::Redis && cfg.redis_url.is_none() {
            anyhow::bail!("cache mode `redis` needs OBJECT_META_REDIS_URL");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_and_debug_mode_win() {
        let args = Args::parse_from([
            "object-meta",
            "--port",
            "9100",
            "--cache-mode",
            "none",
            "--mg-workers",
            "2",
            "--debug-mode",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.cache_mode, CacheMode::None);
        assert_eq!(cfg.mg_workers, 2);
        assert_eq!(cfg.mg_object_cooldown, Duration::from_secs(1));
        assert_eq!(cfg.mg_scan_interval, Duration::from_secs(5));
        assert_eq!(cfg.addr(), format!("{}:9100", cfg.host));
    }

    #[test]
    fn redis_cache_requires_a_url() {
        let args = Args::parse_from(["object-meta", "--cache-mode", "redis"]);
        if env::var("OBJECT_META_REDIS_URL").is_err() {
            assert!(AppConfig::merge(args).is_err());
        }
    }
}
