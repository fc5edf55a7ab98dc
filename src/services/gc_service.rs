//! GC reaper: drains the garbage collection ledger.
//!
//! An entry leaves the ledger only after every blob it names has been removed
//! from its cluster (a blob that is already gone counts as removed). A failed
//! removal bumps the entry's retry counter and leaves it for a later sweep.

use crate::backend::{BlobError, ClusterRegistry};
use crate::errors::MetaResult;
use crate::models::gc::{GarbageCollection, GcCursor};
use crate::store::MetaStore;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_SCAN_LIMIT: usize = 100;

/// Outcome of one ledger page.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcPass {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
    /// Resume point when the page was full.
    pub next: Option<GcCursor>,
}

#[derive(Clone)]
pub struct GcReaper {
    store: Arc<dyn MetaStore>,
    clusters: ClusterRegistry,
    scan_limit: usize,
    interval: Duration,
}

impl GcReaper {
    pub fn new(store: Arc<dyn MetaStore>, clusters: ClusterRegistry) -> Self {
        Self {
            store,
            clusters,
            scan_limit: DEFAULT_SCAN_LIMIT,
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_scan_limit(mut self, scan_limit: usize) -> Self {
        self.scan_limit = scan_limit.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Process up to `limit` entries after `after`.
    pub async fn run_once(&self, limit: usize, after: Option<&GcCursor>) -> MetaResult<GcPass> {
        let limit = limit.max(1);
        let entries = self.store.scan_garbage_collection(limit, after).await?;
        let mut pass = GcPass {
            scanned: entries.len(),
            next: (entries.len() == limit)
                .then(|| entries.last().map(GarbageCollection::cursor))
                .flatten(),
            ..Default::default()
        };

        for entry in &entries {
            let cursor = entry.cursor();
            match self.reap(entry).await {
                Ok(()) => {
                    self.store.remove_from_garbage_collection(&cursor).await?;
                    pass.removed += 1;
                }
                Err(err) => {
                    warn!(
                        "gc of {}/{} version {} failed (tried {} times): {}",
                        entry.bucket_name, entry.object_name, entry.version, entry.tried_times, err
                    );
                    self.store.mark_garbage_collection_failed(&cursor).await?;
                    pass.failed += 1;
                }
            }
        }
        Ok(pass)
    }

    /// Walk the whole ledger once.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> MetaResult<GcPass> {
        let mut total = GcPass::default();
        let mut cursor: Option<GcCursor> = None;
        loop {
            let pass = self.run_once(self.scan_limit, cursor.as_ref()).await?;
            total.scanned += pass.scanned;
            total.removed += pass.removed;
            total.failed += pass.failed;
            match pass.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(total)
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!("gc reaper started, interval {:?}", self.interval);
        loop {
            match self.sweep().await {
                Ok(pass) if pass.scanned > 0 => info!(
                    "gc sweep: {} scanned, {} removed, {} failed",
                    pass.scanned, pass.removed, pass.failed
                ),
                Ok(_) => debug!("gc sweep: ledger empty"),
                Err(err) => warn!("gc sweep aborted: {}", err),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("gc reaper stopped");
    }

    async fn reap(&self, entry: &GarbageCollection) -> Result<(), BlobError> {
        let blob_ids = entry.blob_ids();
        if blob_ids.is_empty() {
            return Ok(());
        }
        let cluster = self.clusters.get(&entry.location)?;
        let removals = blob_ids.into_iter().map(|blob_id| {
            let cluster = cluster.clone();
            async move {
                match cluster.remove(&entry.pool, blob_id).await {
                    Ok(()) => debug!("removed blob {}/{}", entry.pool, blob_id),
                    Err(err) if err.is_not_found() => {
                        debug!("blob {}/{} already gone", entry.pool, blob_id)
                    }
                    Err(err) => return Err(err),
                }
                Ok(())
            }
        });
        try_join_all(removals).await?;
        Ok(())
    }
}
