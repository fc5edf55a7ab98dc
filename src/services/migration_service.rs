//! Migration engine: moves cooled objects from the fast pool to the capacity
//! pool.
//!
//! A single scanner (guarded cluster-wide by the job lock) walks the hot
//! object table into a bounded queue; a fixed pool of workers drains it. Per
//! object a worker takes the object's lock, re-reads the row, copies the blob,
//! repoints the row with a compare-and-swap on the copied-from blob id, size
//! and etag, and only then frees the old blob. A failure after the repoint can leak the old blob (it
//! is handed to the GC ledger) but never leaves the row pointing at bytes that
//! do not exist.

use crate::backend::{BlobCluster, ClusterRegistry};
use crate::cache::{CacheTable, MetaCache};
use crate::errors::{ErrorKind, MetaError, MetaResult};
use crate::lock::{Lease, LockError, Locker};
use crate::models::{
    gc::GarbageCollection,
    object::{CAPACITY_POOL, HotObject, Object, StorageClass},
};
use crate::store::MetaStore;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Above this many queued candidates the scanner stops feeding.
pub const WATER_LOW: usize = 120;
pub const TASKQ_MAX_LENGTH: usize = 200;
pub const SCAN_LIMIT: usize = 50;
pub const MIGRATE_JOB_MUTEX: &str = "MIGRATE_JOB_MUTEX";

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub workers: usize,
    /// Minimum age of an object before it may leave the fast pool.
    pub cooldown: Duration,
    /// Pause between two scans of the hot object table.
    pub scan_interval: Duration,
    pub lock_ttl: Duration,
    pub refresh_period: Duration,
    /// Retry period while another process holds the job lock.
    pub job_lock_retry: Duration,
    /// Poll period while waiting for the queue to drain.
    pub drain_poll: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cooldown: Duration::from_secs(3600),
            scan_interval: Duration::from_secs(600),
            lock_ttl: Duration::from_secs(10),
            refresh_period: Duration::from_secs(5),
            job_lock_retry: Duration::from_secs(30),
            drain_poll: Duration::from_secs(1),
        }
    }
}

impl MigrationConfig {
    /// Short cooldown and scan interval for local testing.
    pub fn debug() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
            scan_interval: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// Steps a candidate goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Discovered,
    LockAttempted,
    Locked,
    Verified,
    Copied,
    Repointed,
    SourceFreed,
    Done,
    LockFailed,
    Aborted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::Discovered => "Discovered",
            MigrationState::LockAttempted => "LockAttempted",
            MigrationState::Locked => "Locked",
            MigrationState::Verified => "Verified",
            MigrationState::Copied => "Copied",
            MigrationState::Repointed => "Repointed",
            MigrationState::SourceFreed => "SourceFreed",
            MigrationState::Done => "Done",
            MigrationState::LockFailed => "LockFailed",
            MigrationState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// The row (or that version) no longer exists.
    Gone,
    AlreadyMigrated,
    /// Younger than the cooldown window.
    StillWarm,
    /// The row changed between the copy and the repoint.
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    /// Storage class moved to archival in the meantime.
    Archived,
    ShortWrite { expected: u64, written: u64 },
    /// The object lock expired before the repoint.
    LeaseLost,
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    Migrated {
        old_blob_id: String,
        new_blob_id: String,
        /// False when the old blob went to the GC ledger instead.
        source_freed: bool,
    },
    Skipped(SkipReason),
    LockFailed,
    Aborted(AbortReason),
}

impl MigrationOutcome {
    pub fn state(&self) -> MigrationState {
        match self {
            MigrationOutcome::Migrated { .. } => MigrationState::Done,
            MigrationOutcome::Skipped(_) => MigrationState::Discovered,
            MigrationOutcome::LockFailed => MigrationState::LockFailed,
            MigrationOutcome::Aborted(_) => MigrationState::Aborted,
        }
    }
}

#[derive(Debug, Default)]
struct MigrationStats {
    scanned: AtomicU64,
    migrated: AtomicU64,
    skipped: AtomicU64,
    lock_failed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatsSnapshot {
    pub scanned: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub lock_failed: u64,
    pub aborted: u64,
    pub failed: u64,
    pub active_leases: usize,
    pub fatal: Option<String>,
}

impl MigrationStats {
    fn record(&self, outcome: &MigrationOutcome) {
        let counter = match outcome {
            MigrationOutcome::Migrated { .. } => &self.migrated,
            MigrationOutcome::Skipped(_) => &self.skipped,
            MigrationOutcome::LockFailed => &self.lock_failed,
            MigrationOutcome::Aborted(_) => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MigrationEngine {
    store: Arc<dyn MetaStore>,
    clusters: ClusterRegistry,
    locker: Arc<dyn Locker>,
    cache: MetaCache,
    config: MigrationConfig,
    /// Leases currently held by this engine, refreshed in the background.
    leases: DashMap<String, Lease>,
    stats: MigrationStats,
    fatal: CancellationToken,
    fatal_reason: SyncMutex<Option<String>>,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<dyn MetaStore>,
        clusters: ClusterRegistry,
        locker: Arc<dyn Locker>,
        cache: MetaCache,
        config: MigrationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clusters,
            locker,
            cache,
            config,
            leases: DashMap::new(),
            stats: MigrationStats::default(),
            fatal: CancellationToken::new(),
            fatal_reason: SyncMutex::new(None),
        })
    }

    /// Fires once the engine hit an error it cannot continue past.
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub fn active_leases(&self) -> usize {
        self.leases.len()
    }

    pub fn stats(&self) -> MigrationStatsSnapshot {
        MigrationStatsSnapshot {
            scanned: self.stats.scanned.load(Ordering::Relaxed),
            migrated: self.stats.migrated.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            lock_failed: self.stats.lock_failed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            active_leases: self.leases.len(),
            fatal: self.fatal_reason.lock().clone(),
        }
    }

    /// Run scanner, workers and lease refresher until `cancel` fires or a
    /// fatal error occurs. Workers finish their current object before this
    /// returns.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> MetaResult<()> {
        let stop = cancel.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(TASKQ_MAX_LENGTH);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        info!(
            "migration engine starting {} workers, cooldown {:?}, scan interval {:?}",
            self.config.workers, self.config.cooldown, self.config.scan_interval
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().scan_loop(queue_tx, stop.clone()));
        for index in 0..self.config.workers.max(1) {
            tasks.spawn(
                self.clone()
                    .worker_loop(index, queue_rx.clone(), stop.clone()),
            );
        }
        tasks.spawn(self.clone().refresh_loop(stop.clone()));

        tokio::select! {
            _ = stop.cancelled() => {}
            _ = self.fatal.cancelled() => stop.cancel(),
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("migration task panicked: {}", err);
            }
        }
        self.release_all().await;
        info!("migration engine stopped");

        match self.fatal_reason.lock().clone() {
            Some(reason) => Err(MetaError::Fatal(reason)),
            None => Ok(()),
        }
    }

    /// Take one candidate through the whole migration.
    #[instrument(skip(self, hot), fields(object = %hot.mutex_key()))]
    pub async fn migrate_candidate(&self, hot: &HotObject) -> MetaResult<MigrationOutcome> {
        let current = match self.read_current(hot).await? {
            Ok(object) => object,
            Err(reason) => return Ok(MigrationOutcome::Skipped(reason)),
        };
        if let Some(reason) = self.skip_reason(&current) {
            return Ok(MigrationOutcome::Skipped(reason));
        }

        let key = hot.mutex_key();
        let lease = match self.locker.obtain(&key, self.config.lock_ttl).await {
            Ok(lease) => lease,
            Err(LockError::NotObtained(_)) => {
                debug!("{} is locked elsewhere", key);
                return Ok(MigrationOutcome::LockFailed);
            }
            Err(err) => return Err(err.into()),
        };
        self.leases.insert(key.clone(), lease.clone());

        let outcome = self.migrate_locked(hot, &key).await;

        self.leases.remove(&key);
        match self.locker.release(&lease).await {
            Ok(()) | Err(LockError::NotObtained(_)) => {}
            Err(err) => return Err(err.into()),
        }
        outcome
    }

    async fn migrate_locked(&self, hot: &HotObject, key: &str) -> MetaResult<MigrationOutcome> {
        let mut object = match self.read_current(hot).await? {
            Ok(object) => object,
            Err(reason) => return Ok(MigrationOutcome::Skipped(reason)),
        };
        if object.storage_class == StorageClass::Glacier {
            self.drop_hot_row(hot).await?;
            info!("{} became archival, migration abandoned", object);
            return Ok(MigrationOutcome::Aborted(AbortReason::Archived));
        }
        if object.pool == CAPACITY_POOL {
            return Ok(MigrationOutcome::Skipped(SkipReason::AlreadyMigrated));
        }

        let expected = u64::try_from(object.size).unwrap_or_default();
        let source = self.clusters.get(&object.location)?;
        let reader = source
            .get_reader(&object.pool, &object.blob_id, 0, expected)
            .await?;
        let destination = self.clusters.pick(CAPACITY_POOL)?;
        let written = destination.put(CAPACITY_POOL, reader).await?;

        if written.bytes_written != expected {
            warn!(
                "{}: wrote {} of {} bytes, discarding {}",
                object, written.bytes_written, expected, written.blob_id
            );
            discard(destination.as_ref(), &written.blob_id).await;
            return Ok(MigrationOutcome::Aborted(AbortReason::ShortWrite {
                expected,
                written: written.bytes_written,
            }));
        }
        if !self.leases.contains_key(key) {
            warn!("{}: lease lost during copy, discarding {}", object, written.blob_id);
            discard(destination.as_ref(), &written.blob_id).await;
            return Ok(MigrationOutcome::Aborted(AbortReason::LeaseLost));
        }

        let old = object.clone();
        object.location = destination.id().to_string();
        object.pool = CAPACITY_POOL.to_string();
        object.blob_id = written.blob_id.clone();
        match self.repoint(&object, &old).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() || err.kind() == ErrorKind::Conflict => {
                debug!("{} changed before repoint", old);
                discard(destination.as_ref(), &written.blob_id).await;
                return Ok(MigrationOutcome::Skipped(SkipReason::Changed));
            }
            Err(err) => {
                discard(destination.as_ref(), &written.blob_id).await;
                return Err(MetaError::Fatal(format!("repoint of {old} failed: {err}")));
            }
        }

        let source_freed = self.free_source(source.as_ref(), &old).await;
        for cache_key in old.cache_keys() {
            self.cache.remove(CacheTable::Object, &cache_key).await;
        }
        info!(
            "migrated bucket {} name {} version {} old blob {} new blob {}",
            old.bucket_name, old.name, old.version, old.blob_id, object.blob_id
        );
        Ok(MigrationOutcome::Migrated {
            old_blob_id: old.blob_id,
            new_blob_id: object.blob_id,
            source_freed,
        })
    }

    /// Fresh store read of a candidate; never served from the cache. A
    /// vanished row also loses its hot row.
    async fn read_current(&self, hot: &HotObject) -> MetaResult<Result<Object, SkipReason>> {
        match self
            .store
            .get_object(&hot.bucket_name, &hot.name, Some(hot.version))
            .await
        {
            Ok(object) => Ok(Ok(object)),
            Err(err) if err.is_not_found() => {
                self.drop_hot_row(hot).await?;
                Ok(Err(SkipReason::Gone))
            }
            Err(err) => Err(err),
        }
    }

    fn skip_reason(&self, object: &Object) -> Option<SkipReason> {
        if object.pool == CAPACITY_POOL {
            return Some(SkipReason::AlreadyMigrated);
        }
        match (Utc::now() - object.last_modified).to_std() {
            Ok(age) if age >= self.config.cooldown => None,
            _ => Some(SkipReason::StillWarm),
        }
    }

    async fn repoint(&self, object: &Object, previous: &Object) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.migrate_object(object, previous).await?;
        tx.commit().await
    }

    async fn drop_hot_row(&self, hot: &HotObject) -> MetaResult<()> {
        let mut tx = self.store.begin().await?;
        tx.remove_hot_object(hot).await?;
        tx.commit().await
    }

    /// Remove the pre-migration blob. On failure it is handed to the GC
    /// ledger under a fresh identity; returns whether it was removed here.
    async fn free_source(&self, source: &dyn BlobCluster, old: &Object) -> bool {
        match source.remove(&old.pool, &old.blob_id).await {
            Ok(()) => return true,
            Err(err) if err.is_not_found() => return true,
            Err(err) => warn!("removing {}/{} failed: {}", old.pool, old.blob_id, err),
        }

        let enqueued = async {
            let mut orphan = GarbageCollection::from_replaced_object(old)?;
            orphan.parts.clear();
            let mut tx = self.store.begin().await?;
            tx.put_garbage_collection(&orphan).await?;
            tx.commit().await
        };
        if let Err(err) = enqueued.await {
            warn!(
                "old blob {}/{} of {} leaked: {}",
                old.pool, old.blob_id, old, err
            );
        }
        false
    }

    async fn scan_loop(self: Arc<Self>, queue: mpsc::Sender<HotObject>, stop: CancellationToken) {
        let Some(job) = self.obtain_job_lock(&stop).await else {
            return;
        };
        self.leases.insert(job.key().to_string(), job.clone());
        info!("scanner holds {}", MIGRATE_JOB_MUTEX);

        'scan: loop {
            while queued_len(&queue) > 0 {
                debug!("waiting for the previous round to drain");
                tokio::select! {
                    _ = stop.cancelled() => break 'scan,
                    _ = tokio::time::sleep(self.config.drain_poll) => {}
                }
            }

            match self.scan_round(&queue, &stop).await {
                Ok(queued) => debug!("scan round queued {} candidates", queued),
                Err(err) if err.kind() == ErrorKind::Fatal => {
                    self.signal_fatal(&err);
                    break;
                }
                Err(err) => warn!("scan round failed: {}", err),
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        self.leases.remove(job.key());
        if let Err(err) = self.locker.release(&job).await {
            warn!("releasing {} failed: {}", MIGRATE_JOB_MUTEX, err);
        }
        info!("scanner stopped");
    }

    async fn obtain_job_lock(&self, stop: &CancellationToken) -> Option<Lease> {
        loop {
            match self
                .locker
                .obtain(MIGRATE_JOB_MUTEX, self.config.lock_ttl)
                .await
            {
                Ok(lease) => return Some(lease),
                Err(LockError::NotObtained(_)) => {
                    info!(
                        "{} held elsewhere, retrying in {:?}",
                        MIGRATE_JOB_MUTEX, self.config.job_lock_retry
                    );
                }
                Err(err) => {
                    self.signal_fatal(&MetaError::Lock(err));
                    return None;
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = tokio::time::sleep(self.config.job_lock_retry) => {}
            }
        }
    }

    /// Feed every hot row into the queue, pausing while it is above the
    /// low-water mark.
    async fn scan_round(
        &self,
        queue: &mpsc::Sender<HotObject>,
        stop: &CancellationToken,
    ) -> MetaResult<usize> {
        let mut after: Option<HotObject> = None;
        let mut queued = 0;
        loop {
            let batch = self.store.scan_hot_objects(after.as_ref(), SCAN_LIMIT).await?;
            let exhausted = batch.len() < SCAN_LIMIT;
            after = batch.last().cloned();

            for hot in batch {
                self.stats.scanned.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = stop.cancelled() => return Ok(queued),
                    sent = queue.send(hot) => {
                        if sent.is_err() {
                            return Ok(queued);
                        }
                    }
                }
                queued += 1;
                while queued_len(queue) >= WATER_LOW {
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(queued),
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    }
                }
            }
            if exhausted {
                return Ok(queued);
            }
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        index: usize,
        queue: Arc<Mutex<mpsc::Receiver<HotObject>>>,
        stop: CancellationToken,
    ) {
        debug!("migration worker {} started", index);
        loop {
            let next = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    _ = stop.cancelled() => None,
                    hot = queue.recv() => hot,
                }
            };
            let Some(hot) = next else {
                break;
            };

            match self.migrate_candidate(&hot).await {
                Ok(outcome) => {
                    if !matches!(outcome, MigrationOutcome::Migrated { .. }) {
                        debug!("{}: {:?}", hot.mutex_key(), outcome);
                    }
                    self.stats.record(&outcome);
                }
                Err(err) if err.kind() == ErrorKind::Fatal => {
                    self.signal_fatal(&err);
                    break;
                }
                Err(err) => {
                    warn!("migration of {} failed: {}", hot.mutex_key(), err);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        debug!("migration worker {} stopped", index);
    }

    async fn refresh_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.refresh_leases().await {
                self.signal_fatal(&err);
                break;
            }
        }
    }

    /// Extend every held lease. Leases that were lost are forgotten so their
    /// holders stop before writing.
    pub async fn refresh_leases(&self) -> MetaResult<()> {
        let held: Vec<Lease> = self.leases.iter().map(|entry| entry.value().clone()).collect();
        for lease in held {
            match self.locker.refresh(&lease, self.config.lock_ttl).await {
                Ok(()) => debug!("refreshed {}", lease.key()),
                Err(LockError::NotObtained(_)) => {
                    info!("no longer hold {}", lease.key());
                    self.leases.remove(lease.key());
                }
                Err(err) => {
                    self.leases.remove(lease.key());
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn release_all(&self) {
        let held: Vec<Lease> = self.leases.iter().map(|entry| entry.value().clone()).collect();
        self.leases.clear();
        for lease in held {
            if let Err(err) = self.locker.release(&lease).await {
                debug!("releasing {} failed: {}", lease.key(), err);
            }
        }
    }

    fn signal_fatal(&self, err: &MetaError) {
        error!("migration engine stopping: {}", err);
        self.fatal_reason
            .lock()
            .get_or_insert_with(|| err.to_string());
        self.fatal.cancel();
    }
}

fn queued_len<T>(queue: &mpsc::Sender<T>) -> usize {
    queue.max_capacity() - queue.capacity()
}

async fn discard(cluster: &dyn BlobCluster, blob_id: &str) {
    if let Err(err) = cluster.remove(CAPACITY_POOL, blob_id).await {
        if !err.is_not_found() {
            warn!("discarding {}/{} failed: {}", CAPACITY_POOL, blob_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlobError, BlobReader, FsCluster, PutOutcome, reader_from_bytes};
    use crate::lock::MemoryLocker;
    use crate::models::object::FAST_POOL;
    use crate::store::KvStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::io::AsyncReadExt;
    use uuid::Uuid;

    /// In-memory cluster that can drop the last byte of every write, refuse
    /// to remove fast-pool blobs, or let a client append while a copy runs.
    #[derive(Default)]
    struct MemCluster {
        blobs: SyncMutex<BTreeMap<(String, String), Vec<u8>>>,
        truncate: AtomicBool,
        fail_removes: AtomicBool,
        append_during_copy: SyncMutex<Option<ConcurrentAppend>>,
        puts: AtomicUsize,
    }

    /// An append that lands on the source blob and its row after the copy
    /// was read but before it is repointed.
    struct ConcurrentAppend {
        store: Arc<KvStore>,
        hot: HotObject,
        data: Vec<u8>,
    }

    impl MemCluster {
        fn insert(&self, pool: &str, data: &[u8]) -> String {
            let blob_id = Uuid::new_v4().simple().to_string();
            self.blobs
                .lock()
                .insert((pool.to_string(), blob_id.clone()), data.to_vec());
            blob_id
        }

        fn contains(&self, pool: &str, blob_id: &str) -> bool {
            self.blobs
                .lock()
                .contains_key(&(pool.to_string(), blob_id.to_string()))
        }

        fn len(&self) -> usize {
            self.blobs.lock().len()
        }
    }

    #[async_trait]
    impl BlobCluster for MemCluster {
        fn id(&self) -> &str {
            "mem"
        }

        async fn put(&self, pool: &str, mut reader: BlobReader) -> Result<PutOutcome, BlobError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            if self.truncate.load(Ordering::SeqCst) {
                data.pop();
            }
            let pending = self.append_during_copy.lock().take();
            if let Some(append) = pending {
                self.blobs
                    .lock()
                    .entry((FAST_POOL.to_string(), append.hot.blob_id.clone()))
                    .or_default()
                    .extend_from_slice(&append.data);
                let mut object = append
                    .store
                    .get_object(&append.hot.bucket_name, &append.hot.name, Some(append.hot.version))
                    .await
                    .unwrap();
                object.size += append.data.len() as i64;
                object.etag = "appended".into();
                let mut tx = append.store.begin().await.unwrap();
                tx.update_append_object(&object).await.unwrap();
                tx.commit().await.unwrap();
            }
            let bytes_written = data.len() as u64;
            let blob_id = self.insert(pool, &data);
            Ok(PutOutcome {
                blob_id,
                bytes_written,
            })
        }

        async fn append(
            &self,
            _pool: &str,
            _blob_id: Option<&str>,
            _reader: BlobReader,
            _offset: u64,
            _expected_old_size: u64,
        ) -> Result<PutOutcome, BlobError> {
            unimplemented!("migration never appends")
        }

        async fn get_reader(
            &self,
            pool: &str,
            blob_id: &str,
            offset: u64,
            length: u64,
        ) -> Result<BlobReader, BlobError> {
            let blobs = self.blobs.lock();
            let data = blobs
                .get(&(pool.to_string(), blob_id.to_string()))
                .ok_or_else(|| BlobError::NotFound {
                    pool: pool.to_string(),
                    blob_id: blob_id.to_string(),
                })?;
            let start = offset as usize;
            let end = (start + length as usize).min(data.len());
            Ok(reader_from_bytes(data[start..end].to_vec()))
        }

        async fn remove(&self, pool: &str, blob_id: &str) -> Result<(), BlobError> {
            if pool == FAST_POOL && self.fail_removes.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("device offline").into());
            }
            match self
                .blobs
                .lock()
                .remove(&(pool.to_string(), blob_id.to_string()))
            {
                Some(_) => Ok(()),
                None => Err(BlobError::NotFound {
                    pool: pool.to_string(),
                    blob_id: blob_id.to_string(),
                }),
            }
        }
    }

    /// Locker whose backing service is down.
    struct BrokenLocker;

    #[async_trait]
    impl Locker for BrokenLocker {
        async fn obtain(&self, _key: &str, _ttl: Duration) -> Result<Lease, LockError> {
            Err(LockError::Unavailable("connection refused".into()))
        }

        async fn refresh(&self, _lease: &Lease, _ttl: Duration) -> Result<(), LockError> {
            Err(LockError::Unavailable("connection refused".into()))
        }

        async fn release(&self, _lease: &Lease) -> Result<(), LockError> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<KvStore>,
        cluster: Arc<MemCluster>,
        locker: MemoryLocker,
        engine: Arc<MigrationEngine>,
    }

    fn fixture(config: MigrationConfig) -> Fixture {
        let store = Arc::new(KvStore::new());
        let cluster = Arc::new(MemCluster::default());
        let locker = MemoryLocker::new();
        let engine = MigrationEngine::new(
            store.clone(),
            ClusterRegistry::new().with_cluster(cluster.clone()),
            Arc::new(locker.clone()),
            MetaCache::Disabled,
            config,
        );
        Fixture {
            store,
            cluster,
            locker,
            engine,
        }
    }

    async fn hot_object(
        store: &KvStore,
        cluster: &dyn BlobCluster,
        blob_id: String,
        size: i64,
        age: ChronoDuration,
    ) -> HotObject {
        let mut object = Object::created_at("bkt", "cooling", Utc::now() - age).unwrap();
        object.location = cluster.id().to_string();
        object.pool = FAST_POOL.into();
        object.blob_id = blob_id;
        object.size = size;
        let mut tx = store.begin().await.unwrap();
        tx.put_object(&object).await.unwrap();
        tx.commit().await.unwrap();
        HotObject::from_object(&object)
    }

    async fn stored(store: &KvStore, hot: &HotObject) -> Object {
        store
            .get_object(&hot.bucket_name, &hot.name, Some(hot.version))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cold_object_moves_to_capacity_pool() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FsCluster::new("local", dir.path()));
        let store = Arc::new(KvStore::new());
        let payload = b"cold bytes that should move".to_vec();
        let put = cluster
            .put(FAST_POOL, reader_from_bytes(payload.clone()))
            .await
            .unwrap();
        let hot = hot_object(
            &store,
            cluster.as_ref(),
            put.blob_id.clone(),
            payload.len() as i64,
            ChronoDuration::hours(2),
        )
        .await;

        let engine = MigrationEngine::new(
            store.clone(),
            ClusterRegistry::new().with_cluster(cluster.clone()),
            Arc::new(MemoryLocker::new()),
            MetaCache::Disabled,
            MigrationConfig::default(),
        );
        let outcome = engine.migrate_candidate(&hot).await.unwrap();
        let MigrationOutcome::Migrated {
            old_blob_id,
            new_blob_id,
            source_freed,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(old_blob_id, put.blob_id);
        assert!(source_freed);

        let object = stored(&store, &hot).await;
        assert_eq!(object.pool, CAPACITY_POOL);
        assert_eq!(object.location, "local");
        assert_eq!(object.blob_id, new_blob_id);

        let mut reader = cluster
            .get_reader(CAPACITY_POOL, &new_blob_id, 0, payload.len() as u64)
            .await
            .unwrap();
        let mut copied = Vec::new();
        reader.read_to_end(&mut copied).await.unwrap();
        assert_eq!(copied, payload);
        assert!(
            cluster
                .get_reader(FAST_POOL, &old_blob_id, 0, 1)
                .await
                .is_err()
        );
        assert!(store.scan_hot_objects(None, 10).await.unwrap().is_empty());
        assert_eq!(engine.active_leases(), 0);
    }

    #[tokio::test]
    async fn short_write_never_repoints() {
        let fx = fixture(MigrationConfig::default());
        let blob_id = fx.cluster.insert(FAST_POOL, b"0123456789");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id.clone(),
            10,
            ChronoDuration::hours(2),
        )
        .await;
        fx.cluster.truncate.store(true, Ordering::SeqCst);

        let outcome = fx.engine.migrate_candidate(&hot).await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Aborted(AbortReason::ShortWrite {
                expected: 10,
                written: 9
            })
        );
        let object = stored(&fx.store, &hot).await;
        assert_eq!(object.pool, FAST_POOL);
        assert_eq!(object.blob_id, blob_id);
        assert_eq!(fx.cluster.len(), 1);
        assert!(fx.cluster.contains(FAST_POOL, &blob_id));
        assert!(!fx.locker.is_held(&hot.mutex_key()));
        assert_eq!(fx.store.scan_hot_objects(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_during_copy_keeps_the_fast_blob() {
        let fx = fixture(MigrationConfig::default());
        let blob_id = fx.cluster.insert(FAST_POOL, b"0123456789");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id.clone(),
            10,
            ChronoDuration::hours(2),
        )
        .await;
        *fx.cluster.append_during_copy.lock() = Some(ConcurrentAppend {
            store: fx.store.clone(),
            hot: hot.clone(),
            data: b"tail".to_vec(),
        });

        let outcome = fx.engine.migrate_candidate(&hot).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Skipped(SkipReason::Changed));

        let object = stored(&fx.store, &hot).await;
        assert_eq!(object.pool, FAST_POOL);
        assert_eq!(object.blob_id, blob_id);
        assert_eq!(object.size, 14);
        let blob_len = fx.cluster.blobs.lock()[&(FAST_POOL.to_string(), blob_id.clone())].len();
        assert_eq!(object.size as usize, blob_len);
        // the 10-byte copy was discarded
        assert_eq!(fx.cluster.len(), 1);
        assert!(!fx.locker.is_held(&hot.mutex_key()));
    }

    #[tokio::test]
    async fn unremovable_source_goes_to_the_gc_ledger() {
        let fx = fixture(MigrationConfig::default());
        let blob_id = fx.cluster.insert(FAST_POOL, b"stubborn");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id.clone(),
            8,
            ChronoDuration::hours(2),
        )
        .await;
        fx.cluster.fail_removes.store(true, Ordering::SeqCst);

        let outcome = fx.engine.migrate_candidate(&hot).await.unwrap();
        let MigrationOutcome::Migrated {
            old_blob_id,
            new_blob_id,
            source_freed,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(!source_freed);
        assert_eq!(old_blob_id, blob_id);

        let object = stored(&fx.store, &hot).await;
        assert_eq!(object.pool, CAPACITY_POOL);
        assert_eq!(object.blob_id, new_blob_id);
        assert!(fx.cluster.contains(CAPACITY_POOL, &new_blob_id));
        assert!(fx.cluster.contains(FAST_POOL, &blob_id));

        let ledger = fx.store.scan_garbage_collection(10, None).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].blob_id, blob_id);
        assert_eq!(ledger[0].pool, FAST_POOL);
        assert_eq!(ledger[0].location, "mem");
        assert!(ledger[0].parts.is_empty());
        assert_ne!(ledger[0].version, object.version);
        assert!(fx.store.scan_hot_objects(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn contended_lock_is_a_skip_without_mutation() {
        let fx = fixture(MigrationConfig::default());
        let blob_id = fx.cluster.insert(FAST_POOL, b"abc");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id.clone(),
            3,
            ChronoDuration::hours(2),
        )
        .await;
        let other = fx
            .locker
            .obtain(&hot.mutex_key(), Duration::from_secs(10))
            .await
            .unwrap();

        let outcome = fx.engine.migrate_candidate(&hot).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::LockFailed);
        assert_eq!(fx.cluster.puts.load(Ordering::SeqCst), 0);
        assert_eq!(stored(&fx.store, &hot).await.blob_id, blob_id);
        assert!(fx.locker.is_held(&hot.mutex_key()));
        fx.locker.release(&other).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_attempts_copy_once() {
        let fx = fixture(MigrationConfig::default());
        let blob_id = fx.cluster.insert(FAST_POOL, b"payload");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id,
            7,
            ChronoDuration::hours(2),
        )
        .await;

        let (a, b) = tokio::join!(
            fx.engine.migrate_candidate(&hot),
            fx.engine.migrate_candidate(&hot)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let migrated = outcomes
            .iter()
            .filter(|o| matches!(o, MigrationOutcome::Migrated { .. }))
            .count();
        assert_eq!(migrated, 1, "{outcomes:?}");
        assert!(outcomes.iter().all(|o| matches!(
            o,
            MigrationOutcome::Migrated { .. }
                | MigrationOutcome::LockFailed
                | MigrationOutcome::Skipped(SkipReason::AlreadyMigrated)
                | MigrationOutcome::Skipped(SkipReason::Gone)
        )));
        assert_eq!(fx.cluster.puts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.cluster.len(), 1);
    }

    #[tokio::test]
    async fn archived_object_is_abandoned() {
        let fx = fixture(MigrationConfig::default());
        let blob_id = fx.cluster.insert(FAST_POOL, b"frozen");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id,
            6,
            ChronoDuration::hours(2),
        )
        .await;
        let mut object = stored(&fx.store, &hot).await;
        object.storage_class = StorageClass::Glacier;
        let mut tx = fx.store.begin().await.unwrap();
        tx.update_object_attrs(&object).await.unwrap();
        tx.commit().await.unwrap();

        let outcome = fx.engine.migrate_candidate(&hot).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Aborted(AbortReason::Archived));
        assert_eq!(fx.cluster.puts.load(Ordering::SeqCst), 0);
        assert!(fx.store.scan_hot_objects(None, 10).await.unwrap().is_empty());
        assert!(!fx.locker.is_held(&hot.mutex_key()));
    }

    #[tokio::test]
    async fn warm_gone_and_migrated_rows_are_skipped() {
        let fx = fixture(MigrationConfig::default());
        let warm_blob = fx.cluster.insert(FAST_POOL, b"warm");
        let warm = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            warm_blob,
            4,
            ChronoDuration::seconds(5),
        )
        .await;
        assert_eq!(
            fx.engine.migrate_candidate(&warm).await.unwrap(),
            MigrationOutcome::Skipped(SkipReason::StillWarm)
        );

        let mut gone = warm.clone();
        gone.name = "deleted-meanwhile".into();
        let mut tx = fx.store.begin().await.unwrap();
        tx.put_hot_object(&gone).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            fx.engine.migrate_candidate(&gone).await.unwrap(),
            MigrationOutcome::Skipped(SkipReason::Gone)
        );
        let remaining = fx.store.scan_hot_objects(None, 10).await.unwrap();
        assert_eq!(remaining, vec![warm.clone()]);

        let previous = stored(&fx.store, &warm).await;
        let mut moved = previous.clone();
        moved.pool = CAPACITY_POOL.into();
        let mut tx = fx.store.begin().await.unwrap();
        tx.migrate_object(&moved, &previous).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            fx.engine.migrate_candidate(&warm).await.unwrap(),
            MigrationOutcome::Skipped(SkipReason::AlreadyMigrated)
        );
        assert_eq!(fx.cluster.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lock_service_outage_is_fatal() {
        let store = Arc::new(KvStore::new());
        let cluster = Arc::new(MemCluster::default());
        let blob_id = cluster.insert(FAST_POOL, b"x");
        let hot = hot_object(
            &store,
            cluster.as_ref(),
            blob_id,
            1,
            ChronoDuration::hours(2),
        )
        .await;
        let engine = MigrationEngine::new(
            store,
            ClusterRegistry::new().with_cluster(cluster),
            Arc::new(BrokenLocker),
            MetaCache::Disabled,
            MigrationConfig::default(),
        );

        let err = engine.migrate_candidate(&hot).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.clone().run(CancellationToken::new()),
        )
        .await
        .expect("engine stops on its own");
        assert!(matches!(result, Err(MetaError::Fatal(_))));
        assert!(engine.fatal_signal().is_cancelled());
        assert!(engine.stats().fatal.is_some());
    }

    #[tokio::test]
    async fn lost_leases_are_forgotten_on_refresh() {
        let fx = fixture(MigrationConfig::default());
        let lease = fx
            .locker
            .obtain("bkt:k:1", Duration::from_millis(20))
            .await
            .unwrap();
        fx.engine.leases.insert(lease.key().to_string(), lease.clone());
        let kept = fx
            .locker
            .obtain("bkt:k:2", Duration::from_secs(10))
            .await
            .unwrap();
        fx.engine.leases.insert(kept.key().to_string(), kept);

        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.engine.refresh_leases().await.unwrap();
        assert_eq!(fx.engine.active_leases(), 1);
        assert!(fx.engine.leases.contains_key("bkt:k:2"));
    }

    #[tokio::test]
    async fn engine_run_migrates_and_drains_on_cancel() {
        let config = MigrationConfig {
            workers: 2,
            cooldown: Duration::ZERO,
            scan_interval: Duration::from_millis(20),
            drain_poll: Duration::from_millis(10),
            ..MigrationConfig::default()
        };
        let fx = fixture(config);
        let blob_id = fx.cluster.insert(FAST_POOL, b"run loop");
        let hot = hot_object(
            &fx.store,
            fx.cluster.as_ref(),
            blob_id,
            8,
            ChronoDuration::seconds(1),
        )
        .await;

        let cancel = CancellationToken::new();
        let running = tokio::spawn(fx.engine.clone().run(cancel.clone()));
        let mut migrated = false;
        for _ in 0..200 {
            if stored(&fx.store, &hot).await.pool == CAPACITY_POOL {
                migrated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(migrated);

        cancel.cancel();
        running.await.unwrap().unwrap();
        let stats = fx.engine.stats();
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.active_leases, 0);
        assert!(!fx.locker.is_held(MIGRATE_JOB_MUTEX));
        assert!(stats.fatal.is_none());
    }
}
