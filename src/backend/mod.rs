//! Blob clusters: opaque byte stores addressed by `(location, pool, blob_id)`.
//!
//! The metadata engine never looks inside a blob. It only needs to create
//! one, read it back, and remove it once no metadata row references it.

pub mod fs;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::{io, pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use fs::FsCluster;

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{pool}/{blob_id}` not found")]
    NotFound { pool: String, blob_id: String },
    #[error("unknown cluster `{0}`")]
    UnknownCluster(String),
    #[error("append to `{blob_id}` expected size {expected} but blob has {actual} bytes")]
    AppendPosition {
        blob_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("blob I/O failed after {bytes_written} bytes: {source}")]
    Io {
        bytes_written: u64,
        #[source]
        source: io::Error,
    },
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    /// Bytes that reached the cluster before the failure.
    pub fn bytes_written(&self) -> u64 {
        match self {
            BlobError::Io { bytes_written, .. } => *bytes_written,
            _ => 0,
        }
    }
}

impl From<io::Error> for BlobError {
    fn from(source: io::Error) -> Self {
        BlobError::Io {
            bytes_written: 0,
            source,
        }
    }
}

/// Result of a write. `bytes_written` is what actually landed, which may be
/// less than the caller expected when the source ran dry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub blob_id: String,
    pub bytes_written: u64,
}

#[async_trait]
pub trait BlobCluster: Send + Sync {
    /// Location id recorded in object metadata.
    fn id(&self) -> &str;

    /// Store a new blob under a freshly generated id.
    async fn put(&self, pool: &str, reader: BlobReader) -> Result<PutOutcome, BlobError>;

    /// Append to `blob_id` (or create it when `None`). The blob must currently
    /// hold exactly `expected_old_size` bytes and `offset` must equal it.
    async fn append(
        &self,
        pool: &str,
        blob_id: Option<&str>,
        reader: BlobReader,
        offset: u64,
        expected_old_size: u64,
    ) -> Result<PutOutcome, BlobError>;

    async fn get_reader(
        &self,
        pool: &str,
        blob_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<BlobReader, BlobError>;

    async fn remove(&self, pool: &str, blob_id: &str) -> Result<(), BlobError>;
}

/// Blob clusters by location id.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    clusters: BTreeMap<String, Arc<dyn BlobCluster>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn BlobCluster>) -> Self {
        self.clusters.insert(cluster.id().to_string(), cluster);
        self
    }

    pub fn get(&self, location: &str) -> Result<Arc<dyn BlobCluster>, BlobError> {
        self.clusters
            .get(location)
            .cloned()
            .ok_or_else(|| BlobError::UnknownCluster(location.to_string()))
    }

    /// Cluster that receives new blobs for `pool`. Every registered cluster
    /// serves every pool, so this is the first one by id.
    pub fn pick(&self, pool: &str) -> Result<Arc<dyn BlobCluster>, BlobError> {
        self.clusters
            .values()
            .next()
            .cloned()
            .ok_or_else(|| BlobError::UnknownCluster(format!("<none for pool {pool}>")))
    }

    pub fn ids(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Wrap an in-memory buffer as a [`BlobReader`].
pub fn reader_from_bytes(data: impl Into<bytes::Bytes>) -> BlobReader {
    Box::pin(io::Cursor::new(data.into()))
}
