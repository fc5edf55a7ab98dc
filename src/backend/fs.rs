//! Filesystem blob cluster.
//!
//! Blobs live at `root/{pool}/{shard}/{shard}/{blob_id}` where the shards are
//! the first two bytes of MD5(pool/blob_id). New blobs are streamed into a
//! temporary file, fsynced, then renamed into place so a reader never sees a
//! partial blob.

use super::{BlobCluster, BlobError, BlobReader, PutOutcome};
use async_trait::async_trait;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct FsCluster {
    id: String,
    base_path: PathBuf,
}

impl FsCluster {
    pub fn new(id: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn pool_root(&self, pool: &str) -> PathBuf {
        self.base_path.join(pool)
    }

    /// Two-level shard directories for a blob, from MD5(pool/blob_id).
    fn blob_shards(pool: &str, blob_id: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", pool, blob_id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, pool: &str, blob_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::blob_shards(pool, blob_id);
        let mut path = self.pool_root(pool);
        path.push(shard_a);
        path.push(shard_b);
        path.push(blob_id);
        path
    }

    fn not_found(pool: &str, blob_id: &str) -> BlobError {
        BlobError::NotFound {
            pool: pool.to_string(),
            blob_id: blob_id.to_string(),
        }
    }

    async fn write_new(
        &self,
        pool: &str,
        blob_id: String,
        reader: BlobReader,
    ) -> Result<PutOutcome, BlobError> {
        let file_path = self.blob_path(pool, &blob_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::from(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written = match copy_counted(reader, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io {
                bytes_written: written,
                source: err,
            });
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io {
                bytes_written: written,
                source: err,
            });
        }

        Ok(PutOutcome {
            blob_id,
            bytes_written: written,
        })
    }

    /// Recursively remove empty directories up to the pool root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobCluster for FsCluster {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(&self, pool: &str, reader: BlobReader) -> Result<PutOutcome, BlobError> {
        self.write_new(pool, Uuid::new_v4().simple().to_string(), reader)
            .await
    }

    async fn append(
        &self,
        pool: &str,
        blob_id: Option<&str>,
        reader: BlobReader,
        offset: u64,
        expected_old_size: u64,
    ) -> Result<PutOutcome, BlobError> {
        let Some(blob_id) = blob_id else {
            if offset != 0 || expected_old_size != 0 {
                return Err(BlobError::AppendPosition {
                    blob_id: String::new(),
                    expected: expected_old_size,
                    actual: 0,
                });
            }
            return self
                .write_new(pool, Uuid::new_v4().simple().to_string(), reader)
                .await;
        };

        let file_path = self.blob_path(pool, blob_id);
        let mut file = match OpenOptions::new().append(true).open(&file_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Self::not_found(pool, blob_id));
            }
            Err(err) => return Err(err.into()),
        };
        let actual = file.metadata().await?.len();
        if actual != expected_old_size || offset != expected_old_size {
            return Err(BlobError::AppendPosition {
                blob_id: blob_id.to_string(),
                expected: expected_old_size,
                actual,
            });
        }

        let written = match copy_counted(reader, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                // roll the blob back to its previous length
                let _ = file.set_len(expected_old_size).await;
                return Err(err);
            }
        };
        file.sync_all().await.map_err(|source| BlobError::Io {
            bytes_written: written,
            source,
        })?;

        Ok(PutOutcome {
            blob_id: blob_id.to_string(),
            bytes_written: written,
        })
    }

    async fn get_reader(
        &self,
        pool: &str,
        blob_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<BlobReader, BlobError> {
        let file_path = self.blob_path(pool, blob_id);
        let mut file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                Self::not_found(pool, blob_id)
            } else {
                BlobError::from(err)
            }
        })?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::pin(file.take(length)))
    }

    async fn remove(&self, pool: &str, blob_id: &str) -> Result<(), BlobError> {
        let file_path = self.blob_path(pool, blob_id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Self::not_found(pool, blob_id));
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = file_path.parent() {
            let pool_root = self.pool_root(pool);
            self.prune_empty_dirs(parent, &pool_root).await;
        }
        Ok(())
    }
}

/// Copy `reader` into `file`, keeping an exact count of what was written even
/// when the copy fails half way.
async fn copy_counted<R>(mut reader: R, file: &mut File) -> Result<u64, BlobError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(source) => {
                return Err(BlobError::Io {
                    bytes_written: written,
                    source,
                });
            }
        };
        if let Err(source) = file.write_all(&buf[..n]).await {
            return Err(BlobError::Io {
                bytes_written: written,
                source,
            });
        }
        written += n as u64;
    }
    file.flush().await.map_err(|source| BlobError::Io {
        bytes_written: written,
        source,
    })?;
    Ok(written)
}
