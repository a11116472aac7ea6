use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, RwLock};

use storage_driver::{
    Download, Driver, LockRetry, Metadata, ResourceLock, StorageError, StorageErrorKind, Upload,
    UploadSink, has_reserved_component,
};

const ENGINE: &str = "memory";

type Buckets = Arc<RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryFileItem>>>>;

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryFileItem {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

fn not_found(bucket: &str, remote: &Utf8Path) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        io::Error::new(io::ErrorKind::NotFound, format!("Path not found: {remote}")),
    )
    .bucket(bucket)
    .path(remote.as_str())
    .build()
}

fn already_exists(bucket: &str, remote: &Utf8Path) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::AlreadyExists,
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("Path already exists: {remote}"),
        ),
    )
    .bucket(bucket)
    .path(remote.as_str())
    .build()
}

/// Blob names are held to the same rules as the filesystem driver.
fn check_path(bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
    if remote.as_str().is_empty() || has_reserved_component(remote) {
        return Err(StorageError::builder(
            ENGINE,
            StorageErrorKind::InvalidRequest,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Path is reserved: {remote}"),
            ),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .build());
    }
    Ok(())
}

/// Storage driver that stores blobs in memory.
///
/// Writes are atomic under the bucket lock, so there is no staging and
/// nothing survives the process. Locks are per-blob async mutexes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: Buckets,
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry: LockRetry,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: Arc::new(RwLock::new(map)),
            ..Default::default()
        }
    }

    /// Override the lock retry policy.
    pub fn with_lock_retry(mut self, retry: LockRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    async fn get(&self, bucket: &str, remote: &Utf8Path) -> Result<MemoryFileItem, StorageError> {
        check_path(bucket, remote)?;
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|items| items.get(remote))
            .cloned()
            .ok_or_else(|| not_found(bucket, remote))
    }

    fn lock_for(&self, bucket: &str, remote: &Utf8Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(format!("{bucket}/{remote}"))
            .or_default()
            .clone()
    }

    /// Forget a blob's lock once no handle holds or waits on it.
    fn prune_lock(&self, bucket: &str, remote: &Utf8Path) {
        let mut locks = self.locks.lock();
        let key = format!("{bucket}/{remote}");
        if locks
            .get(&key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&key);
        }
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        Ok((&self.get(bucket, remote).await?).into())
    }

    async fn read(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        Ok(self.get(bucket, remote).await?.data)
    }

    async fn create(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        check_path(bucket, remote)?;
        let mut buckets = self.buckets.write().await;
        let items = buckets.entry(bucket.to_owned()).or_default();
        if items.contains_key(remote) {
            return Err(already_exists(bucket, remote));
        }
        items.insert(remote.to_owned(), data.into());
        Ok(())
    }

    async fn update(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        check_path(bucket, remote)?;
        let mut buckets = self.buckets.write().await;
        let item = buckets
            .get_mut(bucket)
            .and_then(|items| items.get_mut(remote))
            .ok_or_else(|| not_found(bucket, remote))?;
        *item = data.into();
        Ok(())
    }

    async fn write(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        check_path(bucket, remote)?;
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_owned())
            .or_default()
            .insert(remote.to_owned(), data.into());
        Ok(())
    }

    async fn lock_and_read(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<(Bytes, ResourceLock), StorageError> {
        check_path(bucket, remote)?;
        let mutex = self.lock_for(bucket, remote);
        let acquired = self
            .retry
            .acquire(ENGINE, remote.as_str(), || {
                Ok(mutex.clone().try_lock_owned().ok())
            })
            .await;
        drop(mutex);
        let guard = match acquired {
            Ok(guard) => guard,
            Err(error) => {
                self.prune_lock(bucket, remote);
                return Err(error);
            }
        };

        match self.read(bucket, remote).await {
            Ok(data) => Ok((data, ResourceLock::new(remote.as_str(), guard))),
            Err(error) => {
                drop(guard);
                self.prune_lock(bucket, remote);
                Err(error)
            }
        }
    }

    async fn upload(&self, bucket: &str, remote: &Utf8Path) -> Result<Upload, StorageError> {
        check_path(bucket, remote)?;
        if self.exists(bucket, remote).await? {
            return Err(already_exists(bucket, remote));
        }

        Ok(Upload::new(
            remote.as_str(),
            MemoryUpload {
                buckets: self.buckets.clone(),
                bucket: bucket.to_owned(),
                remote: remote.to_owned(),
                staged: Vec::new(),
            },
        ))
    }

    async fn download(&self, bucket: &str, remote: &Utf8Path) -> Result<Download, StorageError> {
        let data = self.read(bucket, remote).await?;
        Ok(Download::new(
            remote.as_str(),
            data.len() as u64,
            io::Cursor::new(data),
        ))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        check_path(bucket, remote)?;
        let mut buckets = self.buckets.write().await;
        buckets
            .get_mut(bucket)
            .and_then(|items| items.remove(remote))
            .ok_or_else(|| not_found(bucket, remote))?;
        drop(buckets);

        self.prune_lock(bucket, remote);
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let buckets = self.buckets.read().await;
        let Some(items) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        Ok(items
            .keys()
            .filter(|path| prefix.map_or(true, |prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect())
    }
}

/// A buffered upload which becomes visible as a whole on commit.
#[derive(Debug)]
struct MemoryUpload {
    buckets: Buckets,
    bucket: String,
    remote: Utf8PathBuf,
    staged: Vec<u8>,
}

impl AsyncWrite for MemoryUpload {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().staged.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl UploadSink for MemoryUpload {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        let mut buckets = this.buckets.write().await;
        buckets
            .entry(this.bucket)
            .or_default()
            .insert(this.remote, Bytes::from(this.staged).into());
        Ok(())
    }

    async fn discard(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
