//! # Storage backends
//!
//! Configuration and unification for the blob storage backends.

use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{
    Download, Driver, LockRetry, Metadata, ResourceLock, StorageError, StorageErrorKind,
    TransferState, Upload, is_reserved_name,
};

/// Which storage backend to use, as read from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in memory, pre-creating a single bucket.
    Memory {
        /// The bucket to create.
        bucket: String,
    },

    /// Store blobs under a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// The storage root.
        path: Utf8PathBuf,
    },

    /// Store blobs in a fresh temporary directory.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| StorageError::io("local", err).path(path.as_str()).build())?;
                LocalDriver::new(path).into()
            }
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::io("temp", err).build())?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// Storage operations scoped to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket name.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The name of the underlying driver.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Get the metadata for a blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Check whether a blob exists.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    /// Read a whole blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn read(&self, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.read(&self.bucket, remote).await
    }

    /// Write a new blob, failing if it exists.
    #[tracing::instrument(skip(self, data), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn create(&self, remote: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        self.driver.create(&self.bucket, remote, data).await
    }

    /// Replace an existing blob.
    #[tracing::instrument(skip(self, data), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn update(&self, remote: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        self.driver.update(&self.bucket, remote, data).await
    }

    /// Write a blob unconditionally.
    #[tracing::instrument(skip(self, data), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn write(&self, remote: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        self.driver.write(&self.bucket, remote, data).await
    }

    /// Lock a blob and read it.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn lock_and_read(
        &self,
        remote: &Utf8Path,
    ) -> Result<(Bytes, ResourceLock), StorageError> {
        self.driver.lock_and_read(&self.bucket, remote).await
    }

    /// Open an upload to a new blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn upload(&self, remote: &Utf8Path) -> Result<Upload, StorageError> {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote).await
    }

    /// Open a download of a blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn download(&self, remote: &Utf8Path) -> Result<Download, StorageError> {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote).await
    }

    /// List blobs, optionally under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Delete a blob.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_json() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"memory": {"bucket": "registry"}}"#).unwrap();
        assert!(matches!(config, StorageConfig::Memory { bucket } if bucket == "registry"));

        let config: StorageConfig =
            serde_json::from_str(r#"{"local": {"path": "/var/lib/registry"}}"#).unwrap();
        assert!(matches!(config, StorageConfig::Local { .. }));
    }

    #[tokio::test]
    async fn bucket_handle_scopes_operations() {
        let storage: Storage = MemoryStorage::new().into();
        let left = storage.bucket("left");
        let right = storage.bucket("right");

        left.write(Utf8Path::new("a"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        assert!(left.exists(Utf8Path::new("a")).await.unwrap());
        assert!(!right.exists(Utf8Path::new("a")).await.unwrap());
        assert_eq!(storage.name(), "memory");
    }
}
