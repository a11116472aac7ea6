use std::io;

use bytes::Bytes;
use camino::Utf8Path;
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Download, Driver, Metadata, ResourceLock, StorageError, Upload};

/// A storage driver that stores blobs in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempDriver {
    driver: LocalDriver,
    #[allow(unused)]
    dir: TempDir,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "temporary path is not UTF-8"))?
            .to_owned();

        Ok(Self {
            driver: LocalDriver::new(root),
            dir: tmp,
        })
    }

    /// The temporary storage root.
    pub fn root(&self) -> &Utf8Path {
        self.driver.root()
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn read(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.read(bucket, remote).await
    }

    async fn create(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.driver.create(bucket, remote, data).await
    }

    async fn update(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.driver.update(bucket, remote, data).await
    }

    async fn write(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.driver.write(bucket, remote, data).await
    }

    async fn lock_and_read(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<(Bytes, ResourceLock), StorageError> {
        self.driver.lock_and_read(bucket, remote).await
    }

    async fn upload(&self, bucket: &str, remote: &Utf8Path) -> Result<Upload, StorageError> {
        self.driver.upload(bucket, remote).await
    }

    async fn download(&self, bucket: &str, remote: &Utf8Path) -> Result<Download, StorageError> {
        self.driver.download(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }
}
