use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::lock::ResourceLock;
use crate::transfer::{Download, Upload};

/// Blob metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the blob in bytes.
    pub size: u64,

    /// The creation timestamp of the blob.
    pub created: DateTime<Utc>,
}

/// Whether a path component collides with a driver's own files.
///
/// Drivers keep staging files (`.tmp` and 32 hex digits), backups (`.old`) and
/// lock files (`.lock`) next to the blobs they belong to. Blobs may not use
/// those names.
pub fn is_reserved_name(name: &str) -> bool {
    if name.ends_with(".old") || name.ends_with(".lock") {
        return true;
    }

    match name.rsplit_once(".tmp") {
        Some((_, id)) => id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// Whether any component of `remote` is a reserved name.
pub fn has_reserved_component(remote: &Utf8Path) -> bool {
    remote
        .components()
        .any(|component| is_reserved_name(component.as_str()))
}

/// A storage driver: durable, lock-protected storage of named blobs.
///
/// Every blob is addressed by a bucket and a relative path. A driver owns
/// its storage root; two drivers must not share one.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for a blob, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Check whether a blob exists.
    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Read a whole blob.
    async fn read(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError>;

    /// Write a new blob, failing with `AlreadyExists` if it is present.
    async fn create(&self, bucket: &str, remote: &Utf8Path, data: Bytes)
        -> Result<(), StorageError>;

    /// Replace an existing blob, failing with `NotFound` if it is absent.
    async fn update(&self, bucket: &str, remote: &Utf8Path, data: Bytes)
        -> Result<(), StorageError>;

    /// Write a blob whether or not it exists.
    async fn write(&self, bucket: &str, remote: &Utf8Path, data: Bytes)
        -> Result<(), StorageError>;

    /// Acquire the advisory lock for a blob and read it.
    ///
    /// The lock is held until the returned [`ResourceLock`] is unlocked or
    /// dropped. Fails with `LockTimeout` if the lock stays busy, and with
    /// `NotFound` (after releasing the lock) if the blob is absent.
    async fn lock_and_read(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<(Bytes, ResourceLock), StorageError>;

    /// Open an upload to a new blob, failing with `AlreadyExists` if it is present.
    async fn upload(&self, bucket: &str, remote: &Utf8Path) -> Result<Upload, StorageError>;

    /// Open a download of a blob.
    async fn download(&self, bucket: &str, remote: &Utf8Path) -> Result<Download, StorageError>;

    /// Delete a blob from the storage, by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// List the blobs in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(bucket, remote).await
    }

    async fn read(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.deref().read(bucket, remote).await
    }

    async fn create(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.deref().create(bucket, remote, data).await
    }

    async fn update(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.deref().update(bucket, remote, data).await
    }

    async fn write(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.deref().write(bucket, remote, data).await
    }

    async fn lock_and_read(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<(Bytes, ResourceLock), StorageError> {
        self.deref().lock_and_read(bucket, remote).await
    }

    async fn upload(&self, bucket: &str, remote: &Utf8Path) -> Result<Upload, StorageError> {
        self.deref().upload(bucket, remote).await
    }

    async fn download(&self, bucket: &str, remote: &Utf8Path) -> Result<Download, StorageError> {
        self.deref().download(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name("package.json.old"));
        assert!(is_reserved_name("package.json.lock"));
        assert!(is_reserved_name("x.tmp0123456789abcdef0123456789abcdef"));
        assert!(!is_reserved_name("foo-1.0.0.tgz"));
        assert!(!is_reserved_name("template.tmpl"));
        assert!(!is_reserved_name("x.tmp0123"));

        assert!(has_reserved_component(Utf8Path::new("foo/package.json.old")));
        assert!(has_reserved_component(Utf8Path::new("foo.lock/package.json")));
        assert!(!has_reserved_component(Utf8Path::new("foo/package.json")));
    }
}
