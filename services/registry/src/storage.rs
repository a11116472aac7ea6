//! Package repository: documents and tarballs on top of a storage bucket

use std::collections::BTreeMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use storage::{Download, StorageBucket, StorageError, StorageErrorKind, Upload};

use crate::document::{self, Package, ensure_name};
use crate::error::{RegistryError, RegistryResult};

const DOCUMENT: &str = "package.json";

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Map a missing blob to a client-facing not-found message.
fn missing(message: &'static str) -> impl FnOnce(StorageError) -> RegistryError {
    move |error| {
        if error.is_not_found() {
            RegistryError::not_found(message)
        } else {
            error.into()
        }
    }
}

fn corrupt(error: serde_json::Error) -> RegistryError {
    StorageError::new("registry", StorageErrorKind::Corrupt, error).into()
}

fn decode(data: &[u8]) -> RegistryResult<Package> {
    Package::from_slice(data).map_err(corrupt)
}

fn encode(package: &Package) -> RegistryResult<Bytes> {
    package.to_vec().map(Bytes::from).map_err(corrupt)
}

/// Registry storage backend
///
/// Each package owns a directory in the bucket holding `package.json` and its
/// tarballs. Read-modify-write updates of a document hold the document's lock.
#[derive(Clone, Debug)]
pub struct RegistryStorage {
    bucket: StorageBucket,
}

impl RegistryStorage {
    /// Create a new registry storage
    pub fn new(storage: storage::Storage, bucket: impl Into<String>) -> Self {
        Self {
            bucket: storage.bucket(bucket),
        }
    }

    /// Get the path for a package document
    fn document_path(&self, name: &str) -> RegistryResult<Utf8PathBuf> {
        ensure_name("package", name)?;
        Ok(Utf8Path::new(name).join(DOCUMENT))
    }

    /// Get the path for a tarball
    fn tarball_path(&self, name: &str, filename: &str) -> RegistryResult<Utf8PathBuf> {
        ensure_name("package", name)?;
        ensure_name("filename", filename)?;
        Ok(Utf8Path::new(name).join(filename))
    }

    /// Get a package document
    #[tracing::instrument(skip(self))]
    pub async fn get_package(&self, name: &str) -> RegistryResult<Package> {
        let path = self.document_path(name)?;
        let data = self
            .bucket
            .read(&path)
            .await
            .map_err(missing("no such package available"))?;
        decode(&data)
    }

    /// Store a new package document, returning its revision
    #[tracing::instrument(skip(self, package))]
    pub async fn add_package(&self, name: &str, mut package: Package) -> RegistryResult<String> {
        let path = self.document_path(name)?;
        package.name = name.to_owned();
        package.attachments.clear();
        package.time.entry("created".into()).or_insert_with(now);
        package.time.insert("modified".into(), now());

        let rev = document::next_revision(None);
        package.rev = Some(rev.clone());

        self.bucket
            .create(&path, encode(&package)?)
            .await
            .map_err(|error| {
                if error.is_already_exists() {
                    RegistryError::conflict("this package is already present")
                } else {
                    error.into()
                }
            })?;

        tracing::info!(%rev, "created package");
        Ok(rev)
    }

    /// Replace a package document, if `revision` is current
    #[tracing::instrument(skip(self, package))]
    pub async fn change_package(
        &self,
        name: &str,
        mut package: Package,
        revision: &str,
    ) -> RegistryResult<String> {
        ensure_name("revision", revision)?;
        package.attachments.clear();

        let stored = self
            .update_locked(name, move |current| {
                if current.rev.as_deref() != Some(revision) {
                    return Err(RegistryError::conflict("this revision is out of date"));
                }

                // the replacement keeps the creation time and the revision sequence
                let created = current.time.get("created").cloned();
                let rev = current.rev.take();
                package.name = current.name.clone();
                package.rev = rev;
                if let Some(created) = created {
                    package.time.entry("created".into()).or_insert(created);
                }
                *current = package;
                Ok(true)
            })
            .await?;

        Ok(stored.rev.unwrap_or_default())
    }

    /// Insert a version, optionally pointing a dist-tag at it
    #[tracing::instrument(skip(self, manifest))]
    pub async fn add_version(
        &self,
        name: &str,
        version: &str,
        manifest: Value,
        tag: Option<&str>,
    ) -> RegistryResult<()> {
        ensure_name("version", version)?;
        if let Some(tag) = tag {
            ensure_name("tag", tag)?;
        }

        self.update_locked(name, move |package| {
            if package.versions.contains_key(version) {
                return Err(RegistryError::conflict("this version already present"));
            }

            package.versions.insert(version.to_owned(), manifest);
            package.time.insert(version.to_owned(), now());
            if let Some(tag) = tag {
                package.dist_tags.insert(tag.to_owned(), version.to_owned());
            }
            Ok(true)
        })
        .await?;

        tracing::info!("added version");
        Ok(())
    }

    /// Merge dist-tags into a package, replacing tags of the same name
    ///
    /// Tags are not checked against the package's versions.
    #[tracing::instrument(skip(self))]
    pub async fn add_tags(&self, name: &str, tags: BTreeMap<String, String>) -> RegistryResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        for (tag, version) in &tags {
            ensure_name("tag", tag)?;
            ensure_name("version", version)?;
        }

        self.update_locked(name, move |package| {
            package.dist_tags.extend(tags);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    /// Open an upload of a new tarball
    #[tracing::instrument(skip(self))]
    pub async fn add_tarball(&self, name: &str, filename: &str) -> RegistryResult<Upload> {
        let path = self.tarball_path(name, filename)?;
        self.bucket.upload(&path).await.map_err(|error| {
            if error.is_already_exists() {
                RegistryError::conflict("this tarball is already present")
            } else {
                error.into()
            }
        })
    }

    /// Delete a tarball, if `revision` is the package's current revision
    #[tracing::instrument(skip(self))]
    pub async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        revision: &str,
    ) -> RegistryResult<()> {
        ensure_name("revision", revision)?;
        let path = self.tarball_path(name, filename)?;

        let package = self.get_package(name).await?;
        if package.rev.as_deref() != Some(revision) {
            return Err(RegistryError::conflict("this revision is out of date"));
        }

        self.bucket
            .delete(&path)
            .await
            .map_err(missing("no such file available"))?;
        tracing::info!("removed tarball");
        Ok(())
    }

    /// Delete a tarball regardless of revision
    pub(crate) async fn discard_tarball(&self, name: &str, filename: &str) -> RegistryResult<()> {
        let path = self.tarball_path(name, filename)?;
        self.bucket
            .delete(&path)
            .await
            .map_err(missing("no such file available"))
    }

    /// Delete a package document and every tarball next to it
    ///
    /// Not transactional: a failure part way leaves the blobs deleted so far
    /// deleted.
    #[tracing::instrument(skip(self))]
    pub async fn remove_package(&self, name: &str) -> RegistryResult<()> {
        let document = self.document_path(name)?;
        if !self.bucket.exists(&document).await? {
            return Err(RegistryError::not_found("no such package available"));
        }

        let prefix = Utf8PathBuf::from(name);
        let blobs = self.bucket.list(Some(&prefix)).await?;
        for blob in blobs
            .iter()
            .map(Utf8Path::new)
            .filter(|blob| *blob != document.as_path())
        {
            tracing::debug!(%blob, "removing tarball");
            self.bucket
                .delete(blob)
                .await
                .map_err(missing("no such file available"))?;
        }

        self.bucket
            .delete(&document)
            .await
            .map_err(missing("no such package available"))?;

        tracing::info!(tarballs = blobs.len().saturating_sub(1), "removed package");
        Ok(())
    }

    /// Open a download of a tarball
    #[tracing::instrument(skip(self))]
    pub async fn get_tarball(&self, name: &str, filename: &str) -> RegistryResult<Download> {
        let path = self.tarball_path(name, filename)?;
        self.bucket
            .download(&path)
            .await
            .map_err(missing("no such file available"))
    }

    /// A version manifest, by version string or dist-tag
    pub async fn get_version(&self, name: &str, version_or_tag: &str) -> RegistryResult<Value> {
        let package = self.get_package(name).await?;
        package
            .get_version(version_or_tag)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(format!("version not found: {version_or_tag}")))
    }

    /// Names of every stored package
    #[tracing::instrument(skip(self))]
    pub async fn list_packages(&self) -> RegistryResult<Vec<String>> {
        let blobs = self.bucket.list(None).await?;
        let mut names: Vec<String> = blobs
            .iter()
            .map(Utf8Path::new)
            .filter(|blob| blob.file_name() == Some(DOCUMENT))
            .filter_map(|blob| blob.parent())
            .filter(|parent| parent.components().count() == 1)
            .map(|parent| parent.to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Read-modify-write a document under its lock.
    ///
    /// `update` returns whether it changed anything; an unchanged document is
    /// not written. A written document gets a new revision and modification
    /// time. The lock is released on every path out of this function.
    pub(crate) async fn update_locked<F>(&self, name: &str, update: F) -> RegistryResult<Package>
    where
        F: FnOnce(&mut Package) -> RegistryResult<bool> + Send,
    {
        let path = self.document_path(name)?;
        let (data, lock) = self
            .bucket
            .lock_and_read(&path)
            .await
            .map_err(missing("no such package available"))?;

        let mut package = decode(&data)?;
        if !update(&mut package)? {
            return Ok(package);
        }

        package.rev = Some(document::next_revision(package.rev.as_deref()));
        package.time.insert("modified".into(), now());
        self.bucket.write(&path, encode(&package)?).await?;

        lock.unlock();
        tracing::debug!(rev = ?package.rev, "updated package");
        Ok(package)
    }
}
