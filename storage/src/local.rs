//! Filesystem storage driver.
//!
//! Blobs live at `<root>/<bucket>/b/<remote>`. Next to a blob the driver may
//! leave three kinds of internal files, none of which are ever listed:
//!
//! - `<blob>.tmp<uuid>`: a staging file for a write or upload in progress,
//!   or stranded by a crash before the write completed.
//! - `<blob>.old`: the previous generation of the blob.
//! - `<blob>.lock`: the advisory lock file for the blob. It is never replaced
//!   by writes, so a lock taken on it stays meaningful across renames of the
//!   blob itself.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use eyre::{eyre, WrapErr as _};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::Instrument;

use storage_driver::{
    Download, Driver, LockRetry, Metadata, ResourceLock, StorageError, StorageErrorKind, Upload,
    UploadSink, has_reserved_component, is_reserved_name,
};

const ENGINE: &str = "local";

/// Stores blobs as files under a root directory.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    retry: LockRetry,
}

impl LocalDriver {
    /// Create a driver which owns `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            retry: LockRetry::default(),
        }
    }

    /// Override the lock retry policy.
    pub fn with_lock_retry(mut self, retry: LockRetry) -> Self {
        self.retry = retry;
        self
    }

    /// The storage root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn base(&self, bucket: &str) -> Result<Utf8PathBuf, StorageError> {
        if !is_single_component(Utf8Path::new(bucket)) {
            return Err(invalid_path(bucket, bucket));
        }
        let mut path = self.root.join(bucket);
        path.push("b");
        Ok(path)
    }

    pub(crate) fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let relative = remote.components().count() > 0
            && remote
                .components()
                .all(|c| matches!(c, Utf8Component::Normal(_)));
        if !relative {
            return Err(invalid_path(bucket, remote.as_str()));
        }
        if has_reserved_component(remote) {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                eyre!("path collides with a staging, backup or lock file"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        let mut path = self.base(bucket)?;
        path.push(remote);
        Ok(path)
    }
}

fn is_single_component(path: &Utf8Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Utf8Component::Normal(_)), None)
    )
}

fn invalid_path(bucket: &str, remote: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::InvalidRequest,
        eyre!("path must be relative and must not traverse directories"),
    )
    .bucket(bucket)
    .path(remote)
    .build()
}

fn failed<'a>(
    bucket: &'a str,
    remote: &'a Utf8Path,
    context: &'static str,
) -> impl FnOnce(io::Error) -> StorageError + 'a {
    move |err| {
        StorageError::io(ENGINE, err)
            .bucket(bucket)
            .path(remote.as_str())
            .context(context)
            .build()
    }
}

fn sibling(target: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{target}{suffix}"))
}

fn staging_path(target: &Utf8Path) -> Utf8PathBuf {
    sibling(target, &format!(".tmp{}", uuid::Uuid::new_v4().simple()))
}

pub(crate) fn backup_path(target: &Utf8Path) -> Utf8PathBuf {
    sibling(target, ".old")
}

pub(crate) fn lock_path(target: &Utf8Path) -> Utf8PathBuf {
    sibling(target, ".lock")
}

/// Treat a missing file as success.
fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A payload written and synced to a staging file, not yet visible at its target.
#[derive(Debug)]
pub(crate) struct Staged {
    pub(crate) staging: Utf8PathBuf,
    pub(crate) target: Utf8PathBuf,
}

impl Staged {
    /// Write `data` next to `target`. A missing parent directory is created
    /// and the write retried once.
    pub(crate) async fn write(target: &Utf8Path, data: &[u8]) -> io::Result<Self> {
        let staging = staging_path(target);

        match write_synced(&staging, data).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                write_synced(&staging, data).await?;
            }
            other => other?,
        }

        Ok(Self {
            staging,
            target: target.to_owned(),
        })
    }

    /// Keep the current target as the `.old` backup and move the staged
    /// payload onto the target.
    pub(crate) async fn commit(self) -> io::Result<()> {
        backup(&self.target).await?;
        fs::rename(&self.staging, &self.target).await
    }

    /// Move the staged payload onto the target only if no target exists.
    pub(crate) async fn commit_new(self) -> io::Result<()> {
        let linked = fs::hard_link(&self.staging, &self.target).await;
        if let Err(err) = fs::remove_file(&self.staging).await {
            tracing::warn!(staging = %self.staging, "unable to remove staging file: {err}");
        }
        linked
    }
}

async fn write_synced(path: &Utf8Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Replace any stale `.old` with the current target.
///
/// The backup is a hard link, so the target stays in place until the final
/// rename replaces it. Where links are unavailable the target is renamed
/// instead, which briefly leaves no file at the target path.
pub(crate) async fn backup(target: &Utf8Path) -> io::Result<()> {
    let old = backup_path(target);
    ignore_missing(fs::remove_file(&old).await)?;

    match fs::hard_link(target, &old).await {
        // no current generation, or a concurrent writer already linked one
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::AlreadyExists
            ) =>
        {
            Ok(())
        }
        Err(err) => {
            tracing::debug!(%target, "hard link backup failed, renaming: {err}");
            ignore_missing(fs::rename(target, &old).await)
        }
        Ok(()) => Ok(()),
    }
}

fn try_lock(path: &Utf8Path) -> io::Result<Option<Flock<std::fs::File>>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    lock_file(file, path)
}

/// Lock an open lock file, if it is still the one linked at `path`.
fn lock_file(file: std::fs::File, path: &Utf8Path) -> io::Result<Option<Flock<std::fs::File>>> {
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            // a lock on a file its last holder unlinked excludes nobody
            let held = lock.metadata()?;
            match std::fs::metadata(path) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    Ok(Some(lock))
                }
                Ok(_) => Ok(None),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            }
        }
        // the descriptor is closed as the file is dropped here
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(errno.into()),
    }
}

/// Remove a lock file unless some handle holds it.
fn remove_lock_file(path: &Utf8Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    match try_lock(path)? {
        Some(_held) => ignore_missing(std::fs::remove_file(path)),
        None => Ok(()),
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(failed(bucket, remote, "metadata"))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(failed(bucket, remote, "metadata"))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    #[tracing::instrument(skip(self), fields(driver = ENGINE))]
    async fn read(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        let path = self.path(bucket, remote)?;
        let data = fs::read(&path).await.map_err(failed(bucket, remote, "read"))?;
        Ok(data.into())
    }

    #[tracing::instrument(skip(self, data), fields(driver = ENGINE, size = data.len()))]
    async fn create(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        if fs::try_exists(&path)
            .await
            .map_err(failed(bucket, remote, "create"))?
        {
            return Err(already_exists(bucket, remote));
        }

        Staged::write(&path, &data)
            .await
            .map_err(failed(bucket, remote, "create: stage"))?
            .commit_new()
            .await
            .map_err(failed(bucket, remote, "create: commit"))
    }

    #[tracing::instrument(skip(self, data), fields(driver = ENGINE, size = data.len()))]
    async fn update(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        if !fs::try_exists(&path)
            .await
            .map_err(failed(bucket, remote, "update"))?
        {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                eyre!("no blob to update"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        self.write(bucket, remote, data).await
    }

    #[tracing::instrument(skip(self, data), fields(driver = ENGINE, size = data.len()))]
    async fn write(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        Staged::write(&path, &data)
            .await
            .map_err(failed(bucket, remote, "write: stage"))?
            .commit()
            .await
            .map_err(failed(bucket, remote, "write: commit"))
    }

    #[tracing::instrument(skip(self), fields(driver = ENGINE))]
    async fn lock_and_read(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<(Bytes, ResourceLock), StorageError> {
        let path = self.path(bucket, remote)?;
        let lock_file = lock_path(&path);

        let lock = self
            .retry
            .acquire(ENGINE, remote.as_str(), || {
                try_lock(&lock_file).map_err(failed(bucket, remote, "lock"))
            })
            .await?;
        let lock = ResourceLock::new(remote.as_str(), lock);

        // on error the lock is dropped, and so released, before returning
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    ignore_missing(fs::remove_file(&lock_file).await)
                        .map_err(failed(bucket, remote, "remove lock file"))?;
                }
                return Err(failed(bucket, remote, "read locked")(err));
            }
        };
        tracing::trace!(size = data.len(), "acquired lock and read");

        Ok((data.into(), lock))
    }

    #[tracing::instrument(skip(self), fields(driver = ENGINE))]
    async fn upload(&self, bucket: &str, remote: &Utf8Path) -> Result<Upload, StorageError> {
        let path = self.path(bucket, remote)?;
        if fs::try_exists(&path)
            .await
            .map_err(failed(bucket, remote, "upload"))?
        {
            return Err(already_exists(bucket, remote));
        }

        let staging = staging_path(&path);
        let file = match create_staging(&staging).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(failed(bucket, remote, "upload: create directory"))?;
                }
                create_staging(&staging).await
            }
            other => other,
        }
        .map_err(failed(bucket, remote, "upload: open staging file"))?;

        tracing::trace!(%staging, "opened upload");
        Ok(Upload::new(
            remote.as_str(),
            LocalUpload {
                file: Some(BufWriter::new(file)),
                staging,
                target: path,
                settled: false,
            },
        ))
    }

    #[tracing::instrument(skip(self), fields(driver = ENGINE))]
    async fn download(&self, bucket: &str, remote: &Utf8Path) -> Result<Download, StorageError> {
        let path = self.path(bucket, remote)?;
        let file = fs::File::open(&path)
            .await
            .map_err(failed(bucket, remote, "download: open"))?;
        let length = file
            .metadata()
            .await
            .map_err(failed(bucket, remote, "download: stat"))?
            .len();

        Ok(Download::new(remote.as_str(), length, file))
    }

    #[tracing::instrument(skip(self), fields(driver = ENGINE))]
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        fs::remove_file(&path)
            .await
            .map_err(failed(bucket, remote, "remove_file"))?;
        ignore_missing(fs::remove_file(backup_path(&path)).await)
            .map_err(failed(bucket, remote, "remove backup"))?;
        remove_lock_file(&lock_path(&path)).map_err(failed(bucket, remote, "remove lock file"))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(driver = ENGINE))]
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.base(bucket)?;
        let start = match prefix {
            Some(prefix) if !prefix.as_str().is_empty() => self.path(bucket, prefix)?,
            _ => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &start))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(ENGINE, err).bucket(bucket).context("list").build())?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

fn already_exists(bucket: &str, remote: &Utf8Path) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::AlreadyExists,
        eyre!("blob already exists"),
    )
    .bucket(bucket)
    .path(remote.as_str())
    .build()
}

async fn create_staging(path: &Utf8Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

fn collect_list(base: &Utf8Path, start: &Utf8Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    match visit(start, &mut files) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        other => other?,
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_string()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else if !is_reserved_name(entry.file_name()) {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

/// Upload sink writing to a staging file next to the target.
#[derive(Debug)]
struct LocalUpload {
    file: Option<BufWriter<fs::File>>,
    staging: Utf8PathBuf,
    target: Utf8PathBuf,
    settled: bool,
}

impl LocalUpload {
    fn file(&mut self) -> io::Result<&mut BufWriter<fs::File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "upload is closed"))
    }

    fn error(&self, context: &'static str) -> impl FnOnce(io::Error) -> StorageError + '_ {
        move |err| {
            StorageError::io(ENGINE, err)
                .path(self.target.as_str())
                .context(context)
                .build()
        }
    }
}

impl AsyncWrite for LocalUpload {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().file() {
            Ok(file) => Pin::new(file).poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file() {
            Ok(file) => Pin::new(file).poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file() {
            Ok(file) => Pin::new(file).poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

#[async_trait::async_trait]
impl UploadSink for LocalUpload {
    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "upload is closed"))
            .map_err(self.error("commit"))?;

        file.flush().await.map_err(self.error("commit: flush"))?;
        let file = file.into_inner();
        file.sync_all().await.map_err(self.error("commit: sync"))?;
        drop(file);

        backup(&self.target)
            .await
            .map_err(self.error("commit: backup"))?;
        fs::rename(&self.staging, &self.target)
            .await
            .map_err(self.error("commit: rename"))?;
        self.settled = true;
        Ok(())
    }

    async fn discard(mut self: Box<Self>) -> Result<(), StorageError> {
        drop(self.file.take());
        let removed = ignore_missing(fs::remove_file(&self.staging).await);
        self.settled = true;
        removed.map_err(self.error("discard"))
    }
}

impl Drop for LocalUpload {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(staging = %self.staging, "removing abandoned upload");
            if let Err(err) = std::fs::remove_file(&self.staging) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(staging = %self.staging, "unable to remove staging file: {err}");
                }
            }
        }
    }
}
