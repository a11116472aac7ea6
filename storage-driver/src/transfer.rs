//! Streaming transfers between network peers and a storage driver.
//!
//! An [`Upload`] or [`Download`] is produced by the driver once the
//! underlying resource is ready; the pending [`Driver::upload`] or
//! [`Driver::download`] future is the "opening" phase, and a failure to open
//! is simply the error it resolves to. From there both directions walk the
//! same [`TransferState`] machine.
//!
//! [`Driver::upload`]: crate::Driver::upload
//! [`Driver::download`]: crate::Driver::download

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use eyre::eyre;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{StorageError, StorageErrorKind};

/// Lifecycle of a transfer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// The resource is ready and no bytes have moved yet.
    Open,

    /// At least one byte has moved.
    Transferring,

    /// Terminal: an upload was committed, or a download reached its end.
    Finalized,

    /// Terminal: the transfer was abandoned before completion.
    Aborted,

    /// Terminal: the underlying resource reported an error.
    Failed,
}

impl TransferState {
    /// Whether the transfer can still move bytes.
    pub fn is_active(&self) -> bool {
        matches!(self, TransferState::Open | TransferState::Transferring)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Open => write!(f, "open"),
            TransferState::Transferring => write!(f, "transferring"),
            TransferState::Finalized => write!(f, "finalized"),
            TransferState::Aborted => write!(f, "aborted"),
            TransferState::Failed => write!(f, "failed"),
        }
    }
}

/// The driver side of an upload: a writable staging area which can be
/// committed onto its target or thrown away.
///
/// Implementations must discard the staging area when dropped without a
/// call to [`UploadSink::commit`].
#[async_trait::async_trait]
pub trait UploadSink: AsyncWrite + Send + Unpin + fmt::Debug {
    /// Flush staged bytes and make them visible at the target.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Throw away the staged bytes.
    async fn discard(self: Box<Self>) -> Result<(), StorageError>;
}

/// An upload of a single blob.
///
/// Bytes are written through [`AsyncWrite`]; the producer is suspended by the
/// sink's own write readiness, so nothing is buffered beyond what the sink
/// buffers. The producer calls [`Upload::finalize`] after the last byte,
/// or [`Upload::abort`] if its input ended early.
#[derive(Debug)]
pub struct Upload {
    resource: String,
    state: TransferState,
    written: u64,
    sink: Option<Box<dyn UploadSink>>,
}

impl Upload {
    /// Create an open upload over a driver's sink.
    pub fn new<S>(resource: impl Into<String>, sink: S) -> Self
    where
        S: UploadSink + 'static,
    {
        Self {
            resource: resource.into(),
            state: TransferState::Open,
            written: 0,
            sink: Some(Box::new(sink)),
        }
    }

    /// The name of the blob being uploaded.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The current state of the upload.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Commit the upload. Returns the number of bytes written.
    ///
    /// Fails with [`StorageErrorKind::InvalidRequest`] if the upload is no
    /// longer active.
    #[tracing::instrument(skip(self), fields(resource = %self.resource, written = self.written))]
    pub async fn finalize(&mut self) -> Result<u64, StorageError> {
        let sink = match self.sink.take() {
            Some(sink) if self.state.is_active() => sink,
            sink => {
                self.sink = sink;
                return Err(self.closed("finalize"));
            }
        };

        match sink.commit().await {
            Ok(()) => {
                self.state = TransferState::Finalized;
                tracing::debug!("upload finalized");
                Ok(self.written)
            }
            Err(error) => {
                self.state = TransferState::Failed;
                Err(error)
            }
        }
    }

    /// Abandon the upload, discarding anything staged.
    ///
    /// This is a no-op once the upload has been finalized or aborted.
    #[tracing::instrument(skip(self), fields(resource = %self.resource, written = self.written))]
    pub async fn abort(&mut self) -> Result<(), StorageError> {
        if matches!(
            self.state,
            TransferState::Finalized | TransferState::Aborted
        ) {
            return Ok(());
        }

        if self.state.is_active() {
            self.state = TransferState::Aborted;
        }

        if let Some(sink) = self.sink.take() {
            tracing::debug!("upload aborted");
            sink.discard().await?;
        }
        Ok(())
    }

    fn closed(&self, operation: &str) -> StorageError {
        StorageError::builder(
            "transfer",
            StorageErrorKind::InvalidRequest,
            eyre!("cannot {operation} an upload which is {}", self.state),
        )
        .path(self.resource.clone())
        .build()
    }

    fn sink(&mut self) -> io::Result<&mut Box<dyn UploadSink>> {
        if !self.state.is_active() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("upload is {}", self.state),
            ));
        }
        self.sink
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "upload is closed"))
    }
}

impl AsyncWrite for Upload {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let sink = match this.sink() {
            Ok(sink) => sink,
            Err(error) => return Poll::Ready(Err(error)),
        };

        match Pin::new(&mut **sink).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                this.state = TransferState::Transferring;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(error)) => {
                this.state = TransferState::Failed;
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.sink() {
            Ok(sink) => Pin::new(&mut **sink).poll_flush(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.sink() {
            Ok(sink) => Pin::new(&mut **sink).poll_shutdown(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

/// The byte source behind a [`Download`].
pub type Source = dyn AsyncRead + Send + Unpin;

/// A download of a single blob.
///
/// The total length is known as soon as the download exists, before the
/// first byte is read, so it can be sent ahead as a `Content-Length`.
pub struct Download {
    resource: String,
    length: u64,
    read: u64,
    state: TransferState,
    source: Option<Box<Source>>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("resource", &self.resource)
            .field("length", &self.length)
            .field("read", &self.read)
            .field("state", &self.state)
            .finish()
    }
}

impl Download {
    /// Create an open download of `length` bytes.
    pub fn new<R>(resource: impl Into<String>, length: u64, source: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            resource: resource.into(),
            length,
            read: 0,
            state: TransferState::Open,
            source: Some(Box::new(source)),
        }
    }

    /// The name of the blob being downloaded.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The total number of bytes in the blob.
    pub fn content_length(&self) -> u64 {
        self.length
    }

    /// The current state of the download.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Stop reading early and close the source. Not an error.
    pub fn abort(&mut self) {
        if self.state.is_active() {
            tracing::debug!(resource = %self.resource, read = self.read, "download aborted");
            self.state = TransferState::Aborted;
        }
        self.source = None;
    }
}

impl AsyncRead for Download {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let before = buf.filled().len();
        match Pin::new(&mut **source).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 && buf.remaining() > 0 {
                    this.state = TransferState::Finalized;
                    this.source = None;
                } else {
                    this.read += n as u64;
                    this.state = TransferState::Transferring;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                this.state = TransferState::Failed;
                this.source = None;
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
