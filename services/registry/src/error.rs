//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use storage::{StorageError, StorageErrorKind};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
///
/// The `Display` form of each variant except [`RegistryError::Storage`] and
/// [`RegistryError::Io`] is safe to show to clients.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Package, version or tarball not found
    #[error("{0}")]
    NotFound(String),

    /// Duplicate create, or a revision mismatch
    #[error("{0}")]
    Conflict(String),

    /// Request shape the registry does not handle
    #[error("{0}")]
    UnsupportedRequest(String),

    /// Malformed request
    #[error("{0}")]
    BadRequest(String),

    /// Package document failed validation
    #[error("{0}")]
    BadData(String),

    /// A package, version, tag, filename or revision failed name validation
    #[error("invalid {kind}")]
    InvalidName {
        /// Which parameter was rejected
        kind: &'static str,
        /// The rejected value
        value: String,
    },

    /// The caller may not perform this action
    #[error("{0}")]
    Forbidden(String),

    /// Wrong request content type
    #[error("wrong content-type, expect: {expected}, got: {actual}")]
    UnsupportedMediaType {
        /// The required media type
        expected: &'static str,
        /// The media type sent
        actual: String,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::UnsupportedRequest(_) | RegistryError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::BadData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RegistryError::InvalidName { .. } | RegistryError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            RegistryError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::Storage(error) => match error.kind() {
                StorageErrorKind::NotFound => StatusCode::NOT_FOUND,
                StorageErrorKind::AlreadyExists => StatusCode::CONFLICT,
                StorageErrorKind::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
                StorageErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message sent to clients.
    ///
    /// Storage and I/O failures are reduced to their kind so that storage
    /// paths never reach the wire.
    pub fn public_message(&self) -> String {
        match self {
            RegistryError::Storage(error) => match error.kind() {
                StorageErrorKind::NotFound => "not found".into(),
                StorageErrorKind::AlreadyExists => "already exists".into(),
                StorageErrorKind::LockTimeout => "resource is busy, try again later".into(),
                StorageErrorKind::InvalidRequest => "invalid storage request".into(),
                _ => "internal server error".into(),
            },
            RegistryError::Io(_) => "internal server error".into(),
            other => other.to_string(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        RegistryError::NotFound(message.into())
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        RegistryError::Conflict(message.into())
    }

    pub(crate) fn is_conflict(&self) -> bool {
        self.status_code() == StatusCode::CONFLICT
    }
}

/// npm error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = ErrorResponse {
            error: self.public_message(),
        };

        crate::api::json_response(status, &body)
    }
}
