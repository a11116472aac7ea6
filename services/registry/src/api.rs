//! API server builder and router

use std::fmt;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AllowAll, Authorizer};
use crate::document;
use crate::error::{RegistryError, RegistryResult};
use crate::storage::RegistryStorage;

/// Default request body limit for JSON documents
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Default `X-Powered-By` value
pub const DEFAULT_USER_AGENT: &str = concat!("npm-registry/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
struct Settings {
    url_prefix: Option<String>,
}

/// Shared state behind every route
#[derive(Clone)]
pub struct Registry {
    storage: RegistryStorage,
    auth: Arc<dyn Authorizer>,
    settings: Arc<Settings>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("storage", &self.storage)
            .field("auth", &self.auth)
            .field("url_prefix", &self.settings.url_prefix)
            .finish()
    }
}

impl Registry {
    /// The package repository
    pub fn storage(&self) -> &RegistryStorage {
        &self.storage
    }

    /// The authorization gate
    pub fn auth(&self) -> &dyn Authorizer {
        self.auth.as_ref()
    }

    /// The public base URL for tarball links.
    ///
    /// A configured prefix wins; otherwise the URL is built from the request's
    /// `Host` and `X-Forwarded-Proto` headers.
    pub(crate) fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(prefix) = &self.settings.url_prefix {
            return prefix.clone();
        }

        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("localhost");
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("http");
        format!("{scheme}://{host}/")
    }
}

/// Registry builder for configuring and creating the npm registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: storage::Storage,
    bucket: Option<String>,
    auth: Option<Arc<dyn Authorizer>>,
    url_prefix: Option<String>,
    max_body_size: usize,
    user_agent: Option<String>,
}

impl RegistryBuilder {
    /// Create a new registry builder over a storage backend
    pub fn new(storage: storage::Storage) -> Self {
        Self {
            storage,
            bucket: None,
            auth: None,
            url_prefix: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            user_agent: None,
        }
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the authorizer; the default allows everything
    pub fn authorizer<A: Authorizer + 'static>(mut self, auth: A) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Set the public base URL used in tarball links
    pub fn url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    /// Set the largest accepted JSON request body
    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Set the `X-Powered-By` response header
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());
        let registry = Registry {
            storage: RegistryStorage::new(self.storage, bucket),
            auth: self.auth.unwrap_or_else(|| Arc::new(AllowAll)),
            settings: Arc::new(Settings {
                url_prefix: self.url_prefix,
            }),
        };

        let powered_by = self
            .user_agent
            .and_then(|agent| HeaderValue::from_str(&agent).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_USER_AGENT));

        Router::new()
            .route("/-/ping", get(ping))
            .merge(crate::package::router())
            .merge(crate::tarball::router())
            .merge(crate::user::router())
            .with_state(registry)
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-powered-by"),
                powered_by,
            ))
            .layer(TraceLayer::new_for_http())
    }
}

/// Liveness check
async fn ping() -> Response {
    json_response(StatusCode::OK, &json!({}))
}

/// Serialize a JSON response body, tab-indented, with an `ETag` on success.
pub(crate) fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response {
    let body = match document::to_pretty_vec(body) {
        Ok(body) => body,
        Err(error) => {
            tracing::error!(%error, "unable to serialize response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response = (
        status,
        [(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())],
        body.clone(),
    )
        .into_response();

    if status.is_success() {
        let etag = format!("\"{}\"", hex::encode(Sha256::digest(&body)));
        if let Ok(etag) = HeaderValue::from_str(&etag) {
            response.headers_mut().insert(header::ETAG, etag);
        }
    }
    response
}

/// `{"ok": message}`
pub(crate) fn ok(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, &json!({ "ok": message.into() }))
}

/// Fail with 415 unless the request content type is `expected`.
pub(crate) fn expect_media(headers: &HeaderMap, expected: &mime::Mime) -> RegistryResult<()> {
    let actual = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match actual.parse::<mime::Mime>() {
        Ok(mime) if mime.essence_str() == expected.essence_str() => Ok(()),
        _ => Err(RegistryError::UnsupportedMediaType {
            expected: match expected.essence_str() {
                "application/json" => "application/json",
                _ => "application/octet-stream",
            },
            actual: actual.to_owned(),
        }),
    }
}

/// Parse a JSON request body.
pub(crate) fn parse_json(body: &[u8]) -> RegistryResult<serde_json::Value> {
    serde_json::from_slice(body)
        .map_err(|_| RegistryError::BadRequest("can't parse incoming json".into()))
}
