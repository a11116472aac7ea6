//! Tarball routes

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use futures::StreamExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio_util::io::ReaderStream;

use crate::api::{self, Registry};
use crate::auth::{Action, Caller};
use crate::document::ensure_name;
use crate::error::{RegistryError, RegistryResult};

pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route("/{package}/-/{filename}", get(download))
        .route(
            "/{package}/-/{filename}/-rev/{revision}",
            put(upload).delete(unpublish),
        )
}

#[tracing::instrument(skip_all, fields(%package, %filename, user = %caller.name()))]
async fn download(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, filename)): Path<(String, String)>,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("filename", &filename)?;
    caller.authorize(registry.auth(), Action::Access, &package)?;

    let download = registry.storage().get_tarball(&package, &filename).await?;
    let length = download.content_length();
    tracing::debug!(length, "streaming tarball");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(ReaderStream::new(download)),
    )
        .into_response())
}

/// Stream a request body into a new tarball.
///
/// The tarball only becomes visible once the whole body has arrived; a body
/// that ends in an error leaves nothing behind.
#[tracing::instrument(skip_all, fields(%package, %filename, user = %caller.name()))]
async fn upload(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, filename, revision)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("filename", &filename)?;
    ensure_name("revision", &revision)?;
    caller.authorize(registry.auth(), Action::Publish, &package)?;
    api::expect_media(&headers, &mime::APPLICATION_OCTET_STREAM)?;

    let mut upload = registry.storage().add_tarball(&package, &filename).await?;
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        let written = match chunk {
            Ok(chunk) => upload.write_all(&chunk).await.map_err(RegistryError::from),
            Err(error) => Err(RegistryError::BadRequest(format!(
                "unable to read request body: {error}"
            ))),
        };

        if let Err(error) = written {
            if let Err(abort) = upload.abort().await {
                tracing::warn!(%abort, "unable to discard partial tarball");
            }
            return Err(error);
        }
    }

    let length = upload.finalize().await?;
    tracing::info!(length, "tarball uploaded");
    Ok(api::ok(StatusCode::CREATED, "tarball uploaded successfully"))
}

#[tracing::instrument(skip_all, fields(%package, %filename, user = %caller.name()))]
async fn unpublish(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, filename, revision)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("filename", &filename)?;
    ensure_name("revision", &revision)?;
    caller.authorize(registry.auth(), Action::Publish, &package)?;

    registry
        .storage()
        .unpublish_tarball(&package, &filename, &revision)
        .await?;
    Ok(api::ok(StatusCode::CREATED, "tarball removed"))
}
