//! Package document routes

use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, put};
use bytes::Bytes;
use serde_json::{Value, json};

use crate::api::{self, Registry};
use crate::auth::{Action, Caller};
use crate::document::{self, Package, ensure_name};
use crate::error::{RegistryError, RegistryResult};

pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route("/-/all", get(list_all))
        .route("/{package}", get(get_package).put(publish))
        .route(
            "/{package}/-rev/{revision}",
            put(publish_revision).delete(remove_package),
        )
        .route("/{package}/{version}", get(get_version).put(tag_version))
        .route("/{package}/{version}/-tag/{tag}", put(add_version))
}

/// Summaries of every package the caller may read
#[tracing::instrument(skip_all, fields(user = %caller.name()))]
async fn list_all(State(registry): State<Registry>, caller: Caller) -> RegistryResult<Response> {
    let storage = registry.storage();
    let mut all = serde_json::Map::new();

    for name in storage.list_packages().await? {
        if caller.authorize(registry.auth(), Action::Access, &name).is_err() {
            continue;
        }

        let package = match storage.get_package(&name).await {
            Ok(package) => package,
            Err(error) => {
                tracing::warn!(%name, %error, "skipping unreadable package");
                continue;
            }
        };

        all.insert(
            name.clone(),
            json!({
                "name": name,
                "description": package.description(),
                "dist-tags": package.dist_tags,
            }),
        );
    }

    Ok(api::json_response(StatusCode::OK, &all))
}

#[tracing::instrument(skip_all, fields(%package, user = %caller.name()))]
async fn get_package(
    State(registry): State<Registry>,
    caller: Caller,
    Path(package): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    caller.authorize(registry.auth(), Action::Access, &package)?;

    let mut document = registry.storage().get_package(&package).await?;
    document.rewrite_tarball_urls(&registry.base_url(&headers));
    Ok(api::json_response(StatusCode::OK, &document))
}

#[tracing::instrument(skip_all, fields(%package, %version, user = %caller.name()))]
async fn get_version(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("version", &version)?;
    caller.authorize(registry.auth(), Action::Access, &package)?;

    let mut manifest = registry.storage().get_version(&package, &version).await?;
    document::rewrite_tarball_url(&mut manifest, &package, &registry.base_url(&headers));
    Ok(api::json_response(StatusCode::OK, &manifest))
}

async fn publish(
    State(registry): State<Registry>,
    caller: Caller,
    Path(package): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    publish_document(&registry, &caller, &package, None, &headers, &body).await
}

async fn publish_revision(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, revision)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    ensure_name("revision", &revision)?;
    publish_document(&registry, &caller, &package, Some(&revision), &headers, &body).await
}

#[tracing::instrument(skip(registry, headers, body), fields(user = %caller.name()))]
async fn publish_document(
    registry: &Registry,
    caller: &Caller,
    package: &str,
    revision: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> RegistryResult<Response> {
    ensure_name("package", package)?;
    caller.authorize(registry.auth(), Action::Publish, package)?;
    api::expect_media(headers, &mime::APPLICATION_JSON)?;

    let value = api::parse_json(body)?;
    if !value.is_object() {
        return Err(RegistryError::BadRequest("can't parse incoming json".into()));
    }
    let document: Package = serde_json::from_value(value).map_err(|error| {
        tracing::debug!(%error, "rejected package document");
        RegistryError::BadData("bad incoming package data".into())
    })?;

    let message = registry
        .storage()
        .publish(package, document, revision)
        .await?;
    Ok(api::ok(StatusCode::CREATED, message))
}

/// Point one dist-tag at a version; the body is the version as a JSON string
#[tracing::instrument(skip_all, fields(%package, %tag, user = %caller.name()))]
async fn tag_version(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, tag)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("tag", &tag)?;
    caller.authorize(registry.auth(), Action::Publish, &package)?;
    api::expect_media(&headers, &mime::APPLICATION_JSON)?;

    let Value::String(version) = api::parse_json(&body)? else {
        return Err(RegistryError::BadRequest(
            "tag value must be a version string".into(),
        ));
    };

    registry
        .storage()
        .add_tags(&package, BTreeMap::from([(tag, version)]))
        .await?;
    Ok(api::ok(StatusCode::CREATED, "package tagged"))
}

/// Add one version manifest and point a tag at it
#[tracing::instrument(skip_all, fields(%package, %version, %tag, user = %caller.name()))]
async fn add_version(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, version, tag)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("version", &version)?;
    ensure_name("tag", &tag)?;
    caller.authorize(registry.auth(), Action::Publish, &package)?;
    api::expect_media(&headers, &mime::APPLICATION_JSON)?;

    let manifest = api::parse_json(&body)?;
    if !manifest.is_object() {
        return Err(RegistryError::BadRequest("can't parse incoming json".into()));
    }

    registry
        .storage()
        .add_version(&package, &version, manifest, Some(&tag))
        .await?;
    Ok(api::ok(StatusCode::CREATED, "package published"))
}

#[tracing::instrument(skip_all, fields(%package, user = %caller.name()))]
async fn remove_package(
    State(registry): State<Registry>,
    caller: Caller,
    Path((package, revision)): Path<(String, String)>,
) -> RegistryResult<Response> {
    ensure_name("package", &package)?;
    ensure_name("revision", &revision)?;
    caller.authorize(registry.auth(), Action::Publish, &package)?;

    registry.storage().remove_package(&package).await?;
    Ok(api::ok(StatusCode::CREATED, "package removed"))
}
