//! Integration tests for the npm registry

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use base64::Engine as _;
use http_body_util::BodyExt;
use npm_registry::{Policy, RegistryBuilder, StaticAccess};
use serde_json::{Value, json};
use storage::{LocalDriver, MemoryStorage};
use tower::ServiceExt;

/// Helper to create a test registry
fn test_registry() -> Router {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new(storage.into())
        .bucket("test-registry")
        .url_prefix("http://registry.test/")
        .build()
}

fn basic(user: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    format!("Basic {encoded}")
}

fn publish_body(version: &str, tarball: &[u8]) -> Value {
    let filename = format!("foo-{version}.tgz");
    json!({
        "_id": "foo",
        "name": "foo",
        "description": "a test package",
        "versions": {
            version: {
                "name": "foo",
                "version": version,
                "description": "a test package",
                "dist": {"tarball": format!("http://localhost:4873/foo/-/{filename}")},
            },
        },
        "dist-tags": {"latest": version},
        "_attachments": {
            filename: {
                "content_type": "application/octet-stream",
                "data": base64::engine::general_purpose::STANDARD.encode(tarball),
                "length": tarball.len(),
            },
        },
    })
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn get(app: &Router, uri: &str) -> Response {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn put_json(app: &Router, uri: &str, body: &Value) -> Response {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
    )
    .await
}

async fn delete(app: &Router, uri: &str) -> Response {
    send(
        app,
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn current_rev(app: &Router) -> String {
    let document = body_json(get(app, "/foo").await).await;
    document["_rev"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn test_ping() {
    let app = test_registry();

    let response = get(&app, "/-/ping").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-powered-by"));
    assert!(response.headers().contains_key(header::ETAG));
    assert_eq!(body_bytes(response).await, b"{}\n");
}

#[tokio::test]
async fn test_publish_and_install() {
    let app = test_registry();

    let response = put_json(&app, "/foo", &publish_body("1.0.0", b"tarball bytes")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"ok": "created new package"}));

    let response = get(&app, "/foo").await;
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    assert_eq!(document["dist-tags"]["latest"], "1.0.0");
    assert_eq!(
        document["versions"]["1.0.0"]["dist"]["tarball"],
        "http://registry.test/foo/-/foo-1.0.0.tgz"
    );
    assert!(document.get("_attachments").is_none());

    let response = get(&app, "/foo/latest").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["version"], "1.0.0");

    let response = get(&app, "/foo/-/foo-1.0.0.tgz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        "13"
    );
    assert_eq!(body_bytes(response).await, b"tarball bytes");
}

#[tokio::test]
async fn test_publish_second_version_and_duplicate() {
    let app = test_registry();

    let response = put_json(&app, "/foo", &publish_body("1.0.0", b"one")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let response = put_json(&app, "/foo", &publish_body("1.1.0", b"two")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let document = body_json(get(&app, "/foo").await).await;
    assert_eq!(document["dist-tags"]["latest"], "1.1.0");
    assert_eq!(document["versions"].as_object().unwrap().len(), 2);

    // the same publish again changes nothing
    let response = put_json(&app, "/foo", &publish_body("1.1.0", b"two")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut changed = publish_body("1.1.0", b"two");
    changed["versions"]["1.1.0"]["description"] = json!("changed");
    let response = put_json(&app, "/foo", &changed).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(body_json(response).await.get("error").is_some());

    let document = body_json(get(&app, "/foo").await).await;
    assert_eq!(document["versions"]["1.1.0"]["description"], "a test package");
}

#[tokio::test]
async fn test_missing_things() {
    let app = test_registry();

    let response = get(&app, "/nothing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await,
        json!({"error": "no such package available"})
    );

    put_json(&app, "/foo", &publish_body("1.0.0", b"one")).await;

    let response = get(&app, "/foo/9.9.9").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await,
        json!({"error": "version not found: 9.9.9"})
    );

    let response = get(&app, "/foo/-/foo-9.9.9.tgz").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tags_and_versions() {
    let app = test_registry();
    put_json(&app, "/foo", &publish_body("1.0.0", b"one")).await;

    let response = put_json(&app, "/foo/stable", &json!("1.0.0")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"ok": "package tagged"}));

    let response = put_json(&app, "/foo/stable", &json!({"not": "a string"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let manifest = json!({"name": "foo", "version": "2.0.0-beta"});
    let response = put_json(&app, "/foo/2.0.0-beta/-tag/next", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"ok": "package published"}));

    let response = put_json(&app, "/foo/2.0.0-beta/-tag/next", &manifest).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let document = body_json(get(&app, "/foo").await).await;
    assert_eq!(document["dist-tags"]["stable"], "1.0.0");
    assert_eq!(document["dist-tags"]["next"], "2.0.0-beta");
    assert_eq!(document["dist-tags"]["latest"], "1.0.0");

    let response = get(&app, "/foo/next").await;
    assert_eq!(body_json(response).await["version"], "2.0.0-beta");
}

#[tokio::test]
async fn test_tarball_upload_and_unpublish() {
    let app = test_registry();

    // old clients: document first, then the tarball on its own
    let document = json!({
        "name": "foo",
        "versions": {},
        "dist-tags": {},
    });
    let response = put_json(&app, "/foo", &document).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let rev = current_rev(&app).await;

    let upload = |data: &'static [u8]| {
        Request::builder()
            .method("PUT")
            .uri(format!("/foo/-/foo-1.0.0.tgz/-rev/{rev}"))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(data))
            .unwrap()
    };

    let response = send(&app, upload(b"streamed tarball")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        body_json(response).await,
        json!({"ok": "tarball uploaded successfully"})
    );

    let response = send(&app, upload(b"again")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let manifest = json!({
        "name": "foo",
        "version": "1.0.0",
        "dist": {"tarball": "http://localhost/foo/-/foo-1.0.0.tgz"},
    });
    let response = put_json(&app, "/foo/1.0.0/-tag/latest", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = get(&app, "/foo/-/foo-1.0.0.tgz").await;
    assert_eq!(body_bytes(response).await, b"streamed tarball");

    let response = delete(&app, &format!("/foo/-/foo-1.0.0.tgz/-rev/{rev}")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let rev = current_rev(&app).await;
    let response = delete(&app, &format!("/foo/-/foo-1.0.0.tgz/-rev/{rev}")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"ok": "tarball removed"}));

    let response = get(&app, "/foo/-/foo-1.0.0.tgz").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let document = body_json(get(&app, "/foo").await).await;
    assert!(document["versions"].as_object().unwrap().is_empty());
    assert!(document["dist-tags"].get("latest").is_none());
}

#[tokio::test]
async fn test_remove_package() {
    let app = test_registry();
    put_json(&app, "/foo", &publish_body("1.0.0", b"one")).await;
    let rev = current_rev(&app).await;

    let response = delete(&app, &format!("/foo/-rev/{rev}")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"ok": "package removed"}));

    assert_eq!(get(&app, "/foo").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        get(&app, "/foo/-/foo-1.0.0.tgz").await.status(),
        StatusCode::NOT_FOUND
    );

    let response = delete(&app, &format!("/foo/-rev/{rev}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_change_package_with_revision() {
    let app = test_registry();
    put_json(&app, "/foo", &publish_body("1.0.0", b"one")).await;
    let rev = current_rev(&app).await;

    let mut document = body_json(get(&app, "/foo").await).await;
    document["description"] = json!("changed");

    let response = put_json(&app, &format!("/foo/-rev/{rev}"), &document).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"ok": "package changed"}));

    let response = put_json(&app, &format!("/foo/-rev/{rev}"), &document).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let stored = body_json(get(&app, "/foo").await).await;
    assert_eq!(stored["description"], "changed");
    assert_ne!(stored["_rev"], rev.as_str());
}

#[tokio::test]
async fn test_list_all() {
    let app = test_registry();
    put_json(&app, "/foo", &publish_body("1.0.0", b"one")).await;

    let response = get(&app, "/-/all").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({
            "foo": {
                "name": "foo",
                "description": "a test package",
                "dist-tags": {"latest": "1.0.0"},
            }
        })
    );
}

#[tokio::test]
async fn test_rejected_requests() {
    let app = test_registry();

    // wrong media type
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/foo")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    // bad names
    assert_eq!(get(&app, "/node_modules").await.status(), StatusCode::FORBIDDEN);
    assert_eq!(get(&app, "/foo/.hidden").await.status(), StatusCode::FORBIDDEN);

    // not JSON
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/foo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // name mismatch
    let response = put_json(&app, "/bar", &publish_body("1.0.0", b"x")).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body_json(response).await,
        json!({"error": "bad incoming package data"})
    );

    // star requests
    let response = put_json(&app, "/foo", &json!({"_id": "foo", "users": {"bob": true}})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_access_control() {
    let storage = MemoryStorage::with_buckets(&["registry"]);
    let app = RegistryBuilder::new(storage.into())
        .authorizer(
            StaticAccess::default()
                .with_user("alice", "secret")
                .with_user("bob", "hunter2")
                .with_publish(Policy::Users(vec!["alice".into()])),
        )
        .build();

    let publish = |auth: Option<String>| {
        let mut request = Request::builder()
            .method("PUT")
            .uri("/foo")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        request
            .body(Body::from(
                serde_json::to_vec(&publish_body("1.0.0", b"one")).unwrap(),
            ))
            .unwrap()
    };

    let response = send(&app, publish(None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let message = body_json(response).await["error"].as_str().unwrap().to_owned();
    assert!(message.contains("without auth"), "{message}");

    let response = send(&app, publish(Some(basic("bob", "hunter2")))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, publish(Some(basic("alice", "wrong")))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, publish(Some(basic("alice", "secret")))).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // anyone may read
    assert_eq!(get(&app, "/foo").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_login() {
    let storage = MemoryStorage::with_buckets(&["registry"]);
    let app = RegistryBuilder::new(storage.into())
        .authorizer(StaticAccess::default().with_user("alice", "secret"))
        .build();

    let response = put_json(
        &app,
        "/-/user/org.couchdb.user:alice",
        &json!({"name": "alice", "password": "secret"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        body_json(response).await,
        json!({"ok": "you are authenticated as \"alice\""})
    );

    let response = put_json(
        &app,
        "/-/user/org.couchdb.user:alice",
        &json!({"name": "alice", "password": "wrong"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = put_json(&app, "/-/user/org.couchdb.user:alice", &json!({})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/_session")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers().get(header::SET_COOKIE).unwrap();
    assert!(cookie.to_str().unwrap().starts_with("AuthSession="));
    assert_eq!(body_json(response).await["ok"], true);
}

#[tokio::test]
async fn test_custom_powered_by() {
    let storage = MemoryStorage::with_buckets(&["registry"]);
    let app = RegistryBuilder::new(storage.into())
        .user_agent("test-registry/1.0")
        .build();

    let response = get(&app, "/nothing").await;
    assert_eq!(
        response.headers().get("x-powered-by").unwrap(),
        "test-registry/1.0"
    );
}

#[tokio::test]
async fn test_local_storage_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::create_dir_all(root.join("registry")).unwrap();

    let app = RegistryBuilder::new(LocalDriver::new(root.clone()).into()).build();

    let response = put_json(&app, "/foo", &publish_body("1.0.0", b"on disk")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    assert!(root.join("registry/b/foo/package.json").exists());
    assert!(root.join("registry/b/foo/foo-1.0.0.tgz").exists());

    let response = get(&app, "/foo/-/foo-1.0.0.tgz").await;
    assert_eq!(body_bytes(response).await, b"on disk");

    // served URLs follow the request host when no prefix is configured
    let response = send(
        &app,
        Request::builder()
            .uri("/foo")
            .header(header::HOST, "npm.internal:4873")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let document = body_json(response).await;
    assert_eq!(
        document["versions"]["1.0.0"]["dist"]["tarball"],
        "http://npm.internal:4873/foo/-/foo-1.0.0.tgz"
    );

    // tarball names may not shadow the files kept beside the document
    let rev = current_rev(&app).await;
    for filename in ["package.json.old", "package.json.lock"] {
        let response = send(
            &app,
            Request::builder()
                .method("PUT")
                .uri(format!("/foo/-/{filename}/-rev/{rev}"))
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from("not a backup"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{filename}");
    }

    let response = put_json(&app, "/foo/stable", &json!("1.0.0")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let backup = std::fs::read(root.join("registry/b/foo/package.json.old")).unwrap();
    assert_ne!(backup, b"not a backup");
    let document = body_json(get(&app, "/foo").await).await;
    assert_eq!(document["dist-tags"]["stable"], "1.0.0");
}
