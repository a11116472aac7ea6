//! Login routes used by `npm adduser` and `npm login`

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post, put};
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde_json::{Value, json};

use crate::api::{self, Registry};
use crate::auth::Caller;
use crate::error::{RegistryError, RegistryResult};

const SESSION_HOURS: i64 = 10;

pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route("/_session", post(session))
        .route("/-/user/{user}", get(whoami).put(login))
        .route("/-/user/{user}/-rev/{revision}", put(login_revision))
}

/// Couch-style session; always succeeds.
async fn session() -> Response {
    let mut response = api::json_response(
        StatusCode::OK,
        &json!({"ok": true, "name": "somebody", "roles": []}),
    );

    let expires = (Utc::now() + Duration::hours(SESSION_HOURS)).format("%a, %d %b %Y %H:%M:%S GMT");
    let cookie = format!("AuthSession=; Path=/; Expires={expires}; HttpOnly");
    if let Ok(cookie) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

async fn whoami(caller: Caller, Path(_user): Path<String>) -> Response {
    api::json_response(
        StatusCode::OK,
        &json!({"ok": format!("you are authenticated as \"{}\"", caller.name())}),
    )
}

async fn login(
    State(registry): State<Registry>,
    caller: Caller,
    Path(_user): Path<String>,
    body: Bytes,
) -> RegistryResult<Response> {
    authenticate(&registry, caller, &body)
}

async fn login_revision(
    State(registry): State<Registry>,
    caller: Caller,
    Path((_user, _revision)): Path<(String, String)>,
    body: Bytes,
) -> RegistryResult<Response> {
    authenticate(&registry, caller, &body)
}

/// A caller who already sent good credentials is accepted as is; otherwise
/// the name and password in the body are checked.
fn authenticate(registry: &Registry, caller: Caller, body: &[u8]) -> RegistryResult<Response> {
    if let Some(identity) = caller.identity {
        return Ok(authenticated(&identity.name));
    }

    let credentials = serde_json::from_slice::<Value>(body).ok();
    let field = |key: &str| {
        credentials
            .as_ref()
            .and_then(|body| body.get(key))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    let (Some(name), Some(password)) = (field("name"), field("password")) else {
        return Err(RegistryError::BadRequest(
            "user/password is not found in request (npm issue?)".into(),
        ));
    };

    match registry.auth().authenticate(&name, &password) {
        Some(identity) => {
            tracing::info!(user = %identity.name, "authenticated");
            Ok(authenticated(&identity.name))
        }
        None => {
            tracing::debug!(user = %name, "login rejected");
            Err(RegistryError::conflict("bad username/password, access denied"))
        }
    }
}

fn authenticated(name: &str) -> Response {
    api::ok(
        StatusCode::CREATED,
        format!("you are authenticated as \"{name}\""),
    )
}
