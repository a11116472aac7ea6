//! Authentication and the per-action authorization gate

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use base64::Engine as _;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::api::Registry;
use crate::error::{RegistryError, RegistryResult};

/// What a caller wants to do to a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read documents and tarballs
    Access,
    /// Publish, tag or remove
    Publish,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Access => write!(f, "access"),
            Action::Publish => write!(f, "publish"),
        }
    }
}

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User name
    pub name: String,
}

impl Identity {
    /// Create an identity for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Checks credentials and decides who may do what.
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Verify a user name and password.
    fn authenticate(&self, user: &str, password: &str) -> Option<Identity>;

    /// Whether `identity` (or an anonymous caller) may perform `action` on `package`.
    fn can(&self, action: Action, package: &str, identity: Option<&Identity>) -> bool;
}

/// Accepts any credentials and allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authenticate(&self, user: &str, _password: &str) -> Option<Identity> {
        Some(Identity::new(user))
    }

    fn can(&self, _action: Action, _package: &str, _identity: Option<&Identity>) -> bool {
        true
    }
}

/// Who an action is open to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Everyone, including anonymous callers
    All,
    /// Any authenticated user
    Authenticated,
    /// Only the listed users
    Users(Vec<String>),
}

impl Policy {
    fn allows(&self, identity: Option<&Identity>) -> bool {
        match (self, identity) {
            (Policy::All, _) => true,
            (Policy::Authenticated, identity) => identity.is_some(),
            (Policy::Users(users), Some(identity)) => users.iter().any(|u| *u == identity.name),
            (Policy::Users(_), None) => false,
        }
    }
}

/// A configured user
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// Hex SHA-256 digest of the password
    pub password: String,
}

fn default_access() -> Policy {
    Policy::All
}

fn default_publish() -> Policy {
    Policy::Authenticated
}

/// A fixed user table with one policy per action.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticAccess {
    /// Users by name
    #[serde(default)]
    pub users: BTreeMap<String, User>,

    /// Who may read
    #[serde(default = "default_access")]
    pub access: Policy,

    /// Who may publish
    #[serde(default = "default_publish")]
    pub publish: Policy,
}

impl Default for StaticAccess {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            access: default_access(),
            publish: default_publish(),
        }
    }
}

impl StaticAccess {
    /// Add a user with a plaintext password.
    pub fn with_user(mut self, name: impl Into<String>, password: &str) -> Self {
        self.users.insert(
            name.into(),
            User {
                password: hex::encode(Sha256::digest(password.as_bytes())),
            },
        );
        self
    }

    /// Set the access policy.
    pub fn with_access(mut self, policy: Policy) -> Self {
        self.access = policy;
        self
    }

    /// Set the publish policy.
    pub fn with_publish(mut self, policy: Policy) -> Self {
        self.publish = policy;
        self
    }
}

impl Authorizer for StaticAccess {
    fn authenticate(&self, user: &str, password: &str) -> Option<Identity> {
        let entry = self.users.get(user)?;
        let digest = hex::encode(Sha256::digest(password.as_bytes()));
        entry
            .password
            .eq_ignore_ascii_case(&digest)
            .then(|| Identity::new(user))
    }

    fn can(&self, action: Action, _package: &str, identity: Option<&Identity>) -> bool {
        match action {
            Action::Access => self.access.allows(identity),
            Action::Publish => self.publish.allows(identity),
        }
    }
}

/// The caller of a request, from its `Authorization` header.
///
/// Missing or bad credentials leave the caller anonymous; the reason is kept
/// for the denial message.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// The authenticated user, if any
    pub identity: Option<Identity>,
    failure: Option<&'static str>,
}

impl Caller {
    fn anonymous(failure: &'static str) -> Self {
        Self {
            identity: None,
            failure: Some(failure),
        }
    }

    /// The user name, or `anonymous`.
    pub fn name(&self) -> &str {
        self.identity
            .as_ref()
            .map_or("anonymous", |identity| identity.name.as_str())
    }

    /// Authenticate with Basic credentials.
    pub fn from_header(auth: &dyn Authorizer, value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };

        let Some(("Basic", encoded)) = value.split_once(' ') else {
            return Self::anonymous("bad authorization header");
        };

        let Some(credentials) = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
        else {
            return Self::anonymous("bad authorization header");
        };

        let Some((user, password)) = credentials.split_once(':') else {
            return Self::anonymous("bad authorization header");
        };

        match auth.authenticate(user, password) {
            Some(identity) => Self {
                identity: Some(identity),
                failure: None,
            },
            None => {
                tracing::debug!(%user, "rejected credentials");
                Self::anonymous("bad username/password, access denied")
            }
        }
    }

    /// Fail with 403 unless the caller may perform `action` on `package`.
    pub fn authorize(
        &self,
        auth: &dyn Authorizer,
        action: Action,
        package: &str,
    ) -> RegistryResult<()> {
        if auth.can(action, package, self.identity.as_ref()) {
            return Ok(());
        }

        let message = match (&self.identity, self.failure) {
            (Some(identity), _) => format!("user {} not allowed to {action} it", identity.name),
            (None, Some(failure)) => format!("can't {action} restricted package, {failure}"),
            (None, None) => format!(
                "can't {action} restricted package without auth, did you forget 'npm set always-auth true'?"
            ),
        };
        Err(RegistryError::Forbidden(message))
    }
}

impl FromRequestParts<Registry> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Registry) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        Ok(Caller::from_header(state.auth(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user: &str, password: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        format!("Basic {encoded}")
    }

    fn access() -> StaticAccess {
        StaticAccess::default()
            .with_user("alice", "secret")
            .with_user("bob", "hunter2")
            .with_publish(Policy::Users(vec!["alice".into()]))
    }

    #[test]
    fn basic_credentials() {
        let auth = access();

        let caller = Caller::from_header(&auth, Some(basic("alice", "secret").as_str()));
        assert_eq!(caller.name(), "alice");

        let caller = Caller::from_header(&auth, Some(basic("alice", "wrong").as_str()));
        assert!(caller.identity.is_none());
        assert_eq!(caller.failure, Some("bad username/password, access denied"));

        let caller = Caller::from_header(&auth, Some("Bearer token"));
        assert!(caller.identity.is_none());

        let caller = Caller::from_header(&auth, None);
        assert_eq!(caller.name(), "anonymous");
        assert!(caller.failure.is_none());
    }

    #[test]
    fn policies() {
        let auth = access();
        let alice = Caller::from_header(&auth, Some(basic("alice", "secret").as_str()));
        let bob = Caller::from_header(&auth, Some(basic("bob", "hunter2").as_str()));
        let anonymous = Caller::default();

        assert!(anonymous.authorize(&auth, Action::Access, "foo").is_ok());
        assert!(alice.authorize(&auth, Action::Publish, "foo").is_ok());

        let err = bob.authorize(&auth, Action::Publish, "foo").unwrap_err();
        assert_eq!(err.to_string(), "user bob not allowed to publish it");

        let err = anonymous
            .authorize(&auth, Action::Publish, "foo")
            .unwrap_err();
        assert!(err.to_string().contains("without auth"));
    }

    #[test]
    fn policy_from_toml() {
        let auth: StaticAccess = toml_edit::de::from_str(
            r#"
            access = "authenticated"
            publish = { users = ["alice"] }

            [users.alice]
            password = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
            "#,
        )
        .unwrap();

        assert_eq!(auth.access, Policy::Authenticated);
        assert_eq!(auth.publish, Policy::Users(vec!["alice".into()]));
        assert!(auth.authenticate("alice", "secret").is_some());
    }

    #[test]
    fn allow_all() {
        let caller = Caller::from_header(&AllowAll, Some(basic("anyone", "anything").as_str()));
        assert_eq!(caller.name(), "anyone");
        assert!(Caller::default()
            .authorize(&AllowAll, Action::Publish, "foo")
            .is_ok());
    }
}
