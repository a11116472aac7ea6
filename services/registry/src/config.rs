//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::api::{DEFAULT_MAX_BODY_SIZE, RegistryBuilder};
use crate::auth::StaticAccess;

/// Error loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("unable to read {path}")]
    Io {
        /// The configuration file
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),
}

/// How callers are authenticated and authorized
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthConfig {
    /// Anyone may do anything
    #[default]
    AllowAll,

    /// A fixed user table
    Static(StaticAccess),
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 4873))
}

fn default_bucket() -> String {
    "registry".into()
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_storage() -> StorageConfig {
    StorageConfig::Temp
}

/// Registry server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Public base URL, used in tarball links
    #[serde(default)]
    pub url_prefix: Option<String>,

    /// Storage bucket holding the packages
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Largest accepted request body for JSON documents
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// `X-Powered-By` header value
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Storage backend
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Authorization
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            url_prefix: None,
            bucket: default_bucket(),
            max_body_size: default_max_body_size(),
            user_agent: None,
            storage: default_storage(),
            auth: AuthConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml_edit::de::from_str(text)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Open the storage backend and configure a registry over it.
    pub async fn into_builder(self) -> Result<RegistryBuilder, StorageError> {
        let storage = self.storage.build().await?;
        tracing::info!(driver = storage.name(), bucket = %self.bucket, "opened storage");

        let mut builder = RegistryBuilder::new(storage)
            .bucket(self.bucket)
            .max_body_size(self.max_body_size);

        if let Some(prefix) = self.url_prefix {
            builder = builder.url_prefix(prefix);
        }
        if let Some(agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }

        Ok(match self.auth {
            AuthConfig::AllowAll => builder,
            AuthConfig::Static(access) => builder.authorizer(access),
        })
    }
}
