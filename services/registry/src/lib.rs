//! # Private npm Registry
//!
//! A small npm registry server: package documents and tarballs kept in a
//! pluggable storage backend, served over the registry HTTP API that the `npm`
//! client speaks.
//!
//! ## Features
//!
//! - Publish, tag, install and unpublish with the stock `npm` client
//! - Streaming tarball uploads and downloads
//! - Revision-checked, lock-protected document updates
//! - Pluggable storage backend via the `storage` crate
//! - Basic authentication and per-action policies
//!
//! ## Example
//!
//! ```no_run
//! use npm_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new(storage.into())
//!     .bucket("registry")
//!     .url_prefix("http://localhost:4873/")
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod auth;
mod config;
mod document;
mod error;
mod package;
mod publish;
mod storage;
mod tarball;
mod user;

pub use api::{DEFAULT_MAX_BODY_SIZE, DEFAULT_USER_AGENT, Registry, RegistryBuilder};
pub use auth::{Action, AllowAll, Authorizer, Caller, Identity, Policy, StaticAccess, User};
pub use config::{AuthConfig, ConfigError, RegistryConfig};
pub use document::{Attachment, Package, validate_name};
pub use error::{RegistryError, RegistryResult};
pub use crate::storage::RegistryStorage;
