//! The package document and its wire format

use std::collections::BTreeMap;

use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RegistryError, RegistryResult};

/// Names that can never be used as a package, version, tag or filename.
const RESERVED: &[&str] = &["node_modules", "__proto__", "package.json", "favicon.ico"];

/// Check a package name, version, tag, filename or revision.
///
/// Only names that are safe as a single path component and unambiguous in a
/// URL are accepted, and none that the storage drivers keep for their own
/// files.
pub fn validate_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') || name.starts_with('-') {
        return false;
    }

    if name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '@' | '+' | '%' | ':'))
    {
        return false;
    }

    let lower = name.to_ascii_lowercase();
    !RESERVED.contains(&lower.as_str()) && !storage::is_reserved_name(name)
}

/// Fail with [`RegistryError::InvalidName`] unless `value` is a valid name.
pub(crate) fn ensure_name(kind: &'static str, value: &str) -> RegistryResult<()> {
    if validate_name(value) {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            kind,
            value: value.to_owned(),
        })
    }
}

/// One package: its versions, dist-tags and descriptive metadata.
///
/// Keys the registry does not interpret are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Package name
    #[serde(default)]
    pub name: String,

    /// Version manifests, by version string
    #[serde(default)]
    pub versions: BTreeMap<String, Value>,

    /// Tag to version
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,

    /// Readme text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,

    /// Timestamps: `created`, `modified`, and one per version
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub time: BTreeMap<String, Value>,

    /// Maintainer list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainers: Option<Value>,

    /// Revision token
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Inline tarballs, present only in publish requests
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: BTreeMap<String, Attachment>,

    /// Everything else
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A base64 tarball embedded in a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Declared media type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Base64 payload
    pub data: String,

    /// Declared decoded length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl Attachment {
    /// Decode the payload, checking the declared length when there is one.
    pub fn decode(&self) -> Result<Bytes, String> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|err| format!("bad attachment encoding: {err}"))?;

        match self.length {
            Some(length) if length != data.len() as u64 => Err(format!(
                "attachment length mismatch: declared {length}, got {}",
                data.len()
            )),
            _ => Ok(data.into()),
        }
    }
}

impl Package {
    /// An empty document for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a stored or submitted document.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Serialize for storage.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        to_pretty_vec(self)
    }

    /// Check a submitted document against the name it is published under.
    ///
    /// A missing name is filled in; a different name is rejected.
    pub fn validate_for(&mut self, name: &str) -> Result<(), String> {
        if self.name.is_empty() {
            self.name = name.to_owned();
        }

        if self.name != name {
            return Err(format!(
                "document name {:?} does not match {name:?}",
                self.name
            ));
        }

        if let Some(id) = self.extra.get("_id").and_then(Value::as_str) {
            if id != name {
                return Err(format!("document id {id:?} does not match {name:?}"));
            }
        }

        if self.versions.values().any(|v| !v.is_object()) {
            return Err("version manifests must be objects".into());
        }

        Ok(())
    }

    /// Whether this is a star/unstar request: a `users` map and nothing else.
    pub fn is_star_request(&self) -> bool {
        self.versions.is_empty()
            && self.dist_tags.is_empty()
            && self.attachments.is_empty()
            && self.readme.is_none()
            && self.extra.get("users").is_some_and(Value::is_object)
            && self.extra.keys().all(|k| k == "users" || k == "_id")
    }

    /// Resolve a version string, or failing that a dist-tag.
    pub fn get_version(&self, version_or_tag: &str) -> Option<&Value> {
        self.versions.get(version_or_tag).or_else(|| {
            self.dist_tags
                .get(version_or_tag)
                .and_then(|version| self.versions.get(version))
        })
    }

    /// The description of the latest version, else the top-level one.
    pub fn description(&self) -> Option<&str> {
        self.dist_tags
            .get("latest")
            .and_then(|latest| self.versions.get(latest))
            .and_then(|v| v.get("description"))
            .or_else(|| self.extra.get("description"))
            .and_then(Value::as_str)
    }

    /// Point every version's `dist.tarball` at this registry.
    pub fn rewrite_tarball_urls(&mut self, base: &str) {
        for manifest in self.versions.values_mut() {
            rewrite_tarball_url(manifest, &self.name, base);
        }
    }

    /// Versions whose tarball is `filename`.
    pub fn versions_with_tarball<'a>(
        &'a self,
        filename: &'a str,
    ) -> impl Iterator<Item = &'a String> + 'a {
        self.versions
            .iter()
            .filter(move |(_, manifest)| tarball_filename(manifest) == Some(filename))
            .map(|(version, _)| version)
    }
}

/// The file name part of a manifest's `dist.tarball` URL.
pub fn tarball_filename(manifest: &Value) -> Option<&str> {
    let url = manifest.get("dist")?.get("tarball")?.as_str()?;
    url.rsplit('/').next().filter(|name| !name.is_empty())
}

/// Replace a manifest's `dist.tarball` with `<base><package>/-/<filename>`.
pub fn rewrite_tarball_url(manifest: &mut Value, package: &str, base: &str) {
    let Some(filename) = tarball_filename(manifest).map(str::to_owned) else {
        return;
    };

    if let Some(dist) = manifest.get_mut("dist").and_then(Value::as_object_mut) {
        let base = base.trim_end_matches('/');
        dist.insert(
            "tarball".into(),
            Value::String(format!("{base}/{package}/-/{filename}")),
        );
    }
}

/// The next revision after `current`: `<n + 1>-<16 hex>`.
pub fn next_revision(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", generation.saturating_add(1), &suffix[..16])
}

/// Serialize as tab-indented JSON with a trailing newline.
pub fn to_pretty_vec<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn names() {
        for good in ["foo", "foo-bar", "foo.js", "1.0.0", "latest", "foo-1.0.0.tgz", "3-abc"] {
            assert!(validate_name(good), "{good}");
        }

        for bad in [
            "",
            "-rev",
            ".hidden",
            "../etc",
            "a/b",
            "@scope",
            "a b",
            "a+b",
            "%2e%2e",
            "c:",
            "node_modules",
            "Favicon.ICO",
            "__proto__",
            "package.json.old",
            "foo-1.0.0.tgz.lock",
            "foo.tmp0123456789abcdef0123456789abcdef",
        ] {
            assert!(!validate_name(bad), "{bad}");
        }
    }

    #[test]
    fn document_round_trip_keeps_unknown_keys() {
        let raw = json!({
            "name": "foo",
            "description": "a package",
            "versions": {"1.0.0": {"name": "foo", "version": "1.0.0"}},
            "dist-tags": {"latest": "1.0.0"},
            "_rev": "3-0123456789abcdef",
            "users": {"alice": true},
        });

        let package: Package = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(package.rev.as_deref(), Some("3-0123456789abcdef"));
        assert_eq!(package.extra["description"], "a package");

        let written = package.to_vec().unwrap();
        assert!(written.starts_with(b"{\n\t\""));
        assert!(written.ends_with(b"}\n"));

        let reread = Package::from_slice(&written).unwrap();
        assert_eq!(reread, package);
        assert_eq!(serde_json::to_value(&reread).unwrap(), raw);
    }

    #[test]
    fn version_or_tag() {
        let package: Package = serde_json::from_value(json!({
            "name": "foo",
            "versions": {"1.0.0": {"version": "1.0.0"}},
            "dist-tags": {"latest": "1.0.0", "broken": "9.9.9"},
        }))
        .unwrap();

        assert_eq!(package.get_version("1.0.0").unwrap()["version"], "1.0.0");
        assert_eq!(package.get_version("latest").unwrap()["version"], "1.0.0");
        assert!(package.get_version("broken").is_none());
        assert!(package.get_version("2.0.0").is_none());
    }

    #[test]
    fn tarball_urls() {
        let mut package: Package = serde_json::from_value(json!({
            "name": "foo",
            "versions": {
                "1.0.0": {"dist": {"tarball": "https://registry.npmjs.org/foo/-/foo-1.0.0.tgz"}},
                "1.1.0": {"dist": {}},
            },
        }))
        .unwrap();

        assert_eq!(
            package.versions_with_tarball("foo-1.0.0.tgz").collect::<Vec<_>>(),
            ["1.0.0"]
        );

        package.rewrite_tarball_urls("http://localhost:4873/");
        assert_eq!(
            package.versions["1.0.0"]["dist"]["tarball"],
            "http://localhost:4873/foo/-/foo-1.0.0.tgz"
        );
        assert_eq!(package.versions["1.1.0"]["dist"], json!({}));
    }

    #[test]
    fn revisions_increase() {
        let first = next_revision(None);
        assert!(first.starts_with("1-"));
        assert_eq!(first.len(), 2 + 16);

        let second = next_revision(Some(&first));
        assert!(second.starts_with("2-"));
        assert_ne!(first, second);

        assert!(next_revision(Some("garbage")).starts_with("1-"));

        let last = format!("{}-0123456789abcdef", u64::MAX);
        assert!(next_revision(Some(&last)).starts_with(&format!("{}-", u64::MAX)));
    }

    #[test]
    fn attachments() {
        let attachment = Attachment {
            content_type: Some("application/octet-stream".into()),
            data: "aGVsbG8=".into(),
            length: Some(5),
        };
        assert_eq!(attachment.decode().unwrap(), &b"hello"[..]);

        let wrong = Attachment {
            length: Some(4),
            ..attachment.clone()
        };
        assert!(wrong.decode().is_err());

        let garbage = Attachment {
            data: "***".into(),
            ..attachment
        };
        assert!(garbage.decode().is_err());
    }

    #[test]
    fn star_requests() {
        let star: Package =
            serde_json::from_value(json!({"_id": "foo", "_rev": "1-a", "users": {"bob": true}}))
                .unwrap();
        assert!(star.is_star_request());

        let publish: Package = serde_json::from_value(json!({
            "name": "foo",
            "users": {},
            "versions": {"1.0.0": {}},
        }))
        .unwrap();
        assert!(!publish.is_star_request());
    }
}
