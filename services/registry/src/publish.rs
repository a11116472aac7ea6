//! The composite publish and unpublish operations

use std::mem;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::document::{Package, ensure_name};
use crate::error::{RegistryError, RegistryResult};
use crate::storage::RegistryStorage;

/// Outcome of writing a published attachment
enum Attached {
    /// The tarball was written and its version still has to be added
    Stored,
    /// The tarball and an identical version were already stored
    AlreadyPublished,
}

impl RegistryStorage {
    /// Publish a submitted package document.
    ///
    /// Without a revision the document is created, and an existing package
    /// is tolerated so that new versions can be appended; with a revision the
    /// stored document is replaced. A document carrying one inline tarball and
    /// one version then has the tarball, the version and its dist-tags added
    /// in that order.
    ///
    /// The steps are not transactional. A tarball left behind by an earlier
    /// attempt that failed before its version was recorded is replaced, and an
    /// attempt that failed after recording an identical version resumes at the
    /// dist-tags, so the same publish can simply be retried.
    ///
    /// Returns the success message for the client.
    #[tracing::instrument(skip(self, package))]
    pub async fn publish(
        &self,
        name: &str,
        mut package: Package,
        revision: Option<&str>,
    ) -> RegistryResult<&'static str> {
        if package.is_star_request() {
            return Err(RegistryError::not_found(
                "npm star|unstar calls are not implemented",
            ));
        }

        package
            .validate_for(name)
            .map_err(|reason| {
                tracing::debug!(%reason, "rejected package document");
                RegistryError::BadData("bad incoming package data".into())
            })?;

        let message = if revision.is_some() {
            "package changed"
        } else {
            "created new package"
        };

        // old clients send the tarball separately
        if package.attachments.is_empty() {
            self.store(name, package, revision).await?;
            return Ok(message);
        }

        if package.attachments.len() != 1 || package.versions.len() != 1 {
            return Err(RegistryError::UnsupportedRequest(
                "unsupported registry call".into(),
            ));
        }

        let mut attachments = mem::take(&mut package.attachments);
        let mut versions = mem::take(&mut package.versions);
        let tags = mem::take(&mut package.dist_tags);
        let (Some((filename, attachment)), Some((version, manifest))) =
            (attachments.pop_first(), versions.pop_first())
        else {
            return Err(RegistryError::UnsupportedRequest(
                "unsupported registry call".into(),
            ));
        };

        ensure_name("filename", &filename)?;
        let data = attachment.decode().map_err(|reason| {
            tracing::debug!(%reason, "rejected attachment");
            RegistryError::BadData("bad incoming package data".into())
        })?;

        match self.store(name, package, revision).await {
            Err(error) if error.is_conflict() && revision.is_none() => {
                tracing::debug!("package exists, appending version");
            }
            other => {
                other?;
            }
        }

        match self
            .write_attachment(name, &filename, &version, &manifest, data)
            .await?
        {
            Attached::Stored => self.add_version(name, &version, manifest, None).await?,
            Attached::AlreadyPublished => {
                tracing::info!(%version, "version already stored, resuming at dist-tags");
            }
        }
        self.add_tags(name, tags).await?;

        tracing::info!(%version, %filename, "published");
        Ok(message)
    }

    async fn store(
        &self,
        name: &str,
        package: Package,
        revision: Option<&str>,
    ) -> RegistryResult<String> {
        match revision {
            Some(revision) => self.change_package(name, package, revision).await,
            None => self.add_package(name, package).await,
        }
    }

    /// Stream a decoded attachment into a new tarball.
    ///
    /// An existing tarball is an orphan, and is replaced, unless `version` is
    /// already published. A published version whose stored manifest equals
    /// `manifest` is the same publish retried after it stored the version, and
    /// is left alone; any other published version is a conflict.
    async fn write_attachment(
        &self,
        name: &str,
        filename: &str,
        version: &str,
        manifest: &Value,
        data: Bytes,
    ) -> RegistryResult<Attached> {
        let mut upload = match self.add_tarball(name, filename).await {
            Ok(upload) => upload,
            Err(error) if error.is_conflict() => {
                let package = self.get_package(name).await?;
                match package.versions.get(version) {
                    Some(stored) if stored == manifest => return Ok(Attached::AlreadyPublished),
                    Some(_) => {
                        return Err(RegistryError::conflict("this version already present"));
                    }
                    None => {}
                }

                tracing::warn!(%filename, "replacing tarball from an incomplete publish");
                self.discard_tarball(name, filename).await?;
                self.add_tarball(name, filename).await?
            }
            Err(error) => return Err(error),
        };

        if let Err(error) = upload.write_all(&data).await {
            if let Err(abort) = upload.abort().await {
                tracing::warn!(%abort, "unable to discard tarball");
            }
            return Err(error.into());
        }
        upload.finalize().await?;
        Ok(Attached::Stored)
    }

    /// Remove one tarball and the versions that point at it.
    ///
    /// Dist-tags naming a removed version are removed too.
    #[tracing::instrument(skip(self))]
    pub async fn unpublish_tarball(
        &self,
        name: &str,
        filename: &str,
        revision: &str,
    ) -> RegistryResult<()> {
        self.remove_tarball(name, filename, revision).await?;

        self.update_locked(name, |package| {
            let pruned: Vec<String> = package.versions_with_tarball(filename).cloned().collect();
            if pruned.is_empty() {
                return Ok(false);
            }

            for version in &pruned {
                package.versions.remove(version);
                package.time.remove(version);
            }
            package
                .dist_tags
                .retain(|_, version| !pruned.contains(version));

            tracing::debug!(?pruned, "pruned versions");
            Ok(true)
        })
        .await?;
        Ok(())
    }
}
