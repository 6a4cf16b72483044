//! Storage layer for the registry.
//!
//! Translates registry operations into driver calls against the
//! distribution on-disk layout that bundle archives carry: tag and
//! revision link files under `repositories/`, content-addressed blob data
//! under `blobs/`.

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

use bundle_storage::Storage;

use crate::error::{RegistryError, RegistryResult};

/// The registry engine's fixed storage root inside a bundle.
const STORAGE_ROOT: &str = "docker/registry/v2";

/// Registry storage backend over the distribution v2 layout.
#[derive(Clone, Debug)]
pub struct RegistryStorage {
    storage: Storage,
}

impl RegistryStorage {
    /// Create a new registry storage over any driver.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// The path for a blob's data file:
    /// `blobs/<algorithm>/<hex[0..2]>/<hex>/data`.
    fn blob_data_path(&self, digest: &str) -> RegistryResult<Utf8PathBuf> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(Utf8PathBuf::from(format!(
            "{STORAGE_ROOT}/blobs/{algorithm}/{}/{hex}/data",
            &hex[..2]
        )))
    }

    /// The link file naming the digest a tag currently points at.
    fn tag_link_path(&self, repository: &str, tag: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{STORAGE_ROOT}/repositories/{repository}/_manifests/tags/{tag}/current/link"
        ))
    }

    /// The link file recording a manifest revision in a repository.
    fn revision_link_path(&self, repository: &str, digest: &str) -> RegistryResult<Utf8PathBuf> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(Utf8PathBuf::from(format!(
            "{STORAGE_ROOT}/repositories/{repository}/_manifests/revisions/{algorithm}/{hex}/link"
        )))
    }

    /// The link file recording a layer blob in a repository.
    fn layer_link_path(&self, repository: &str, digest: &str) -> RegistryResult<Utf8PathBuf> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(Utf8PathBuf::from(format!(
            "{STORAGE_ROOT}/repositories/{repository}/_layers/{algorithm}/{hex}/link"
        )))
    }

    /// The directory holding one link subtree per tag.
    fn tags_dir(&self, repository: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{STORAGE_ROOT}/repositories/{repository}/_manifests/tags"
        ))
    }

    /// Check if a blob exists.
    pub async fn blob_exists(&self, digest: &str) -> RegistryResult<bool> {
        let path = self.blob_data_path(digest)?;
        match self.storage.stat(&path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Get a blob's full contents.
    pub async fn get_blob(&self, digest: &str) -> RegistryResult<Vec<u8>> {
        let path = self.blob_data_path(digest)?;
        self.storage.get_content(&path).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::BlobNotFound(digest.to_string())
            } else {
                err.into()
            }
        })
    }

    /// Get a blob as a stream plus its size, for large layer downloads.
    pub async fn blob_reader(
        &self,
        digest: &str,
    ) -> RegistryResult<(bundle_storage::FileInfo, bundle_storage::Reader)> {
        let path = self.blob_data_path(digest)?;
        let not_found = |err: bundle_storage::StorageError| {
            if err.is_not_found() {
                RegistryError::BlobNotFound(digest.to_string())
            } else {
                err.into()
            }
        };

        let info = self.storage.stat(&path).await.map_err(not_found)?;
        let reader = self.storage.reader(&path, 0).await.map_err(not_found)?;
        Ok((info, reader))
    }

    /// Store a blob with digest verification.
    pub async fn put_blob(&self, repository: &str, digest: &str, data: &[u8]) -> RegistryResult<()> {
        let computed = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        if computed != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        let path = self.blob_data_path(digest)?;
        self.storage.put_content(&path, data.to_vec()).await?;

        // Record the blob as a layer of this repository.
        let link = self.layer_link_path(repository, digest)?;
        self.storage
            .put_content(&link, digest.as_bytes().to_vec())
            .await?;

        Ok(())
    }

    /// Delete a blob's data.
    pub async fn delete_blob(&self, digest: &str) -> RegistryResult<()> {
        let path = self.blob_data_path(digest)?;
        let parent = path.parent().map(Utf8Path::to_owned).unwrap_or(path);
        self.storage.delete(&parent).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::BlobNotFound(digest.to_string())
            } else {
                err.into()
            }
        })
    }

    /// Resolve a tag to the digest it currently points at.
    async fn resolve_tag(&self, repository: &str, tag: &str) -> RegistryResult<String> {
        let link = self.tag_link_path(repository, tag);
        let data = self.storage.get_content(&link).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::ManifestNotFound(format!("{repository}/{tag}"))
            } else {
                err.into()
            }
        })?;

        let digest = String::from_utf8_lossy(&data).trim().to_string();
        if digest.is_empty() {
            return Err(RegistryError::ManifestNotFound(format!(
                "{repository}/{tag}"
            )));
        }
        Ok(digest)
    }

    /// Get a manifest by tag or digest, returning its digest and bytes.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> RegistryResult<(String, Vec<u8>)> {
        let digest = if reference.contains(':') {
            // Digest reference: the repository must actually record this
            // revision before the blob store is consulted.
            let link = self.revision_link_path(repository, reference)?;
            match self.storage.stat(&link).await {
                Ok(_) => reference.to_string(),
                Err(err) if err.is_not_found() => {
                    return Err(RegistryError::ManifestNotFound(format!(
                        "{repository}/{reference}"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            self.resolve_tag(repository, reference).await?
        };

        let data = self.get_blob(&digest).await.map_err(|err| match err {
            RegistryError::BlobNotFound(_) => {
                RegistryError::ManifestNotFound(format!("{repository}/{reference}"))
            }
            other => other,
        })?;

        Ok((digest, data))
    }

    /// Store a manifest, writing its revision link, and its tag link when
    /// the reference is a tag. Returns the manifest digest.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        data: &[u8],
    ) -> RegistryResult<String> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));

        let path = self.blob_data_path(&digest)?;
        self.storage.put_content(&path, data.to_vec()).await?;

        let revision = self.revision_link_path(repository, &digest)?;
        self.storage
            .put_content(&revision, digest.as_bytes().to_vec())
            .await?;

        if !reference.contains(':') {
            let tag = self.tag_link_path(repository, reference);
            self.storage
                .put_content(&tag, digest.as_bytes().to_vec())
                .await?;
        }

        Ok(digest)
    }

    /// Delete a manifest reference: the tag subtree for a tag, the
    /// revision link for a digest. Blob data is left in place.
    pub async fn delete_manifest(&self, repository: &str, reference: &str) -> RegistryResult<()> {
        let target = if reference.contains(':') {
            self.revision_link_path(repository, reference)?
        } else {
            Utf8PathBuf::from(format!(
                "{STORAGE_ROOT}/repositories/{repository}/_manifests/tags/{reference}"
            ))
        };

        self.storage.delete(&target).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::ManifestNotFound(format!("{repository}/{reference}"))
            } else {
                err.into()
            }
        })
    }

    /// List the tags of a repository, sorted.
    pub async fn list_tags(&self, repository: &str) -> RegistryResult<Vec<String>> {
        let dir = self.tags_dir(repository);
        let entries = self.storage.list(&dir).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::ManifestNotFound(repository.to_string())
            } else {
                err.into()
            }
        })?;

        let mut tags: Vec<String> = entries
            .iter()
            .filter_map(|path| path.file_name())
            .map(str::to_string)
            .collect();
        tags.sort();
        Ok(tags)
    }
}

/// Split `algorithm:hex`, validating both halves enough to build blob
/// paths from them.
fn split_digest(digest: &str) -> RegistryResult<(&str, &str)> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(RegistryError::InvalidDigest(digest.to_string()));
    };
    if algorithm.is_empty() || hex.len() < 3 || !hex.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RegistryError::InvalidDigest(digest.to_string()));
    }
    Ok((algorithm, hex))
}
