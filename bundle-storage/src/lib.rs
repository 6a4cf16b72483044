//! # Bundle storage backends
//!
//! Configuration and unification for the storage backends behind the
//! air-gap registry: read-only overlays over bundle archives, a writable
//! local-filesystem tree for assembling fresh bundles, and an in-memory
//! backend for tests.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

pub(crate) mod archive;
pub mod bundle;
pub(crate) mod filesystem;
pub mod limit;
pub(crate) mod memory;
pub mod remap;

#[doc(inline)]
pub use archive::ArchiveFilesystem;

#[doc(inline)]
pub use bundle::BundleDriver;

#[doc(inline)]
pub use filesystem::FilesystemDriver;

#[doc(inline)]
pub use memory::MemoryDriver;

#[doc(inline)]
pub use bundle_driver::{Driver, FileInfo, Reader, StorageError, StorageErrorKind};

/// Configuration for the bundle-archive backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundleConfig {
    /// Bundle archive files, in priority order: earlier archives win when
    /// several contain the same logical path.
    pub archives: Vec<Utf8PathBuf>,

    /// Optional path segment the registry inserts between its fixed
    /// repositories root and the repository namespace.
    #[serde(default)]
    pub repositories_prefix: Option<String>,

    /// Maximum number of storage operations in flight at once. Defaults
    /// and floors per [`limit`].
    #[serde(default)]
    pub max_threads: Option<usize>,
}

impl BundleConfig {
    /// Check the configuration, reporting every violation at once rather
    /// than failing on the first bad field.
    pub fn validate(&self) -> Result<(), StorageError> {
        let mut problems = Vec::new();

        if self.archives.is_empty() {
            problems.push("archives: at least one bundle archive is required".to_string());
        }
        for (index, archive) in self.archives.iter().enumerate() {
            if archive.as_str().is_empty() {
                problems.push(format!("archives[{index}]: path must not be empty"));
            }
        }
        if let Some(prefix) = &self.repositories_prefix {
            if prefix.trim_matches('/').contains("//") {
                problems.push(format!(
                    "repositories-prefix: {prefix:?} contains empty path segments"
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StorageError::new(
                "bundle",
                StorageErrorKind::InvalidConfig,
                problems.join("; "),
            ))
        }
    }
}

/// Selects and configures a storage backend.
///
/// An explicit tagged variant per backend; the chosen driver is
/// constructed directly from the parsed configuration, with no global
/// factory registration involved.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Read-only overlay over one or more bundle archives.
    Bundle(BundleConfig),

    /// Writable tree rooted at a local directory.
    Filesystem {
        /// Directory holding the registry's on-disk layout.
        root: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Build the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let storage: Storage = match self {
            StorageConfig::Bundle(config) => BundleDriver::open(&config).await?.into(),
            StorageConfig::Filesystem { root } => FilesystemDriver::new(root).into(),
        };
        Ok(storage)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cheaply clonable handle over any storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Read the full contents of the entry at `path`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver.get_content(path).await
    }

    /// Store `content` at `path`.
    #[tracing::instrument(skip(self, content), fields(driver = self.driver.name()))]
    pub async fn put_content(&self, path: &Utf8Path, content: Vec<u8>) -> Result<(), StorageError> {
        self.driver.put_content(path, content).await
    }

    /// Get a reader over the entry at `path`, starting at `offset`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn reader(
        &self,
        path: &Utf8Path,
        offset: u64,
    ) -> Result<bundle_driver::Reader, StorageError> {
        self.driver.reader(path, offset).await
    }

    /// Get a writer for the entry at `path`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn writer(
        &self,
        path: &Utf8Path,
        append: bool,
    ) -> Result<bundle_driver::Writer, StorageError> {
        self.driver.writer(path, append).await
    }

    /// Get the metadata for the entry at `path`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        self.driver.stat(path).await
    }

    /// List the direct children of the directory at `path`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(path).await
    }

    /// Rename the entry at `from` to `to`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(from, to).await
    }

    /// Delete the entry at `path`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    /// Enumerate every entry under `path`, depth first.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn walk(&self, path: &Utf8Path) -> Result<Vec<FileInfo>, StorageError> {
        self.driver.walk(path).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared tar fixtures for backend tests.

    use camino::Utf8PathBuf;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn write_tar(
        dir: &std::path::Path,
        name: &str,
        entries: &[(&str, &[u8])],
    ) -> Utf8PathBuf {
        let target = dir.join(name);
        std::fs::write(&target, build_tar(entries)).unwrap();
        Utf8PathBuf::from(target.to_str().unwrap())
    }

    pub(crate) fn write_tgz(
        dir: &std::path::Path,
        name: &str,
        entries: &[(&str, &[u8])],
    ) -> Utf8PathBuf {
        let target = dir.join(name);
        let file = std::fs::File::create(&target).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        std::io::copy(&mut build_tar(entries).as_slice(), &mut encoder).unwrap();
        encoder.finish().unwrap();
        Utf8PathBuf::from(target.to_str().unwrap())
    }
}
