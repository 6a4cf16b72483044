use std::future::Future;
use std::pin::Pin;
use std::{fmt, ops::Deref, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// An owned reader stream over one file's contents.
pub type Reader = Box<dyn io::AsyncBufRead + Unpin + Send + Sync + 'static>;

/// An owned writer stream for one file's contents.
pub type Writer = Box<dyn io::AsyncWrite + Unpin + Send + Sync + 'static>;

/// Metadata describing one stored entry.
///
/// Synthesized by the driver from whatever the backend records (archive
/// headers, filesystem metadata), so all backends present the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    /// The logical path of the entry, as the caller addressed it.
    pub path: Utf8PathBuf,

    /// The size of the entry in bytes. Zero for directories.
    pub size: u64,

    /// The modification timestamp of the entry.
    pub modified: DateTime<Utc>,

    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// A storage driver: the backend contract behind the registry engine.
///
/// All paths are slash-separated and rooted at the registry's storage
/// namespace. Read-only backends fail every mutating method with
/// [`StorageErrorKind::Unsupported`].
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Read the full contents of the entry at `path` into memory.
    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError>;

    /// Store `content` at `path`, replacing any existing entry.
    async fn put_content(&self, path: &Utf8Path, content: Vec<u8>) -> Result<(), StorageError>;

    /// Get a reader over the entry at `path`, starting at `offset` bytes.
    ///
    /// Backends over sequential media only accept `offset == 0` and reject
    /// anything else with [`StorageErrorKind::Unsupported`].
    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Reader, StorageError>;

    /// Get a writer for the entry at `path`, optionally appending.
    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Writer, StorageError>;

    /// Get the metadata for the entry at `path`.
    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError>;

    /// List the direct children of the directory at `path`, as full paths.
    ///
    /// Listing a nonexistent path is an error, not an empty list.
    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError>;

    /// Rename the entry at `from` to `to`.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Delete the entry at `path`, recursively for directories.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Return a URL clients may fetch `path` from directly, if the backend
    /// supports offloading reads. The default supports none.
    async fn redirect_url(&self, path: &Utf8Path) -> Result<Option<String>, StorageError> {
        let _ = path;
        Ok(None)
    }

    /// Enumerate every entry under `path`, depth first in preorder.
    ///
    /// A generic walker built from `list` and `stat`; backends with no
    /// cheaper bulk enumeration (archives) get this for free.
    async fn walk(&self, path: &Utf8Path) -> Result<Vec<FileInfo>, StorageError> {
        let mut found = Vec::new();
        walk_into(self, path.to_owned(), &mut found).await?;
        Ok(found)
    }
}

/// Recursive step for the default `walk`: emit each child, descending into
/// directories before moving on to later siblings.
fn walk_into<'a, D>(
    driver: &'a D,
    path: Utf8PathBuf,
    found: &'a mut Vec<FileInfo>,
) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>>
where
    D: Driver + ?Sized + Sync,
{
    Box::pin(async move {
        for child in driver.list(&path).await? {
            let info = driver.stat(&child).await?;
            let descend = info.is_dir;
            found.push(info);
            if descend {
                walk_into(driver, child, found).await?;
            }
        }
        Ok(())
    })
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: Vec<u8>) -> Result<(), StorageError> {
        self.deref().put_content(path, content).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Reader, StorageError> {
        self.deref().reader(path, offset).await
    }

    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Writer, StorageError> {
        self.deref().writer(path, append).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        self.deref().stat(path).await
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.deref().list(path).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().rename(from, to).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }

    async fn redirect_url(&self, path: &Utf8Path) -> Result<Option<String>, StorageError> {
        self.deref().redirect_url(path).await
    }

    async fn walk(&self, path: &Utf8Path) -> Result<Vec<FileInfo>, StorageError> {
        self.deref().walk(path).await
    }
}

/// Create the canonical read-only error for a mutating call on an
/// immutable backend.
pub fn read_only(engine: &'static str, path: &Utf8Path) -> StorageError {
    StorageError::builder(
        engine,
        StorageErrorKind::Unsupported,
        std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "storage is read-only",
        ),
    )
    .path(path.as_str())
    .build()
}
