//! Writable local-filesystem backend.
//!
//! Used when assembling a fresh bundle: the registry engine writes its
//! normal on-disk layout into a staging directory, which is then archived.
//! Unlike the bundle driver this backend can seek, so reader offsets are
//! honored.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncSeekExt, SeekFrom};

use bundle_driver::{Driver, FileInfo, Reader, StorageError, StorageErrorKind, Writer};

use crate::archive::normalize;

const ENGINE: &str = "filesystem";

/// Storage driver rooted at a local directory.
#[derive(Debug)]
pub struct FilesystemDriver {
    root: Utf8PathBuf,
}

impl FilesystemDriver {
    /// Create a driver storing everything under `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(normalize(path))
    }
}

/// Convert an io::Error into a StorageError, keeping not-found
/// distinguishable.
fn io_error(path: &Utf8Path, err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        _ => StorageErrorKind::Io,
    };
    StorageError::builder(ENGINE, kind, err)
        .path(path.as_str())
        .build()
}

#[async_trait::async_trait]
impl Driver for FilesystemDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|err| io_error(path, err))
    }

    async fn put_content(&self, path: &Utf8Path, content: Vec<u8>) -> Result<(), StorageError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(path, err))?;
        }
        tokio::fs::write(target, content)
            .await
            .map_err(|err| io_error(path, err))
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Reader, StorageError> {
        let mut file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|err| io_error(path, err))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|err| io_error(path, err))?;
        }
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }

    async fn writer(&self, path: &Utf8Path, append: bool) -> Result<Writer, StorageError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(path, err))?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }

        let file = options
            .open(target)
            .await
            .map_err(|err| io_error(path, err))?;
        Ok(Box::new(tokio::io::BufWriter::new(file)))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        let metadata = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|err| io_error(path, err))?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(FileInfo {
            path: normalize(path),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let logical = normalize(path);
        let mut dir = tokio::fs::read_dir(self.resolve(path))
            .await
            .map_err(|err| io_error(path, err))?;

        let mut listed = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| io_error(path, err))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            listed.push(logical.join(name));
        }
        listed.sort();

        Ok(listed)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(to, err))?;
        }
        tokio::fs::rename(self.resolve(from), target)
            .await
            .map_err(|err| io_error(from, err))
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|err| io_error(path, err))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(target)
                .await
                .map_err(|err| io_error(path, err))
        } else {
            tokio::fs::remove_file(target)
                .await
                .map_err(|err| io_error(path, err))
        }
    }
}
