//! In-memory backend, primarily a test harness for the registry engine.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use bundle_driver::{Driver, FileInfo, Reader, StorageError, StorageErrorKind, Writer};

use crate::archive::normalize;

const ENGINE: &str = "memory";

#[derive(Debug)]
struct MemoryItem {
    modified: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            modified: Utc::now(),
            data,
        }
    }
}

/// Storage driver that keeps all files in memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    files: RwLock<HashMap<Utf8PathBuf, MemoryItem>>,
}

impl MemoryDriver {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Whether `path` has any stored descendants, making it a synthetic
/// directory.
fn is_dir_of(files: &HashMap<Utf8PathBuf, MemoryItem>, path: &Utf8Path) -> bool {
    path.as_str().is_empty() || files.keys().any(|key| key.starts_with(path) && key != path)
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let files = self.files.read().await;
        files
            .get(&normalize(path))
            .map(|item| item.data.clone())
            .ok_or_else(|| StorageError::not_found(ENGINE, path.as_str()))
    }

    async fn put_content(&self, path: &Utf8Path, content: Vec<u8>) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        files.insert(normalize(path), content.into());
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Reader, StorageError> {
        let data = self.get_content(path).await?;
        let offset = offset as usize;
        if offset > data.len() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::Io,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("offset {offset} beyond end of entry ({} bytes)", data.len()),
                ),
            )
            .path(path.as_str())
            .build());
        }
        Ok(Box::new(std::io::Cursor::new(data[offset..].to_vec())))
    }

    async fn writer(&self, path: &Utf8Path, _append: bool) -> Result<Writer, StorageError> {
        // Streamed writes have no way to land back in the map on shutdown;
        // callers use put_content instead.
        Err(StorageError::builder(
            ENGINE,
            StorageErrorKind::Unsupported,
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "memory storage does not support streamed writes",
            ),
        )
        .path(path.as_str())
        .build())
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        let logical = normalize(path);
        let files = self.files.read().await;

        if let Some(item) = files.get(&logical) {
            return Ok(FileInfo {
                path: logical,
                size: item.data.len() as u64,
                modified: item.modified,
                is_dir: false,
            });
        }

        if is_dir_of(&files, &logical) {
            return Ok(FileInfo {
                path: logical,
                size: 0,
                modified: DateTime::UNIX_EPOCH,
                is_dir: true,
            });
        }

        Err(StorageError::not_found(ENGINE, path.as_str()))
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let logical = normalize(path);
        let files = self.files.read().await;

        if !is_dir_of(&files, &logical) {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        }

        let mut names = std::collections::BTreeSet::new();
        for key in files.keys() {
            let Ok(rest) = key.strip_prefix(&logical) else {
                continue;
            };
            if let Some(first) = rest.iter().next() {
                names.insert(first.to_owned());
            }
        }

        Ok(names.into_iter().map(|name| logical.join(name)).collect())
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        let item = files
            .remove(&normalize(from))
            .ok_or_else(|| StorageError::not_found(ENGINE, from.as_str()))?;
        files.insert(normalize(to), item);
        Ok(())
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let logical = normalize(path);
        let mut files = self.files.write().await;

        let before = files.len();
        files.retain(|key, _| !(key == &logical || key.starts_with(&logical)));
        if files.len() == before {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn content_round_trip() {
        let driver = MemoryDriver::new();
        let path = Utf8Path::new("a/b");

        driver.put_content(path, b"data".to_vec()).await.unwrap();
        assert_eq!(driver.get_content(path).await.unwrap(), b"data");

        let info = driver.stat(path).await.unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.size, 4);

        // The parent is a synthetic directory.
        assert!(driver.stat(Utf8Path::new("a")).await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn reader_slices_from_offset() {
        let driver = MemoryDriver::new();
        driver
            .put_content(Utf8Path::new("x"), b"0123456789".to_vec())
            .await
            .unwrap();

        let mut reader = driver.reader(Utf8Path::new("x"), 6).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"6789");
    }

    #[tokio::test]
    async fn list_derives_directories_from_keys() {
        let driver = MemoryDriver::new();
        driver.put_content(Utf8Path::new("top/a"), vec![1]).await.unwrap();
        driver
            .put_content(Utf8Path::new("top/sub/b"), vec![2])
            .await
            .unwrap();

        let listed = driver.list(Utf8Path::new("top")).await.unwrap();
        assert_eq!(
            listed,
            vec![Utf8PathBuf::from("top/a"), Utf8PathBuf::from("top/sub")]
        );

        assert!(driver
            .list(Utf8Path::new("absent"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_subtrees() {
        let driver = MemoryDriver::new();
        driver.put_content(Utf8Path::new("top/a"), vec![1]).await.unwrap();
        driver.put_content(Utf8Path::new("top/b"), vec![2]).await.unwrap();

        driver.delete(Utf8Path::new("top")).await.unwrap();
        assert!(driver
            .stat(Utf8Path::new("top"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
