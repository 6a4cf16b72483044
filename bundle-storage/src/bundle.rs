//! The multi-archive overlay driver.
//!
//! Serves the read half of the driver contract by probing an ordered list
//! of bundle archives and returning the first hit; earlier archives win
//! when several contain the same logical path. Listings union the children
//! from every archive so separate bundles can contribute different images
//! under one repository tree. All mutations fail: bundles are immutable
//! once created.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::Instrument;

use bundle_driver::{
    read_only, Driver, FileInfo, Reader, StorageError, StorageErrorKind, Writer,
};

use crate::archive::{normalize, ArchiveFilesystem};
use crate::limit::OperationLimiter;
use crate::remap::PathRemapper;
use crate::BundleConfig;

const ENGINE: &str = "bundle";

/// Chunks buffered between the blocking archive scan and the async reader.
const READER_CHANNEL_CHUNKS: usize = 8;

/// Blocking write half of a streaming read: hands each chunk to the async
/// reader, exerting backpressure through the bounded channel.
struct ChunkSender {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl std::io::Write for ChunkSender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream reader dropped")
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Read-through storage driver over one or more bundle archives.
#[derive(Debug)]
pub struct BundleDriver {
    archives: Vec<Arc<ArchiveFilesystem>>,
    remapper: PathRemapper,
    limiter: OperationLimiter,
}

impl BundleDriver {
    /// Validate the configuration and index every archive, in priority
    /// order. Fails fast at startup on a bad configuration or an
    /// unreadable archive.
    pub async fn open(config: &BundleConfig) -> Result<Self, StorageError> {
        config.validate()?;

        let mut archives = Vec::with_capacity(config.archives.len());
        for path in &config.archives {
            let opened = path.clone();
            let fs = tokio::task::spawn_blocking(move || ArchiveFilesystem::open(&opened))
                .in_current_span()
                .await
                .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
                .map_err(|err| {
                    StorageError::builder(ENGINE, StorageErrorKind::Io, err)
                        .context(format!("opening bundle archive {path}"))
                        .build()
                })?;
            tracing::debug!(archive = %fs.source(), "indexed bundle archive");
            archives.push(Arc::new(fs));
        }

        Ok(Self {
            archives,
            remapper: PathRemapper::new(config.repositories_prefix.as_deref()),
            limiter: OperationLimiter::new(config.max_threads),
        })
    }

    /// Probe each archive for the entry and buffer the first hit.
    ///
    /// Unregulated; callers hold the operation permit. This must never be
    /// re-entered from within another regulated call.
    async fn read_all(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let Some(inner) = self.remapper.to_inner(path) else {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        };
        let inner = normalize(&inner);

        for archive in &self.archives {
            let fs = archive.clone();
            let wanted = inner.clone();
            let result = tokio::task::spawn_blocking(move || fs.read(&wanted))
                .in_current_span()
                .await
                .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
                .map_err(|err| {
                    StorageError::builder(ENGINE, StorageErrorKind::Io, err)
                        .path(path.as_str())
                        .context(format!("reading from {}", archive.source()))
                        .build()
                })?;

            if let Some(data) = result {
                return Ok(data);
            }
        }

        Err(StorageError::not_found(ENGINE, path.as_str()))
    }
}

#[async_trait::async_trait]
impl Driver for BundleDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        self.read_all(path).await
    }

    async fn put_content(&self, path: &Utf8Path, _content: Vec<u8>) -> Result<(), StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        Err(read_only(ENGINE, path))
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Reader, StorageError> {
        if offset != 0 {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::Unsupported,
                std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("archive entries are sequential; offset {offset} is not readable"),
                ),
            )
            .path(path.as_str())
            .build());
        }

        let permit = self.limiter.acquire(ENGINE).await?;
        let Some(inner) = self.remapper.to_inner(path) else {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        };
        let inner = normalize(&inner);

        // Resolve the winning archive up front so a missing path fails here
        // rather than mid-stream.
        let winner = self
            .archives
            .iter()
            .find(|archive| archive.stat(&inner).is_some_and(|entry| !entry.is_dir))
            .cloned();
        let Some(archive) = winner else {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        };

        // The scan runs on a blocking thread and streams chunks through a
        // bounded channel, so large blobs never sit fully in memory. The
        // permit moves into the task and is held for the whole transfer.
        let (tx, rx) = mpsc::channel(READER_CHANNEL_CHUNKS);
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            let _permit = permit;
            let mut out = ChunkSender { tx: tx.clone() };
            match archive.read_into(&inner, &mut out) {
                Ok(true) => {}
                Ok(false) => {
                    // The index said this entry exists, so the archive file
                    // changed underneath us.
                    let _ = tx.blocking_send(Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("entry {inner} vanished from {}", archive.source()),
                    )));
                }
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                }
            }
        });

        Ok(Box::new(StreamReader::new(ReceiverStream::new(rx))))
    }

    async fn writer(&self, path: &Utf8Path, _append: bool) -> Result<Writer, StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        Err(read_only(ENGINE, path))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        let Some(inner) = self.remapper.to_inner(path) else {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        };

        for archive in &self.archives {
            if let Some(entry) = archive.stat(&inner) {
                return Ok(FileInfo {
                    path: normalize(path),
                    size: entry.size,
                    modified: entry.modified,
                    is_dir: entry.is_dir,
                });
            }
        }

        Err(StorageError::not_found(ENGINE, path.as_str()))
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        let Some(inner) = self.remapper.to_inner(path) else {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        };
        let inner = normalize(&inner);

        // Union across every archive, deduplicated by first match so a name
        // resolves to the same archive that stat/get_content would pick.
        let mut seen = HashSet::new();
        let mut listed = Vec::new();
        let mut found = false;

        for archive in &self.archives {
            let Some(names) = archive.read_dir(&inner) else {
                continue;
            };
            found = true;
            for name in names {
                if seen.insert(name.clone()) {
                    listed.push(self.remapper.from_inner(&inner.join(&name)));
                }
            }
        }

        if !found {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        }

        Ok(listed)
    }

    async fn rename(&self, from: &Utf8Path, _to: &Utf8Path) -> Result<(), StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        Err(read_only(ENGINE, from))
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let _permit = self.limiter.acquire(ENGINE).await?;
        Err(read_only(ENGINE, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_tar, write_tgz};
    use tokio::io::AsyncReadExt;

    const REPOS: &str = "docker/registry/v2/repositories";

    async fn two_bundle_driver(dir: &std::path::Path) -> BundleDriver {
        let a = write_tar(
            dir,
            "a.tar",
            &[
                (
                    "docker/registry/v2/repositories/img1/_manifests/tags/v1/current/link",
                    b"sha256:aaa",
                ),
                ("docker/registry/v2/repositories/shared/tag", b"from-a"),
                ("docker/registry/v2/blobs/sha256/aa/aaa/data", b"blob-a"),
            ],
        );
        let b = write_tgz(
            dir,
            "b.tar.gz",
            &[
                (
                    "docker/registry/v2/repositories/img2/_manifests/tags/v2/current/link",
                    b"sha256:bbb",
                ),
                ("docker/registry/v2/repositories/shared/tag", b"from-b"),
            ],
        );

        BundleDriver::open(&BundleConfig {
            archives: vec![a, b],
            repositories_prefix: None,
            max_threads: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn read_through_matches_archive_content() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;

        let path = Utf8Path::new("docker/registry/v2/blobs/sha256/aa/aaa/data");
        let content = driver.get_content(path).await.unwrap();
        assert_eq!(content, b"blob-a");

        let mut reader = driver.reader(path, 0).await.unwrap();
        let mut streamed = Vec::new();
        reader.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, content);

        let info = driver.stat(path).await.unwrap();
        assert_eq!(info.size, content.len() as u64);
        assert!(!info.is_dir);
    }

    #[tokio::test]
    async fn reader_streams_entries_larger_than_the_channel_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
        let archive = write_tar(
            dir.path(),
            "big.tar",
            &[("docker/registry/v2/blobs/sha256/cc/ccc/data", &payload)],
        );

        let driver = BundleDriver::open(&BundleConfig {
            archives: vec![archive],
            repositories_prefix: None,
            max_threads: None,
        })
        .await
        .unwrap();

        let mut reader = driver
            .reader(Utf8Path::new("docker/registry/v2/blobs/sha256/cc/ccc/data"), 0)
            .await
            .unwrap();
        let mut streamed = Vec::new();
        reader.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, payload);
    }

    #[tokio::test]
    async fn dropping_a_reader_mid_stream_frees_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x5a_u8; 1 << 20];
        let archive = write_tar(
            dir.path(),
            "big.tar",
            &[("docker/registry/v2/blobs/sha256/cc/ccc/data", &payload)],
        );

        let driver = BundleDriver::open(&BundleConfig {
            archives: vec![archive],
            repositories_prefix: None,
            max_threads: None,
        })
        .await
        .unwrap();
        let limit = driver.limiter.limit();

        let reader = driver
            .reader(Utf8Path::new("docker/registry/v2/blobs/sha256/cc/ccc/data"), 0)
            .await
            .unwrap();
        drop(reader);

        // The transfer task notices the dropped receiver and returns its
        // permit shortly after.
        for _ in 0..200 {
            if driver.limiter.available() == limit {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(driver.limiter.available(), limit);
    }

    #[tokio::test]
    async fn first_archive_wins_for_shared_paths() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;

        let content = driver
            .get_content(Utf8Path::new(
                "docker/registry/v2/repositories/shared/tag",
            ))
            .await
            .unwrap();
        assert_eq!(content, b"from-a");
    }

    #[tokio::test]
    async fn listing_unions_children_across_archives() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;

        let mut listed = driver.list(Utf8Path::new(REPOS)).await.unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                Utf8PathBuf::from(format!("{REPOS}/img1")),
                Utf8PathBuf::from(format!("{REPOS}/img2")),
                Utf8PathBuf::from(format!("{REPOS}/shared")),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_names_are_listed_once() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;

        let listed = driver.list(Utf8Path::new(REPOS)).await.unwrap();
        let shared = listed
            .iter()
            .filter(|p| p.as_str().ends_with("/shared"))
            .count();
        assert_eq!(shared, 1);
    }

    #[tokio::test]
    async fn repositories_prefix_remaps_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(
            dir.path(),
            "a.tar",
            &[("docker/registry/v2/repositories/foo/tag", b"payload")],
        );

        let driver = BundleDriver::open(&BundleConfig {
            archives: vec![archive],
            repositories_prefix: Some("/team-x".to_string()),
            max_threads: None,
        })
        .await
        .unwrap();

        // A request under the prefix resolves against the unprefixed tree.
        let content = driver
            .get_content(Utf8Path::new(&format!("{REPOS}/team-x/foo/tag")))
            .await
            .unwrap();
        assert_eq!(content, b"payload");

        // Listing results come back with the prefix inserted.
        let listed = driver
            .list(Utf8Path::new(&format!("{REPOS}/team-x")))
            .await
            .unwrap();
        assert_eq!(listed, vec![Utf8PathBuf::from(format!("{REPOS}/team-x/foo"))]);

        // The unprefixed path is no longer addressable from outside.
        let err = driver
            .get_content(Utf8Path::new(&format!("{REPOS}/foo/tag")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn every_mutation_is_rejected_as_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;
        let path = Utf8Path::new("docker/registry/v2/repositories/foo");

        let err = driver.put_content(path, b"data".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);

        let Err(err) = driver.writer(path, false).await else {
            panic!("writer must fail on bundles");
        };
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);

        let err = driver
            .rename(path, Utf8Path::new("docker/registry/v2/repositories/bar"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);

        let err = driver.delete(path).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn writes_leave_archive_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;
        let before = std::fs::read(dir.path().join("a.tar")).unwrap();

        driver
            .put_content(Utf8Path::new(&format!("{REPOS}/foo")), b"data".to_vec())
            .await
            .unwrap_err();

        let after = std::fs::read(dir.path().join("a.tar")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn missing_paths_surface_not_found_from_every_read_method() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;
        let path = Utf8Path::new("docker/registry/v2/repositories/absent");

        assert!(driver.get_content(path).await.unwrap_err().is_not_found());
        let Err(err) = driver.reader(path, 0).await else {
            panic!("reader must fail for a missing path");
        };
        assert!(err.is_not_found());
        assert!(driver.stat(path).await.unwrap_err().is_not_found());
        assert!(driver.list(path).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn nonzero_offsets_are_rejected_regardless_of_path() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;

        let valid = Utf8Path::new("docker/registry/v2/blobs/sha256/aa/aaa/data");
        let Err(err) = driver.reader(valid, 1).await else {
            panic!("nonzero offset must be rejected");
        };
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);

        let absent = Utf8Path::new("docker/registry/v2/nope");
        let Err(err) = driver.reader(absent, 7).await else {
            panic!("nonzero offset must be rejected");
        };
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn empty_archive_list_fails_construction() {
        let err = BundleDriver::open(&BundleConfig {
            archives: Vec::new(),
            repositories_prefix: None,
            max_threads: None,
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn unreadable_archive_fails_construction() {
        let err = BundleDriver::open(&BundleConfig {
            archives: vec![Utf8PathBuf::from("/definitely/not/here.tar")],
            repositories_prefix: None,
            max_threads: None,
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Io);
    }

    #[tokio::test]
    async fn walk_enumerates_the_overlayed_tree() {
        let dir = tempfile::tempdir().unwrap();
        let driver = two_bundle_driver(dir.path()).await;

        let entries = driver
            .walk(Utf8Path::new(&format!("{REPOS}/shared")))
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec![format!("{REPOS}/shared/tag")]);
    }

    #[tokio::test]
    async fn concurrent_reads_agree_under_the_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(two_bundle_driver(dir.path()).await);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let driver = driver.clone();
            tasks.push(tokio::spawn(async move {
                driver
                    .get_content(Utf8Path::new(
                        "docker/registry/v2/repositories/shared/tag",
                    ))
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), b"from-a");
        }
    }
}
