//! Read-only filesystem view over a single bundle archive.
//!
//! Opening an archive scans it once to build an in-memory index of entry
//! metadata; entry data is read by re-scanning the archive on demand, so
//! nothing is ever extracted to disk. Each read opens a fresh file handle,
//! which keeps concurrent reads safe without any locking.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;

/// Metadata for one indexed archive entry, synthesized from the archive's
/// own headers rather than filesystem stat calls.
///
/// `position` is the entry's ordinal in the archive. Tar permits the same
/// path to appear more than once, with the last occurrence winning on
/// extraction; indexing overwrites earlier occurrences, and reads seek to
/// the recorded position so data and metadata always describe the same
/// occurrence.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArchiveEntry {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
    position: usize,
}

/// One bundle archive presented as a path-addressable read-only tree.
///
/// Supports plain tar and tar+gzip, chosen by magic-byte sniffing with the
/// file extension as a fallback.
#[derive(Debug)]
pub struct ArchiveFilesystem {
    path: Utf8PathBuf,
    entries: HashMap<Utf8PathBuf, ArchiveEntry>,
    children: HashMap<Utf8PathBuf, BTreeSet<String>>,
}

impl ArchiveFilesystem {
    /// Open an archive and index its contents. Blocking.
    pub fn open(path: &Utf8Path) -> io::Result<Self> {
        let mut entries = HashMap::new();
        let mut children: HashMap<Utf8PathBuf, BTreeSet<String>> = HashMap::new();

        // The index root is the empty path.
        entries.insert(
            Utf8PathBuf::new(),
            ArchiveEntry {
                size: 0,
                modified: DateTime::UNIX_EPOCH,
                is_dir: true,
                position: 0,
            },
        );

        let mut archive = tar::Archive::new(open_reader(path)?);
        for (position, entry) in archive.entries()?.enumerate() {
            let entry = entry?;
            let header = entry.header();
            let entry_type = header.entry_type();
            if !entry_type.is_file() && !entry_type.is_dir() {
                continue;
            }

            let Some(entry_path) = entry_path(&entry)? else {
                continue;
            };

            let modified = header
                .mtime()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
                .unwrap_or(DateTime::UNIX_EPOCH);

            record_parents(&mut entries, &mut children, &entry_path, modified, position);
            entries.insert(
                entry_path,
                ArchiveEntry {
                    size: entry.size(),
                    modified,
                    is_dir: entry_type.is_dir(),
                    position,
                },
            );
        }

        Ok(Self {
            path: path.to_owned(),
            entries,
            children,
        })
    }

    /// The archive file this view was opened from.
    pub fn source(&self) -> &Utf8Path {
        &self.path
    }

    /// Look up entry metadata. `None` means the path is not in the archive.
    pub(crate) fn stat(&self, path: &Utf8Path) -> Option<ArchiveEntry> {
        self.entries.get(&normalize(path)).copied()
    }

    /// Direct child names of a directory, sorted. `None` means the path is
    /// not in the archive.
    pub(crate) fn read_dir(&self, path: &Utf8Path) -> Option<Vec<String>> {
        let path = normalize(path);
        self.entries.get(&path)?;
        Some(
            self.children
                .get(&path)
                .map(|names| names.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }

    /// Read the full data of a file entry by scanning the archive.
    /// Blocking. `Ok(None)` means no file at that path.
    pub(crate) fn read(&self, path: &Utf8Path) -> io::Result<Option<Vec<u8>>> {
        let mut data = Vec::new();
        if self.read_into(path, &mut data)? {
            Ok(Some(data))
        } else {
            Ok(None)
        }
    }

    /// Stream the data of a file entry into `out` by scanning the archive
    /// to the indexed position. Blocking. `Ok(false)` means no file at
    /// that path.
    pub(crate) fn read_into(&self, path: &Utf8Path, out: &mut dyn io::Write) -> io::Result<bool> {
        let Some(target) = self.stat(path).filter(|entry| !entry.is_dir) else {
            return Ok(false);
        };

        let mut archive = tar::Archive::new(open_reader(&self.path)?);
        for (position, entry) in archive.entries()?.enumerate() {
            let mut entry = entry?;
            if position != target.position {
                continue;
            }
            io::copy(&mut entry, out)?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Normalize a logical path to the archive's internal form: no leading
/// slash or `./`, no trailing slash.
pub(crate) fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let trimmed = path
        .as_str()
        .trim_start_matches('/')
        .trim_start_matches("./")
        .trim_end_matches('/');
    Utf8PathBuf::from(trimmed)
}

/// The normalized path of one tar entry; `None` for non-UTF-8 or empty
/// paths (e.g. the `./` root entry).
fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<Option<Utf8PathBuf>> {
    let raw = entry.path()?;
    let Some(utf8) = Utf8Path::from_path(&raw) else {
        return Ok(None);
    };
    let normalized = normalize(utf8);
    if normalized.as_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(normalized))
}

/// Synthesize directory entries for every ancestor of `path` and record
/// parent/child links. Archives written without explicit directory headers
/// still present a full tree this way.
fn record_parents(
    entries: &mut HashMap<Utf8PathBuf, ArchiveEntry>,
    children: &mut HashMap<Utf8PathBuf, BTreeSet<String>>,
    path: &Utf8Path,
    modified: DateTime<Utc>,
    position: usize,
) {
    let mut current = path.to_owned();
    while let Some(name) = current.file_name().map(str::to_owned) {
        let parent = current
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_default();

        children.entry(parent.clone()).or_default().insert(name);
        if !parent.as_str().is_empty() {
            entries.entry(parent.clone()).or_insert(ArchiveEntry {
                size: 0,
                modified,
                is_dir: true,
                position,
            });
        }
        current = parent;
    }
}

/// Open the archive file, transparently decompressing gzip. Detection uses
/// the gzip magic bytes, falling back to the file extension.
fn open_reader(path: &Utf8Path) -> io::Result<Box<dyn Read>> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let gzipped = (n == 2 && magic == [0x1f, 0x8b])
        || matches!(path.extension(), Some("gz") | Some("tgz"));

    if gzipped {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_tar, write_tgz};

    #[test]
    fn indexes_files_and_synthesizes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(
            dir.path(),
            "bundle.tar",
            &[
                ("docker/registry/v2/repositories/img1/link", b"sha256:aa"),
                ("images.yaml", b"images: []"),
            ],
        );

        let fs = ArchiveFilesystem::open(&archive).unwrap();

        let info = fs
            .stat(Utf8Path::new("docker/registry/v2/repositories/img1/link"))
            .unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.size, 9);

        // Ancestors exist even though the tar carried no directory headers.
        let repos = fs
            .stat(Utf8Path::new("docker/registry/v2/repositories"))
            .unwrap();
        assert!(repos.is_dir);

        let names = fs
            .read_dir(Utf8Path::new("docker/registry/v2/repositories"))
            .unwrap();
        assert_eq!(names, vec!["img1".to_string()]);
    }

    #[test]
    fn read_returns_entry_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(dir.path(), "bundle.tar", &[("a/b.txt", b"hello bundle")]);

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        let data = fs.read(Utf8Path::new("/a/b.txt")).unwrap().unwrap();
        assert_eq!(data, b"hello bundle");
    }

    #[test]
    fn missing_paths_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(dir.path(), "bundle.tar", &[("a/b.txt", b"x")]);

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        assert!(fs.stat(Utf8Path::new("a/missing")).is_none());
        assert!(fs.read_dir(Utf8Path::new("nope")).is_none());
        assert!(fs.read(Utf8Path::new("a/missing")).unwrap().is_none());
    }

    #[test]
    fn read_dir_is_direct_children_only() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(
            dir.path(),
            "bundle.tar",
            &[("top/one/deep.txt", b"1"), ("top/two.txt", b"2")],
        );

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        let names = fs.read_dir(Utf8Path::new("top")).unwrap();
        assert_eq!(names, vec!["one".to_string(), "two.txt".to_string()]);
    }

    #[test]
    fn duplicated_paths_resolve_to_the_last_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(
            dir.path(),
            "bundle.tar",
            &[("img/tag", b"old"), ("other", b"z"), ("img/tag", b"replacement")],
        );

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        let info = fs.stat(Utf8Path::new("img/tag")).unwrap();
        let data = fs.read(Utf8Path::new("img/tag")).unwrap().unwrap();

        assert_eq!(data, b"replacement");
        assert_eq!(info.size, data.len() as u64);
    }

    #[test]
    fn gzip_archives_open_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tgz(dir.path(), "bundle.tar.gz", &[("a/b.txt", b"compressed")]);

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        let data = fs.read(Utf8Path::new("a/b.txt")).unwrap().unwrap();
        assert_eq!(data, b"compressed");
    }

    #[test]
    fn gzip_detected_by_magic_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tgz(dir.path(), "bundle.bin", &[("x", b"y")]);

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        assert!(fs.stat(Utf8Path::new("x")).is_some());
    }

    #[test]
    fn root_lists_top_level_names() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_tar(
            dir.path(),
            "bundle.tar",
            &[("docker/registry/v2/blobs/data", b"b"), ("images.yaml", b"i")],
        );

        let fs = ArchiveFilesystem::open(&archive).unwrap();
        let names = fs.read_dir(Utf8Path::new("/")).unwrap();
        assert_eq!(names, vec!["docker".to_string(), "images.yaml".to_string()]);
    }
}
