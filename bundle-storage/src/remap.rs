//! Path remapping between the registry's logical namespace and the paths
//! stored inside bundle archives.
//!
//! Bundles are always written without a repositories prefix. When the
//! registry is mounted under one, every incoming path of the form
//! `docker/registry/v2/repositories/<prefix>/x` must be rewritten to
//! `docker/registry/v2/repositories/x` before consulting an archive, and
//! listing results rewritten back the other way.

use camino::{Utf8Path, Utf8PathBuf};

/// The registry engine's fixed repository-storage subtree, relative to the
/// archive root. Matches the layout bundle archives are created with.
pub const REPOSITORIES_ROOT: &str = "docker/registry/v2/repositories";

/// Pure string rewriting for a configured repositories prefix.
///
/// With no prefix configured every method is a pass-through. Paths outside
/// the repositories subtree (the blob store) are never touched.
#[derive(Debug, Clone, Default)]
pub struct PathRemapper {
    prefix: Option<Utf8PathBuf>,
}

impl PathRemapper {
    /// Create a remapper for the given prefix. Leading and trailing slashes
    /// on the prefix are ignored; an empty prefix means no remapping.
    pub fn new(prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(Utf8PathBuf::from);
        Self { prefix }
    }

    /// Rewrite a logical path to its archive-internal form, dropping the
    /// configured prefix from the repositories subtree.
    ///
    /// Returns `None` for repository paths outside the configured prefix:
    /// with a prefix in force those names are not part of the logical
    /// namespace at all.
    pub fn to_inner(&self, path: &Utf8Path) -> Option<Utf8PathBuf> {
        let Some(prefix) = &self.prefix else {
            return Some(path.to_owned());
        };

        let normalized = crate::archive::normalize(path);
        let Ok(rest) = normalized.strip_prefix(REPOSITORIES_ROOT) else {
            return Some(path.to_owned());
        };

        match rest.strip_prefix(prefix) {
            Ok(tail) if tail.as_str().is_empty() => Some(Utf8PathBuf::from(REPOSITORIES_ROOT)),
            Ok(tail) => Some(Utf8Path::new(REPOSITORIES_ROOT).join(tail)),
            Err(_) => None,
        }
    }

    /// Rewrite an archive-internal path back to its logical form, inserting
    /// the configured prefix into the repositories subtree.
    pub fn from_inner(&self, path: &Utf8Path) -> Utf8PathBuf {
        let Some(prefix) = &self.prefix else {
            return path.to_owned();
        };

        let normalized = crate::archive::normalize(path);
        let Ok(rest) = normalized.strip_prefix(REPOSITORIES_ROOT) else {
            return path.to_owned();
        };

        let mut outer = Utf8Path::new(REPOSITORIES_ROOT).join(prefix);
        if !rest.as_str().is_empty() {
            outer.push(rest);
        }
        outer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_is_pass_through() {
        let remapper = PathRemapper::new(None);
        let path = Utf8Path::new("docker/registry/v2/repositories/foo/link");
        assert_eq!(remapper.to_inner(path).as_deref(), Some(path));
        assert_eq!(remapper.from_inner(path), path);

        let remapper = PathRemapper::new(Some(""));
        assert_eq!(remapper.to_inner(path).as_deref(), Some(path));
    }

    #[test]
    fn prefix_is_stripped_going_in() {
        let remapper = PathRemapper::new(Some("/team-x"));
        assert_eq!(
            remapper
                .to_inner(Utf8Path::new(
                    "docker/registry/v2/repositories/team-x/foo/link"
                ))
                .as_deref(),
            Some(Utf8Path::new("docker/registry/v2/repositories/foo/link"))
        );
    }

    #[test]
    fn prefix_is_inserted_coming_out() {
        let remapper = PathRemapper::new(Some("team-x"));
        assert_eq!(
            remapper.from_inner(Utf8Path::new("docker/registry/v2/repositories/foo")),
            Utf8Path::new("docker/registry/v2/repositories/team-x/foo")
        );
    }

    #[test]
    fn round_trip_restores_the_original() {
        let remapper = PathRemapper::new(Some("team-x"));
        let outer = Utf8Path::new("docker/registry/v2/repositories/team-x/foo/_manifests");
        assert_eq!(remapper.from_inner(&remapper.to_inner(outer).unwrap()), outer);
    }

    #[test]
    fn repositories_root_itself_maps_to_itself_plus_prefix() {
        let remapper = PathRemapper::new(Some("team-x"));
        assert_eq!(
            remapper
                .to_inner(Utf8Path::new("docker/registry/v2/repositories/team-x"))
                .as_deref(),
            Some(Utf8Path::new("docker/registry/v2/repositories"))
        );
        assert_eq!(
            remapper.from_inner(Utf8Path::new("docker/registry/v2/repositories")),
            Utf8Path::new("docker/registry/v2/repositories/team-x")
        );
    }

    #[test]
    fn blob_store_paths_are_untouched() {
        let remapper = PathRemapper::new(Some("team-x"));
        let blob = Utf8Path::new("docker/registry/v2/blobs/sha256/ab/abcd/data");
        assert_eq!(remapper.to_inner(blob).as_deref(), Some(blob));
        assert_eq!(remapper.from_inner(blob), blob);
    }

    #[test]
    fn unprefixed_repository_paths_are_not_addressable() {
        let remapper = PathRemapper::new(Some("team-x"));
        let other = Utf8Path::new("docker/registry/v2/repositories/other/link");
        assert_eq!(remapper.to_inner(other), None);
    }
}
