//! Naming conventions for cached artifacts.
//!
//! Archive caches are produced offline and shipped next to their sources, so
//! their names must stay bit-exact: `<source>.cached.<ext>`, no hash.
//! Loose caches live under the cache root and carry a key prefix.

use crate::cache_key::CacheKey;

pub const ARCHIVE_MARKER: &str = "cached";
pub const DEFAULT_CACHE_ROOT: &str = "cache";
pub const DEFAULT_KEY_PREFIX_DIGITS: usize = 8;

/// `art/meshes/model.dae` -> `art/meshes/model.dae.cached.pmd`.
pub fn archive_cache_path(source: &str, target_extension: &str) -> String {
    format!("{}.{}.{}", source, ARCHIVE_MARKER, target_extension)
}

/// `art/meshes/model.dae` -> `cache/art/meshes/model.<hex>.pmd`.
pub fn loose_cache_path(
    cache_root: &str,
    source: &str,
    key: &CacheKey,
    prefix_digits: usize,
    target_extension: &str,
) -> String {
    let (dir, file_name) = split_parent(source);
    let file = format!(
        "{}.{}.{}",
        file_stem(file_name),
        key.prefix_hex(prefix_digits),
        target_extension
    );
    [cache_root.trim_matches('/'), dir, file.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Hand-provided derived file with no cache decoration: `<stem>.<ext>`.
pub fn uncached_artifact_path(stem: &str, target_extension: &str) -> String {
    format!("{}.{}", stem, target_extension)
}

pub fn source_path(stem: &str, source_extension: &str) -> String {
    format!("{}.{}", stem, source_extension)
}

pub fn split_parent(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

pub fn file_stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::SourceIdentity;
    use crate::storage::FileStat;

    fn key() -> CacheKey {
        let identity = SourceIdentity::from_stat(
            "art/meshes/model.dae",
            FileStat {
                mtime: 1000,
                size: 512,
            },
        );
        CacheKey::build(&identity, 3, &[])
    }

    #[test]
    fn archive_path_keeps_source_extension() {
        assert_eq!(
            archive_cache_path("art/meshes/model.dae", "pmd"),
            "art/meshes/model.dae.cached.pmd"
        );
    }

    #[test]
    fn loose_path_preserves_directories() {
        let key = key();
        let path = loose_cache_path("cache", "art/meshes/model.dae", &key, 8, "pmd");
        assert_eq!(path, format!("cache/art/meshes/model.{}.pmd", key.prefix_hex(8)));
    }

    #[test]
    fn loose_path_for_top_level_source() {
        let key = key();
        let path = loose_cache_path("cache/", "model.dae", &key, 4, "pmd");
        assert_eq!(path, format!("cache/model.{}.pmd", key.prefix_hex(4)));
    }

    #[test]
    fn stems_and_fallback_paths() {
        assert_eq!(file_stem("model.dae"), "model");
        assert_eq!(file_stem("archive.tar.gz"), "archive.tar");
        assert_eq!(file_stem(".hidden"), ".hidden");
        assert_eq!(uncached_artifact_path("art/meshes/model", "pmd"), "art/meshes/model.pmd");
        assert_eq!(source_path("art/meshes/model", "dae"), "art/meshes/model.dae");
    }
}
