use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::cache_key::{CacheKey, CacheKeyBuilder, SourceIdentity};
use crate::cache_paths::{self, DEFAULT_CACHE_ROOT, DEFAULT_KEY_PREFIX_DIGITS};
use crate::error::CacheError;
use crate::storage::{FileStat, Storage};

/// Timestamp tolerance between a source and its archive cache, in seconds.
pub const DEFAULT_SKEW_SECONDS: i64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLocation {
    /// Precomputed artifact shipped next to the source.
    Archive(String),
    /// Previously regenerated artifact under the cache root.
    Loose(String),
    /// Nothing usable; a regenerated artifact belongs at this path.
    Miss(String),
}

impl CacheLocation {
    pub fn path(&self) -> &str {
        match self {
            CacheLocation::Archive(path) | CacheLocation::Loose(path) | CacheLocation::Miss(path) => {
                path
            }
        }
    }

    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheLocation::Miss(_))
    }
}

impl fmt::Display for CacheLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLocation::Archive(path) => write!(f, "archive {}", path),
            CacheLocation::Loose(path) => write!(f, "loose {}", path),
            CacheLocation::Miss(path) => write!(f, "miss -> {}", path),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverSettings {
    pub cache_root: String,
    pub key_prefix_digits: usize,
    pub skew_seconds: i64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            cache_root: DEFAULT_CACHE_ROOT.to_string(),
            key_prefix_digits: DEFAULT_KEY_PREFIX_DIGITS,
            skew_seconds: DEFAULT_SKEW_SECONDS,
        }
    }
}

/// One file the resolver looked at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactStatus {
    pub path: String,
    pub stat: Option<FileStat>,
    pub priority: Option<i32>,
}

impl ArtifactStatus {
    pub fn exists(&self) -> bool {
        self.stat.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct ResolveReport {
    pub source: ArtifactStatus,
    pub archive: ArtifactStatus,
    pub archive_usable: bool,
    pub key: Option<CacheKey>,
    pub loose: Option<ArtifactStatus>,
    pub location: Option<CacheLocation>,
}

impl ResolveReport {
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        match &self.location {
            Some(location) => lines.push(format!("resolved {} -> {}", self.source.path, location)),
            None => lines.push(format!("resolved {} -> no source", self.source.path)),
        }
        lines.push(describe_status("source", &self.source));
        let usable = if self.archive_usable { " [usable]" } else { "" };
        lines.push(format!("{}{}", describe_status("archive", &self.archive), usable));
        if let Some(key) = &self.key {
            lines.push(format!("- key: {}", key));
        }
        if let Some(loose) = &self.loose {
            lines.push(describe_status("loose", loose));
        }
        lines.join("\n")
    }
}

/// Decides, per source and key, between archive cache, loose cache and
/// regeneration for one target extension.
#[derive(Clone)]
pub struct CacheResolver {
    storage: Arc<dyn Storage>,
    target_extension: String,
    settings: ResolverSettings,
}

impl CacheResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        target_extension: impl Into<String>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            storage,
            target_extension: target_extension.into(),
            settings,
        }
    }

    pub fn target_extension(&self) -> &str {
        &self.target_extension
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn archive_path(&self, source: &str) -> String {
        cache_paths::archive_cache_path(source, &self.target_extension)
    }

    pub fn loose_path(&self, source: &str, key: &CacheKey) -> String {
        cache_paths::loose_cache_path(
            &self.settings.cache_root,
            source,
            key,
            self.settings.key_prefix_digits,
            &self.target_extension,
        )
    }

    /// An archive cache is used unless a higher-priority layer supplies the
    /// source, or the source is more than the skew newer than the archive.
    pub fn can_use_archive(&self, source: &str, archive: &str) -> bool {
        let Some(archive_priority) = self.storage.priority(archive) else {
            return false;
        };
        let Some(source_priority) = self.storage.priority(source) else {
            return true;
        };
        if source_priority > archive_priority {
            return false;
        }
        if let (Ok(Some(source_stat)), Ok(Some(archive_stat))) =
            (self.storage.stat(source), self.storage.stat(archive))
        {
            if source_stat.mtime - archive_stat.mtime > self.settings.skew_seconds {
                return false;
            }
        }
        true
    }

    /// Stats the source. A missing source is `NoSource`; any other stat
    /// failure is `SourceUnavailable`.
    pub fn source_identity(&self, source: &str) -> Result<SourceIdentity, CacheError> {
        match self.storage.stat(source) {
            Ok(Some(stat)) => Ok(SourceIdentity::from_stat(source, stat)),
            Ok(None) => Err(CacheError::NoSource {
                path: source.to_string(),
            }),
            Err(err) => Err(CacheError::SourceUnavailable {
                path: source.to_string(),
                source: err,
            }),
        }
    }

    /// Finishes the key from `inputs` once the source has been statted.
    pub fn resolve(&self, source: &str, inputs: &CacheKeyBuilder) -> Result<CacheLocation, CacheError> {
        let archive = self.archive_path(source);
        if self.can_use_archive(source, &archive) {
            debug!(source, archive = %archive, "archive cache hit");
            return Ok(CacheLocation::Archive(archive));
        }
        let identity = self.source_identity(source)?;
        let key = inputs.build(&identity);
        Ok(self.loose_or_miss(source, &key))
    }

    /// Same decision with a key the caller already finished.
    pub fn resolve_with_key(&self, source: &str, key: &CacheKey) -> Result<CacheLocation, CacheError> {
        let archive = self.archive_path(source);
        if self.can_use_archive(source, &archive) {
            debug!(source, archive = %archive, "archive cache hit");
            return Ok(CacheLocation::Archive(archive));
        }
        self.source_identity(source)?;
        Ok(self.loose_or_miss(source, key))
    }

    /// Every candidate `resolve` considers, for diagnostics. Stat failures on
    /// the source are still reported as errors.
    pub fn explain(&self, source: &str, inputs: &CacheKeyBuilder) -> Result<ResolveReport, CacheError> {
        let archive_path = self.archive_path(source);
        let archive = self.inspect(&archive_path);
        let archive_usable = self.can_use_archive(source, &archive_path);
        let source_status = self.inspect(source);
        let mut report = ResolveReport {
            source: source_status,
            archive,
            archive_usable,
            key: None,
            loose: None,
            location: None,
        };
        if archive_usable {
            report.location = Some(CacheLocation::Archive(archive_path));
            return Ok(report);
        }
        let identity = match self.source_identity(source) {
            Ok(identity) => identity,
            Err(CacheError::NoSource { .. }) => return Ok(report),
            Err(err) => return Err(err),
        };
        let key = inputs.build(&identity);
        let loose_path = self.loose_path(source, &key);
        report.loose = Some(self.inspect(&loose_path));
        report.key = Some(key);
        report.location = Some(self.loose_or_miss(source, &key));
        Ok(report)
    }

    fn loose_or_miss(&self, source: &str, key: &CacheKey) -> CacheLocation {
        let loose = self.loose_path(source, key);
        if self.storage.exists(&loose) {
            debug!(source, loose = %loose, "loose cache hit");
            CacheLocation::Loose(loose)
        } else {
            debug!(source, loose = %loose, "cache miss");
            CacheLocation::Miss(loose)
        }
    }

    fn inspect(&self, path: &str) -> ArtifactStatus {
        ArtifactStatus {
            path: path.to_string(),
            stat: self.storage.stat(path).ok().flatten(),
            priority: self.storage.priority(path),
        }
    }
}

fn describe_status(label: &str, status: &ArtifactStatus) -> String {
    match (status.stat, status.priority) {
        (Some(stat), priority) => format!(
            "- {}: {} (mtime={}, size={}, priority={}) [hit]",
            label,
            status.path,
            stat.mtime,
            stat.size,
            priority
                .map(|value| value.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        (None, _) => format!("- {}: {} (missing)", label, status.path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const SOURCE: &str = "art/meshes/model.dae";
    const ARCHIVE: &str = "art/meshes/model.dae.cached.pmd";

    fn resolver(storage: &Arc<MemoryStorage>) -> CacheResolver {
        let storage: Arc<dyn Storage> = storage.clone();
        CacheResolver::new(storage, "pmd", ResolverSettings::default())
    }

    fn source_with_size(storage: &MemoryStorage, mtime: i64, size: usize, priority: i32) {
        storage.insert(SOURCE, vec![7u8; size], mtime, priority);
    }

    #[test]
    fn archive_wins_at_equal_priority_within_skew() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1002, 512, 0);
        storage.insert(ARCHIVE, b"pmd".to_vec(), 1000, 0);
        let location = resolver(&storage)
            .resolve(SOURCE, &CacheKeyBuilder::new(3))
            .unwrap();
        assert_eq!(location, CacheLocation::Archive(ARCHIVE.to_string()));
    }

    #[test]
    fn archive_wins_over_lower_priority_source() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1000, 512, 0);
        storage.insert(ARCHIVE, b"pmd".to_vec(), 1000, 3);
        let location = resolver(&storage)
            .resolve(SOURCE, &CacheKeyBuilder::new(3))
            .unwrap();
        assert!(matches!(location, CacheLocation::Archive(_)));
    }

    #[test]
    fn skew_boundary_is_inclusive() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert(ARCHIVE, b"pmd".to_vec(), 1000, 0);
        let resolver = resolver(&storage);

        source_with_size(&storage, 1002, 512, 0);
        assert!(resolver.can_use_archive(SOURCE, ARCHIVE));

        source_with_size(&storage, 1003, 512, 0);
        assert!(!resolver.can_use_archive(SOURCE, ARCHIVE));
    }

    #[test]
    fn higher_priority_source_rejects_archive() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 900, 512, 2);
        storage.insert(ARCHIVE, b"pmd".to_vec(), 1000, 1);
        let resolver = resolver(&storage);
        assert!(!resolver.can_use_archive(SOURCE, ARCHIVE));
        let location = resolver.resolve(SOURCE, &CacheKeyBuilder::new(3)).unwrap();
        assert!(matches!(location, CacheLocation::Miss(_)));
    }

    #[test]
    fn archive_without_source_is_usable() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert(ARCHIVE, b"pmd".to_vec(), 1000, 0);
        let location = resolver(&storage)
            .resolve(SOURCE, &CacheKeyBuilder::new(3))
            .unwrap();
        assert_eq!(location, CacheLocation::Archive(ARCHIVE.to_string()));
    }

    #[test]
    fn missing_source_and_archive_is_no_source() {
        let storage = Arc::new(MemoryStorage::new());
        let result = resolver(&storage).resolve(SOURCE, &CacheKeyBuilder::new(3));
        assert!(matches!(result, Err(CacheError::NoSource { .. })));
    }

    #[test]
    fn stat_failure_is_reported_not_missed() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1000, 512, 0);
        storage.deny(SOURCE);
        let result = resolver(&storage).resolve(SOURCE, &CacheKeyBuilder::new(3));
        assert!(matches!(result, Err(CacheError::SourceUnavailable { .. })));
    }

    #[test]
    fn miss_then_loose_for_the_same_key() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1000, 512, 0);
        let resolver = resolver(&storage);
        let inputs = CacheKeyBuilder::new(3);

        let identity = resolver.source_identity(SOURCE).unwrap();
        let key = CacheKey::build(&identity, 3, &[]);
        let expected = format!("cache/art/meshes/model.{}.pmd", key.prefix_hex(8));

        let first = resolver.resolve(SOURCE, &inputs).unwrap();
        assert_eq!(first, CacheLocation::Miss(expected.clone()));

        storage.create(&expected, b"converted").unwrap();
        let second = resolver.resolve(SOURCE, &inputs).unwrap();
        assert_eq!(second, CacheLocation::Loose(expected.clone()));
        assert_eq!(
            resolver.resolve_with_key(SOURCE, &key).unwrap(),
            CacheLocation::Loose(expected)
        );
    }

    #[test]
    fn editing_the_source_orphans_the_loose_entry() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1000, 512, 0);
        let resolver = resolver(&storage);
        let inputs = CacheKeyBuilder::new(3);

        let CacheLocation::Miss(old_path) = resolver.resolve(SOURCE, &inputs).unwrap() else {
            panic!("expected miss");
        };
        storage.create(&old_path, b"converted").unwrap();

        source_with_size(&storage, 1000, 600, 0);
        let CacheLocation::Miss(size_path) = resolver.resolve(SOURCE, &inputs).unwrap() else {
            panic!("expected miss after size change");
        };
        assert_ne!(size_path, old_path);

        source_with_size(&storage, 1010, 512, 0);
        let CacheLocation::Miss(mtime_path) = resolver.resolve(SOURCE, &inputs).unwrap() else {
            panic!("expected miss after mtime change");
        };
        assert_ne!(mtime_path, old_path);
        assert!(storage.exists(&old_path));
    }

    #[test]
    fn version_bump_invalidates_loose_entry() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1000, 512, 0);
        let resolver = resolver(&storage);
        let CacheLocation::Miss(path) = resolver.resolve(SOURCE, &CacheKeyBuilder::new(3)).unwrap()
        else {
            panic!("expected miss");
        };
        storage.create(&path, b"converted").unwrap();
        let bumped = resolver.resolve(SOURCE, &CacheKeyBuilder::new(4)).unwrap();
        assert!(matches!(bumped, CacheLocation::Miss(other) if other != path));
    }

    #[test]
    fn explain_lists_candidates() {
        let storage = Arc::new(MemoryStorage::new());
        source_with_size(&storage, 1000, 512, 0);
        let report = resolver(&storage)
            .explain(SOURCE, &CacheKeyBuilder::new(3))
            .unwrap();
        assert!(report.source.exists());
        assert!(!report.archive.exists());
        assert!(!report.archive_usable);
        assert!(report.key.is_some());
        assert!(matches!(report.location, Some(CacheLocation::Miss(_))));
        let text = report.describe();
        assert!(text.contains("archive: art/meshes/model.dae.cached.pmd (missing)"));
        assert!(text.contains("[hit]"));
    }
}
