use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache_paths::{DEFAULT_CACHE_ROOT, DEFAULT_KEY_PREFIX_DIGITS};
use crate::cache_key::CacheKey;
use crate::converter::AssetKind;
use crate::error::CacheError;
use crate::resolver::{ResolverSettings, DEFAULT_SKEW_SECONDS};
use crate::storage::{LayeredStorage, MountKind, StorageError};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub cache_root: String,
    #[serde(default = "default_key_prefix_digits")]
    pub key_prefix_digits: usize,
    #[serde(default = "default_skew_seconds")]
    pub skew_seconds: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub kinds: Vec<AssetKind>,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MountEntry {
    pub kind: MountKind,
    #[serde(default)]
    pub mount_point: String,
    pub path: PathBuf,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigValidation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn default_cache_root() -> String {
    DEFAULT_CACHE_ROOT.to_string()
}

fn default_key_prefix_digits() -> usize {
    DEFAULT_KEY_PREFIX_DIGITS
}

fn default_skew_seconds() -> i64 {
    DEFAULT_SKEW_SECONDS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            key_prefix_digits: default_key_prefix_digits(),
            skew_seconds: default_skew_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            kinds: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn parse_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|err| err.to_string())
    }

    /// Reads a config file. Relative mount paths are taken from the file's
    /// directory, not the working directory.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let text = fs::read_to_string(path)
            .map_err(|err| CacheError::Config(format!("read {}: {}", path.display(), err)))?;
        let mut config = Self::parse_toml(&text)
            .map_err(|err| CacheError::Config(format!("{}: {}", path.display(), err)))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        for mount in &mut config.mounts {
            if mount.path.is_relative() {
                mount.path = base.join(&mount.path);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::default();
        let max_digits = CacheKey::LEN * 2;
        if self.key_prefix_digits == 0 || self.key_prefix_digits > max_digits {
            validation.errors.push(format!(
                "key_prefix_digits must be in 1..={} (got {})",
                max_digits, self.key_prefix_digits
            ));
        } else if self.key_prefix_digits < DEFAULT_KEY_PREFIX_DIGITS {
            validation.warnings.push(format!(
                "key_prefix_digits {} makes loose cache collisions likely",
                self.key_prefix_digits
            ));
        }
        if self.skew_seconds < 0 {
            validation
                .errors
                .push(format!("skew_seconds must not be negative (got {})", self.skew_seconds));
        }
        if self.cache_root.trim_matches('/').is_empty() {
            validation.errors.push("cache_root is empty".to_string());
        }
        if self.poll_interval_ms == 0 {
            validation
                .warnings
                .push("poll_interval_ms is 0; blocking loads will spin".to_string());
        }

        let mut names = BTreeSet::new();
        for kind in &self.kinds {
            if kind.name.trim().is_empty() {
                validation.errors.push("asset kind with empty name".to_string());
            } else if !names.insert(kind.name.as_str()) {
                validation
                    .errors
                    .push(format!("asset kind '{}' declared twice", kind.name));
            }
            for (label, extension) in [
                ("source_extension", &kind.source_extension),
                ("target_extension", &kind.target_extension),
            ] {
                if extension.is_empty() || extension.contains('.') || extension.contains('/') {
                    validation.errors.push(format!(
                        "kind '{}': {} '{}' must be a bare extension",
                        kind.name, label, extension
                    ));
                }
            }
            if kind.source_extension == kind.target_extension {
                validation.warnings.push(format!(
                    "kind '{}' converts .{} to itself",
                    kind.name, kind.source_extension
                ));
            }
            for set in &kind.aux_file_sets {
                if set.extension.is_empty() {
                    validation.errors.push(format!(
                        "kind '{}': aux file set '{}' has no extension",
                        kind.name, set.dir
                    ));
                }
            }
        }

        if !self.mounts.is_empty() && !self.mounts.iter().any(|mount| mount.writable) {
            validation
                .warnings
                .push("no writable mount; converted artifacts will not persist".to_string());
        }
        for mount in &self.mounts {
            if mount.writable && mount.kind == MountKind::Zip {
                validation.errors.push(format!(
                    "zip mount {} cannot be writable",
                    mount.path.display()
                ));
            }
        }
        validation
    }

    pub fn kind(&self, name: &str) -> Option<&AssetKind> {
        self.kinds.iter().find(|kind| kind.name == name)
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            cache_root: self.cache_root.clone(),
            key_prefix_digits: self.key_prefix_digits,
            skew_seconds: self.skew_seconds,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn build_storage(&self) -> Result<LayeredStorage, StorageError> {
        let mut storage = LayeredStorage::new();
        for mount in &self.mounts {
            match (mount.kind, mount.writable) {
                (MountKind::Dir, false) => {
                    storage.add_dir_mount(&mount.mount_point, &mount.path, mount.priority)?
                }
                (MountKind::Dir, true) => {
                    storage.add_writable_dir_mount(&mount.mount_point, &mount.path, mount.priority)?
                }
                (MountKind::Zip, _) => {
                    storage.add_zip_mount(&mount.mount_point, &mount.path, mount.priority)?
                }
            }
        }
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ConversionMode;
    use crate::storage::Storage;

    const SAMPLE: &str = r#"
cache_root = "cache"
key_prefix_digits = 8
skew_seconds = 2

[[kinds]]
name = "mesh"
source_extension = "dae"
target_extension = "pmd"
version = 3
mode = "worker"
[kinds.settings]
up_axis = "z"
[[kinds.aux_file_sets]]
dir = "art/skeletons"
extension = "xml"

[[kinds]]
name = "texture"
source_extension = "png"
target_extension = "dds"
version = 1

[[mounts]]
kind = "dir"
path = "mods/public"

[[mounts]]
kind = "dir"
path = "user"
priority = 10
writable = true
"#;

    #[test]
    fn sample_config_parses() {
        let config = CacheConfig::parse_toml(SAMPLE).unwrap();
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.kinds.len(), 2);
        let mesh = config.kind("mesh").unwrap();
        assert_eq!(mesh.mode, ConversionMode::Worker);
        assert_eq!(mesh.settings.get("up_axis"), Some("z"));
        assert_eq!(mesh.aux_file_sets[0].dir, "art/skeletons");
        assert_eq!(config.kind("texture").unwrap().mode, ConversionMode::Inline);
        assert_eq!(config.mounts[1].priority, 10);
        assert!(config.mounts[1].writable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = CacheConfig::parse_toml("").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.resolver_settings(), ResolverSettings::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = CacheConfig::parse_toml(SAMPLE).unwrap();
        config.key_prefix_digits = 40;
        config.skew_seconds = -1;
        config.kinds[1].name = "mesh".to_string();
        config.kinds[1].target_extension = ".dds".to_string();
        let validation = config.validate();
        assert!(!validation.is_ok());
        assert_eq!(validation.errors.len(), 4);
        assert!(validation.errors.iter().any(|error| error.contains("declared twice")));
    }

    #[test]
    fn load_rebases_relative_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("mods/public/art");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("model.dae"), b"mesh").unwrap();
        fs::create_dir_all(dir.path().join("user")).unwrap();
        let path = dir.path().join("assets.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.mounts[0].path, dir.path().join("mods/public"));

        let storage = config.build_storage().unwrap();
        assert!(storage.exists("art/model.dae"));
        storage.create("cache/art/model.0000.pmd", b"pmd").unwrap();
        assert!(dir.path().join("user/cache/art/model.0000.pmd").is_file());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = CacheConfig::load(Path::new("/nonexistent/assets.toml"));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
