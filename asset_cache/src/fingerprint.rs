//! Aggregate fingerprints of auxiliary file sets (for example every skeleton
//! definition a mesh converter reads). The hash is kept until a file-watch
//! notification invalidates it.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::cache_key::{CacheKey, SourceIdentity};
use crate::storage::{Storage, StorageError};

/// Files directly inside `dir` with the given extension.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FileSetSpec {
    pub dir: String,
    pub extension: String,
}

#[derive(Clone, Debug)]
pub struct FileSetFingerprint {
    spec: FileSetSpec,
    cached: Option<CacheKey>,
}

impl FileSetFingerprint {
    pub fn new(spec: FileSetSpec) -> Self {
        Self { spec, cached: None }
    }

    pub fn spec(&self) -> &FileSetSpec {
        &self.spec
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    pub fn get(&mut self, storage: &dyn Storage) -> Result<CacheKey, StorageError> {
        if let Some(key) = self.cached {
            return Ok(key);
        }
        let key = compute(storage, &self.spec)?;
        self.cached = Some(key);
        Ok(key)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// True when a change to `path` can alter this fingerprint.
    pub fn covers(&self, path: &str) -> bool {
        let dir = self.spec.dir.trim_matches('/');
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        parent == dir
            && name
                .rsplit_once('.')
                .map(|(_, ext)| ext.eq_ignore_ascii_case(&self.spec.extension))
                .unwrap_or(false)
    }
}

// Sorted by path so mount order never changes the result.
fn compute(storage: &dyn Storage, spec: &FileSetSpec) -> Result<CacheKey, StorageError> {
    let mut files = storage.list_files(&spec.dir, &spec.extension)?;
    files.sort();
    let mut hasher = Sha256::new();
    for path in files {
        let Some(stat) = storage.stat(&path)? else {
            continue;
        };
        let identity = SourceIdentity::from_stat(path, stat);
        hasher.update((identity.path.len() as u64).to_le_bytes());
        hasher.update(identity.path.as_bytes());
        hasher.update(identity.mtime.to_le_bytes());
        hasher.update(identity.size.to_le_bytes());
    }
    Ok(CacheKey::from_hasher(hasher))
}
