use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Mutex;

use super::{has_extension, normalize_virtual_path, FileStat, Storage, StorageError};

#[derive(Clone, Debug)]
struct MemoryFile {
    bytes: Vec<u8>,
    mtime: i64,
    priority: i32,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    created: Vec<String>,
    denied: BTreeSet<String>,
    fail_writes: bool,
    write_mtime: i64,
    write_priority: i32,
}

/// In-memory storage with explicit timestamps and priorities.
///
/// Every `create` call is recorded, including rejected ones, so callers can
/// assert exactly which writes were attempted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bytes: impl Into<Vec<u8>>, mtime: i64, priority: i32) {
        let mut guard = self.lock();
        guard.files.insert(
            path.to_string(),
            MemoryFile {
                bytes: bytes.into(),
                mtime,
                priority,
            },
        );
    }

    pub fn remove(&self, path: &str) -> bool {
        self.lock().files.remove(path).is_some()
    }

    /// Makes `stat` and `load` on `path` fail with a permission error.
    pub fn deny(&self, path: &str) {
        self.lock().denied.insert(path.to_string());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Timestamp and priority given to files written through `create`.
    pub fn set_write_layer(&self, mtime: i64, priority: i32) {
        let mut guard = self.lock();
        guard.write_mtime = mtime;
        guard.write_priority = priority;
    }

    pub fn created_paths(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory storage lock poisoned")
    }
}

fn check_access(state: &MemoryState, path: &str) -> Result<(), StorageError> {
    if state.denied.contains(path) {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("access denied: {}", path),
        )));
    }
    Ok(())
}

impl Storage for MemoryStorage {
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StorageError> {
        normalize_virtual_path(path)?;
        let guard = self.lock();
        check_access(&guard, path)?;
        Ok(guard.files.get(path).map(|file| FileStat {
            mtime: file.mtime,
            size: file.bytes.len() as u64,
        }))
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        normalize_virtual_path(path)?;
        let guard = self.lock();
        check_access(&guard, path)?;
        guard
            .files
            .get(path)
            .map(|file| file.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn create(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        normalize_virtual_path(path)?;
        let mut guard = self.lock();
        guard.created.push(path.to_string());
        if guard.fail_writes {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "disk full",
            )));
        }
        let file = MemoryFile {
            bytes: bytes.to_vec(),
            mtime: guard.write_mtime,
            priority: guard.write_priority,
        };
        guard.files.insert(path.to_string(), file);
        Ok(())
    }

    fn priority(&self, path: &str) -> Option<i32> {
        self.lock().files.get(path).map(|file| file.priority)
    }

    fn list_files(&self, dir: &str, extension: &str) -> Result<Vec<String>, StorageError> {
        let prefix = normalize_virtual_path(dir)?.join("/");
        let guard = self.lock();
        Ok(guard
            .files
            .keys()
            .filter(|path| {
                let (parent, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
                parent == prefix && has_extension(name, extension)
            })
            .cloned()
            .collect())
    }
}
