//! The storage seam the cache runs on.
//!
//! Paths are virtual: `/`-separated, relative, with no `.`/`..` segments.
//! Implementations must be callable from the orchestrating thread and from
//! conversion workers at the same time.

mod layered;
mod memory;

use thiserror::Error;

pub use layered::{LayeredStorage, MountCandidate, MountKind, MountSummary};
pub use memory::MemoryStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("unsafe path: {0}")]
    UnsafePath(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("no writable mount for {0}")]
    ReadOnly(String),
}

/// Modification time (seconds since the Unix epoch) and byte size of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: i64,
    pub size: u64,
}

pub trait Storage: Send + Sync {
    /// `Ok(None)` means the file does not exist; `Err` is any other failure.
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StorageError>;

    fn load(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes `bytes` at `path`, creating parent directories as needed.
    fn create(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Layer precedence of the file that currently wins for `path`; higher
    /// overrides lower. `None` if no layer supplies it.
    fn priority(&self, path: &str) -> Option<i32>;

    /// Files directly inside `dir` whose extension is `extension`, as full
    /// virtual paths. Order is unspecified.
    fn list_files(&self, dir: &str, extension: &str) -> Result<Vec<String>, StorageError>;

    fn exists(&self, path: &str) -> bool {
        matches!(self.stat(path), Ok(Some(_)))
    }
}

pub(crate) fn normalize_virtual_path(path: &str) -> Result<Vec<String>, StorageError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let normalized = trimmed.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(StorageError::UnsafePath(path.to_string()));
    }
    let mut components = Vec::new();
    for part in normalized.trim_end_matches('/').split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains(':') {
            return Err(StorageError::UnsafePath(path.to_string()));
        }
        components.push(part.to_string());
    }
    Ok(components)
}

pub(crate) fn has_extension(name: &str, extension: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && ext.eq_ignore_ascii_case(extension),
        None => false,
    }
}
