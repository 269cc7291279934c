use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{Local, NaiveDate, TimeZone};
use serde::Deserialize;
use tempfile::NamedTempFile;
use zip::read::ZipArchive;

use super::{has_extension, normalize_virtual_path, FileStat, Storage, StorageError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Dir,
    Zip,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MountKind::Dir => "dir",
            MountKind::Zip => "zip",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSummary {
    pub mount_point: String,
    pub kind: MountKind,
    pub source: PathBuf,
    pub priority: i32,
    pub writable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountCandidate {
    pub order: usize,
    pub mount_point: String,
    pub kind: MountKind,
    pub source: PathBuf,
    pub priority: i32,
    pub exists: bool,
}

/// Directory and zip layers stacked by priority.
///
/// Mounts are kept sorted by descending priority; among equal priorities the
/// earlier mount wins. Zip contents are indexed at mount time and the
/// mount list is immutable once the storage is shared.
#[derive(Debug, Default)]
pub struct LayeredStorage {
    mounts: Vec<Mount>,
}

#[derive(Debug)]
struct Mount {
    root: VirtualRoot,
    kind: MountKind,
    source: PathBuf,
    priority: i32,
    writable: bool,
    payload: MountPayload,
}

#[derive(Debug)]
enum MountPayload {
    Dir(PathBuf),
    Zip(ZipMount),
}

#[derive(Debug)]
struct ZipMount {
    entries: HashMap<String, ZipEntryInfo>,
}

#[derive(Debug)]
struct ZipEntryInfo {
    raw_name: String,
    stat: FileStat,
}

#[derive(Debug)]
struct VirtualPath {
    components: Vec<String>,
}

#[derive(Debug)]
struct VirtualRoot {
    components: Vec<String>,
    display: String,
}

impl LayeredStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir_mount(
        &mut self,
        mount_point: &str,
        path: impl Into<PathBuf>,
        priority: i32,
    ) -> Result<(), StorageError> {
        self.push_dir(mount_point, path.into(), priority, false)
    }

    /// A directory layer that receives `create` calls under `mount_point`.
    pub fn add_writable_dir_mount(
        &mut self,
        mount_point: &str,
        path: impl Into<PathBuf>,
        priority: i32,
    ) -> Result<(), StorageError> {
        self.push_dir(mount_point, path.into(), priority, true)
    }

    pub fn add_zip_mount(
        &mut self,
        mount_point: &str,
        path: impl Into<PathBuf>,
        priority: i32,
    ) -> Result<(), StorageError> {
        let root = VirtualRoot::parse(mount_point)?;
        let path = path.into();
        let file = fs::File::open(&path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|err| StorageError::Archive(format!("open failed: {}", err)))?;
        let mut entries = HashMap::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|err| StorageError::Archive(format!("entry {} failed: {}", index, err)))?;
            if entry.is_dir() {
                continue;
            }
            let raw_name = entry.name().to_string();
            let name = raw_name.replace('\\', "/");
            let Ok(components) = normalize_virtual_path(&name) else {
                continue;
            };
            if components.is_empty() {
                continue;
            }
            let stat = FileStat {
                mtime: dos_time_to_unix(entry.last_modified()),
                size: entry.size(),
            };
            entries.insert(components.join("/"), ZipEntryInfo { raw_name, stat });
        }
        self.insert(Mount {
            root,
            kind: MountKind::Zip,
            source: path,
            priority,
            writable: false,
            payload: MountPayload::Zip(ZipMount { entries }),
        });
        Ok(())
    }

    pub fn mounts(&self) -> Vec<MountSummary> {
        self.mounts
            .iter()
            .map(|mount| MountSummary {
                mount_point: mount.root.display.clone(),
                kind: mount.kind,
                source: mount.source.clone(),
                priority: mount.priority,
                writable: mount.writable,
            })
            .collect()
    }

    /// Every layer that could supply `virtual_path`, in precedence order.
    pub fn explain_mounts(&self, virtual_path: &str) -> Result<Vec<MountCandidate>, StorageError> {
        let vpath = VirtualPath::parse_file(virtual_path)?;
        let mut candidates = Vec::new();
        for (order, mount) in self.mounts.iter().enumerate() {
            let Some(rel) = mount.root.match_relative(&vpath) else {
                continue;
            };
            let exists = matches!(mount.stat(&rel), Ok(Some(_)));
            candidates.push(MountCandidate {
                order,
                mount_point: mount.root.display.clone(),
                kind: mount.kind,
                source: mount.source.clone(),
                priority: mount.priority,
                exists,
            });
        }
        Ok(candidates)
    }

    fn push_dir(
        &mut self,
        mount_point: &str,
        path: PathBuf,
        priority: i32,
        writable: bool,
    ) -> Result<(), StorageError> {
        let root = VirtualRoot::parse(mount_point)?;
        self.insert(Mount {
            root,
            kind: MountKind::Dir,
            source: path.clone(),
            priority,
            writable,
            payload: MountPayload::Dir(path),
        });
        Ok(())
    }

    fn insert(&mut self, mount: Mount) {
        let index = self
            .mounts
            .iter()
            .position(|existing| existing.priority < mount.priority)
            .unwrap_or(self.mounts.len());
        self.mounts.insert(index, mount);
    }

    fn winner(&self, vpath: &VirtualPath) -> Result<Option<(&Mount, VirtualPath, FileStat)>, StorageError> {
        for mount in &self.mounts {
            let Some(rel) = mount.root.match_relative(vpath) else {
                continue;
            };
            if let Some(stat) = mount.stat(&rel)? {
                return Ok(Some((mount, rel, stat)));
            }
        }
        Ok(None)
    }
}

impl Storage for LayeredStorage {
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StorageError> {
        let vpath = VirtualPath::parse_file(path)?;
        Ok(self.winner(&vpath)?.map(|(_, _, stat)| stat))
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let vpath = VirtualPath::parse_file(path)?;
        match self.winner(&vpath)? {
            Some((mount, rel, _)) => mount.read(&rel),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn create(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let vpath = VirtualPath::parse_file(path)?;
        for mount in self.mounts.iter().filter(|mount| mount.writable) {
            let Some(rel) = mount.root.match_relative(&vpath) else {
                continue;
            };
            let MountPayload::Dir(root) = &mount.payload else {
                continue;
            };
            let target = safe_join(root, &rel)?;
            let parent = target
                .parent()
                .ok_or_else(|| StorageError::UnsafePath(path.to_string()))?;
            fs::create_dir_all(parent)?;
            // Staged next to the target so a failed write never leaves a
            // truncated artifact under its final name.
            let mut staged = NamedTempFile::new_in(parent)?;
            staged.write_all(bytes)?;
            staged.as_file().sync_all()?;
            staged.persist(&target).map_err(|err| StorageError::Io(err.error))?;
            return Ok(());
        }
        Err(StorageError::ReadOnly(path.to_string()))
    }

    fn priority(&self, path: &str) -> Option<i32> {
        let vpath = VirtualPath::parse_file(path).ok()?;
        self.winner(&vpath)
            .ok()
            .flatten()
            .map(|(mount, _, _)| mount.priority)
    }

    fn list_files(&self, dir: &str, extension: &str) -> Result<Vec<String>, StorageError> {
        let vdir = VirtualPath::parse(dir)?;
        let mut names = BTreeSet::new();
        for mount in &self.mounts {
            let Some(rel) = mount.root.match_relative(&vdir) else {
                continue;
            };
            for name in mount.list_files(&rel)? {
                if has_extension(&name, extension) {
                    names.insert(name);
                }
            }
        }
        let prefix = vdir.normalized();
        Ok(names
            .into_iter()
            .map(|name| {
                if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                }
            })
            .collect())
    }
}

impl Mount {
    fn stat(&self, rel: &VirtualPath) -> Result<Option<FileStat>, StorageError> {
        if rel.components.is_empty() {
            return Ok(None);
        }
        match &self.payload {
            MountPayload::Dir(root) => {
                let path = safe_join(root, rel)?;
                let metadata = match fs::metadata(&path) {
                    Ok(metadata) => metadata,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                    Err(err) => return Err(StorageError::Io(err)),
                };
                if !metadata.is_file() {
                    return Ok(None);
                }
                let mtime = metadata
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_secs() as i64)
                    .unwrap_or(0);
                Ok(Some(FileStat {
                    mtime,
                    size: metadata.len(),
                }))
            }
            MountPayload::Zip(zip) => Ok(zip.entries.get(&rel.normalized()).map(|entry| entry.stat)),
        }
    }

    fn read(&self, rel: &VirtualPath) -> Result<Vec<u8>, StorageError> {
        match &self.payload {
            MountPayload::Dir(root) => Ok(fs::read(safe_join(root, rel)?)?),
            MountPayload::Zip(zip) => {
                let key = rel.normalized();
                let Some(info) = zip.entries.get(&key) else {
                    return Err(StorageError::NotFound(key));
                };
                let mut file = fs::File::open(&self.source)?;
                let mut archive = ZipArchive::new(&mut file)
                    .map_err(|err| StorageError::Archive(format!("open failed: {}", err)))?;
                let mut entry = archive
                    .by_name(&info.raw_name)
                    .map_err(|err| StorageError::Archive(format!("read failed: {}", err)))?;
                let mut buffer = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut buffer)?;
                Ok(buffer)
            }
        }
    }

    fn list_files(&self, rel: &VirtualPath) -> Result<Vec<String>, StorageError> {
        match &self.payload {
            MountPayload::Dir(root) => {
                let path = safe_join(root, rel)?;
                let read_dir = match fs::read_dir(&path) {
                    Ok(read_dir) => read_dir,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(err) => return Err(StorageError::Io(err)),
                };
                let mut names = Vec::new();
                for entry in read_dir.flatten() {
                    let Ok(file_type) = entry.file_type() else {
                        continue;
                    };
                    if file_type.is_file() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                Ok(names)
            }
            MountPayload::Zip(zip) => {
                let prefix = if rel.components.is_empty() {
                    String::new()
                } else {
                    format!("{}/", rel.normalized())
                };
                Ok(zip
                    .entries
                    .keys()
                    .filter_map(|name| name.strip_prefix(&prefix))
                    .filter(|rest| !rest.contains('/'))
                    .map(str::to_string)
                    .collect())
            }
        }
    }
}

impl VirtualPath {
    fn parse(path: &str) -> Result<Self, StorageError> {
        let components = normalize_virtual_path(path)?;
        Ok(Self { components })
    }

    fn parse_file(path: &str) -> Result<Self, StorageError> {
        let vpath = Self::parse(path)?;
        if vpath.components.is_empty() {
            return Err(StorageError::UnsafePath(path.to_string()));
        }
        Ok(vpath)
    }

    fn normalized(&self) -> String {
        self.components.join("/")
    }
}

impl VirtualRoot {
    fn parse(path: &str) -> Result<Self, StorageError> {
        let components = normalize_virtual_path(path)?;
        let display = components.join("/");
        Ok(Self {
            components,
            display,
        })
    }

    fn match_relative(&self, path: &VirtualPath) -> Option<VirtualPath> {
        if !path.components.starts_with(&self.components) {
            return None;
        }
        let rel = path.components[self.components.len()..].to_vec();
        Some(VirtualPath { components: rel })
    }
}

fn safe_join(base: &Path, rel: &VirtualPath) -> Result<PathBuf, StorageError> {
    let mut out = PathBuf::from(base);
    for part in &rel.components {
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) => out.push(part),
            _ => return Err(StorageError::UnsafePath(rel.normalized())),
        }
    }
    Ok(out)
}

// Zip entries carry DOS time with 2-second resolution and no zone; archivers
// write the packing machine's local time, so it is read in the local zone.
fn dos_time_to_unix(time: zip::DateTime) -> i64 {
    NaiveDate::from_ymd_opt(
        i32::from(time.year()),
        u32::from(time.month()),
        u32::from(time.day()),
    )
    .and_then(|date| {
        date.and_hms_opt(
            u32::from(time.hour()),
            u32::from(time.minute()),
            u32::from(time.second()),
        )
    })
    .and_then(|datetime| Local.from_local_datetime(&datetime).earliest())
    .map(|datetime| datetime.timestamp())
    .unwrap_or(0)
}
