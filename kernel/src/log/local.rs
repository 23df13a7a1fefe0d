use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::store::{validate_name, FileMeta, LogStore, StoreConfig, StoreError};

const TEMP_PREFIX: &str = ".tmp-";

/// A replace lock older than this is left over from a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Log store over a local directory.
///
/// Creation is atomic through a hard link from a fully written temp file
/// (the link fails if the target exists); replacement goes through rename.
#[derive(Debug, Clone)]
pub struct LocalFileSystemLogStore {
    root: PathBuf,
    config: StoreConfig,
}

impl LocalFileSystemLogStore {
    /// Open (creating if needed) the log directory at `root`.
    pub fn try_new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| io_error(&root, source))?;
        Ok(Self {
            root,
            config: StoreConfig::default(),
        })
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Write `data` to a fresh temp file next to `target`.
    fn write_temp(&self, target: &Path, data: &[u8]) -> Result<PathBuf, StoreError> {
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;

        let temp = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = fs::File::create(&temp).map_err(|source| io_error(&temp, source))?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|source| io_error(&temp, source))?;
        Ok(temp)
    }

    /// Take the per-entry replace lock, or report the entry as `Modified`
    /// while another writer holds it.
    fn lock_entry(&self, name: &str, target: &Path) -> Result<EntryLock, StoreError> {
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        let path = dir.join(format!("{TEMP_PREFIX}lock-{file_name}"));

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(EntryLock { path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let stale = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > STALE_LOCK_AGE);
                if stale {
                    debug!("removing stale lock {}", path.display());
                    let _ = fs::remove_file(&path);
                }
                Err(StoreError::Modified(name.to_string()))
            }
            Err(source) => Err(io_error(&path, source)),
        }
    }

    fn file_meta(&self, name: &str, path: &Path) -> Result<Option<FileMeta>, StoreError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                let last_modified = meta
                    .modified()
                    .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                    .unwrap_or_default();
                Ok(Some(FileMeta {
                    name: name.to_string(),
                    size: meta.len(),
                    last_modified,
                }))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(path, source)),
        }
    }
}

/// Held while an entry is compared and replaced; removed on drop.
struct EntryLock {
    path: PathBuf,
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            debug!("failed to release lock {}: {err}", self.path.display());
        }
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        name: path.display().to_string(),
        source,
    }
}

impl LogStore for LocalFileSystemLogStore {
    fn list(&self, prefix: &str) -> Result<Vec<FileMeta>, StoreError> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&dir, source)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&dir, source))?;
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if file_name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let name = format!("{prefix}{file_name}");
            if let Some(meta) = self.file_meta(&name, &entry.path())? {
                files.push(meta);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn head(&self, name: &str) -> Result<Option<FileMeta>, StoreError> {
        let path = self.resolve(name)?;
        self.file_meta(name, &path)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(name)?;
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => io_error(&path, source),
        })
    }

    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<FileMeta, StoreError> {
        let target = self.resolve(name)?;
        let temp = self.write_temp(&target, data)?;

        let linked = fs::hard_link(&temp, &target);
        if let Err(err) = fs::remove_file(&temp) {
            debug!("failed to remove temp file {}: {err}", temp.display());
        }
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(name.to_string()))
            }
            Err(source) => return Err(io_error(&target, source)),
        }

        self.file_meta(name, &target)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<FileMeta, StoreError> {
        let target = self.resolve(name)?;
        let temp = self.write_temp(&target, data)?;
        fs::rename(&temp, &target).map_err(|source| io_error(&target, source))?;

        self.file_meta(name, &target)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn put_if_unchanged(
        &self,
        name: &str,
        expected: Option<&[u8]>,
        data: &[u8],
    ) -> Result<FileMeta, StoreError> {
        let target = self.resolve(name)?;
        let _lock = self.lock_entry(name, &target)?;

        let current = match fs::read(&target) {
            Ok(body) => Some(body),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(io_error(&target, source)),
        };
        if current.as_deref() != expected {
            return Err(StoreError::Modified(name.to_string()));
        }
        self.put(name, data)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => io_error(&path, source),
        })
    }

    fn config(&self) -> StoreConfig {
        self.config
    }
}
