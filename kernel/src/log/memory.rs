use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::now_millis;
use super::store::{validate_name, FileMeta, LogStore, StoreConfig, StoreError};

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Arc<[u8]>,
    last_modified: i64,
}

/// Log store held in process memory.
///
/// Clones address the same log, so a clone handed to another writer thread
/// races against the original exactly like a second process would.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    entries: Arc<RwLock<BTreeMap<String, StoredEntry>>>,
    config: StoreConfig,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Names of every stored entry, including nested ones.
    pub fn names(&self) -> Vec<String> {
        self.read_entries().keys().cloned().collect()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, BTreeMap<String, StoredEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, BTreeMap<String, StoredEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn meta(name: &str, entry: &StoredEntry) -> FileMeta {
    FileMeta {
        name: name.to_string(),
        size: entry.data.len() as u64,
        last_modified: entry.last_modified,
    }
}

impl LogStore for InMemoryLogStore {
    fn list(&self, prefix: &str) -> Result<Vec<FileMeta>, StoreError> {
        Ok(self
            .read_entries()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| !name[prefix.len()..].contains('/'))
            .map(|(name, entry)| meta(name, entry))
            .collect())
    }

    fn head(&self, name: &str) -> Result<Option<FileMeta>, StoreError> {
        Ok(self.read_entries().get(name).map(|entry| meta(name, entry)))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.read_entries()
            .get(name)
            .map(|entry| entry.data.to_vec())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<FileMeta, StoreError> {
        validate_name(name)?;
        let mut entries = self.write_entries();
        if entries.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let entry = StoredEntry {
            data: Arc::from(data),
            last_modified: now_millis(),
        };
        let file = meta(name, &entry);
        entries.insert(name.to_string(), entry);
        Ok(file)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<FileMeta, StoreError> {
        validate_name(name)?;
        let entry = StoredEntry {
            data: Arc::from(data),
            last_modified: now_millis(),
        };
        let file = meta(name, &entry);
        self.write_entries().insert(name.to_string(), entry);
        Ok(file)
    }

    fn put_if_unchanged(
        &self,
        name: &str,
        expected: Option<&[u8]>,
        data: &[u8],
    ) -> Result<FileMeta, StoreError> {
        validate_name(name)?;
        let mut entries = self.write_entries();
        let current = entries.get(name).map(|entry| &*entry.data);
        if current != expected {
            return Err(StoreError::Modified(name.to_string()));
        }
        let entry = StoredEntry {
            data: Arc::from(data),
            last_modified: now_millis(),
        };
        let file = meta(name, &entry);
        entries.insert(name.to_string(), entry);
        Ok(file)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.write_entries()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn config(&self) -> StoreConfig {
        self.config
    }
}
