// Log Entry Storage Abstraction
//
// Defines the durability contract for log entries. A store is rooted at
// one table's log directory and addresses entries by relative name.
// Implementations may persist to disk, object storage, databases, etc.

use serde::{Deserialize, Serialize};

/// Listing/status information about one stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Name relative to the log directory.
    pub name: String,
    pub size: u64,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
}

/// Batch sizing hints. These tune throughput only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of entries fetched per `read_batch` call during replay.
    pub read_batch_size: usize,
    /// Number of actions serialized per chunk when writing checkpoints.
    pub write_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_batch_size: 32,
            write_batch_size: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("log entry not found: {0}")]
    NotFound(String),

    #[error("log entry already exists: {0}")]
    AlreadyExists(String),

    #[error("log entry changed concurrently: {0}")]
    Modified(String),

    #[error("invalid log entry name: {0}")]
    InvalidName(String),

    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Storage backend for log entries.
///
/// Properties required from implementations:
/// - `put_if_absent` is atomic: exactly one of several racing writers wins
/// - `put` replaces the entry atomically; readers see old or new content
/// - `put_if_unchanged` compares and replaces as one step
/// - `list` is sorted by name
///
/// Implementations MUST NOT:
/// - Expose partially written entries
/// - Mutate an entry created by `put_if_absent`
pub trait LogStore: Send + Sync + std::fmt::Debug {
    /// Entries directly inside the directory named by `prefix`
    /// (`""` for the log directory itself, `"_commits/"` for staged commits).
    fn list(&self, prefix: &str) -> Result<Vec<FileMeta>, StoreError>;

    /// Status of a single entry, `None` if absent.
    fn head(&self, name: &str) -> Result<Option<FileMeta>, StoreError>;

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Create `name`, failing with `AlreadyExists` if it is taken.
    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<FileMeta, StoreError>;

    /// Create or atomically replace `name`.
    fn put(&self, name: &str, data: &[u8]) -> Result<FileMeta, StoreError>;

    /// Replace `name` only while its content is still `expected` (`None`:
    /// still absent). Fails with `Modified` otherwise.
    fn put_if_unchanged(
        &self,
        name: &str,
        expected: Option<&[u8]>,
        data: &[u8],
    ) -> Result<FileMeta, StoreError>;

    fn delete(&self, name: &str) -> Result<(), StoreError>;

    fn config(&self) -> StoreConfig {
        StoreConfig::default()
    }

    /// Read several entries, preserving order.
    fn read_batch(&self, names: &[String]) -> Result<Vec<Vec<u8>>, StoreError> {
        names.iter().map(|name| self.read(name)).collect()
    }
}

/// Reject names that could escape the log directory.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_stay_inside_log_directory() {
        validate_name("00000000000000000000.json").unwrap();
        validate_name("_commits/00000000000000000000.x.json").unwrap();

        for name in ["", "/abs", "../up", "a//b", "dir/", "a/./b"] {
            assert!(
                matches!(validate_name(name), Err(StoreError::InvalidName(_))),
                "{name}"
            );
        }
    }
}
