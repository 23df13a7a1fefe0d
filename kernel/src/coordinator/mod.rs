// Commit Coordination
//
// Protocol between writers and the service that arbitrates commit order
// for coordinated-commit tables. A coordinator ratifies each version
// exactly once, tracks ratified-but-unbackfilled commits, and copies them
// to their published names on request.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::log::{Action, CommitInfo, FileMeta, LogStore, Metadata, Protocol, StoreError, Version};

mod committer;
mod in_memory;

pub use committer::{CoordinatedCommitter, Committer, FileSystemCommitter};
pub use in_memory::InMemoryCommitCoordinator;

/// Opaque configuration issued by a coordinator when a table registers.
///
/// Writers never build one themselves: they receive it from
/// [`CommitCoordinatorClient::register_table`] (or from the table metadata
/// it was persisted into) and hand it back unmodified on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableConf(Arc<BTreeMap<String, String>>);

impl TableConf {
    /// Issue a configuration. Intended for coordinator implementations.
    pub fn issued(entries: BTreeMap<String, String>) -> Self {
        Self(Arc::new(entries))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Form stored in table metadata.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self.0.as_ref())
    }

    /// Restore a configuration previously written by [`TableConf::to_json`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json).map(Self::issued)
    }
}

/// How a commit failed, as decided by the coordinator.
///
/// | variant              | retryable | conflict | caller action                    |
/// |----------------------|-----------|----------|----------------------------------|
/// | `Fatal`              | no        | no       | abort                            |
/// | `PermanentConflict`  | no        | yes      | abort                            |
/// | `Transient`          | yes       | no       | resubmit the same commit         |
/// | `RebaseableConflict` | yes       | yes      | rebuild against new state, retry |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitFailureKind {
    Fatal,
    PermanentConflict,
    Transient,
    RebaseableConflict,
}

impl CommitFailureKind {
    pub fn from_flags(retryable: bool, conflict: bool) -> Self {
        match (retryable, conflict) {
            (false, false) => Self::Fatal,
            (false, true) => Self::PermanentConflict,
            (true, false) => Self::Transient,
            (true, true) => Self::RebaseableConflict,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RebaseableConflict)
    }

    pub fn conflict(self) -> bool {
        matches!(self, Self::PermanentConflict | Self::RebaseableConflict)
    }
}

impl fmt::Display for CommitFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fatal => "fatal",
            Self::PermanentConflict => "permanent conflict",
            Self::Transient => "transient",
            Self::RebaseableConflict => "rebaseable conflict",
        })
    }
}

/// Error returned by a commit attempt. Always classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("commit failed ({kind}): {message}")]
pub struct CommitFailed {
    pub kind: CommitFailureKind,
    pub message: String,
}

impl CommitFailed {
    pub fn new(kind: CommitFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(CommitFailureKind::Fatal, message)
    }

    pub fn permanent_conflict(message: impl Into<String>) -> Self {
        Self::new(CommitFailureKind::PermanentConflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(CommitFailureKind::Transient, message)
    }

    pub fn rebaseable_conflict(message: impl Into<String>) -> Self {
        Self::new(CommitFailureKind::RebaseableConflict, message)
    }

    pub fn kind(&self) -> CommitFailureKind {
        self.kind
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn conflict(&self) -> bool {
        self.kind.conflict()
    }
}

/// Storage hiccups while committing are worth retrying unchanged.
impl From<StoreError> for CommitFailed {
    fn from(err: StoreError) -> Self {
        Self::transient(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("table {0} is already registered with the commit coordinator")]
    AlreadyRegistered(String),

    #[error("table {0} is not registered with the commit coordinator")]
    UnknownTable(String),

    #[error("table configuration for {0} does not match the one issued at registration")]
    ConfMismatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Backfill only ever fails on I/O; it is idempotent and safe to retry.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("backfill failed: {0}")]
    Io(#[from] StoreError),
}

/// One ratified version of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub version: Version,
    /// Where the payload lives: the staged entry while unbackfilled, the
    /// published entry afterwards.
    pub file: FileMeta,
    pub commit_timestamp: i64,
    pub backfilled: bool,
}

/// Result of a successful commit. `commit` is `None` when the entry was
/// backfilled right away and is discoverable by its published name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResponse {
    pub commit: Option<Commit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCommitsResponse {
    /// Contiguous and ascending. The first version may be above the
    /// requested start when earlier versions are already backfilled.
    pub commits: Vec<Commit>,
    /// Highest ratified version, `None` if the coordinator never ratified
    /// an unbackfilled commit for this table.
    pub latest_table_version: Option<Version>,
}

/// Metadata/protocol delta and provenance of a commit, for the
/// coordinator's own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedActions {
    pub commit_info: CommitInfo,
    pub new_metadata: Metadata,
    pub new_protocol: Protocol,
    pub old_metadata: Option<Metadata>,
    pub old_protocol: Option<Protocol>,
}

/// Client side of a commit coordination service.
pub trait CommitCoordinatorClient: Send + Sync + fmt::Debug {
    /// Name recorded in table metadata to find the coordinator again.
    fn name(&self) -> &str;

    /// Convert the table at `log_path` into a coordinated-commit table.
    ///
    /// `current_version` is the last version committed before conversion,
    /// `None` for a brand-new table. The conversion commit at
    /// `current_version + 1` must be written by the caller directly as a
    /// published entry; the first coordinated commit follows it.
    fn register_table(
        &self,
        log_path: &str,
        current_version: Option<Version>,
        current_metadata: &Metadata,
        current_protocol: &Protocol,
    ) -> Result<TableConf, CoordinatorError>;

    /// Ratify `actions` as `commit_version`. A successful return is durable.
    fn commit(
        &self,
        store: &dyn LogStore,
        log_path: &str,
        table_conf: &TableConf,
        commit_version: Version,
        actions: &[Action],
        updated_actions: &UpdatedActions,
    ) -> Result<CommitResponse, CommitFailed>;

    /// Unbackfilled commits within `[start_version, end_version]`.
    fn get_commits(
        &self,
        log_path: &str,
        table_conf: &TableConf,
        start_version: Option<Version>,
        end_version: Option<Version>,
    ) -> Result<GetCommitsResponse, CoordinatorError>;

    /// Make every commit up to and including `version` a published entry.
    ///
    /// `last_known_backfilled_version` is a hint only; an absent or stale
    /// value costs extra work, never correctness.
    fn backfill_to_version(
        &self,
        store: &dyn LogStore,
        log_path: &str,
        table_conf: &TableConf,
        version: Version,
        last_known_backfilled_version: Option<Version>,
    ) -> Result<(), BackfillError>;

    /// Whether `other` can be used in place of `self` for every call.
    /// Defaults to instance identity.
    fn semantic_equals(&self, other: &dyn CommitCoordinatorClient) -> bool {
        std::ptr::addr_eq(
            self.as_any() as *const dyn Any,
            other.as_any() as *const dyn Any,
        )
    }

    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_every_flag_pair_once() {
        let kinds: Vec<_> = [(false, false), (false, true), (true, false), (true, true)]
            .into_iter()
            .map(|(retryable, conflict)| {
                let kind = CommitFailureKind::from_flags(retryable, conflict);
                assert_eq!(kind.retryable(), retryable);
                assert_eq!(kind.conflict(), conflict);
                kind
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                CommitFailureKind::Fatal,
                CommitFailureKind::PermanentConflict,
                CommitFailureKind::Transient,
                CommitFailureKind::RebaseableConflict,
            ]
        );
    }

    #[test]
    fn store_errors_become_transient_failures() {
        let failure = CommitFailed::from(StoreError::NotFound("x".into()));
        assert_eq!(failure.kind(), CommitFailureKind::Transient);
        assert!(failure.to_string().contains("transient"));
    }

    #[test]
    fn table_conf_survives_metadata_round_trip() {
        let conf = TableConf::issued(BTreeMap::from([("tableId".to_string(), "t-1".to_string())]));
        let restored = TableConf::from_json(&conf.to_json().unwrap()).unwrap();

        assert_eq!(restored, conf);
        assert_eq!(restored.get("tableId"), Some("t-1"));
    }

    #[derive(Debug)]
    struct Opaque(u8);

    impl CommitCoordinatorClient for Opaque {
        fn name(&self) -> &str {
            "opaque"
        }

        fn register_table(
            &self,
            log_path: &str,
            _: Option<Version>,
            _: &Metadata,
            _: &Protocol,
        ) -> Result<TableConf, CoordinatorError> {
            Err(CoordinatorError::UnknownTable(log_path.into()))
        }

        fn commit(
            &self,
            _: &dyn LogStore,
            _: &str,
            _: &TableConf,
            _: Version,
            _: &[Action],
            _: &UpdatedActions,
        ) -> Result<CommitResponse, CommitFailed> {
            Err(CommitFailed::fatal("unsupported"))
        }

        fn get_commits(
            &self,
            _: &str,
            _: &TableConf,
            _: Option<Version>,
            _: Option<Version>,
        ) -> Result<GetCommitsResponse, CoordinatorError> {
            Ok(GetCommitsResponse {
                commits: vec![],
                latest_table_version: None,
            })
        }

        fn backfill_to_version(
            &self,
            _: &dyn LogStore,
            _: &str,
            _: &TableConf,
            _: Version,
            _: Option<Version>,
        ) -> Result<(), BackfillError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn default_semantic_equality_is_identity() {
        let a = Opaque(1);
        let b = Opaque(1);

        assert!(a.semantic_equals(&a));
        assert!(!a.semantic_equals(&b));
    }
}
