//! Transactions drive one commit end to end.
//!
//! ```text
//! Building -> Submitting -> Committed
//!                        -> ConflictDetected -> Building (rebase)
//!                        -> TransientFailure -> Submitting (same commit)
//!                        -> Fatal
//! ```
//!
//! The coordinator classifies failures; the transaction owns the decision
//! to retry and bounds it with [`WriterOptions::max_commit_attempts`].
//! Once committed, a due checkpoint is written according to
//! [`WriterOptions::checkpoint_mode`]; its failure never undoes the commit.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointError;
use crate::coordinator::{CommitFailed, CommitFailureKind, UpdatedActions};
use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::log::{now_millis, Action, CommitInfo, Metadata, Protocol, Version};
use crate::state::{PropertyError, TableProperties};
use crate::table::{Snapshot, SnapshotError, Table};

mod options;

pub use options::{CheckpointMode, WriterOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Building,
    Submitting { version: Version, attempt: u32 },
    Committed { version: Version },
    ConflictDetected { version: Version },
    TransientFailure { version: Version },
    Fatal { version: Version },
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error(transparent)]
    Commit(CommitFailed),

    #[error("gave up after {attempts} commit attempts: {last}")]
    RetriesExhausted { attempts: u32, last: CommitFailed },

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("failed to read table: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("commit at version {0} does not define protocol and metadata for a new table")]
    MissingTableDefinition(Version),
}

impl TransactionError {
    /// The coordinator's classification, when the commit itself failed.
    pub fn commit_failure(&self) -> Option<&CommitFailed> {
        match self {
            Self::Commit(failure) | Self::RetriesExhausted { last: failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// What happened to the checkpoint after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCommitCheckpoint {
    NotDue,
    /// Due, but left to the caller.
    Deferred,
    Scheduled,
    Written { size: u64 },
    Failed(String),
}

#[derive(Debug)]
pub struct CommitResult {
    pub version: Version,
    /// Submissions made, including the successful one.
    pub attempts: u32,
    /// Checkpoint the commit was built on top of.
    pub last_checkpoint_version: Option<Version>,
    /// Table properties as of the new version.
    pub properties: TableProperties,
    pub checkpoint: PostCommitCheckpoint,
    background: Option<JoinHandle<Result<u64, CheckpointError>>>,
}

impl CommitResult {
    pub fn new(
        version: Version,
        attempts: u32,
        last_checkpoint_version: Option<Version>,
        properties: TableProperties,
    ) -> Self {
        Self {
            version,
            attempts,
            last_checkpoint_version,
            properties,
            checkpoint: PostCommitCheckpoint::NotDue,
            background: None,
        }
    }

    /// Block until a background checkpoint finishes.
    pub fn wait_for_checkpoint(&mut self) -> &PostCommitCheckpoint {
        if let Some(handle) = self.background.take() {
            self.checkpoint = match handle.join() {
                Ok(Ok(size)) => PostCommitCheckpoint::Written { size },
                Ok(Err(e)) => PostCommitCheckpoint::Failed(e.to_string()),
                Err(_) => PostCommitCheckpoint::Failed("checkpoint thread panicked".into()),
            };
        }
        &self.checkpoint
    }
}

struct PreparedCommit {
    actions: Vec<Action>,
    updated: UpdatedActions,
    properties: TableProperties,
}

#[derive(Debug)]
pub struct Transaction {
    table: Table,
    operation: String,
    options: WriterOptions,
    invariants: InvariantEngine,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(table: Table) -> Self {
        let options = table.options().clone();
        Self {
            table,
            operation: "WRITE".into(),
            options,
            invariants: InvariantEngine::standard(),
            state: TransactionState::Building,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_options(mut self, options: WriterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_invariants(mut self, invariants: InvariantEngine) -> Self {
        self.invariants = invariants;
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commit a fixed set of actions, rebasing them unchanged on conflict.
    pub fn commit(&mut self, actions: Vec<Action>) -> Result<CommitResult, TransactionError> {
        self.commit_with(|_| actions.clone())
    }

    /// Commit the actions produced by `build`. `build` sees the snapshot the
    /// commit is based on (`None` for a new table) and is called again after
    /// every rebaseable conflict.
    pub fn commit_with<F>(&mut self, mut build: F) -> Result<CommitResult, TransactionError>
    where
        F: FnMut(Option<&Snapshot>) -> Vec<Action>,
    {
        let max_attempts = self.options.max_commit_attempts.max(1);
        let mut attempts = 0;

        let (version, last_checkpoint_version, properties) = 'rebase: loop {
            self.state = TransactionState::Building;
            let snapshot = self.read_snapshot()?;
            let version = snapshot.as_ref().map_or(0, |s| s.version() + 1);

            let actions = build(snapshot.as_ref());
            let prepared = self
                .invariants
                .evaluate(snapshot.as_ref().map(Snapshot::state), version, &actions)
                .map_err(TransactionError::from)
                .and_then(|()| prepare(snapshot.as_ref(), version, &self.operation, actions));
            let prepared = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.state = TransactionState::Fatal { version };
                    return Err(e);
                }
            };

            loop {
                attempts += 1;
                self.state = TransactionState::Submitting {
                    version,
                    attempt: attempts,
                };
                let submitted = self.table.committer().commit(
                    self.table.store().as_ref(),
                    version,
                    &prepared.actions,
                    &prepared.updated,
                );
                let failure = match submitted {
                    Ok(_) => {
                        break 'rebase (
                            version,
                            snapshot.as_ref().and_then(Snapshot::checkpoint_version),
                            prepared.properties,
                        )
                    }
                    Err(failure) => failure,
                };

                let rebase = match failure.kind() {
                    CommitFailureKind::Transient => {
                        self.state = TransactionState::TransientFailure { version };
                        false
                    }
                    CommitFailureKind::RebaseableConflict => {
                        self.state = TransactionState::ConflictDetected { version };
                        true
                    }
                    CommitFailureKind::Fatal | CommitFailureKind::PermanentConflict => {
                        self.state = TransactionState::Fatal { version };
                        warn!(version, "commit failed: {failure}");
                        return Err(TransactionError::Commit(failure));
                    }
                };

                if attempts >= max_attempts {
                    self.state = TransactionState::Fatal { version };
                    warn!(version, attempts, "giving up: {failure}");
                    return Err(TransactionError::RetriesExhausted {
                        attempts,
                        last: failure,
                    });
                }
                warn!(version, attempt = attempts, rebase, "retrying commit: {failure}");
                thread::sleep(Duration::from_millis(
                    self.options.retry_backoff_ms * u64::from(attempts),
                ));
                if rebase {
                    continue 'rebase;
                }
            }
        };

        self.state = TransactionState::Committed { version };
        info!(version, attempts, log_path = self.table.log_path(), "committed");

        let mut result = CommitResult::new(version, attempts, last_checkpoint_version, properties);
        self.checkpoint_if_due(&mut result);
        Ok(result)
    }

    fn read_snapshot(&mut self) -> Result<Option<Snapshot>, TransactionError> {
        match self.table.snapshot(None) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if e.is_empty_table() => Ok(None),
            Err(e) => {
                self.state = TransactionState::Fatal { version: 0 };
                Err(e.into())
            }
        }
    }

    fn checkpoint_if_due(&self, result: &mut CommitResult) {
        let manager = self.table.checkpoint_manager();
        if !manager.is_ready_for_checkpoint(result) {
            return;
        }

        let version = result.version;
        result.checkpoint = match self.options.checkpoint_mode {
            CheckpointMode::Skip => PostCommitCheckpoint::Deferred,
            CheckpointMode::Inline => match manager.write_checkpoint(version) {
                Ok(size) => PostCommitCheckpoint::Written { size },
                Err(e) => {
                    warn!(version, "post-commit checkpoint failed: {e}");
                    PostCommitCheckpoint::Failed(e.to_string())
                }
            },
            CheckpointMode::Background => {
                let manager = manager.clone();
                result.background = Some(thread::spawn(move || {
                    let written = manager.write_checkpoint(version);
                    if let Err(e) = &written {
                        warn!(version, "background checkpoint failed: {e}");
                    }
                    written
                }));
                PostCommitCheckpoint::Scheduled
            }
        };
    }
}

/// Attach commit info and work out the metadata/protocol the commit leaves
/// the table with.
fn prepare(
    snapshot: Option<&Snapshot>,
    version: Version,
    operation: &str,
    actions: Vec<Action>,
) -> Result<PreparedCommit, TransactionError> {
    let old_metadata = snapshot.and_then(Snapshot::metadata).cloned();
    let old_protocol = snapshot.and_then(Snapshot::protocol).cloned();

    let mut new_metadata: Option<Metadata> = None;
    let mut new_protocol: Option<Protocol> = None;
    for action in &actions {
        match action {
            Action::Metadata(m) => new_metadata = Some(m.clone()),
            Action::Protocol(p) => new_protocol = Some(p.clone()),
            _ => {}
        }
    }
    let (Some(new_metadata), Some(new_protocol)) = (
        new_metadata.or_else(|| old_metadata.clone()),
        new_protocol.or_else(|| old_protocol.clone()),
    ) else {
        return Err(TransactionError::MissingTableDefinition(version));
    };
    let properties = TableProperties::from_configuration(&new_metadata.configuration)?;

    let timestamp = now_millis();
    let in_commit_timestamp = properties.in_commit_timestamps.then(|| {
        match snapshot.and_then(Snapshot::in_commit_timestamp) {
            Some(previous) => timestamp.max(previous + 1),
            None => timestamp,
        }
    });
    let commit_info = CommitInfo {
        timestamp: Some(timestamp),
        in_commit_timestamp,
        operation: Some(operation.to_string()),
        txn_id: Some(Uuid::new_v4().to_string()),
    };

    let actions = std::iter::once(Action::CommitInfo(commit_info.clone()))
        .chain(
            actions
                .into_iter()
                .filter(|a| !matches!(a, Action::CommitInfo(_))),
        )
        .collect();

    Ok(PreparedCommit {
        actions,
        updated: UpdatedActions {
            commit_info,
            new_metadata,
            new_protocol,
            old_metadata,
            old_protocol,
        },
        properties,
    })
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::coordinator::{
        BackfillError, CommitCoordinatorClient, CommitResponse, CoordinatorError,
        GetCommitsResponse, InMemoryCommitCoordinator, TableConf,
    };
    use crate::log::{Add, InMemoryLogStore, LogStore, Remove};
    use crate::state::properties::{CHECKPOINT_INTERVAL_KEY, IN_COMMIT_TIMESTAMPS_KEY};

    fn new_table(metadata: Metadata) -> Table {
        Table::create(
            Arc::new(InMemoryLogStore::new()),
            "memory://t/_delta_log",
            Protocol::default(),
            metadata,
            None,
        )
        .unwrap()
    }

    fn add(path: &str) -> Vec<Action> {
        vec![Action::Add(Add::new(path, 1))]
    }

    #[test]
    fn sequential_commits_take_consecutive_versions() {
        let table = new_table(Metadata::new("{}"));

        for expected in 1..=4 {
            let mut txn = table.transaction();
            let result = txn.commit(add(&format!("f{expected}"))).unwrap();
            assert_eq!(result.version, expected);
            assert_eq!(result.attempts, 1);
            assert_eq!(txn.state(), TransactionState::Committed { version: expected });
        }
        assert_eq!(table.snapshot(None).unwrap().state().file_count(), 4);
    }

    #[test]
    fn conflict_rebuilds_against_the_winner() {
        let table = new_table(Metadata::new("{}"));
        let other = table.clone();

        let mut calls = 0;
        let result = table
            .transaction()
            .commit_with(|snapshot| {
                calls += 1;
                if calls == 1 {
                    // a concurrent writer takes version 1 after we read version 0
                    assert_eq!(snapshot.unwrap().version(), 0);
                    other.transaction().commit(add("theirs")).unwrap();
                }
                add(&format!("ours-{calls}"))
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(result.version, 2);
        assert_eq!(result.attempts, 2);
        let snapshot = table.snapshot(None).unwrap();
        assert!(snapshot.state().contains_file("theirs"));
        assert!(snapshot.state().contains_file("ours-2"));
    }

    #[test]
    fn invariant_violation_aborts_before_submission() {
        let table = new_table(Metadata::new("{}"));
        let mut txn = table.transaction();

        let err = txn.commit(vec![Action::Remove(Remove::new("ghost"))]).unwrap_err();

        assert!(matches!(err, TransactionError::Invariant(_)));
        assert_eq!(txn.state(), TransactionState::Fatal { version: 1 });
        assert_eq!(table.latest_version().unwrap(), 0);
    }

    #[test]
    fn in_commit_timestamps_increase_strictly() {
        let table = new_table(Metadata::new("{}").with_configuration(IN_COMMIT_TIMESTAMPS_KEY, "true"));

        let mut previous = table.snapshot(None).unwrap().in_commit_timestamp().unwrap();
        for i in 0..5 {
            table.transaction().commit(add(&i.to_string())).unwrap();
            let current = table.snapshot(None).unwrap().in_commit_timestamp().unwrap();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn due_checkpoint_is_written_inline_or_deferred() {
        let metadata = Metadata::new("{}").with_configuration(CHECKPOINT_INTERVAL_KEY, "2");
        let table = new_table(metadata);

        let result = table.transaction().commit(add("a")).unwrap();
        assert_eq!(result.version, 1);
        assert_eq!(result.checkpoint, PostCommitCheckpoint::Written { size: 3 });

        let skip = WriterOptions {
            checkpoint_mode: CheckpointMode::Skip,
            ..Default::default()
        };
        let result = table.transaction().with_options(skip.clone()).commit(add("b")).unwrap();
        assert_eq!(result.last_checkpoint_version, Some(1));
        assert_eq!(result.checkpoint, PostCommitCheckpoint::NotDue);

        let result = table.transaction().with_options(skip).commit(add("c")).unwrap();
        assert_eq!(result.checkpoint, PostCommitCheckpoint::Deferred);
    }

    #[test]
    fn background_checkpoint_can_be_awaited() {
        let metadata = Metadata::new("{}").with_configuration(CHECKPOINT_INTERVAL_KEY, "1");
        let table = new_table(metadata);
        let options = WriterOptions {
            checkpoint_mode: CheckpointMode::Background,
            ..Default::default()
        };

        let mut result = table.transaction().with_options(options).commit(add("a")).unwrap();
        assert_eq!(result.checkpoint, PostCommitCheckpoint::Scheduled);
        assert_eq!(
            result.wait_for_checkpoint(),
            &PostCommitCheckpoint::Written { size: 3 }
        );
        let pointer = table.checkpoint_manager().read_last_checkpoint().unwrap().unwrap();
        assert_eq!(pointer.version, 1);
    }

    /// Delegates to an in-memory service but fails the first `failures`
    /// commits with a fixed classification.
    #[derive(Debug)]
    struct Flaky {
        inner: InMemoryCommitCoordinator,
        kind: CommitFailureKind,
        failures: AtomicU32,
    }

    impl CommitCoordinatorClient for Flaky {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn register_table(
            &self,
            log_path: &str,
            current_version: Option<Version>,
            metadata: &Metadata,
            protocol: &Protocol,
        ) -> Result<TableConf, CoordinatorError> {
            self.inner.register_table(log_path, current_version, metadata, protocol)
        }

        fn commit(
            &self,
            store: &dyn LogStore,
            log_path: &str,
            conf: &TableConf,
            version: Version,
            actions: &[Action],
            updated: &UpdatedActions,
        ) -> Result<CommitResponse, CommitFailed> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(CommitFailed::new(self.kind, "injected"));
            }
            self.inner.commit(store, log_path, conf, version, actions, updated)
        }

        fn get_commits(
            &self,
            log_path: &str,
            conf: &TableConf,
            start: Option<Version>,
            end: Option<Version>,
        ) -> Result<GetCommitsResponse, CoordinatorError> {
            self.inner.get_commits(log_path, conf, start, end)
        }

        fn backfill_to_version(
            &self,
            store: &dyn LogStore,
            log_path: &str,
            conf: &TableConf,
            version: Version,
            hint: Option<Version>,
        ) -> Result<(), BackfillError> {
            self.inner.backfill_to_version(store, log_path, conf, version, hint)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn flaky_table(kind: CommitFailureKind, failures: u32) -> Table {
        let client = Arc::new(Flaky {
            inner: InMemoryCommitCoordinator::new(100),
            kind,
            failures: AtomicU32::new(failures),
        });
        Table::create(
            Arc::new(InMemoryLogStore::new()),
            "memory://flaky/_delta_log",
            Protocol::default(),
            Metadata::new("{}"),
            Some(client),
        )
        .unwrap()
        .with_options(WriterOptions {
            retry_backoff_ms: 0,
            max_commit_attempts: 3,
            ..Default::default()
        })
    }

    #[test]
    fn transient_failure_resubmits_same_version() {
        let table = flaky_table(CommitFailureKind::Transient, 2);
        let mut calls = 0;

        let result = table
            .transaction()
            .commit_with(|_| {
                calls += 1;
                add("a")
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(result.version, 1);
        assert_eq!(result.attempts, 3);
    }

    #[test]
    fn terminal_failures_keep_their_classification() {
        for kind in [CommitFailureKind::Fatal, CommitFailureKind::PermanentConflict] {
            let table = flaky_table(kind, 1);
            let mut txn = table.transaction();

            let err = txn.commit(add("a")).unwrap_err();

            assert_eq!(err.commit_failure().unwrap().kind(), kind);
            assert_eq!(txn.state(), TransactionState::Fatal { version: 1 });
        }
    }

    #[test]
    fn retry_budget_is_bounded() {
        let table = flaky_table(CommitFailureKind::Transient, 10);

        let err = table.transaction().commit(add("a")).unwrap_err();

        assert!(matches!(err, TransactionError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.commit_failure().unwrap().retryable());
    }
}
