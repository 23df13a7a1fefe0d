//! A table is a log location, a store and the committer that orders its
//! commits.
//!
//! Reads go through [`Table::snapshot`], writes through
//! [`Table::transaction`]. Tables created with a coordinator client, or
//! converted later, commit through that coordinator; all others commit by
//! creating published entries directly.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointManager, CheckpointMetadata};
use crate::coordinator::{
    BackfillError, CommitCoordinatorClient, CoordinatedCommitter, Committer, CoordinatorError,
    FileSystemCommitter,
};
use crate::log::path::delta_file_name;
use crate::log::{
    decode_actions, encode_actions, now_millis, Action, CommitInfo, LogError, LogFileKind,
    LogStore, Metadata, ParsedLogName, Protocol, StoreError, Version,
};
use crate::replay::{replay_segment, ReplayError};
use crate::segment::{resolve, LogSegment, SegmentError};
use crate::state::properties::{COORDINATOR_CONF_KEY, COORDINATOR_NAME_KEY};
use crate::state::{PropertyError, TableProperties, TableState};
use crate::transaction::{Transaction, WriterOptions};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Property(#[from] PropertyError),
}

impl SnapshotError {
    pub fn is_empty_table(&self) -> bool {
        matches!(self, Self::Segment(SegmentError::EmptyLog))
    }

    /// See [`SegmentError::is_version_unavailable`].
    pub fn is_version_unavailable(&self) -> bool {
        self.unavailable_version().is_some()
    }

    pub fn unavailable_version(&self) -> Option<Version> {
        match self {
            Self::Segment(e) => e.unavailable_version(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("a table already exists at {0}")]
    AlreadyExists(String),

    #[error("table at {0} already commits through a coordinator")]
    AlreadyCoordinated(String),

    #[error("table is managed by commit coordinator `{0}` but no matching client was supplied")]
    MissingCoordinator(String),

    #[error("version {0} was committed concurrently with the conversion")]
    ConversionConflict(Version),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Backfill(#[from] BackfillError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Table state at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    segment: LogSegment,
    state: TableState,
    properties: TableProperties,
    in_commit_timestamp: Option<i64>,
}

impl Snapshot {
    pub fn version(&self) -> Version {
        self.segment.end_version
    }

    pub fn state(&self) -> &TableState {
        &self.state
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.state.protocol()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.state.metadata()
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn segment(&self) -> &LogSegment {
        &self.segment
    }

    pub fn checkpoint_version(&self) -> Option<Version> {
        self.segment.checkpoint_version
    }

    /// `inCommitTimestamp` of the commit that produced this version.
    pub fn in_commit_timestamp(&self) -> Option<i64> {
        self.in_commit_timestamp
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    log_path: String,
    store: Arc<dyn LogStore>,
    committer: Committer,
    checkpoints: CheckpointManager,
    options: WriterOptions,
}

impl Table {
    fn new(log_path: String, store: Arc<dyn LogStore>, committer: Committer) -> Self {
        let checkpoints = CheckpointManager::new(store.clone(), committer.clone());
        Self {
            log_path,
            store,
            committer,
            checkpoints,
            options: WriterOptions::default(),
        }
    }

    /// Create a table by writing version 0. With a coordinator, the table
    /// is registered first and commits through it from version 1 on.
    pub fn create(
        store: Arc<dyn LogStore>,
        log_path: impl Into<String>,
        protocol: Protocol,
        mut metadata: Metadata,
        coordinator: Option<Arc<dyn CommitCoordinatorClient>>,
    ) -> Result<Self, TableError> {
        let log_path = log_path.into();
        let properties = TableProperties::from_configuration(&metadata.configuration)?;
        if store.head(&delta_file_name(0))?.is_some() {
            return Err(TableError::AlreadyExists(log_path));
        }

        let committer = match coordinator {
            Some(client) => {
                let conf = client.register_table(&log_path, None, &metadata, &protocol)?;
                metadata
                    .configuration
                    .insert(COORDINATOR_NAME_KEY.to_string(), client.name().to_string());
                metadata.configuration.insert(
                    COORDINATOR_CONF_KEY.to_string(),
                    conf.to_json().map_err(LogError::from)?,
                );
                Committer::Coordinated(CoordinatedCommitter::new(client, conf, log_path.clone()))
            }
            None => Committer::FileSystem(FileSystemCommitter),
        };

        let actions = [
            Action::CommitInfo(commit_info("CREATE TABLE", &properties)),
            Action::Protocol(protocol),
            Action::Metadata(metadata),
        ];
        match write_published(store.as_ref(), 0, &actions) {
            Err(TableError::Store(StoreError::AlreadyExists(_))) => {
                return Err(TableError::AlreadyExists(log_path))
            }
            other => other?,
        }

        info!(
            log_path = %log_path,
            coordinated = committer.is_coordinated(),
            "created table"
        );
        Ok(Self::new(log_path, store, committer))
    }

    /// Open an existing table. A coordinated table needs a client whose
    /// name matches the one recorded in its metadata.
    pub fn open(
        store: Arc<dyn LogStore>,
        log_path: impl Into<String>,
        coordinator: Option<Arc<dyn CommitCoordinatorClient>>,
    ) -> Result<Self, TableError> {
        let log_path = log_path.into();
        let published = Self::new(
            log_path.clone(),
            store.clone(),
            Committer::FileSystem(FileSystemCommitter),
        );
        let properties = published.snapshot(None)?.properties;

        let committer = match (properties.coordinator_name.as_deref(), coordinator) {
            (None, _) => Committer::FileSystem(FileSystemCommitter),
            (Some(name), Some(client)) if client.name() == name => {
                let conf = properties
                    .table_conf()?
                    .ok_or_else(|| PropertyError::InvalidValue {
                        key: COORDINATOR_CONF_KEY.to_string(),
                        value: String::new(),
                    })?;
                Committer::Coordinated(CoordinatedCommitter::new(client, conf, log_path.clone()))
            }
            (Some(name), _) => return Err(TableError::MissingCoordinator(name.to_string())),
        };

        debug!(log_path = %log_path, coordinated = committer.is_coordinated(), "opened table");
        Ok(Self::new(log_path, store, committer))
    }

    /// Register this filesystem table with `client` at its latest version
    /// and record the issued configuration in the next version. The
    /// returned table commits through the coordinator.
    pub fn convert_to_coordinated(
        &self,
        client: Arc<dyn CommitCoordinatorClient>,
    ) -> Result<Table, TableError> {
        if self.committer.is_coordinated() {
            return Err(TableError::AlreadyCoordinated(self.log_path.clone()));
        }

        let snapshot = self.snapshot(None)?;
        let version = snapshot.version();
        let (Some(protocol), Some(metadata)) = (snapshot.protocol(), snapshot.metadata()) else {
            return Err(SnapshotError::from(ReplayError::MissingTableDefinition(version)).into());
        };
        let pivot = version + 1;
        if self.store.head(&delta_file_name(pivot))?.is_some() {
            return Err(TableError::ConversionConflict(pivot));
        }

        let conf = client.register_table(&self.log_path, Some(version), metadata, protocol)?;
        let mut metadata = metadata.clone();
        metadata
            .configuration
            .insert(COORDINATOR_NAME_KEY.to_string(), client.name().to_string());
        metadata.configuration.insert(
            COORDINATOR_CONF_KEY.to_string(),
            conf.to_json().map_err(LogError::from)?,
        );

        let actions = [
            Action::CommitInfo(commit_info("CONVERT TO COORDINATED", snapshot.properties())),
            Action::Metadata(metadata),
        ];
        match write_published(self.store.as_ref(), pivot, &actions) {
            Err(TableError::Store(StoreError::AlreadyExists(_))) => {
                return Err(TableError::ConversionConflict(pivot))
            }
            other => other?,
        }

        info!(log_path = %self.log_path, version = pivot, "converted table to coordinated commits");
        let committer =
            Committer::Coordinated(CoordinatedCommitter::new(client, conf, self.log_path.clone()));
        Ok(Self::new(self.log_path.clone(), self.store.clone(), committer)
            .with_options(self.options.clone()))
    }

    pub fn with_options(mut self, options: WriterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn log_path(&self) -> &str {
        &self.log_path
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn committer(&self) -> &Committer {
        &self.committer
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// Read the table at `version`, or at its latest version.
    pub fn snapshot(&self, version: Option<Version>) -> Result<Snapshot, SnapshotError> {
        let segment = resolve(self.store.as_ref(), &self.committer, version)?;
        let replayed = replay_segment(self.store.as_ref(), &segment)?;
        let properties = match replayed.state.metadata() {
            Some(metadata) => TableProperties::from_configuration(&metadata.configuration)?,
            None => TableProperties::default(),
        };

        let in_commit_timestamp = match replayed.in_commit_timestamp {
            Some(ts) => Some(ts),
            None if properties.in_commit_timestamps && segment.commits.is_empty() => {
                self.published_in_commit_timestamp(replayed.version)
            }
            None => None,
        };

        Ok(Snapshot {
            segment,
            state: replayed.state,
            properties,
            in_commit_timestamp,
        })
    }

    pub fn latest_version(&self) -> Result<Version, SnapshotError> {
        Ok(resolve(self.store.as_ref(), &self.committer, None)?.end_version)
    }

    /// Write a checkpoint at `version` and move the pointer to it.
    pub fn checkpoint(&self, version: Version) -> Result<CheckpointMetadata, TableError> {
        let size = self.checkpoints.write_checkpoint(version)?;
        Ok(CheckpointMetadata { version, size })
    }

    /// Publish every ratified commit. Returns the latest version.
    pub fn backfill(&self) -> Result<Version, TableError> {
        let latest = self.latest_version()?;
        let hint = self
            .checkpoints
            .read_last_checkpoint()
            .ok()
            .flatten()
            .map(|p| p.version);
        self.committer
            .backfill_to_version(self.store.as_ref(), latest, hint)?;
        Ok(latest)
    }

    /// Delete log entries no longer needed to read any version from the
    /// newest checkpoint at or below `until` onwards: commits before that
    /// checkpoint and older checkpoints. Returns the number deleted.
    pub fn cleanup_expired_logs(&self, until: Version) -> Result<usize, TableError> {
        let files = self.store.list("")?;
        let parsed: Vec<(String, ParsedLogName)> = files
            .into_iter()
            .filter_map(|f| ParsedLogName::parse(&f.name).map(|p| (f.name, p)))
            .collect();

        let Some(retained) = parsed
            .iter()
            .filter(|(_, p)| p.kind == LogFileKind::Checkpoint && p.version <= until)
            .map(|(_, p)| p.version)
            .max()
        else {
            debug!(until, "no checkpoint to clean up to");
            return Ok(0);
        };

        let mut removed = 0;
        for (name, p) in &parsed {
            let expired = match p.kind {
                LogFileKind::Delta | LogFileKind::Checkpoint => p.version < retained,
                LogFileKind::StagedCommit => false,
            };
            if !expired {
                continue;
            }
            match self.store.delete(name) {
                Ok(()) => removed += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(log_path = %self.log_path, retained, removed, "cleaned up expired log entries");
        Ok(removed)
    }

    /// Timestamp from the published entry of a version that was read from
    /// a checkpoint.
    fn published_in_commit_timestamp(&self, version: Version) -> Option<i64> {
        let body = match self.store.read(&delta_file_name(version)) {
            Ok(body) => body,
            Err(e) => {
                debug!(version, "no commit to read in-commit timestamp from: {e}");
                return None;
            }
        };
        match decode_actions(&body) {
            Ok(actions) => actions.into_iter().find_map(|a| match a {
                Action::CommitInfo(info) => info.in_commit_timestamp,
                _ => None,
            }),
            Err(e) => {
                warn!(version, "unreadable commit: {e}");
                None
            }
        }
    }
}

fn commit_info(operation: &str, properties: &TableProperties) -> CommitInfo {
    let timestamp = now_millis();
    CommitInfo {
        timestamp: Some(timestamp),
        in_commit_timestamp: properties.in_commit_timestamps.then_some(timestamp),
        operation: Some(operation.to_string()),
        txn_id: None,
    }
}

fn write_published(
    store: &dyn LogStore,
    version: Version,
    actions: &[Action],
) -> Result<(), TableError> {
    store.put_if_absent(&delta_file_name(version), &encode_actions(actions)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCommitCoordinator;
    use crate::log::{Add, InMemoryLogStore};
    use crate::state::properties::CHECKPOINT_INTERVAL_KEY;

    const LOG: &str = "memory://t/_delta_log";

    fn add(path: &str) -> Vec<Action> {
        vec![Action::Add(Add::new(path, 1))]
    }

    fn filesystem_table(store: &InMemoryLogStore) -> Table {
        Table::create(
            Arc::new(store.clone()),
            LOG,
            Protocol::default(),
            Metadata::new("{}").with_configuration(CHECKPOINT_INTERVAL_KEY, "100"),
            None,
        )
        .unwrap()
    }

    #[test]
    fn create_twice_fails() {
        let store = InMemoryLogStore::new();
        filesystem_table(&store);

        let err = Table::create(
            Arc::new(store),
            LOG,
            Protocol::default(),
            Metadata::new("{}"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TableError::AlreadyExists(_)));
    }

    #[test]
    fn failed_coordinated_create_leaves_no_registration() {
        let store = InMemoryLogStore::new();
        let coordinator = InMemoryCommitCoordinator::new(10);
        let table = filesystem_table(&store);

        let err = Table::create(
            Arc::new(store.clone()),
            LOG,
            Protocol::default(),
            Metadata::new("{}"),
            Some(Arc::new(coordinator.connect())),
        )
        .unwrap_err();
        assert!(matches!(err, TableError::AlreadyExists(_)));

        let converted = table
            .convert_to_coordinated(Arc::new(coordinator.connect()))
            .unwrap();
        assert_eq!(converted.transaction().commit(add("a")).unwrap().version, 2);
    }

    #[test]
    fn snapshot_of_missing_version() {
        let store = InMemoryLogStore::new();
        let table = filesystem_table(&store);

        let err = table.snapshot(Some(3)).unwrap_err();
        assert!(err.is_version_unavailable());
        assert_eq!(err.unavailable_version(), Some(3));

        let empty = Table::new(
            LOG.into(),
            Arc::new(InMemoryLogStore::new()),
            Committer::FileSystem(FileSystemCommitter),
        );
        assert!(empty.snapshot(None).unwrap_err().is_empty_table());
    }

    #[test]
    fn open_requires_matching_coordinator() {
        let store = InMemoryLogStore::new();
        let coordinator = InMemoryCommitCoordinator::new(10);
        Table::create(
            Arc::new(store.clone()),
            LOG,
            Protocol::default(),
            Metadata::new("{}"),
            Some(Arc::new(coordinator.clone())),
        )
        .unwrap();

        let err = Table::open(Arc::new(store.clone()), LOG, None).unwrap_err();
        assert!(matches!(err, TableError::MissingCoordinator(name) if name == "in-memory"));

        let table = Table::open(Arc::new(store), LOG, Some(Arc::new(coordinator.connect()))).unwrap();
        assert!(table.committer().is_coordinated());
        assert_eq!(table.transaction().commit(add("a")).unwrap().version, 1);
    }

    #[test]
    fn conversion_hands_ordering_to_the_coordinator() {
        let store = InMemoryLogStore::new();
        let table = filesystem_table(&store);
        table.transaction().commit(add("a")).unwrap();

        let coordinated = table
            .convert_to_coordinated(Arc::new(InMemoryCommitCoordinator::new(100)))
            .unwrap();
        assert!(matches!(
            coordinated.convert_to_coordinated(Arc::new(InMemoryCommitCoordinator::new(1))),
            Err(TableError::AlreadyCoordinated(_))
        ));

        let result = coordinated.transaction().commit(add("b")).unwrap();
        assert_eq!(result.version, 3);
        // ratified but unpublished
        assert!(store.head(&delta_file_name(3)).unwrap().is_none());

        let snapshot = coordinated.snapshot(None).unwrap();
        assert_eq!(snapshot.version(), 3);
        assert!(snapshot.state().contains_file("b"));
        assert!(snapshot.properties().coordinator_name.is_some());

        assert_eq!(coordinated.backfill().unwrap(), 3);
        assert!(store.head(&delta_file_name(3)).unwrap().is_some());
    }

    #[test]
    fn cleanup_keeps_what_the_retained_checkpoint_needs() {
        let store = InMemoryLogStore::new();
        let table = filesystem_table(&store);
        for i in 1..=5 {
            table.transaction().commit(add(&i.to_string())).unwrap();
        }
        table.checkpoint(2).unwrap();
        table.checkpoint(4).unwrap();

        assert_eq!(table.cleanup_expired_logs(1).unwrap(), 0);
        // deltas 0 and 1
        assert_eq!(table.cleanup_expired_logs(3).unwrap(), 2);
        assert_eq!(table.snapshot(Some(2)).unwrap().state().file_count(), 2);
        // deltas 2 and 3, checkpoint 2
        assert_eq!(table.cleanup_expired_logs(5).unwrap(), 3);

        let latest = table.snapshot(None).unwrap();
        assert_eq!(latest.version(), 5);
        assert_eq!(latest.state().file_count(), 5);
        assert!(table.snapshot(Some(3)).unwrap_err().is_version_unavailable());
    }
}
