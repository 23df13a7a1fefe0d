// In-Memory Commit Coordinator
//
// Reference coordination service. Ratification is serialized per table by
// a single mutex; payloads are staged in the log store before ratification
// so a ratified commit is always readable.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BackfillError, Commit, CommitCoordinatorClient, CommitFailed, CommitResponse,
    CoordinatorError, GetCommitsResponse, TableConf, UpdatedActions,
};
use crate::log::path::{delta_file_name, new_staged_commit_name};
use crate::log::{encode_actions, now_millis, Action, LogStore, Metadata, Protocol, StoreError, Version};

const TABLE_ID_KEY: &str = "tableId";

#[derive(Debug)]
struct PerTableData {
    conf: TableConf,
    /// Highest version known to the coordinator, including the
    /// registration pivot which it never ratified itself.
    max_commit_version: Version,
    ratified_any: bool,
    /// Ratified, not yet backfilled.
    commits: BTreeMap<Version, Commit>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    tables: HashMap<String, PerTableData>,
}

/// Coordinator service kept in process memory.
///
/// [`InMemoryCommitCoordinator::connect`] hands out further clients of the
/// same service; all of them are semantically equal.
#[derive(Debug, Clone)]
pub struct InMemoryCommitCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    backfill_batch_size: u64,
}

impl Default for InMemoryCommitCoordinator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryCommitCoordinator {
    pub const NAME: &'static str = "in-memory";

    /// A new service that backfills after every `backfill_batch_size`
    /// commits (versions that are multiples of it). Zero is treated as one.
    pub fn new(backfill_batch_size: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            backfill_batch_size: backfill_batch_size.max(1),
        }
    }

    /// Another client addressing this same service.
    pub fn connect(&self) -> Self {
        self.clone()
    }

    pub fn backfill_batch_size(&self) -> u64 {
        self.backfill_batch_size
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinatorState {
    fn table(&self, log_path: &str, conf: &TableConf) -> Result<&PerTableData, CoordinatorError> {
        let table = self
            .tables
            .get(log_path)
            .ok_or_else(|| CoordinatorError::UnknownTable(log_path.to_string()))?;
        if &table.conf != conf {
            return Err(CoordinatorError::ConfMismatch(log_path.to_string()));
        }
        Ok(table)
    }

    fn table_mut(
        &mut self,
        log_path: &str,
        conf: &TableConf,
    ) -> Result<&mut PerTableData, CoordinatorError> {
        self.table(log_path, conf)?;
        self.tables
            .get_mut(log_path)
            .ok_or_else(|| CoordinatorError::UnknownTable(log_path.to_string()))
    }
}

/// Reject versions that cannot be the next one.
fn check_next_version(table: &PerTableData, version: Version) -> Result<(), CommitFailed> {
    let expected = table.max_commit_version + 1;
    if version < expected {
        return Err(CommitFailed::rebaseable_conflict(format!(
            "version {version} already ratified; next version is {expected}"
        )));
    }
    if version > expected {
        return Err(CommitFailed::fatal(format!(
            "version {version} would leave a gap; next version is {expected}"
        )));
    }
    Ok(())
}

fn to_commit_failure(err: CoordinatorError) -> CommitFailed {
    match err {
        CoordinatorError::Store(e) => e.into(),
        other => CommitFailed::fatal(other.to_string()),
    }
}

impl CommitCoordinatorClient for InMemoryCommitCoordinator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register_table(
        &self,
        log_path: &str,
        current_version: Option<Version>,
        _current_metadata: &Metadata,
        _current_protocol: &Protocol,
    ) -> Result<TableConf, CoordinatorError> {
        let mut state = self.lock();
        if state.tables.contains_key(log_path) {
            return Err(CoordinatorError::AlreadyRegistered(log_path.to_string()));
        }

        let conf = TableConf::issued(BTreeMap::from([(
            TABLE_ID_KEY.to_string(),
            Uuid::new_v4().to_string(),
        )]));
        let pivot = current_version.map_or(0, |v| v + 1);
        state.tables.insert(
            log_path.to_string(),
            PerTableData {
                conf: conf.clone(),
                max_commit_version: pivot,
                ratified_any: false,
                commits: BTreeMap::new(),
            },
        );

        info!(log_path, pivot, "registered table with commit coordinator");
        Ok(conf)
    }

    fn commit(
        &self,
        store: &dyn LogStore,
        log_path: &str,
        table_conf: &TableConf,
        commit_version: Version,
        actions: &[Action],
        updated_actions: &UpdatedActions,
    ) -> Result<CommitResponse, CommitFailed> {
        {
            let state = self.lock();
            let table = state.table(log_path, table_conf).map_err(to_commit_failure)?;
            check_next_version(table, commit_version)?;
        }

        let body = encode_actions(actions).map_err(|e| CommitFailed::fatal(e.to_string()))?;
        let file = store.put_if_absent(&new_staged_commit_name(commit_version), &body)?;

        let ratified = {
            let mut state = self.lock();
            let table = state
                .table_mut(log_path, table_conf)
                .map_err(to_commit_failure)?;
            check_next_version(table, commit_version).map(|()| {
                let commit = Commit {
                    version: commit_version,
                    file: file.clone(),
                    commit_timestamp: updated_actions
                        .commit_info
                        .in_commit_timestamp
                        .or(updated_actions.commit_info.timestamp)
                        .unwrap_or_else(now_millis),
                    backfilled: false,
                };
                table.commits.insert(commit_version, commit.clone());
                table.max_commit_version = commit_version;
                table.ratified_any = true;
                commit
            })
        };

        let commit = match ratified {
            Ok(commit) => commit,
            Err(failure) => {
                // lost the race after staging; the staged entry is garbage
                if let Err(e) = store.delete(&file.name) {
                    debug!("failed to remove orphaned staged commit {}: {e}", file.name);
                }
                return Err(failure);
            }
        };
        debug!(log_path, version = commit_version, "ratified commit");

        if commit_version % self.backfill_batch_size == 0 {
            match self.backfill_to_version(store, log_path, table_conf, commit_version, None) {
                Ok(()) => return Ok(CommitResponse { commit: None }),
                Err(e) => warn!(log_path, version = commit_version, "eager backfill failed: {e}"),
            }
        }
        Ok(CommitResponse {
            commit: Some(commit),
        })
    }

    fn get_commits(
        &self,
        log_path: &str,
        table_conf: &TableConf,
        start_version: Option<Version>,
        end_version: Option<Version>,
    ) -> Result<GetCommitsResponse, CoordinatorError> {
        let state = self.lock();
        let table = state.table(log_path, table_conf)?;

        let start = start_version.unwrap_or(0);
        let commits = match end_version {
            Some(end) if end < start => Vec::new(),
            Some(end) => table.commits.range(start..=end).map(|(_, c)| c.clone()).collect(),
            None => table.commits.range(start..).map(|(_, c)| c.clone()).collect(),
        };

        Ok(GetCommitsResponse {
            commits,
            latest_table_version: table.ratified_any.then_some(table.max_commit_version),
        })
    }

    fn backfill_to_version(
        &self,
        store: &dyn LogStore,
        log_path: &str,
        table_conf: &TableConf,
        version: Version,
        last_known_backfilled_version: Option<Version>,
    ) -> Result<(), BackfillError> {
        let (pending, hint) = {
            let state = self.lock();
            let table = state.table(log_path, table_conf).map_err(|e| match e {
                CoordinatorError::Store(e) => e,
                other => StoreError::NotFound(other.to_string()),
            })?;
            let pending: Vec<Commit> = table
                .commits
                .range(..=version)
                .map(|(_, c)| c.clone())
                .collect();
            // a hint beyond anything ratified is invalid; start from scratch
            let hint = last_known_backfilled_version
                .filter(|h| *h <= version && *h <= table.max_commit_version);
            (pending, hint)
        };

        for commit in &pending {
            let published = delta_file_name(commit.version);
            if hint.is_some_and(|h| commit.version <= h) && store.head(&published)?.is_some() {
                continue;
            }
            let body = store.read(&commit.file.name)?;
            match store.put_if_absent(&published, &body) {
                Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut state = self.lock();
        if let Ok(table) = state.table_mut(log_path, table_conf) {
            table.commits.retain(|v, _| *v > version);
        }
        debug!(log_path, version, backfilled = pending.len(), "backfill complete");
        Ok(())
    }

    fn semantic_equals(&self, other: &dyn CommitCoordinatorClient) -> bool {
        other
            .as_any()
            .downcast_ref::<InMemoryCommitCoordinator>()
            .is_some_and(|o| Arc::ptr_eq(&self.state, &o.state))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
