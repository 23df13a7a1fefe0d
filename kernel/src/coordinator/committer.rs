//! The two ways a table commits. A table picks one when it is created,
//! opened or converted, and keeps it for its lifetime:
//!
//! - [`FileSystemCommitter`] writes the published entry directly and relies
//!   on the store's put-if-absent to order racing writers.
//! - [`CoordinatedCommitter`] hands the commit to a
//!   [`CommitCoordinatorClient`], which arbitrates ordering itself.

use std::sync::Arc;

use tracing::debug;

use super::{
    BackfillError, CommitCoordinatorClient, CommitFailed, CommitResponse, CoordinatorError,
    GetCommitsResponse, TableConf, UpdatedActions,
};
use crate::log::path::delta_file_name;
use crate::log::{encode_actions, Action, LogStore, StoreError, Version};

/// Commits by atomically creating the published entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemCommitter;

impl FileSystemCommitter {
    pub fn new() -> Self {
        Self
    }

    pub fn commit(
        &self,
        store: &dyn LogStore,
        version: Version,
        actions: &[Action],
    ) -> Result<CommitResponse, CommitFailed> {
        let body = encode_actions(actions).map_err(|e| CommitFailed::fatal(e.to_string()))?;
        match store.put_if_absent(&delta_file_name(version), &body) {
            Ok(_) => Ok(CommitResponse { commit: None }),
            Err(StoreError::AlreadyExists(_)) => Err(CommitFailed::rebaseable_conflict(format!(
                "version {version} was already committed by another writer"
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Commits through a coordinator using the configuration it issued.
#[derive(Debug, Clone)]
pub struct CoordinatedCommitter {
    client: Arc<dyn CommitCoordinatorClient>,
    conf: TableConf,
    log_path: String,
}

impl CoordinatedCommitter {
    pub fn new(
        client: Arc<dyn CommitCoordinatorClient>,
        conf: TableConf,
        log_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            conf,
            log_path: log_path.into(),
        }
    }

    pub fn client(&self) -> &Arc<dyn CommitCoordinatorClient> {
        &self.client
    }

    pub fn table_conf(&self) -> &TableConf {
        &self.conf
    }
}

#[derive(Debug, Clone)]
pub enum Committer {
    FileSystem(FileSystemCommitter),
    Coordinated(CoordinatedCommitter),
}

impl Committer {
    pub fn is_coordinated(&self) -> bool {
        matches!(self, Self::Coordinated(_))
    }

    pub fn coordinator(&self) -> Option<&CoordinatedCommitter> {
        match self {
            Self::FileSystem(_) => None,
            Self::Coordinated(c) => Some(c),
        }
    }

    pub fn commit(
        &self,
        store: &dyn LogStore,
        version: Version,
        actions: &[Action],
        updated_actions: &UpdatedActions,
    ) -> Result<CommitResponse, CommitFailed> {
        match self {
            Self::FileSystem(fs) => fs.commit(store, version, actions),
            Self::Coordinated(c) => c.client.commit(
                store,
                &c.log_path,
                &c.conf,
                version,
                actions,
                updated_actions,
            ),
        }
    }

    /// Commits ratified but not yet published. Always empty for
    /// filesystem tables.
    pub fn unbackfilled_commits(
        &self,
        start_version: Option<Version>,
        end_version: Option<Version>,
    ) -> Result<GetCommitsResponse, CoordinatorError> {
        match self {
            Self::FileSystem(_) => Ok(GetCommitsResponse {
                commits: Vec::new(),
                latest_table_version: None,
            }),
            Self::Coordinated(c) => {
                c.client
                    .get_commits(&c.log_path, &c.conf, start_version, end_version)
            }
        }
    }

    pub fn backfill_to_version(
        &self,
        store: &dyn LogStore,
        version: Version,
        last_known_backfilled_version: Option<Version>,
    ) -> Result<(), BackfillError> {
        match self {
            Self::FileSystem(_) => Ok(()),
            Self::Coordinated(c) => {
                debug!(version, log_path = %c.log_path, "backfilling");
                c.client.backfill_to_version(
                    store,
                    &c.log_path,
                    &c.conf,
                    version,
                    last_known_backfilled_version,
                )
            }
        }
    }
}
