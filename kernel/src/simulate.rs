// Concurrent Writer Simulation
//
// Runs several writers against one coordinated table held in memory:
// create → N threads committing → backfill → checkpoint → replay check.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordinator::{CommitCoordinatorClient, InMemoryCommitCoordinator};
use crate::log::path::delta_file_name;
use crate::log::{decode_actions, Action, Add, InMemoryLogStore, LogStore, Metadata, Protocol, Version};
use crate::replay::ReplayError;
use crate::state::properties::CHECKPOINT_INTERVAL_KEY;
use crate::state::{TableState, TableStateMachine};
use crate::table::{SnapshotError, Table, TableError};
use crate::transaction::{CheckpointMode, TransactionError, WriterOptions};

const LOG_PATH: &str = "memory://simulation/_delta_log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub writers: usize,
    pub commits_per_writer: usize,
    pub backfill_batch_size: u64,
    pub checkpoint_interval: u64,
    pub max_commit_attempts: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            writers: 4,
            commits_per_writer: 10,
            backfill_batch_size: 5,
            checkpoint_interval: 10,
            max_commit_attempts: 100,
        }
    }
}

/// Result of a simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub latest_version: Version,
    pub commits: usize,
    /// Submissions beyond one per commit.
    pub retries: u64,
    /// Every committed version was handed to exactly one writer.
    pub versions_unique: bool,
    pub live_files: usize,
    pub last_checkpoint: Option<Version>,
    /// Reading from the checkpoint gives the same state as replaying
    /// every commit.
    pub checkpoint_consistent: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("writer {writer} failed: {source}")]
    Writer {
        writer: usize,
        source: TransactionError,
    },

    #[error("writer {0} panicked")]
    WriterPanicked(usize),
}

pub fn run_simulation(config: &SimulationConfig) -> Result<SimulationReport, SimulationError> {
    let store = Arc::new(InMemoryLogStore::new());
    let coordinator = InMemoryCommitCoordinator::new(config.backfill_batch_size);
    let options = WriterOptions {
        max_commit_attempts: config.max_commit_attempts,
        retry_backoff_ms: 1,
        checkpoint_mode: CheckpointMode::Inline,
    };

    Table::create(
        store.clone(),
        LOG_PATH,
        Protocol::default(),
        Metadata::new("{}")
            .with_name("simulation")
            .with_configuration(CHECKPOINT_INTERVAL_KEY, config.checkpoint_interval.to_string()),
        Some(Arc::new(coordinator.connect())),
    )?;

    let outcomes = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.writers)
            .map(|writer| {
                let store = store.clone();
                let client: Arc<dyn CommitCoordinatorClient> = Arc::new(coordinator.connect());
                let options = options.clone();
                scope.spawn(move || write_commits(store, client, options, writer, config))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(writer, handle)| handle.join().unwrap_or(Err(WriterFailure::Panicked(writer))))
            .collect::<Vec<_>>()
    });

    let mut versions = Vec::new();
    let mut retries = 0;
    for outcome in outcomes {
        for (version, attempts) in outcome.map_err(SimulationError::from)? {
            versions.push(version);
            retries += u64::from(attempts.saturating_sub(1));
        }
    }
    let versions_unique = versions.iter().collect::<BTreeSet<_>>().len() == versions.len();

    let table = Table::open(store.clone(), LOG_PATH, Some(Arc::new(coordinator.connect())))?;
    let latest_version = table.backfill()?;
    table.checkpoint(latest_version)?;

    let snapshot = table.snapshot(None)?;
    let full_replay = replay_every_commit(store.as_ref(), latest_version)?;
    let last_checkpoint = table.checkpoint_manager().read_last_checkpoint().ok().flatten();

    let report = SimulationReport {
        latest_version,
        commits: versions.len(),
        retries,
        versions_unique,
        live_files: snapshot.state().file_count(),
        last_checkpoint: last_checkpoint.map(|c| c.version),
        checkpoint_consistent: snapshot.state() == &full_replay,
    };
    info!(
        latest_version,
        commits = report.commits,
        retries,
        "simulation finished"
    );
    Ok(report)
}

enum WriterFailure {
    Open(usize, TableError),
    Commit(usize, TransactionError),
    Panicked(usize),
}

impl From<WriterFailure> for SimulationError {
    fn from(failure: WriterFailure) -> Self {
        match failure {
            WriterFailure::Open(_, e) => SimulationError::Table(e),
            WriterFailure::Commit(writer, source) => SimulationError::Writer { writer, source },
            WriterFailure::Panicked(writer) => SimulationError::WriterPanicked(writer),
        }
    }
}

/// Table state from version 0 onwards, ignoring checkpoints.
fn replay_every_commit(store: &dyn LogStore, latest: Version) -> Result<TableState, ReplayError> {
    let mut machine = TableStateMachine::new();
    for version in 0..=latest {
        let body = store.read(&delta_file_name(version))?;
        machine.apply_commit(version, &decode_actions(&body)?)?;
    }
    Ok(machine.into_state())
}

fn write_commits(
    store: Arc<InMemoryLogStore>,
    client: Arc<dyn CommitCoordinatorClient>,
    options: WriterOptions,
    writer: usize,
    config: &SimulationConfig,
) -> Result<Vec<(Version, u32)>, WriterFailure> {
    let table = Table::open(store, LOG_PATH, Some(client))
        .map_err(|e| WriterFailure::Open(writer, e))?
        .with_options(options);

    (0..config.commits_per_writer)
        .map(|n| {
            let path = format!("part-{writer:03}-{n:05}.parquet");
            table
                .transaction()
                .with_operation("SIMULATED WRITE")
                .commit(vec![Action::Add(Add::new(path, 1024))])
                .map(|result| (result.version, result.attempts))
                .map_err(|e| WriterFailure::Commit(writer, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_writers_get_distinct_versions() {
        let config = SimulationConfig {
            writers: 4,
            commits_per_writer: 5,
            backfill_batch_size: 3,
            checkpoint_interval: 4,
            max_commit_attempts: 200,
        };

        let report = run_simulation(&config).unwrap();

        assert!(report.versions_unique);
        assert_eq!(report.commits, 20);
        assert_eq!(report.latest_version, 20);
        assert_eq!(report.live_files, 20);
        assert_eq!(report.last_checkpoint, Some(20));
        assert!(report.checkpoint_consistent);
    }
}
