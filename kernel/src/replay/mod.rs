// Log Replay
//
// Replays a resolved log segment (checkpoint, then commits in order) and
// produces the table state at the segment's end version.

use tracing::debug;

use crate::log::{decode_actions, LogError, LogStore, StoreError, Version};
use crate::segment::LogSegment;
use crate::state::{StateError, TableState, TableStateMachine};

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("failed to read log entry: {0}")]
    Store(#[from] StoreError),

    #[error("failed to decode log entry: {0}")]
    Log(#[from] LogError),

    #[error("table definition (protocol and metadata) missing at version {0}")]
    MissingTableDefinition(Version),
}

/// Result of replaying a segment.
#[derive(Debug, Clone)]
pub struct ReplayedState {
    pub version: Version,
    pub state: TableState,
    /// In-commit timestamp of the end version, when it was replayed from a
    /// commit that carried one.
    pub in_commit_timestamp: Option<i64>,
}

/// Replay the segment and derive the table state at its end version.
///
/// This is the *only* supported way to derive table state.
pub fn replay_segment(
    store: &dyn LogStore,
    segment: &LogSegment,
) -> Result<ReplayedState, ReplayError> {
    let mut state_machine = match (&segment.checkpoint_version, &segment.checkpoint_file) {
        (Some(version), Some(file)) => {
            let actions = decode_actions(&store.read(&file.name)?)?;
            TableStateMachine::from_checkpoint(*version, &actions)
        }
        _ => TableStateMachine::new(),
    };

    let batch_size = store.config().read_batch_size.max(1);
    for batch in segment.commits.chunks(batch_size) {
        let names: Vec<String> = batch.iter().map(|c| c.file.name.clone()).collect();
        let bodies = store.read_batch(&names)?;
        for (commit, body) in batch.iter().zip(bodies) {
            state_machine.apply_commit(commit.version, &decode_actions(&body)?)?;
        }
    }

    let version = state_machine.version().unwrap_or(segment.end_version);
    let state = state_machine.current_state();
    if state.protocol().is_none() || state.metadata().is_none() {
        return Err(ReplayError::MissingTableDefinition(version));
    }
    debug!(version, files = state.file_count(), "replayed log segment");

    Ok(ReplayedState {
        version,
        in_commit_timestamp: state_machine.in_commit_timestamp(),
        state: state_machine.into_state(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Committer, FileSystemCommitter};
    use crate::log::path::{checkpoint_file_name, delta_file_name};
    use crate::log::{encode_actions, Action, Add, InMemoryLogStore, Metadata, Protocol, StoreConfig};
    use crate::segment::resolve;

    fn put(store: &InMemoryLogStore, name: &str, actions: &[Action]) {
        store.put(name, &encode_actions(actions).unwrap()).unwrap();
    }

    fn table(store: &InMemoryLogStore, commits: u64) {
        put(
            store,
            &delta_file_name(0),
            &[
                Action::Protocol(Protocol::default()),
                Action::Metadata(Metadata::new("{}")),
            ],
        );
        for v in 1..=commits {
            put(store, &delta_file_name(v), &[Action::Add(Add::new(format!("f{v}"), v))]);
        }
    }

    #[test]
    fn replay_applies_commits_in_small_batches() {
        let store = InMemoryLogStore::new().with_config(StoreConfig {
            read_batch_size: 2,
            ..Default::default()
        });
        table(&store, 5);

        let fs = Committer::FileSystem(FileSystemCommitter);
        let segment = resolve(&store, &fs, Some(4)).unwrap();
        let replayed = replay_segment(&store, &segment).unwrap();

        assert_eq!(replayed.version, 4);
        assert_eq!(replayed.state.file_count(), 4);
    }

    #[test]
    fn replay_from_checkpoint_matches_full_replay() {
        let store = InMemoryLogStore::new();
        table(&store, 5);
        let fs = Committer::FileSystem(FileSystemCommitter);

        let full = replay_segment(&store, &resolve(&store, &fs, Some(5)).unwrap()).unwrap();
        let at_three = replay_segment(&store, &resolve(&store, &fs, Some(3)).unwrap()).unwrap();
        put(&store, &checkpoint_file_name(3), &at_three.state.checkpoint_actions());

        let segment = resolve(&store, &fs, Some(5)).unwrap();
        assert_eq!(segment.checkpoint_version, Some(3));
        let from_checkpoint = replay_segment(&store, &segment).unwrap();

        assert_eq!(from_checkpoint.version, 5);
        assert_eq!(from_checkpoint.state, full.state);
    }

    #[test]
    fn replay_without_table_definition_fails() {
        let store = InMemoryLogStore::new();
        put(&store, &delta_file_name(0), &[Action::Add(Add::new("a", 1))]);

        let fs = Committer::FileSystem(FileSystemCommitter);
        let err = replay_segment(&store, &resolve(&store, &fs, None).unwrap()).unwrap_err();
        assert!(matches!(err, ReplayError::MissingTableDefinition(0)));
    }
}
