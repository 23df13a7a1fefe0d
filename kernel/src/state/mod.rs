// Table State
//
// Derives the table state at a version from a checkpoint and the ordered
// commits after it. This module is pure, deterministic, and side-effect free.

use std::collections::BTreeMap;

use crate::log::{Action, Add, Metadata, Protocol, Version};

pub mod properties;

pub use properties::{PropertyError, TableProperties};

/// Reconstructed table state: what a reader sees at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    protocol: Option<Protocol>,
    metadata: Option<Metadata>,
    /// Live files keyed by path.
    files: BTreeMap<String, Add>,
}

impl TableState {
    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn files(&self) -> impl Iterator<Item = &Add> {
        self.files.values()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Actions that summarize this state: protocol, metadata, then live
    /// files ordered by path.
    pub fn checkpoint_actions(&self) -> Vec<Action> {
        self.protocol
            .iter()
            .cloned()
            .map(Action::Protocol)
            .chain(self.metadata.iter().cloned().map(Action::Metadata))
            .chain(self.files.values().cloned().map(Action::Add))
            .collect()
    }

    fn apply(&mut self, action: &Action) {
        match action {
            Action::Protocol(p) => self.protocol = Some(p.clone()),
            Action::Metadata(m) => self.metadata = Some(m.clone()),
            Action::Add(add) => {
                self.files.insert(add.path.clone(), add.clone());
            }
            Action::Remove(remove) => {
                self.files.remove(&remove.path);
            }
            Action::CommitInfo(_) => {}
        }
    }
}

/// Errors produced while folding commits into state.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("commit out of order: expected version {expected}, got {actual}")]
    OutOfOrder { expected: Version, actual: Version },
}

/// Stateful reducer for commits.
#[derive(Debug, Default)]
pub struct TableStateMachine {
    state: TableState,
    version: Option<Version>,
    in_commit_timestamp: Option<i64>,
}

impl TableStateMachine {
    /// A state machine for a table with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the actions of a checkpoint taken at `version`.
    pub fn from_checkpoint(version: Version, actions: &[Action]) -> Self {
        let mut state = TableState::default();
        for action in actions {
            state.apply(action);
        }
        Self {
            state,
            version: Some(version),
            in_commit_timestamp: None,
        }
    }

    /// Apply the actions of commit `version`, which must directly follow
    /// the last applied one.
    pub fn apply_commit(&mut self, version: Version, actions: &[Action]) -> Result<(), StateError> {
        let expected = self.version.map_or(0, |v| v + 1);
        if version != expected {
            return Err(StateError::OutOfOrder {
                expected,
                actual: version,
            });
        }

        self.in_commit_timestamp = None;
        for action in actions {
            if let Action::CommitInfo(info) = action {
                self.in_commit_timestamp = info.in_commit_timestamp;
            }
            self.state.apply(action);
        }
        self.version = Some(version);
        Ok(())
    }

    pub fn current_state(&self) -> &TableState {
        &self.state
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// In-commit timestamp of the last applied commit, if it carried one.
    pub fn in_commit_timestamp(&self) -> Option<i64> {
        self.in_commit_timestamp
    }

    pub fn into_state(self) -> TableState {
        self.state
    }
}
