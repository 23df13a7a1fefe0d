//! Checkpoint creation and the `_last_checkpoint` pointer.
//!
//! A checkpoint at version `v` summarizes every action through `v`. It is
//! written in full before the pointer moves, so the pointer only ever names
//! complete checkpoints. The pointer never moves backwards.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::{BackfillError, Committer};
use crate::log::path::{checkpoint_file_name, LAST_CHECKPOINT_FILE_NAME};
use crate::log::{encode_actions, LogError, LogStore, StoreError, Version};
use crate::replay::{replay_segment, ReplayError};
use crate::segment::{resolve, SegmentError};
use crate::transaction::CommitResult;

/// Attempts at moving the pointer while other writers keep replacing it.
const POINTER_UPDATE_ATTEMPTS: u32 = 16;

/// Contents of the `_last_checkpoint` pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: Version,
    /// Number of actions in the checkpoint.
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to backfill before checkpointing: {0}")]
    Backfill(#[from] BackfillError),

    #[error("failed to resolve log segment: {0}")]
    Segment(#[from] SegmentError),

    #[error("failed to replay log: {0}")]
    Replay(#[from] ReplayError),

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] LogError),

    #[error("malformed last checkpoint pointer: {0}")]
    Pointer(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Try reading the `_last_checkpoint` pointer.
///
/// In case the file is not found, `None` is returned.
pub fn read_last_checkpoint(
    store: &dyn LogStore,
) -> Result<Option<CheckpointMetadata>, CheckpointError> {
    match read_pointer_bytes(store)? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

fn read_pointer_bytes(store: &dyn LogStore) -> Result<Option<Vec<u8>>, StoreError> {
    match store.read(LAST_CHECKPOINT_FILE_NAME) {
        Ok(data) => Ok(Some(data)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decides when checkpoints are due and writes them.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: Arc<dyn LogStore>,
    committer: Committer,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn LogStore>, committer: Committer) -> Self {
        Self { store, committer }
    }

    /// Due once the commits since the last checkpoint reach the table's
    /// checkpoint interval.
    pub fn is_ready_for_checkpoint(&self, result: &CommitResult) -> bool {
        let since = match result.last_checkpoint_version {
            Some(checkpoint) => result.version.saturating_sub(checkpoint),
            None => result.version + 1,
        };
        since >= result.properties.checkpoint_interval
    }

    pub fn read_last_checkpoint(&self) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        read_last_checkpoint(self.store.as_ref())
    }

    /// Write a checkpoint at `version` and point `_last_checkpoint` at it.
    /// Returns the number of actions written.
    pub fn write_checkpoint(&self, version: Version) -> Result<u64, CheckpointError> {
        let store = self.store.as_ref();

        // checkpoints only summarize published entries
        let hint = match self.read_last_checkpoint() {
            Ok(pointer) => pointer.map(|p| p.version).filter(|v| *v <= version),
            Err(_) => None,
        };
        self.committer.backfill_to_version(store, version, hint)?;

        let segment = resolve(store, &self.committer, Some(version))?;
        let replayed = replay_segment(store, &segment)?;
        let actions = replayed.state.checkpoint_actions();

        let mut body = Vec::new();
        for chunk in actions.chunks(store.config().write_batch_size.max(1)) {
            body.extend(encode_actions(chunk)?);
        }
        let name = checkpoint_file_name(version);
        debug!("writing checkpoint to {name}");
        store.put(&name, &body)?;

        let size = actions.len() as u64;
        self.update_last_checkpoint_pointer(version, size)?;
        info!(version, size, "checkpoint written");
        Ok(size)
    }

    /// Overwrite the pointer with `{version, size}` unless it already names
    /// a newer checkpoint. Returns whether the pointer moved.
    ///
    /// The version check and the write are one conditional replace against
    /// the store, retried while other writers move the pointer.
    pub fn update_last_checkpoint_pointer(
        &self,
        version: Version,
        size: u64,
    ) -> Result<bool, CheckpointError> {
        let store = self.store.as_ref();
        let pointer = serde_json::to_vec(&CheckpointMetadata { version, size })?;

        let mut attempt = 1;
        loop {
            let observed = read_pointer_bytes(store)?;
            if let Some(data) = &observed {
                let current: CheckpointMetadata = serde_json::from_slice(data)?;
                if current.version > version {
                    debug!(
                        current = current.version,
                        version, "pointer already names a newer checkpoint"
                    );
                    return Ok(false);
                }
            }

            match store.put_if_unchanged(LAST_CHECKPOINT_FILE_NAME, observed.as_deref(), &pointer) {
                Ok(_) => return Ok(true),
                Err(StoreError::Modified(_)) if attempt < POINTER_UPDATE_ATTEMPTS => {
                    debug!(version, attempt, "pointer changed underneath us, retrying");
                    attempt += 1;
                    thread::sleep(Duration::from_millis(u64::from(attempt)));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
