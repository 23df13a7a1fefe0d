// Writer Options
//
// Retry and post-commit checkpoint behaviour of transactions, loadable
// from JSON.

use serde::{Deserialize, Serialize};

/// What a transaction does when its commit makes a checkpoint due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Leave it to the caller.
    Skip,
    /// Write it before `commit` returns.
    Inline,
    /// Write it on a background thread.
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Submissions allowed per transaction, rebases included.
    pub max_commit_attempts: u32,
    /// Backoff before retry `n` is `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    pub checkpoint_mode: CheckpointMode,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_commit_attempts: 5,
            retry_backoff_ms: 10,
            checkpoint_mode: CheckpointMode::Inline,
        }
    }
}
