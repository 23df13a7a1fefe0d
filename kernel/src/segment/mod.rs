//! Resolution of the [`LogSegment`] needed to read a table at a version.
//!
//! A segment is a checkpoint at or below the target plus every commit after
//! it through the target. The checkpoint named by `_last_checkpoint` is
//! preferred; without a usable pointer the newest listed checkpoint at or
//! below the target is taken. Commits come from published entries
//! and, for coordinated tables, from the coordinator's unbackfilled tail.
//! Guarantees of a resolved segment:
//!     1. Commit versions are contiguous and ascending.
//!     2. The first commit directly follows the checkpoint (or is version 0
//!        when there is no checkpoint).
//!     3. The last commit (or the checkpoint, if there are none) is the
//!        target version.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::checkpoint::read_last_checkpoint;
use crate::coordinator::{Commit, Committer, CoordinatorError};
use crate::log::{FileMeta, LogFileKind, LogStore, ParsedLogName, StoreError, Version};

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("table log is empty")]
    EmptyLog,

    #[error("cannot read version {version}: the latest version of the table is {latest}")]
    VersionNotFound { version: Version, latest: Version },

    #[error(
        "cannot time travel to version {version}: the log entries needed to reconstruct it have been removed{}",
        .earliest.map(|e| format!(" (earliest available version is {e})")).unwrap_or_default()
    )]
    HistoryTruncated {
        version: Version,
        earliest: Option<Version>,
    },

    #[error("log is inconsistent: version {missing} is missing while reconstructing version {target}")]
    Gap { missing: Version, target: Version },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl SegmentError {
    /// The requested version can never be read. Not retryable.
    pub fn is_version_unavailable(&self) -> bool {
        self.unavailable_version().is_some()
    }

    pub fn unavailable_version(&self) -> Option<Version> {
        match self {
            Self::VersionNotFound { version, .. } | Self::HistoryTruncated { version, .. } => {
                Some(*version)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub end_version: Version,
    pub checkpoint_version: Option<Version>,
    pub checkpoint_file: Option<FileMeta>,
    /// Ascending, contiguous commits after the checkpoint.
    pub commits: Vec<Commit>,
}

impl LogSegment {
    /// Versions replayed on top of the checkpoint.
    pub fn commit_versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.commits.iter().map(|c| c.version)
    }
}

/// Everything the log currently holds.
#[derive(Debug, Default)]
struct ListedLog {
    commits: BTreeMap<Version, Commit>,
    checkpoints: BTreeMap<Version, FileMeta>,
    latest: Option<Version>,
}

impl ListedLog {
    fn list(
        store: &dyn LogStore,
        committer: &Committer,
        end_version: Option<Version>,
    ) -> Result<Self, SegmentError> {
        let mut listed = Self::default();

        // ask the coordinator first: a commit it forgets after this call was
        // already published and shows up in the listing below
        let tail = committer.unbackfilled_commits(None, end_version)?;

        for file in store.list("")? {
            let Some(parsed) = ParsedLogName::parse(&file.name) else {
                continue;
            };
            match parsed.kind {
                LogFileKind::Delta => {
                    listed.commits.insert(
                        parsed.version,
                        Commit {
                            version: parsed.version,
                            commit_timestamp: file.last_modified,
                            file,
                            backfilled: true,
                        },
                    );
                }
                LogFileKind::Checkpoint => {
                    listed.checkpoints.insert(parsed.version, file);
                }
                LogFileKind::StagedCommit => {}
            }
        }

        // the published copy of a version wins; its content is identical
        for commit in tail.commits {
            listed.commits.entry(commit.version).or_insert(commit);
        }

        listed.latest = [
            listed.commits.keys().next_back().copied(),
            listed.checkpoints.keys().next_back().copied(),
            tail.latest_table_version,
        ]
        .into_iter()
        .flatten()
        .max();
        Ok(listed)
    }

    /// Lowest version that can still be reconstructed.
    fn earliest_recoverable(&self) -> Option<Version> {
        let from_start = self.commits.contains_key(&0).then_some(0);
        from_start.or_else(|| self.checkpoints.keys().next().copied())
    }
}

/// Resolve the segment for `target_version`, or the latest version if `None`.
pub fn resolve(
    store: &dyn LogStore,
    committer: &Committer,
    target_version: Option<Version>,
) -> Result<LogSegment, SegmentError> {
    let listed = ListedLog::list(store, committer, target_version)?;
    let latest = listed.latest.ok_or(SegmentError::EmptyLog)?;
    let target = target_version.unwrap_or(latest);
    if target > latest {
        return Err(SegmentError::VersionNotFound {
            version: target,
            latest,
        });
    }

    let checkpoint = pointed_checkpoint(store, &listed, target).or_else(|| {
        listed
            .checkpoints
            .range(..=target)
            .next_back()
            .map(|(v, file)| (*v, file.clone()))
    });

    let start = checkpoint.as_ref().map_or(0, |(v, _)| v + 1);
    let mut commits = Vec::new();
    for version in start..=target {
        match listed.commits.get(&version) {
            Some(commit) => commits.push(commit.clone()),
            None => {
                let pruned = listed
                    .commits
                    .keys()
                    .next()
                    .map_or(true, |first| version < *first);
                return Err(if pruned {
                    SegmentError::HistoryTruncated {
                        version: target,
                        earliest: listed.earliest_recoverable(),
                    }
                } else {
                    SegmentError::Gap {
                        missing: version,
                        target,
                    }
                });
            }
        }
    }

    let (checkpoint_version, checkpoint_file) = match checkpoint {
        Some((v, file)) => (Some(v), Some(file)),
        None => (None, None),
    };
    debug!(
        target,
        checkpoint = ?checkpoint_version,
        commits = commits.len(),
        "resolved log segment"
    );
    Ok(LogSegment {
        end_version: target,
        checkpoint_version,
        checkpoint_file,
        commits,
    })
}

/// The checkpoint `_last_checkpoint` names, when it is usable for `target`.
fn pointed_checkpoint(
    store: &dyn LogStore,
    listed: &ListedLog,
    target: Version,
) -> Option<(Version, FileMeta)> {
    let pointer = match read_last_checkpoint(store) {
        Ok(Some(pointer)) if pointer.version <= target => pointer,
        Ok(_) => return None,
        Err(e) => {
            warn!("ignoring unreadable last checkpoint pointer: {e}");
            return None;
        }
    };
    match listed.checkpoints.get(&pointer.version) {
        Some(file) => Some((pointer.version, file.clone())),
        None => {
            warn!(
                version = pointer.version,
                "last checkpoint pointer names a missing checkpoint"
            );
            None
        }
    }
}
