//! Naming of log entries relative to the log directory.
//!
//! - published delta: `00000000000000000042.json`
//! - staged commit: `_commits/00000000000000000042.<uuid>.json`
//! - checkpoint: `00000000000000000042.checkpoint.json`

use uuid::Uuid;

use super::Version;

/// Pointer record naming the preferred checkpoint.
pub const LAST_CHECKPOINT_FILE_NAME: &str = "_last_checkpoint";

/// Directory holding commits ratified by a coordinator but not yet backfilled.
pub const STAGED_COMMITS_DIR: &str = "_commits/";

const VERSION_DIGITS: usize = 20;

pub fn delta_file_name(version: Version) -> String {
    format!("{version:020}.json")
}

pub fn checkpoint_file_name(version: Version) -> String {
    format!("{version:020}.checkpoint.json")
}

/// A fresh, unique name for a staged commit of `version`.
pub fn new_staged_commit_name(version: Version) -> String {
    format!("{STAGED_COMMITS_DIR}{version:020}.{}.json", Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileKind {
    Delta,
    StagedCommit,
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogName {
    pub version: Version,
    pub kind: LogFileKind,
}

impl ParsedLogName {
    /// Parse a name relative to the log directory. Names that are not log
    /// entries (pointer, temp files, checksums) yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let (staged, file_name) = match name.strip_prefix(STAGED_COMMITS_DIR) {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        if file_name.contains('/') || file_name.len() <= VERSION_DIGITS {
            return None;
        }

        let digits = file_name.get(..VERSION_DIGITS)?;
        let suffix = &file_name[VERSION_DIGITS..];
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let version = digits.parse().ok()?;

        let kind = match (staged, suffix) {
            (false, ".json") => LogFileKind::Delta,
            (false, ".checkpoint.json") => LogFileKind::Checkpoint,
            (true, suffix) => {
                let uuid = suffix.strip_prefix('.')?.strip_suffix(".json")?;
                Uuid::parse_str(uuid).ok()?;
                LogFileKind::StagedCommit
            }
            _ => return None,
        };

        Some(Self { version, kind })
    }
}
