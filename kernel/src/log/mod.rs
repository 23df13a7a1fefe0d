// Table Log
//
// Version-numbered log entries and the actions they carry.
// An entry is newline-delimited JSON, one action per line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod local;
mod memory;
pub mod path;
pub mod store;

pub use local::LocalFileSystemLogStore;
pub use memory::InMemoryLogStore;
pub use path::{LogFileKind, ParsedLogName};
pub use store::{FileMeta, LogStore, StoreConfig, StoreError};

/// Logical version of a table.
pub type Version = u64;

/// Reader and writer requirements of the table format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: u32,
    pub min_writer_version: u32,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            min_reader_version: 1,
            min_writer_version: 2,
        }
    }
}

/// Table-level metadata: identity, schema and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub schema_string: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

impl Metadata {
    /// Metadata for a new table with a fresh id.
    pub fn new(schema_string: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: None,
            schema_string: schema_string.into(),
            partition_columns: Vec::new(),
            configuration: BTreeMap::new(),
            created_time: Some(now_millis()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_configuration(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }
}

/// A data file added to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    pub path: String,
    pub size: u64,
    pub modification_time: i64,
    pub data_change: bool,
}

impl Add {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            modification_time: now_millis(),
            data_change: true,
        }
    }
}

/// A data file logically removed from the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    pub data_change: bool,
}

impl Remove {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            deletion_timestamp: Some(now_millis()),
            data_change: true,
        }
    }
}

/// Provenance of a single commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_commit_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
}

/// One line of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Protocol(Protocol),
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    Add(Add),
    Remove(Remove),
    CommitInfo(CommitInfo),
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("malformed action on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode action: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode actions as a log entry body.
pub fn encode_actions<'a>(
    actions: impl IntoIterator<Item = &'a Action>,
) -> Result<Vec<u8>, LogError> {
    let mut buf = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut buf, action)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Decode a log entry body. Blank lines are skipped.
pub fn decode_actions(bytes: &[u8]) -> Result<Vec<Action>, LogError> {
    bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .map(|(idx, line)| {
            serde_json::from_slice(line).map_err(|source| LogError::Malformed {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_log_field_names() {
        let actions = vec![
            Action::Protocol(Protocol::default()),
            Action::Metadata(Metadata::new("{}").with_configuration("k", "v")),
            Action::Add(Add::new("part-0.parquet", 10)),
        ];

        let encoded = String::from_utf8(encode_actions(&actions).unwrap()).unwrap();
        let lines: Vec<_> = encoded.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(r#"{"protocol":{"minReaderVersion":1"#));
        assert!(lines[1].starts_with(r#"{"metaData":{"id":"#));
        assert!(lines[2].contains(r#""dataChange":true"#));
        assert_eq!(decode_actions(encoded.as_bytes()).unwrap(), actions);
    }

    #[test]
    fn decode_reports_offending_line() {
        let body = b"{\"remove\":{\"path\":\"a\",\"dataChange\":false}}\n\nnot json\n";
        let err = decode_actions(body).unwrap_err();

        assert!(matches!(err, LogError::Malformed { line: 3, .. }));
    }
}
