// Table Properties
//
// Typed view of the metadata `configuration` keys this layer acts on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::coordinator::TableConf;

pub const CHECKPOINT_INTERVAL_KEY: &str = "tablelog.checkpointInterval";
pub const IN_COMMIT_TIMESTAMPS_KEY: &str = "tablelog.enableInCommitTimestamps";
pub const COORDINATOR_NAME_KEY: &str = "tablelog.coordinatedCommits.commitCoordinator";
pub const COORDINATOR_CONF_KEY: &str = "tablelog.coordinatedCommits.tableConf";

pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("invalid value `{value}` for table property `{key}`")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Commits between checkpoints.
    pub checkpoint_interval: u64,
    /// Whether commits carry a monotonic `inCommitTimestamp`.
    pub in_commit_timestamps: bool,
    pub coordinator_name: Option<String>,
    /// Serialized [`TableConf`] issued at registration.
    pub coordinator_conf: Option<String>,
}

impl Default for TableProperties {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            in_commit_timestamps: false,
            coordinator_name: None,
            coordinator_conf: None,
        }
    }
}

fn invalid(key: &str, value: &str) -> PropertyError {
    PropertyError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl TableProperties {
    pub fn from_configuration(config: &BTreeMap<String, String>) -> Result<Self, PropertyError> {
        let mut props = Self::default();

        if let Some(value) = config.get(CHECKPOINT_INTERVAL_KEY) {
            props.checkpoint_interval = match value.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid(CHECKPOINT_INTERVAL_KEY, value)),
            };
        }
        if let Some(value) = config.get(IN_COMMIT_TIMESTAMPS_KEY) {
            props.in_commit_timestamps = match value.trim().to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => return Err(invalid(IN_COMMIT_TIMESTAMPS_KEY, value)),
            };
        }
        props.coordinator_name = config.get(COORDINATOR_NAME_KEY).cloned();
        props.coordinator_conf = config.get(COORDINATOR_CONF_KEY).cloned();

        Ok(props)
    }

    /// The coordinator-issued configuration, if the table is coordinated.
    pub fn table_conf(&self) -> Result<Option<TableConf>, PropertyError> {
        self.coordinator_conf
            .as_deref()
            .map(|json| TableConf::from_json(json).map_err(|_| invalid(COORDINATOR_CONF_KEY, json)))
            .transpose()
    }
}
