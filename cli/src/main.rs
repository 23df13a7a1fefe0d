use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use tablelog_kernel::log::{
    Action, Add, LocalFileSystemLogStore, LogStore, Metadata, Protocol, Remove, StoreConfig,
};
use tablelog_kernel::simulate::{run_simulation, SimulationConfig};
use tablelog_kernel::state::properties::{CHECKPOINT_INTERVAL_KEY, IN_COMMIT_TIMESTAMPS_KEY};
use tablelog_kernel::state::TableProperties;
use tablelog_kernel::transaction::WriterOptions;
use tablelog_kernel::{Table, Version};

/// Tablelog CLI
#[derive(Parser, Debug)]
#[command(name = "tablelog")]
#[command(about = "Versioned table log with checkpoints", long_about = None)]
struct Cli {
    /// Directory holding the table log
    #[arg(long, global = true)]
    table: Option<PathBuf>,

    /// Path to writer/store config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new table
    Init {
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "{}")]
        schema: String,

        #[arg(long)]
        checkpoint_interval: Option<u64>,

        #[arg(long)]
        in_commit_timestamps: bool,
    },

    /// Commit added and removed data files
    Append {
        /// Data files to add
        paths: Vec<String>,

        /// Data files to remove
        #[arg(long = "remove")]
        removes: Vec<String>,

        #[arg(long, default_value_t = 0)]
        size: u64,
    },

    /// Print the table state at a version
    Snapshot {
        #[arg(long)]
        version: Option<Version>,
    },

    /// Write a checkpoint (at the latest version by default)
    Checkpoint {
        #[arg(long)]
        version: Option<Version>,
    },

    /// Delete log entries older than the newest checkpoint at or below a version
    Cleanup {
        #[arg(long)]
        until: Version,
    },

    /// Run concurrent writers against an in-memory coordinated table
    Simulate {
        #[arg(long, default_value_t = 4)]
        writers: usize,

        #[arg(long, default_value_t = 10)]
        commits: usize,

        #[arg(long, default_value_t = 5)]
        backfill_batch_size: u64,

        #[arg(long, default_value_t = 10)]
        checkpoint_interval: u64,
    },
}

/// Contents of `--config`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    writer: WriterOptions,
    store: StoreConfig,
}

#[derive(Debug, Serialize)]
struct CommitOutput {
    version: Version,
    attempts: u32,
    checkpoint: String,
}

#[derive(Debug, Serialize)]
struct SnapshotOutput<'a> {
    version: Version,
    checkpoint_version: Option<Version>,
    in_commit_timestamp: Option<i64>,
    properties: &'a TableProperties,
    files: Vec<&'a Add>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<CliConfig>(&data)?
        }
        None => CliConfig::default(),
    };

    // ----------------------------
    // Run command
    // ----------------------------
    let output = match cli.command {
        Command::Simulate {
            writers,
            commits,
            backfill_batch_size,
            checkpoint_interval,
        } => {
            let report = run_simulation(&SimulationConfig {
                writers,
                commits_per_writer: commits,
                backfill_batch_size,
                checkpoint_interval,
                max_commit_attempts: simulation_attempts(
                    config.writer.max_commit_attempts,
                    writers,
                    commits,
                ),
            })?;
            serde_json::to_value(report)?
        }

        Command::Init {
            name,
            schema,
            checkpoint_interval,
            in_commit_timestamps,
        } => {
            let dir = table_dir(&cli.table)?;
            let mut metadata = Metadata::new(schema);
            if let Some(name) = name {
                metadata = metadata.with_name(name);
            }
            if let Some(interval) = checkpoint_interval {
                metadata = metadata.with_configuration(CHECKPOINT_INTERVAL_KEY, interval.to_string());
            }
            if in_commit_timestamps {
                metadata = metadata.with_configuration(IN_COMMIT_TIMESTAMPS_KEY, "true");
            }
            let table = Table::create(
                open_store(dir, &config)?,
                dir.display().to_string(),
                Protocol::default(),
                metadata,
                None,
            )?;
            serde_json::json!({ "version": table.latest_version()? })
        }

        Command::Append {
            paths,
            removes,
            size,
        } => {
            let table = open_table(&cli.table, &config)?;
            let actions: Vec<Action> = paths
                .into_iter()
                .map(|path| Action::Add(Add::new(path, size)))
                .chain(removes.into_iter().map(|path| Action::Remove(Remove::new(path))))
                .collect();
            let mut result = table
                .transaction()
                .with_operation("APPEND")
                .commit(actions)?;
            let checkpoint = format!("{:?}", result.wait_for_checkpoint());
            serde_json::to_value(CommitOutput {
                version: result.version,
                attempts: result.attempts,
                checkpoint,
            })?
        }

        Command::Snapshot { version } => {
            let table = open_table(&cli.table, &config)?;
            let snapshot = table.snapshot(version)?;
            serde_json::to_value(SnapshotOutput {
                version: snapshot.version(),
                checkpoint_version: snapshot.checkpoint_version(),
                in_commit_timestamp: snapshot.in_commit_timestamp(),
                properties: snapshot.properties(),
                files: snapshot.state().files().collect(),
            })?
        }

        Command::Checkpoint { version } => {
            let table = open_table(&cli.table, &config)?;
            let version = match version {
                Some(v) => v,
                None => table.latest_version()?,
            };
            serde_json::to_value(table.checkpoint(version)?)?
        }

        Command::Cleanup { until } => {
            let table = open_table(&cli.table, &config)?;
            serde_json::json!({ "removed": table.cleanup_expired_logs(until)? })
        }
    };

    // ----------------------------
    // Output
    // ----------------------------
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Enough attempts for every writer to lose to every other commit.
fn simulation_attempts(configured: u32, writers: usize, commits: usize) -> u32 {
    let total = u32::try_from(writers.saturating_mul(commits)).unwrap_or(u32::MAX);
    configured.max(total)
}

fn table_dir(table: &Option<PathBuf>) -> Result<&Path> {
    table
        .as_deref()
        .context("--table is required for this command")
}

fn open_store(dir: &Path, config: &CliConfig) -> Result<Arc<dyn LogStore>> {
    let store = LocalFileSystemLogStore::try_new(dir)
        .with_context(|| format!("opening table log at {}", dir.display()))?
        .with_config(config.store);
    Ok(Arc::new(store))
}

fn open_table(table: &Option<PathBuf>, config: &CliConfig) -> Result<Table> {
    let dir = table_dir(table)?;
    let table = Table::open(open_store(dir, config)?, dir.display().to_string(), None)?;
    Ok(table.with_options(config.writer.clone()))
}
