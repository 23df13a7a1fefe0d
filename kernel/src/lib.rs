// Tablelog Kernel
//
// Commit coordination and checkpointing for versioned table logs.

pub mod checkpoint;
pub mod coordinator;
pub mod invariants;
pub mod log;
pub mod replay;
pub mod segment;
pub mod simulate;
pub mod state;
pub mod table;
pub mod transaction;

pub use log::Version;
pub use table::{Snapshot, SnapshotError, Table, TableError};
