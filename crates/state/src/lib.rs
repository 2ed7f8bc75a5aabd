//! State preservation for the reload runtime
//!
//! Snapshots of per-module opaque state with checksums and optional
//! compression, per-module lineage chains with retention, chunked byte
//! diffing for observability, and migration routing through each module's
//! own capabilities.

pub mod diff;
pub mod migrate;
pub mod snapshot;
pub mod store;

pub use diff::{compute_diff, DiffRange, DiffSpec, DEFAULT_CHUNK_SIZE};
pub use migrate::{MigrationEngine, MigrationKind, MigrationOutcome};
pub use snapshot::{
    read_snapshot, read_snapshot_header, snapshot_path, state_checksum, write_snapshot,
    CompressionKind, SnapshotHeader, StateSnapshot,
};
pub use store::{ChainEntry, RetentionPolicy, StateStore};
