//! Runtime configuration
//!
//! One [`RuntimeConfig`] is handed to the runtime at init and never mutated
//! afterwards; components copy the fields they care about. Defaults are
//! tuned for a 60 Hz simulation loop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How aggressively WAL records reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// Records buffered in the OS page cache; flushed on rotation and close
    Buffered,
    /// fsync when a transaction outcome record (commit/abort) is appended
    FsyncOnCommit,
    /// fsync after every record
    FsyncEveryRecord,
}

impl DurabilityLevel {
    /// True when this level fsyncs transaction outcome records before
    /// commit success is reported.
    pub fn syncs_on_commit(&self) -> bool {
        !matches!(self, DurabilityLevel::Buffered)
    }
}

/// MVCC isolation level for reload transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Sees uncommitted staging; diagnostics only
    ReadUncommitted,
    /// Sees the latest committed version at each read
    ReadCommitted,
    /// All reads as of the transaction's read timestamp
    RepeatableRead,
    /// RepeatableRead plus first-committer-wins write validation
    Serializable,
}

/// Build pipeline knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Upper bound on concurrently running build jobs
    pub max_parallel_jobs: usize,
    /// System CPU load (0.0..1.0) above which admission clamps to one job
    pub cpu_load_threshold: f32,
    /// Per-job wall-clock timeout
    pub job_timeout: Duration,
    /// Per-path debounce window for change events
    pub debounce: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            max_parallel_jobs: num_cpus_or_default(),
            cpu_load_threshold: 0.85,
            job_timeout: Duration::from_secs(120),
            debounce: Duration::from_millis(50),
        }
    }
}

fn num_cpus_or_default() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Artifact security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Reject artifacts whose header carries no valid signature
    pub require_signature: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            require_signature: false,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding the WAL, snapshots and manifest for this instance
    pub root_dir: PathBuf,
    /// Scheduler poll period in frames; work is only considered every Nth tick
    pub check_interval_frames: u64,
    /// Hard cap on per-frame reload time in nanoseconds
    pub max_frame_budget_ns: u64,
    /// Allow the budget to scale with observed frame-time headroom
    pub adaptive_budgeting: bool,
    /// Registry capacity
    pub max_concurrent_modules: usize,
    /// Allocation ceiling for snapshot bytes held in memory
    pub memory_pool_bytes: u64,
    /// WAL durability level
    pub wal_durability: DurabilityLevel,
    /// Default isolation for transactions that do not request one
    pub default_isolation: IsolationLevel,
    /// Build pipeline configuration
    pub build: BuildConfig,
    /// Artifact security policy
    pub security: SecurityConfig,
    /// Keep at most this many snapshots per module (beyond required ones)
    pub snapshot_retention_count: usize,
    /// Drop retained snapshots older than this
    pub snapshot_retention_age: Duration,
    /// Snapshots larger than this are compressed on disk
    pub compression_threshold_bytes: usize,
    /// Phase-1 wait bound for multi-module commits
    pub phase1_timeout: Duration,
    /// Deadline applied to every transaction at begin
    pub txn_deadline: Duration,
}

impl RuntimeConfig {
    /// Configuration rooted at `dir` with production defaults.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RuntimeConfig {
            root_dir: dir.into(),
            check_interval_frames: 60,
            max_frame_budget_ns: 2_000_000,
            adaptive_budgeting: false,
            max_concurrent_modules: 256,
            memory_pool_bytes: 256 * 1024 * 1024,
            wal_durability: DurabilityLevel::FsyncOnCommit,
            default_isolation: IsolationLevel::Serializable,
            build: BuildConfig::default(),
            security: SecurityConfig::default(),
            snapshot_retention_count: 8,
            snapshot_retention_age: Duration::from_secs(3600),
            compression_threshold_bytes: 64 * 1024,
            phase1_timeout: Duration::from_millis(250),
            txn_deadline: Duration::from_secs(5),
        }
    }

    /// Fast settings for tests: every frame polls, no fsync batching
    /// surprises, short deadlines.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::new(dir);
        cfg.check_interval_frames = 1;
        cfg.wal_durability = DurabilityLevel::FsyncEveryRecord;
        cfg.build.job_timeout = Duration::from_secs(5);
        cfg.build.debounce = Duration::from_millis(10);
        cfg.txn_deadline = Duration::from_secs(2);
        cfg
    }

    /// Directory for WAL segments
    pub fn wal_dir(&self) -> PathBuf {
        self.root_dir.join("wal")
    }

    /// Directory for snapshot files
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root_dir.join("snapshots")
    }

    /// Path of the registry manifest checkpoint
    pub fn manifest_path(&self) -> PathBuf {
        self.root_dir.join("registry.manifest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_paths() {
        let cfg = RuntimeConfig::new("/tmp/hs");
        assert_eq!(cfg.wal_dir(), PathBuf::from("/tmp/hs/wal"));
        assert_eq!(cfg.snapshots_dir(), PathBuf::from("/tmp/hs/snapshots"));
        assert_eq!(
            cfg.manifest_path(),
            PathBuf::from("/tmp/hs/registry.manifest")
        );
    }

    #[test]
    fn test_defaults_are_sane() {
        let cfg = RuntimeConfig::new("/tmp/hs");
        assert_eq!(cfg.check_interval_frames, 60);
        assert!(cfg.build.max_parallel_jobs >= 1);
        assert!(cfg.build.cpu_load_threshold > 0.5);
        assert_eq!(cfg.default_isolation, IsolationLevel::Serializable);
        assert!(cfg.wal_durability.syncs_on_commit());
    }

    #[test]
    fn test_buffered_does_not_sync_on_commit() {
        assert!(!DurabilityLevel::Buffered.syncs_on_commit());
        assert!(DurabilityLevel::FsyncEveryRecord.syncs_on_commit());
    }

    #[test]
    fn test_testing_profile_polls_every_frame() {
        let cfg = RuntimeConfig::for_testing("/tmp/hs");
        assert_eq!(cfg.check_interval_frames, 1);
        assert_eq!(cfg.wal_durability, DurabilityLevel::FsyncEveryRecord);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = RuntimeConfig::new("/tmp/hs");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
