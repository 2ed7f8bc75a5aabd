//! Runtime status and statistics

use hotswap_registry::ModuleInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Coarse runtime phase reported by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    /// Ticking normally
    Running,
    /// Scheduler paused; events and builds continue
    Paused,
    /// Reloads disabled
    Disabled,
    /// Shut down; only status() remains meaningful
    ShutDown,
}

/// What one `frame_tick` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    /// Frame number the tick was called with
    pub frame: u64,
    /// Budget granted, nanoseconds
    pub budget_ns: u64,
    /// Budget consumed, nanoseconds
    pub consumed_ns: u64,
    /// Whether the tick did any reload work (polling interval + enablement)
    pub worked: bool,
    /// Artifacts drained from the build pipeline
    pub artifacts_drained: usize,
    /// Transactions committed this frame
    pub committed: usize,
    /// Transactions aborted this frame
    pub aborted: usize,
    /// Work deferred to a later frame on budget exhaustion
    pub deferred: usize,
}

impl FrameStats {
    pub(crate) fn skipped(frame: u64, budget_ns: u64) -> Self {
        FrameStats {
            frame,
            budget_ns,
            ..FrameStats::default()
        }
    }
}

/// Monotonic counters accumulated across the runtime's life.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    /// Total committed reload transactions
    pub commits: AtomicU64,
    /// Total aborted reload transactions
    pub aborts: AtomicU64,
    /// Total frames that deferred work on budget exhaustion
    pub deferrals: AtomicU64,
    /// Total conflicts detected
    pub conflicts: AtomicU64,
    /// Total artifacts consumed from the pipeline
    pub artifacts: AtomicU64,
}

impl RuntimeCounters {
    pub(crate) fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            artifacts: self.artifacts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RuntimeCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    /// Total committed reload transactions
    pub commits: u64,
    /// Total aborted reload transactions
    pub aborts: u64,
    /// Total frames that deferred work on budget exhaustion
    pub deferrals: u64,
    /// Total conflicts detected
    pub conflicts: u64,
    /// Total artifacts consumed from the pipeline
    pub artifacts: u64,
}

/// Full status snapshot returned by `status()`.
#[derive(Debug)]
pub struct RuntimeStatus {
    /// Coarse phase
    pub phase: RuntimePhase,
    /// True when the WAL is unhealthy and commits are rejected
    pub degraded: bool,
    /// Per-module info keyed by module name
    pub modules: HashMap<String, ModuleInfo>,
    /// Counter snapshot
    pub stats: RuntimeStats,
    /// Open transactions
    pub active_txns: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = RuntimeCounters::default();
        counters.commits.fetch_add(3, Ordering::Relaxed);
        counters.aborts.fetch_add(1, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.commits, 3);
        assert_eq!(snap.aborts, 1);
        assert_eq!(snap.deferrals, 0);
    }

    #[test]
    fn test_skipped_frame_stats() {
        let stats = FrameStats::skipped(42, 1_000_000);
        assert_eq!(stats.frame, 42);
        assert!(!stats.worked);
        assert_eq!(stats.consumed_ns, 0);
    }
}
