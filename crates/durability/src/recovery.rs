//! Crash recovery
//!
//! Replays the WAL into a [`RecoveryPlan`]: which transactions committed
//! (and must be re-applied idempotently), which must be rolled back to
//! their pre-images, and which snapshots remain referenced. The engine
//! applies the plan against its registry and state store; this module only
//! interprets the log.
//!
//! Replay rules:
//! - A transaction with a `Committed` or `GlobalCommit` record committed.
//!   Its module set comes from the `Committed` payload when present, else
//!   from the `Prepare`/`StateMigrated` records (a 2PC participant may have
//!   crashed between the coordinator's decision and its own record).
//! - Everything else rolls back: pre-images from `Prepare` are restored.
//! - A damaged tail is physically truncated before the plan is built, so a
//!   subsequent writer open starts from the last good record.

use crate::reader::{WalReadOutcome, WalReader};
use crate::record::{WalOp, WalRecord};
use hotswap_core::{Lsn, ModuleId, ModuleVersion, Result, SnapshotId, TxnId};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{info, warn};

/// One module's committed outcome within a recovered transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleCommit {
    /// Module
    pub module: ModuleId,
    /// Version that committed
    pub version: ModuleVersion,
    /// Committed state snapshot
    pub snapshot: Option<SnapshotId>,
}

/// A transaction that must be re-applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTxn {
    /// Transaction id
    pub txn: TxnId,
    /// Per-module outcomes
    pub modules: Vec<ModuleCommit>,
}

/// A transaction that must be rolled back.
#[derive(Debug, Clone, PartialEq)]
pub struct RolledBackTxn {
    /// Transaction id
    pub txn: TxnId,
    /// Pre-images to restore, one per touched module
    pub pre_images: Vec<(ModuleId, Option<SnapshotId>)>,
}

/// Statistics from one recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Intact records read
    pub records_read: usize,
    /// Transactions re-applied
    pub txns_committed: usize,
    /// Transactions rolled back
    pub txns_rolled_back: usize,
    /// Whether a damaged tail was discarded
    pub tail_truncated: bool,
}

/// Everything the engine needs to finish recovery.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// Transactions to re-apply, in commit (LSN) order
    pub committed: Vec<CommittedTxn>,
    /// Transactions to roll back
    pub rolled_back: Vec<RolledBackTxn>,
    /// Snapshots referenced by the plan; everything else is an orphan
    pub referenced_snapshots: HashSet<SnapshotId>,
    /// Highest LSN seen
    pub max_lsn: Option<Lsn>,
    /// Highest transaction id seen
    pub max_txn_id: TxnId,
    /// Stats
    pub stats: RecoveryStats,
}

/// Builds a [`RecoveryPlan`] from the WAL directory.
pub struct RecoveryCoordinator {
    wal_dir: PathBuf,
}

struct TxnTrace {
    first_lsn: Lsn,
    ops: Vec<WalOp>,
}

impl RecoveryCoordinator {
    /// Coordinator over the given WAL directory.
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        RecoveryCoordinator {
            wal_dir: wal_dir.into(),
        }
    }

    /// Scan, truncate any damaged tail, and build the plan.
    pub fn recover(&self) -> Result<RecoveryPlan> {
        let reader = WalReader::new();
        let outcome = reader.read_all(&self.wal_dir)?;

        let mut stats = RecoveryStats {
            records_read: outcome.records.len(),
            ..RecoveryStats::default()
        };
        if let Some(corruption) = &outcome.corruption {
            warn!(
                segment = corruption.segment,
                offset = corruption.offset,
                "recovery truncating damaged WAL tail"
            );
            reader.truncate_corrupt_tail(&self.wal_dir, corruption)?;
            stats.tail_truncated = true;
        }

        let plan = Self::build_plan(&outcome, stats);
        info!(
            committed = plan.stats.txns_committed,
            rolled_back = plan.stats.txns_rolled_back,
            records = plan.stats.records_read,
            "recovery plan built"
        );
        Ok(plan)
    }

    fn build_plan(outcome: &WalReadOutcome, mut stats: RecoveryStats) -> RecoveryPlan {
        // BTreeMap keyed by first LSN keeps commit order deterministic.
        let mut traces: BTreeMap<TxnId, TxnTrace> = BTreeMap::new();
        let mut max_txn_id = TxnId(0);
        for record in &outcome.records {
            let WalRecord { txn_id, op, lsn, .. } = record;
            max_txn_id = max_txn_id.max(*txn_id);
            traces
                .entry(*txn_id)
                .or_insert_with(|| TxnTrace {
                    first_lsn: *lsn,
                    ops: Vec::new(),
                })
                .ops
                .push(op.clone());
        }

        let mut ordered: Vec<(TxnId, TxnTrace)> = traces.into_iter().collect();
        ordered.sort_by_key(|(_, t)| t.first_lsn);

        let mut plan = RecoveryPlan {
            max_lsn: outcome.max_lsn,
            max_txn_id,
            ..RecoveryPlan::default()
        };

        for (txn, trace) in ordered {
            if txn == TxnId(0) {
                // Txn 0 carries non-transactional markers (checkpoints).
                continue;
            }
            let decided_commit = trace
                .ops
                .iter()
                .any(|op| matches!(op, WalOp::Committed { .. } | WalOp::GlobalCommit));

            if decided_commit {
                let committed = Self::committed_from_trace(txn, &trace.ops);
                for m in &committed.modules {
                    if let Some(s) = m.snapshot {
                        plan.referenced_snapshots.insert(s);
                    }
                }
                // Pre-images of committed transactions stay referenced until
                // retention decides otherwise; rollback after re-apply must
                // remain possible.
                for op in &trace.ops {
                    if let WalOp::Prepare {
                        pre_snapshot: Some(s),
                        ..
                    } = op
                    {
                        plan.referenced_snapshots.insert(*s);
                    }
                }
                stats.txns_committed += 1;
                plan.committed.push(committed);
            } else {
                let mut pre_images = Vec::new();
                for op in &trace.ops {
                    if let WalOp::Prepare {
                        module,
                        pre_snapshot,
                        ..
                    } = op
                    {
                        if let Some(s) = pre_snapshot {
                            plan.referenced_snapshots.insert(*s);
                        }
                        pre_images.push((*module, *pre_snapshot));
                    }
                }
                stats.txns_rolled_back += 1;
                plan.rolled_back.push(RolledBackTxn { txn, pre_images });
            }
        }

        plan.stats = stats;
        plan
    }

    fn committed_from_trace(txn: TxnId, ops: &[WalOp]) -> CommittedTxn {
        // Reconstruct every participant from the prepare phase, then overlay
        // explicit Committed payloads. A 2PC transaction writes one Committed
        // record per participant, and a crash can lose any suffix of them;
        // the prepare records plus the GlobalCommit decision are enough to
        // re-apply the missing participants idempotently.
        let mut modules: Vec<ModuleCommit> = Vec::new();
        for op in ops {
            match op {
                WalOp::Prepare {
                    module,
                    new_version,
                    ..
                } => {
                    modules.push(ModuleCommit {
                        module: *module,
                        version: *new_version,
                        snapshot: None,
                    });
                }
                WalOp::StateMigrated {
                    module,
                    post_snapshot,
                } => {
                    if let Some(m) = modules.iter_mut().find(|m| m.module == *module) {
                        m.snapshot = Some(*post_snapshot);
                    }
                }
                _ => {}
            }
        }
        for op in ops {
            if let WalOp::Committed { modules: explicit } = op {
                for (module, version, snapshot) in explicit {
                    match modules.iter_mut().find(|m| m.module == *module) {
                        Some(existing) => {
                            existing.version = *version;
                            if snapshot.is_some() {
                                existing.snapshot = *snapshot;
                            }
                        }
                        None => modules.push(ModuleCommit {
                            module: *module,
                            version: *version,
                            snapshot: *snapshot,
                        }),
                    }
                }
            }
        }
        CommittedTxn { txn, modules }
    }
}
