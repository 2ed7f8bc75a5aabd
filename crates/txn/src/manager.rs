//! Transaction manager
//!
//! Orchestrates reload transactions end to end: timestamps, per-step WAL
//! records, conflict detection, the single-module commit protocol and the
//! in-process two-phase variant for multi-module batches.
//!
//! ## Commit sequence (single module)
//!
//! ```text
//! 1. step_snapshot()  - capture pre-image, WAL Prepare        (pausable)
//! 2. detect_conflicts() / resolve_conflicts()
//! 3. step_migrate()   - migrate bytes, WAL StateMigrated      (pausable)
//! 4. commit()         - registry pointer swap, WAL Committed  (atomic)
//! ```
//!
//! A crash before the Committed record rolls the transaction back on
//! recovery; after it, recovery re-applies idempotently. The registry swap
//! inside `commit` is the single linearization point — readers observe the
//! old image until that instant and the new one after it.
//!
//! ## Multi-module (2PC)
//!
//! Phase 1 runs steps 1–3 per participant (each bounded by the phase-1
//! timeout), phase 2 writes `GlobalCommit`, swaps every participant in
//! topological dependency order under entry locks taken in ascending
//! module-id order, then writes each participant's `Committed` record.

use crate::conflict::{
    action_for_module, dependency_violation, detect_version_conflicts, resolve_conflicts,
    ConflictAction, ResolutionStrategy,
};
use crate::context::{TransactionContext, TxnState, TxnType};
use crate::deadlock::WaitGraph;
use crate::merge::{three_way_merge, MergeInput};
use crate::mvcc::{LogicalClock, MvccTable};
use dashmap::DashMap;
use hotswap_core::{
    Event, EventBus, HotswapError, IsolationLevel, ModuleId, Result, SnapshotId, TxnId,
};
use hotswap_durability::{WalHandle, WalOp};
use hotswap_registry::{CodeImage, LifecycleState, ModuleRegistry};
use hotswap_state::{MigrationEngine, StateStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct ActiveTxn {
    read_ts: u64,
    pre_snapshots: Vec<SnapshotId>,
}

/// Coordinates reload transactions over the registry, state store and WAL.
pub struct TxnManager {
    registry: Arc<ModuleRegistry>,
    store: Arc<StateStore>,
    wal: WalHandle,
    events: Arc<EventBus>,
    mvcc: Arc<MvccTable>,
    migration: MigrationEngine,
    clock: LogicalClock,
    next_txn_id: AtomicU64,
    next_conflict_id: AtomicU64,
    commit_locks: DashMap<ModuleId, Arc<Mutex<()>>>,
    active: DashMap<TxnId, ActiveTxn>,
    poison: DashMap<TxnId, String>,
    waits: WaitGraph,
    degraded: Arc<AtomicBool>,
    default_isolation: IsolationLevel,
    txn_deadline: Duration,
    phase1_timeout: Duration,
}

impl TxnManager {
    /// Create a manager over already-opened services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ModuleRegistry>,
        store: Arc<StateStore>,
        wal: WalHandle,
        events: Arc<EventBus>,
        degraded: Arc<AtomicBool>,
        default_isolation: IsolationLevel,
        txn_deadline: Duration,
        phase1_timeout: Duration,
    ) -> Self {
        TxnManager {
            registry,
            store,
            wal,
            events,
            mvcc: Arc::new(MvccTable::new()),
            migration: MigrationEngine::new(),
            clock: LogicalClock::new(0),
            next_txn_id: AtomicU64::new(1),
            next_conflict_id: AtomicU64::new(1),
            commit_locks: DashMap::new(),
            active: DashMap::new(),
            poison: DashMap::new(),
            waits: WaitGraph::new(),
            degraded,
            default_isolation,
            txn_deadline,
            phase1_timeout,
        }
    }

    /// Seed counters after recovery so ids never repeat.
    pub fn seed_after_recovery(&self, max_txn_id: TxnId) {
        self.next_txn_id
            .store(max_txn_id.as_u64() + 1, Ordering::SeqCst);
    }

    /// The MVCC table (shared with the GC thread).
    pub fn mvcc(&self) -> Arc<MvccTable> {
        Arc::clone(&self.mvcc)
    }

    /// Open a transaction.
    pub fn begin(
        &self,
        ty: TxnType,
        isolation: Option<IsolationLevel>,
    ) -> Result<TransactionContext> {
        if self.degraded.load(Ordering::Acquire) {
            return Err(HotswapError::Degraded);
        }
        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let read_ts = self.clock.tick();
        let mut ctx = TransactionContext::new(
            txn_id,
            ty,
            isolation.unwrap_or(self.default_isolation),
            read_ts,
            Instant::now() + self.txn_deadline,
        );

        let op_id = ctx.next_op_id();
        self.wal_append(&mut ctx, op_id, WalOp::TxnBegin { txn_kind: ty.kind_tag() })?;
        self.active.insert(
            txn_id,
            ActiveTxn {
                read_ts,
                pre_snapshots: Vec::new(),
            },
        );
        debug!(txn = %txn_id, ?ty, read_ts, "transaction begun");
        Ok(ctx)
    }

    /// Capture the pre-image of one staged module and write its WAL
    /// `Prepare` record. Safe to pause between calls.
    pub fn step_snapshot(&self, ctx: &mut TransactionContext, module: ModuleId) -> Result<()> {
        self.check_poison(ctx)?;
        self.check_deadline(ctx)?;
        let entry = self.registry.entry(module)?;
        let update = ctx
            .update_mut(module)
            .ok_or(HotswapError::ModuleNotFound { module })?;
        if update.prepared {
            return Ok(());
        }

        // Lifecycle: a live module enters ReloadInProgress, a fresh one Loading.
        match entry.state() {
            LifecycleState::Active => {
                entry.set_state(LifecycleState::ReloadPending)?;
                entry.set_state(LifecycleState::ReloadInProgress)?;
            }
            LifecycleState::ReloadPending => entry.set_state(LifecycleState::ReloadInProgress)?,
            LifecycleState::Unloaded => entry.set_state(LifecycleState::Loading)?,
            LifecycleState::Failed => entry.set_state(LifecycleState::Loading)?,
            LifecycleState::Quarantined => {
                return Err(HotswapError::invalid_argument(format!(
                    "module {} is quarantined",
                    module
                )));
            }
            LifecycleState::Loading | LifecycleState::ReloadInProgress => {}
        }

        let pre_version = entry.current_version();
        let live_bytes = match (&update.staged_state, entry.image()) {
            (Some(staged), _) => staged.clone(),
            (None, Some(_)) => entry.interface().serialize_state()?,
            (None, None) => Vec::new(),
        };

        let parent = self.store.current(module);
        let snapshot_version = pre_version.unwrap_or(update.new_version);
        let pre_snapshot = self
            .store
            .capture(module, snapshot_version, &live_bytes, parent)?;

        update.pre_version = pre_version;
        update.pre_snapshot = Some(pre_snapshot);
        update.prepared = true;
        let new_version = update.new_version;

        if let Some(mut active) = self.active.get_mut(&ctx.txn_id) {
            active.pre_snapshots.push(pre_snapshot);
        }

        let op_id = ctx.next_op_id();
        self.wal_append(
            ctx,
            op_id,
            WalOp::Prepare {
                module,
                new_version,
                pre_snapshot: Some(pre_snapshot),
            },
        )?;
        Ok(())
    }

    /// Detect conflicts across all staged updates. Returns the number of
    /// conflicts found in this pass.
    pub fn detect_conflicts(&self, ctx: &mut TransactionContext) -> Result<usize> {
        self.check_poison(ctx)?;
        let mut next_id = self.next_conflict_id.load(Ordering::SeqCst);
        let mut found = Vec::new();

        let staged: HashMap<String, (ModuleId, hotswap_core::ModuleVersion)> = ctx
            .updates
            .iter()
            .map(|u| (u.image.module_name.clone(), (u.module, u.new_version)))
            .collect();

        for update in &ctx.updates {
            let current = self
                .mvcc
                .visible(update.module, ctx.isolation, ctx.read_ts)
                .map(|r| r.version)
                .or_else(|| {
                    self.registry
                        .entry(update.module)
                        .ok()
                        .and_then(|e| e.current_version())
                });
            found.extend(detect_version_conflicts(
                &mut next_id,
                update.module,
                current,
                update.new_version,
            ));

            // Dependencies must be satisfied by the proposed set or by
            // modules already active outside it.
            for req in &update.image.dependencies {
                let satisfied = match staged.get(&req.name) {
                    Some((_, version)) => version.satisfies(&req.min_version),
                    None => self
                        .registry
                        .lookup(&req.name)
                        .and_then(|id| self.registry.entry(id).ok())
                        .map(|e| {
                            e.state() == LifecycleState::Active
                                && e.current_version()
                                    .map(|v| v.satisfies(&req.min_version))
                                    .unwrap_or(false)
                        })
                        .unwrap_or(false),
                };
                if !satisfied {
                    found.push(dependency_violation(
                        &mut next_id,
                        update.module,
                        update.new_version,
                        &req.name,
                        req.min_version,
                    ));
                }
            }
        }
        self.next_conflict_id.store(next_id, Ordering::SeqCst);

        for record in &found {
            warn!(
                txn = %ctx.txn_id,
                module = %record.module,
                kind = %record.kind,
                severity = record.severity,
                "conflict detected"
            );
            self.events.publish(Event::ConflictDetected {
                module: record.module,
                kind: record.kind.to_string(),
                severity: record.severity,
            });
        }

        let count = found.len();
        ctx.conflicts.extend(found);
        Ok(count)
    }

    /// Apply a resolution strategy. Returns how many records it resolved.
    pub fn resolve_conflicts(
        &self,
        ctx: &mut TransactionContext,
        strategy: ResolutionStrategy,
    ) -> usize {
        let resolved = resolve_conflicts(&mut ctx.conflicts, strategy);
        for update in ctx.updates.iter_mut() {
            if let Some(action) = action_for_module(&ctx.conflicts, update.module) {
                update.action = Some(action);
            }
        }
        resolved
    }

    /// Migrate one module's state and write its WAL `StateMigrated` record.
    /// Safe to pause between calls.
    pub fn step_migrate(&self, ctx: &mut TransactionContext, module: ModuleId) -> Result<()> {
        self.check_poison(ctx)?;
        self.check_deadline(ctx)?;
        let entry = self.registry.entry(module)?;
        let interface = entry.interface();

        let update = ctx
            .update_mut(module)
            .ok_or(HotswapError::ModuleNotFound { module })?;
        if update.migrated || !update.is_effective() {
            return Ok(());
        }
        if !update.prepared {
            return Err(HotswapError::internal(format!(
                "module {} migrate before snapshot in {}",
                module, ctx.txn_id
            )));
        }

        let pre_snapshot = update
            .pre_snapshot
            .ok_or_else(|| HotswapError::internal("prepared update lacks pre-image"))?;
        let pre = self.store.load(module, pre_snapshot)?;
        let from_version = update.pre_version.unwrap_or(update.new_version);

        let migrated = if update.action == Some(ConflictAction::Merge) {
            // Three-way merge over the lineage ancestor.
            let current_snapshot = self
                .store
                .current(module)
                .ok_or_else(|| HotswapError::ConflictUnmergeable {
                    module,
                    reason: "no committed snapshot to merge against".to_string(),
                })?;
            let ancestor = self
                .store
                .common_ancestor(module, current_snapshot, pre_snapshot)
                .ok_or_else(|| HotswapError::ConflictUnmergeable {
                    module,
                    reason: "no common ancestor in snapshot lineage".to_string(),
                })?;
            let base = self.store.load(module, ancestor)?;
            let current = self.store.load(module, current_snapshot)?;
            three_way_merge(
                module,
                &interface,
                MergeInput {
                    base: &base.bytes,
                    current: &current.bytes,
                    incoming: &pre.bytes,
                    current_version: from_version,
                    incoming_version: update.new_version,
                },
            )?
        } else {
            self.migration
                .migrate(module, &interface, &from_version, &update.new_version, &pre.bytes)?
                .bytes
        };

        // Byte-level diff for observers; never part of commit correctness.
        let diff = hotswap_state::compute_diff(&pre.bytes, &migrated, hotswap_state::DEFAULT_CHUNK_SIZE);
        debug!(
            module = %module,
            changed = diff.bytes_changed,
            total = diff.total_len,
            ranges = diff.ranges.len(),
            "state diff"
        );

        let post_snapshot =
            self.store
                .capture(module, update.new_version, &migrated, Some(pre_snapshot))?;
        update.post_snapshot = Some(post_snapshot);
        update.migrated = true;
        let new_version = update.new_version;
        let image = Arc::clone(&update.image);

        let staged_ts = self.clock.tick();
        let version_id = self.mvcc.stage(
            ctx.txn_id,
            module,
            staged_ts,
            new_version,
            Some(post_snapshot),
            Some(image),
        );
        ctx.mvcc_versions.push(version_id);

        let op_id = ctx.next_op_id();
        self.wal_append(
            ctx,
            op_id,
            WalOp::StateMigrated {
                module,
                post_snapshot,
            },
        )?;

        self.events.publish(Event::StateMigrated {
            module,
            from: from_version,
            to: new_version,
            snapshot: post_snapshot,
        });
        Ok(())
    }

    /// Phase 1: finish outstanding snapshot and migrate steps, then mark the
    /// transaction Prepared. Each participant's remaining work is bounded by
    /// the phase-1 timeout; exceeding it is an abort vote.
    pub fn prepare(&self, ctx: &mut TransactionContext) -> Result<()> {
        self.check_poison(ctx)?;
        ctx.require_state(TxnState::Active)?;
        ctx.transition(TxnState::Preparing)?;

        let phase1_deadline = Instant::now() + self.phase1_timeout;
        let modules = ctx.modules();
        for module in &modules {
            if Instant::now() >= phase1_deadline {
                return Err(HotswapError::TransactionAborted {
                    txn: ctx.txn_id,
                    reason: format!("participant {} missed the phase-1 deadline", module),
                });
            }
            if !ctx.update_for(*module).map(|u| u.prepared).unwrap_or(false) {
                self.step_snapshot(ctx, *module)?;
            }
        }
        for module in &modules {
            if Instant::now() >= phase1_deadline {
                return Err(HotswapError::TransactionAborted {
                    txn: ctx.txn_id,
                    reason: format!("participant {} missed the phase-1 deadline", module),
                });
            }
            let needs_migrate = ctx
                .update_for(*module)
                .map(|u| !u.migrated && u.is_effective())
                .unwrap_or(false);
            if needs_migrate {
                self.step_migrate(ctx, *module)?;
            }
        }

        for update in ctx.effective_updates() {
            self.registry.entry(update.module)?.interface().on_reload_prepared();
        }
        ctx.transition(TxnState::Prepared)?;
        self.events.publish(Event::TransactionPrepared { txn: ctx.txn_id });
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// A still-Active context is prepared first (single-call commit).
    /// Unresolved conflicts yield `ConflictUnresolved` and leave the
    /// registry untouched; the caller then aborts.
    pub fn commit(&self, ctx: &mut TransactionContext) -> Result<()> {
        self.check_poison(ctx)?;
        self.check_deadline(ctx)?;
        if ctx.state() == TxnState::Active {
            self.prepare(ctx)?;
        }
        ctx.require_state(TxnState::Prepared)?;

        let unresolved = ctx.unresolved_conflicts();
        if unresolved > 0 {
            return Err(HotswapError::ConflictUnresolved {
                txn: ctx.txn_id,
                count: unresolved,
            });
        }
        ctx.transition(TxnState::Committing)?;

        let effective: Vec<ModuleId> = ctx.effective_updates().map(|u| u.module).collect();
        if effective.is_empty() {
            // Everything resolved to KeepCurrent; commit as a no-op.
            let op_id = ctx.next_op_id();
            self.wal_append(ctx, op_id, WalOp::Committed { modules: vec![] })?;
            ctx.transition(TxnState::Committed)?;
            self.finish(ctx.txn_id);
            self.restore_lifecycle_after_noop(ctx);
            self.events.publish(Event::TransactionCommitted {
                txn: ctx.txn_id,
                modules: vec![],
            });
            return Ok(());
        }

        // Serializable: first committer wins on every touched module.
        let write_ts = self.clock.tick();
        ctx.write_ts = Some(write_ts);
        if ctx.isolation == IsolationLevel::Serializable {
            for module in &effective {
                if let Some(committed) = self.mvcc.newest_committed_ts(*module) {
                    if committed > ctx.read_ts {
                        return Err(HotswapError::TransactionAborted {
                            txn: ctx.txn_id,
                            reason: format!(
                                "write conflict on {}: committed at ts {} after read ts {}",
                                module, committed, ctx.read_ts
                            ),
                        });
                    }
                }
            }
        }

        // Entry writer locks in ascending module-id order (updates are kept
        // sorted), so concurrent batches cannot deadlock.
        let lock_handles: Vec<Arc<Mutex<()>>> = effective
            .iter()
            .map(|m| Arc::clone(&self.commit_locks.entry(*m).or_default()))
            .collect();
        let _locks: Vec<_> = lock_handles.iter().map(|l| l.lock()).collect();

        // Commit order is topological over the proposed dependency graph.
        let mut proposed: HashMap<ModuleId, Vec<ModuleId>> = HashMap::new();
        for update in ctx.effective_updates() {
            let mut deps: Vec<ModuleId> = update
                .image
                .dependencies
                .iter()
                .filter_map(|req| self.registry.lookup(&req.name))
                .collect();
            deps.extend(
                ctx.extra_deps
                    .iter()
                    .filter(|(m, _)| *m == update.module)
                    .map(|(_, d)| *d),
            );
            proposed.insert(update.module, deps);
        }
        let order = self.registry.topo_order(&effective, &proposed)?;

        let multi = order.len() > 1;
        if multi {
            let op_id = ctx.next_op_id();
            self.wal_append(ctx, op_id, WalOp::GlobalCommit)?;
        }

        // The swap loop. Dependencies were validated during conflict
        // detection and are re-checked by activate(); a failure here rolls
        // back every already-published participant.
        let mut published: Vec<(ModuleId, Option<Arc<CodeImage>>)> = Vec::new();
        for module in &order {
            let image = Arc::clone(
                &ctx.update_for(*module)
                    .ok_or_else(|| HotswapError::internal("ordered module not staged"))?
                    .image,
            );
            match self.registry.activate(*module, image) {
                Ok(prior) => published.push((*module, prior)),
                Err(e) => {
                    error!(txn = %ctx.txn_id, module = %module, error = %e, "swap failed mid-batch; rolling back");
                    for (m, prior) in published.into_iter().rev() {
                        if let (Ok(entry), Some(prior)) = (self.registry.entry(m), prior) {
                            entry.publish_image(prior);
                        }
                    }
                    if multi {
                        let op_id = ctx.next_op_id();
                        let _ = self.wal_append(ctx, op_id, WalOp::GlobalAbort);
                    }
                    return Err(e);
                }
            }
        }

        // Per-participant Committed records, post-state install, bookkeeping.
        for module in &order {
            let (new_version, post_snapshot) = {
                let update = ctx.update_for(*module).expect("ordered module staged");
                (update.new_version, update.post_snapshot)
            };
            let op_id = ctx.next_op_id();
            self.wal_append(
                ctx,
                op_id,
                WalOp::Committed {
                    modules: vec![(*module, new_version, post_snapshot)],
                },
            )?;

            let entry = self.registry.entry(*module)?;
            if let Some(snapshot) = post_snapshot {
                self.store.mark_committed(*module, snapshot)?;
                entry.set_current_snapshot(Some(snapshot));
                let post = self.store.load(*module, snapshot)?;
                entry.interface().deserialize_state(&post.bytes)?;
            }
            match entry.state() {
                LifecycleState::ReloadInProgress | LifecycleState::Loading => {
                    entry.set_state(LifecycleState::Active)?;
                }
                _ => {}
            }
            entry.interface().on_reload_committed();
        }

        self.mvcc.commit(ctx.txn_id, write_ts);
        ctx.transition(TxnState::Committed)?;
        self.finish(ctx.txn_id);

        self.events.publish(Event::TransactionCommitted {
            txn: ctx.txn_id,
            modules: order.clone(),
        });
        for module in &order {
            let update = ctx.update_for(*module).expect("ordered module staged");
            self.events.publish(Event::ReloadCompleted {
                module: *module,
                version: update.new_version,
                duration_us: ctx.begun.elapsed().as_micros() as u64,
            });
        }
        info!(txn = %ctx.txn_id, modules = order.len(), write_ts, "transaction committed");
        Ok(())
    }

    /// Abort the transaction, restoring lifecycle states. Nothing was
    /// published before commit, so the registry and live state are already
    /// the pre-transaction ones.
    pub fn abort(&self, ctx: &mut TransactionContext, reason: &str) -> Result<()> {
        if ctx.state().is_terminal() {
            return Err(HotswapError::transaction_state(
                ctx.txn_id,
                ctx.state().to_string(),
                "non-terminal",
            ));
        }
        ctx.transition(TxnState::Aborting)?;

        let op_id = ctx.next_op_id();
        // A WAL failure during abort moves the transaction to Failed; no
        // record beyond the attempted one is written.
        if let Err(e) = self.wal.append(ctx.txn_id, op_id, WalOp::Aborted) {
            self.enter_degraded(&e);
            let _ = ctx.transition(TxnState::Failed);
            self.mvcc.abort(ctx.txn_id);
            self.finish(ctx.txn_id);
            return Err(e);
        }

        self.mvcc.abort(ctx.txn_id);
        for update in &ctx.updates {
            if let Ok(entry) = self.registry.entry(update.module) {
                match entry.state() {
                    LifecycleState::ReloadInProgress => {
                        if entry.record_failure() {
                            entry.set_state(LifecycleState::Quarantined)?;
                            warn!(module = %update.module, "module quarantined after repeated reload failures");
                        } else {
                            entry.set_state(LifecycleState::Active)?;
                        }
                    }
                    LifecycleState::Loading => entry.set_state(LifecycleState::Failed)?,
                    _ => {}
                }
                entry.interface().on_reload_aborted();
                self.events.publish(Event::ReloadFailed {
                    module: update.module,
                    reason: reason.to_string(),
                });
            }
        }

        ctx.transition(TxnState::Aborted)?;
        self.finish(ctx.txn_id);
        self.events.publish(Event::TransactionAborted {
            txn: ctx.txn_id,
            reason: reason.to_string(),
        });
        info!(txn = %ctx.txn_id, reason, "transaction aborted");
        Ok(())
    }

    /// Explicit module rollback to an earlier committed version.
    ///
    /// The only sanctioned way a module's committed version moves backward;
    /// the WAL `Rollback` record makes the reversal auditable.
    pub fn rollback_module(
        &self,
        module: ModuleId,
        to_version: &hotswap_core::ModuleVersion,
    ) -> Result<()> {
        let record = self
            .mvcc
            .find_version(module, to_version)
            .ok_or_else(|| HotswapError::invalid_argument(format!(
                "no committed record of {} at {}",
                module, to_version
            )))?;
        let image = record
            .image
            .clone()
            .ok_or_else(|| HotswapError::invalid_argument("record holds no code image"))?;

        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        self.wal
            .append(
                txn_id,
                0,
                WalOp::Rollback {
                    module,
                    to_version: *to_version,
                    to_snapshot: record.snapshot,
                },
            )
            .map_err(|e| {
                self.enter_degraded(&e);
                e
            })?;

        let entry = self.registry.entry(module)?;
        self.registry.activate(module, Arc::clone(&image))?;
        if let Some(snapshot) = record.snapshot {
            let state = self.store.load(module, snapshot)?;
            entry.interface().deserialize_state(&state.bytes)?;
            entry.set_current_snapshot(Some(snapshot));
        }
        let write_ts = self.clock.tick();
        self.mvcc.stage(
            txn_id,
            module,
            write_ts,
            *to_version,
            record.snapshot,
            Some(image),
        );
        self.mvcc.commit(txn_id, write_ts);
        info!(module = %module, version = %to_version, "module rolled back");
        Ok(())
    }

    /// Mark a transaction for abort (deadline or deadlock). The owner
    /// observes the poison at its next step.
    pub fn poison(&self, txn: TxnId, reason: impl Into<String>) {
        self.poison.insert(txn, reason.into());
    }

    /// Record that `waiter` is blocked on `holder` (deadlock tracking).
    pub fn note_wait(&self, waiter: TxnId, holder: TxnId) {
        self.waits.add_wait(waiter, holder);
    }

    /// Sweep for deadlocks; poisons and returns the victim if a cycle
    /// exists.
    pub fn deadlock_sweep(&self) -> Option<TxnId> {
        let victim = self.waits.pick_victim()?;
        self.poison(victim, "deadlock victim");
        self.waits.remove_txn(victim);
        warn!(txn = %victim, "deadlock cycle broken");
        Some(victim)
    }

    /// Oldest read timestamp any active transaction can see; the MVCC GC
    /// horizon.
    pub fn gc_horizon(&self) -> u64 {
        self.active
            .iter()
            .map(|a| a.read_ts)
            .min()
            .unwrap_or_else(|| self.clock.now())
    }

    /// Pre-image snapshots of live transactions; protected from retention.
    pub fn protected_snapshots(&self) -> HashSet<SnapshotId> {
        self.active
            .iter()
            .flat_map(|a| a.pre_snapshots.clone())
            .collect()
    }

    /// Number of open transactions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn check_poison(&self, ctx: &TransactionContext) -> Result<()> {
        if let Some(reason) = self.poison.get(&ctx.txn_id) {
            if reason.contains("deadlock") {
                return Err(HotswapError::Deadlock { victim: ctx.txn_id });
            }
            return Err(HotswapError::DeadlineExpired { txn: ctx.txn_id });
        }
        Ok(())
    }

    fn check_deadline(&self, ctx: &TransactionContext) -> Result<()> {
        if ctx.deadline_expired() {
            return Err(HotswapError::DeadlineExpired { txn: ctx.txn_id });
        }
        Ok(())
    }

    fn wal_append(&self, ctx: &mut TransactionContext, op_id: u32, op: WalOp) -> Result<()> {
        match self.wal.append(ctx.txn_id, op_id, op) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.enter_degraded(&e);
                // Transaction is non-recoverable; one Failed record is
                // attempted, nothing further.
                let _ = self.wal.append(ctx.txn_id, ctx.next_op_id(), WalOp::Failed);
                while !ctx.state().is_terminal() {
                    let next = match ctx.state() {
                        TxnState::Active
                        | TxnState::Preparing
                        | TxnState::Prepared
                        | TxnState::Committing
                        | TxnState::Aborting => TxnState::Failed,
                        _ => break,
                    };
                    if ctx.transition(next).is_err() {
                        break;
                    }
                }
                self.mvcc.abort(ctx.txn_id);
                self.finish(ctx.txn_id);
                Err(e)
            }
        }
    }

    fn enter_degraded(&self, error: &HotswapError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!(error = %error, "WAL unhealthy; runtime entering degraded mode");
        }
    }

    fn restore_lifecycle_after_noop(&self, ctx: &TransactionContext) {
        for update in &ctx.updates {
            if let Ok(entry) = self.registry.entry(update.module) {
                match entry.state() {
                    LifecycleState::ReloadInProgress => {
                        let _ = entry.set_state(LifecycleState::Active);
                    }
                    LifecycleState::Loading => {
                        let _ = entry.set_state(LifecycleState::Failed);
                    }
                    _ => {}
                }
            }
        }
    }

    fn finish(&self, txn: TxnId) {
        self.active.remove(&txn);
        self.poison.remove(&txn);
        self.waits.remove_txn(txn);
    }
}
