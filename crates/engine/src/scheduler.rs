//! Frame-budgeted reload scheduler
//!
//! Called exactly once per application frame from the frame thread. Each
//! tick drains ready artifacts, advances at most one reload transaction
//! through its step machine, and yields the moment the remaining budget no
//! longer covers the estimated cost of the next step. The transaction's
//! progress cursor lives in its context, so a paused reload resumes exactly
//! where it stopped on a later frame — the only steps that can be split
//! across frames are snapshotting and migration; the commit swap itself is
//! never paused.

use crate::status::{FrameStats, RuntimeCounters};
use hotswap_core::{Event, EventBus, HotswapError, Result};
use hotswap_pipeline::{BuildOutcome, BuildPipeline, BuildPriority};
use hotswap_registry::{ArtifactLoader, LifecycleState, ModuleRegistry};
use hotswap_txn::{ReloadPhase, ResolutionStrategy, TransactionContext, TxnManager, TxnType};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Target frame interval the adaptive budget steers around (60 Hz).
const TARGET_FRAME_NS: u64 = 16_666_667;

/// Sliding window length for adaptive budgeting.
const ADAPTIVE_WINDOW: usize = 60;

/// Most artifacts accepted from the pipeline in one tick.
const MAX_ARTIFACTS_PER_TICK: usize = 8;

/// Step kinds the scheduler budgets individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StepKind {
    Load,
    Snapshot,
    Conflicts,
    Migrate,
    Commit,
}

impl StepKind {
    fn default_estimate_ns(&self) -> f64 {
        match self {
            StepKind::Load => 200_000.0,
            StepKind::Snapshot => 150_000.0,
            StepKind::Conflicts => 50_000.0,
            StepKind::Migrate => 300_000.0,
            StepKind::Commit => 250_000.0,
        }
    }
}

struct PendingReload {
    ctx: TransactionContext,
    target: String,
}

struct AdaptiveState {
    last_tick: Option<Instant>,
    window: VecDeque<u64>,
    scale: f64,
}

enum StepOutcome {
    Progress,
    Committed,
}

/// Per-frame reload driver.
pub struct FrameScheduler {
    registry: Arc<ModuleRegistry>,
    manager: Arc<TxnManager>,
    pipeline: Arc<BuildPipeline>,
    loader: ArtifactLoader,
    events: Arc<EventBus>,
    counters: Arc<RuntimeCounters>,

    enabled: AtomicBool,
    paused: AtomicBool,
    check_interval: u64,
    hard_cap_ns: u64,
    adaptive_enabled: bool,

    adaptive: Mutex<AdaptiveState>,
    step_costs: Mutex<HashMap<StepKind, f64>>,
    pending: Mutex<Option<PendingReload>>,
    backlog: Mutex<VecDeque<BuildOutcome>>,
}

impl FrameScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<ModuleRegistry>,
        manager: Arc<TxnManager>,
        pipeline: Arc<BuildPipeline>,
        loader: ArtifactLoader,
        events: Arc<EventBus>,
        counters: Arc<RuntimeCounters>,
        check_interval: u64,
        hard_cap_ns: u64,
        adaptive_enabled: bool,
    ) -> Self {
        FrameScheduler {
            registry,
            manager,
            pipeline,
            loader,
            events,
            counters,
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            check_interval: check_interval.max(1),
            hard_cap_ns,
            adaptive_enabled,
            adaptive: Mutex::new(AdaptiveState {
                last_tick: None,
                window: VecDeque::with_capacity(ADAPTIVE_WINDOW),
                scale: 1.0,
            }),
            step_costs: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Enable or disable reload work entirely.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Pause (keep queueing builds, perform no reloads).
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Whether the scheduler is currently willing to work.
    pub fn is_active(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire)
    }

    /// True when a paused transaction is waiting for the next frame.
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Abort any in-flight transaction (shutdown path).
    pub fn abort_pending(&self, reason: &str) {
        if let Some(mut pending) = self.pending.lock().take() {
            if let Err(e) = self.manager.abort(&mut pending.ctx, reason) {
                warn!(error = %e, "failed to abort pending transaction");
            }
            self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One frame of reload work.
    pub fn tick(&self, frame: u64, budget_ns: u64) -> Result<FrameStats> {
        let observed_scale = self.observe_frame();
        if !self.is_active() {
            return Ok(FrameStats::skipped(frame, budget_ns));
        }
        if frame % self.check_interval != 0 {
            return Ok(FrameStats::skipped(frame, budget_ns));
        }

        let effective = if self.adaptive_enabled {
            ((budget_ns as f64 * observed_scale) as u64).min(self.hard_cap_ns)
        } else {
            budget_ns.min(self.hard_cap_ns)
        };

        let started = Instant::now();
        let mut stats = FrameStats {
            frame,
            budget_ns: effective,
            worked: true,
            ..FrameStats::default()
        };

        self.refill_backlog(&mut stats);

        loop {
            let remaining = effective.saturating_sub(started.elapsed().as_nanos() as u64);

            let mut pending_slot = self.pending.lock();
            if pending_slot.is_none() {
                drop(pending_slot);
                if !self.start_next_reload(remaining, &mut stats)? {
                    break;
                }
                continue;
            }

            let pending = pending_slot.as_mut().expect("checked above");
            let next_step = Self::next_step(&pending.ctx);
            let estimate = self.estimate_ns(next_step);
            if (remaining as f64) < estimate {
                stats.deferred += 1;
                self.counters.deferrals.fetch_add(1, Ordering::Relaxed);
                debug!(
                    frame,
                    target = %pending.target,
                    ?next_step,
                    remaining,
                    "budget exhausted; reload resumes next frame"
                );
                break;
            }

            let step_started = Instant::now();
            let outcome = self.advance(&mut pending.ctx);
            self.observe_step(next_step, step_started.elapsed());

            match outcome {
                Ok(StepOutcome::Progress) => {}
                Ok(StepOutcome::Committed) => {
                    stats.committed += 1;
                    self.counters.commits.fetch_add(1, Ordering::Relaxed);
                    *pending_slot = None;
                }
                Err(e) => {
                    let target = pending.target.clone();
                    let mut finished = pending_slot
                        .take()
                        .expect("pending present in error branch");
                    drop(pending_slot);
                    self.abort_reload(&mut finished.ctx, &target, &e);
                    stats.aborted += 1;
                    if e.is_wal_failure() {
                        return Err(e);
                    }
                    continue;
                }
            }
        }

        stats.consumed_ns = started.elapsed().as_nanos() as u64;
        Ok(stats)
    }

    /// Pull completed builds into the local backlog, priority first.
    fn refill_backlog(&self, stats: &mut FrameStats) {
        let fresh = self.pipeline.drain_completed(MAX_ARTIFACTS_PER_TICK);
        if fresh.is_empty() {
            return;
        }
        let mut backlog = self.backlog.lock();
        for outcome in fresh {
            stats.artifacts_drained += 1;
            self.counters.artifacts.fetch_add(1, Ordering::Relaxed);
            backlog.push_back(outcome);
        }
        let mut sorted: Vec<BuildOutcome> = backlog.drain(..).collect();
        sorted.sort_by_key(|o| {
            std::cmp::Reverse(match o {
                BuildOutcome::Built { priority, .. } => *priority,
                BuildOutcome::Failed { .. } => BuildPriority::Critical,
            })
        });
        backlog.extend(sorted);
    }

    /// Begin a transaction for the next ready artifact. Returns false when
    /// there is nothing to start or the budget will not cover the load step.
    fn start_next_reload(&self, remaining_ns: u64, stats: &mut FrameStats) -> Result<bool> {
        let next = {
            let mut backlog = self.backlog.lock();
            let Some(front) = backlog.front() else {
                return Ok(false);
            };
            // Failures carry no further work.
            if matches!(front, BuildOutcome::Failed { .. }) {
                backlog.pop_front();
                return Ok(true);
            }
            if (remaining_ns as f64) < self.estimate_ns(StepKind::Load) {
                stats.deferred += 1;
                self.counters.deferrals.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
            backlog.pop_front().expect("front checked")
        };

        let BuildOutcome::Built {
            target,
            artifact_path,
            ..
        } = next
        else {
            return Ok(true);
        };

        let Some(module) = self.registry.lookup(&target) else {
            warn!(target = %target, "artifact for unregistered module ignored");
            return Ok(true);
        };
        let entry = self.registry.entry(module)?;
        if entry.state() == LifecycleState::Quarantined {
            self.events.publish(Event::ReloadFailed {
                module,
                reason: "module is quarantined".to_string(),
            });
            return Ok(true);
        }

        let step_started = Instant::now();
        let image = match self.loader.load(&artifact_path) {
            Ok(image) => image,
            Err(e) => {
                // Artifact rejected; the module stays on its prior image.
                warn!(target = %target, error = %e, "artifact rejected");
                self.events.publish(Event::ReloadFailed {
                    module,
                    reason: e.to_string(),
                });
                self.counters.aborts.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
        };
        self.observe_step(StepKind::Load, step_started.elapsed());

        let mut ctx = match self.manager.begin(TxnType::SingleModule, None) {
            Ok(ctx) => ctx,
            Err(HotswapError::Degraded) => {
                warn!("runtime degraded; reloads suspended");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let from = entry.current_version();
        let to = image.version;
        ctx.add_module_update(module, image)?;
        ctx.cursor.phase = ReloadPhase::Snapshotting;
        ctx.cursor.module_idx = 0;

        self.events.publish(Event::ReloadStarted { module, from, to });
        info!(target = %target, %to, "reload started");
        *self.pending.lock() = Some(PendingReload { ctx, target });
        Ok(true)
    }

    /// The step the pending transaction will run next.
    fn next_step(ctx: &TransactionContext) -> StepKind {
        match ctx.cursor.phase {
            ReloadPhase::Staging | ReloadPhase::Snapshotting => StepKind::Snapshot,
            ReloadPhase::ResolvingConflicts => StepKind::Conflicts,
            ReloadPhase::Migrating => StepKind::Migrate,
            ReloadPhase::Committing | ReloadPhase::Done => StepKind::Commit,
        }
    }

    /// Execute exactly one step of the pending transaction.
    fn advance(&self, ctx: &mut TransactionContext) -> Result<StepOutcome> {
        match ctx.cursor.phase {
            ReloadPhase::Staging => {
                ctx.cursor.phase = ReloadPhase::Snapshotting;
                ctx.cursor.module_idx = 0;
                Ok(StepOutcome::Progress)
            }
            ReloadPhase::Snapshotting => {
                let modules = ctx.modules();
                if let Some(module) = modules.get(ctx.cursor.module_idx).copied() {
                    self.manager.step_snapshot(ctx, module)?;
                    ctx.cursor.module_idx += 1;
                } else {
                    ctx.cursor.phase = ReloadPhase::ResolvingConflicts;
                }
                Ok(StepOutcome::Progress)
            }
            ReloadPhase::ResolvingConflicts => {
                let found = self.manager.detect_conflicts(ctx)?;
                if found > 0 {
                    self.counters
                        .conflicts
                        .fetch_add(found as u64, Ordering::Relaxed);
                    self.manager
                        .resolve_conflicts(ctx, ResolutionStrategy::AutoMerge);
                    let unresolved = ctx.unresolved_conflicts();
                    if unresolved > 0 {
                        return Err(HotswapError::ConflictUnresolved {
                            txn: ctx.txn_id,
                            count: unresolved,
                        });
                    }
                }
                ctx.cursor.phase = ReloadPhase::Migrating;
                ctx.cursor.module_idx = 0;
                Ok(StepOutcome::Progress)
            }
            ReloadPhase::Migrating => {
                let modules = ctx.modules();
                if let Some(module) = modules.get(ctx.cursor.module_idx).copied() {
                    self.manager.step_migrate(ctx, module)?;
                    ctx.cursor.module_idx += 1;
                } else {
                    ctx.cursor.phase = ReloadPhase::Committing;
                }
                Ok(StepOutcome::Progress)
            }
            ReloadPhase::Committing => {
                self.manager.commit(ctx)?;
                ctx.cursor.phase = ReloadPhase::Done;
                Ok(StepOutcome::Committed)
            }
            ReloadPhase::Done => Ok(StepOutcome::Committed),
        }
    }

    fn abort_reload(&self, ctx: &mut TransactionContext, target: &str, cause: &HotswapError) {
        warn!(target = %target, error = %cause, "reload aborted");
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        if !ctx.state().is_terminal() {
            if let Err(e) = self.manager.abort(ctx, &cause.to_string()) {
                warn!(error = %e, "abort itself failed");
            }
        }
    }

    fn estimate_ns(&self, step: StepKind) -> f64 {
        self.step_costs
            .lock()
            .get(&step)
            .copied()
            .unwrap_or_else(|| step.default_estimate_ns())
    }

    fn observe_step(&self, step: StepKind, took: Duration) {
        let took_ns = took.as_nanos() as f64;
        let mut costs = self.step_costs.lock();
        let entry = costs.entry(step).or_insert_with(|| step.default_estimate_ns());
        *entry = 0.3 * took_ns + 0.7 * *entry;
    }

    /// Track inter-tick intervals and derive the adaptive budget scale.
    fn observe_frame(&self) -> f64 {
        let mut adaptive = self.adaptive.lock();
        let now = Instant::now();
        if let Some(last) = adaptive.last_tick {
            let gap = now.duration_since(last).as_nanos() as u64;
            if adaptive.window.len() == ADAPTIVE_WINDOW {
                adaptive.window.pop_front();
            }
            adaptive.window.push_back(gap);

            if self.adaptive_enabled && !adaptive.window.is_empty() {
                let avg = adaptive.window.iter().sum::<u64>() / adaptive.window.len() as u64;
                if avg > TARGET_FRAME_NS {
                    adaptive.scale = (adaptive.scale / 2.0).max(0.25);
                } else {
                    adaptive.scale = (adaptive.scale * 1.05).min(1.25);
                }
            }
        }
        adaptive.last_tick = Some(now);
        adaptive.scale
    }
}
