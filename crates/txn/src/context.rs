//! Transaction contexts
//!
//! A [`TransactionContext`] carries everything one reload transaction
//! accumulates: staged module updates, snapshots, conflicts, MVCC staging
//! ids, and the progress cursor the scheduler uses to resume work on a
//! later frame. The context is plain data — all coordination lives in the
//! manager — so pausing a transaction is nothing more than keeping the
//! context around.

use crate::conflict::{ConflictAction, ConflictRecord};
use hotswap_core::{HotswapError, IsolationLevel, ModuleId, ModuleVersion, Result, SnapshotId, TxnId};
use hotswap_registry::CodeImage;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// What kind of reload a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnType {
    /// One module, fast path
    SingleModule,
    /// A module plus its dependents, committed together
    DependencyChain,
    /// Coordinated update of unrelated modules
    GlobalState,
    /// State-layout change driving a migration
    SchemaMigration,
    /// Several independent updates batched for one frame
    BatchUpdate,
}

impl TxnType {
    /// Numeric tag recorded in the WAL.
    pub fn kind_tag(&self) -> u8 {
        match self {
            TxnType::SingleModule => 0,
            TxnType::DependencyChain => 1,
            TxnType::GlobalState => 2,
            TxnType::SchemaMigration => 3,
            TxnType::BatchUpdate => 4,
        }
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations
    Active,
    /// Phase 1 in progress
    Preparing,
    /// Phase 1 complete, awaiting decision
    Prepared,
    /// Phase 2 in progress
    Committing,
    /// Terminal: all effects live
    Committed,
    /// Abort in progress
    Aborting,
    /// Terminal: no effects
    Aborted,
    /// Terminal: non-recoverable (WAL failure path)
    Failed,
}

impl TxnState {
    /// Whether the state machine allows `self -> to`.
    pub fn can_transition(&self, to: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (*self, to),
            (Active, Preparing)
                | (Active, Committing)
                | (Active, Aborting)
                | (Active, Failed)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Preparing, Failed)
                | (Prepared, Committing)
                | (Prepared, Aborting)
                | (Prepared, Failed)
                | (Committing, Committed)
                | (Committing, Aborting)
                | (Committing, Failed)
                | (Aborting, Aborted)
                | (Aborting, Failed)
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted | TxnState::Failed)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Active => "active",
            TxnState::Preparing => "preparing",
            TxnState::Prepared => "prepared",
            TxnState::Committing => "committing",
            TxnState::Committed => "committed",
            TxnState::Aborting => "aborting",
            TxnState::Aborted => "aborted",
            TxnState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Scheduler-visible progress of a transaction, persisted in the context so
/// work resumes exactly where the previous frame stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    /// Updates being staged
    Staging,
    /// Pre-image snapshots + WAL Prepare records, per module
    Snapshotting,
    /// Conflict detection and resolution
    ResolvingConflicts,
    /// Migration + post snapshots, per module
    Migrating,
    /// Final swap
    Committing,
    /// Nothing left
    Done,
}

/// Progress cursor: phase plus the index of the next module to process
/// within that phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCursor {
    /// Current phase
    pub phase: ReloadPhase,
    /// Next module index within the phase
    pub module_idx: usize,
}

impl ProgressCursor {
    fn start() -> Self {
        ProgressCursor {
            phase: ReloadPhase::Staging,
            module_idx: 0,
        }
    }
}

/// One staged module update within a transaction.
pub struct ModuleUpdate {
    /// Module being updated
    pub module: ModuleId,
    /// New code image (staged, unpublished)
    pub image: Arc<CodeImage>,
    /// Version being swapped in
    pub new_version: ModuleVersion,
    /// State bytes supplied explicitly instead of serializing the live module
    pub staged_state: Option<Vec<u8>>,
    /// Version active when the pre-image was captured
    pub pre_version: Option<ModuleVersion>,
    /// Pre-image snapshot
    pub pre_snapshot: Option<SnapshotId>,
    /// Post-migration snapshot
    pub post_snapshot: Option<SnapshotId>,
    /// Conflict resolution applied to this update
    pub action: Option<ConflictAction>,
    /// WAL Prepare written
    pub prepared: bool,
    /// Migration complete
    pub migrated: bool,
}

impl ModuleUpdate {
    /// An update resolved to KeepCurrent is excluded from the swap set.
    pub fn is_effective(&self) -> bool {
        self.action != Some(ConflictAction::KeepCurrent)
    }
}

/// A reload transaction's accumulated context.
pub struct TransactionContext {
    /// Transaction id
    pub txn_id: TxnId,
    /// Transaction kind
    pub ty: TxnType,
    /// Lifecycle state
    state: TxnState,
    /// Isolation level
    pub isolation: IsolationLevel,
    /// Logical read timestamp assigned at begin
    pub read_ts: u64,
    /// Logical write timestamp assigned at commit
    pub write_ts: Option<u64>,
    /// Staged updates
    pub updates: Vec<ModuleUpdate>,
    /// Extra dependency edges declared by the caller (module, requires)
    pub extra_deps: Vec<(ModuleId, ModuleId)>,
    /// Conflicts found by detection
    pub conflicts: Vec<ConflictRecord>,
    /// MVCC version ids staged by this transaction
    pub mvcc_versions: Vec<u64>,
    /// Progress cursor for multi-frame resumption
    pub cursor: ProgressCursor,
    /// Checkpoints: (checkpoint id, modules staged at the time)
    checkpoints: Vec<(u32, Vec<ModuleId>)>,
    next_checkpoint: u32,
    next_op_id: u32,
    /// Wall-clock deadline; beyond it the manager aborts the transaction
    pub deadline: Instant,
    /// When the transaction began
    pub begun: Instant,
}

impl TransactionContext {
    /// New active transaction.
    pub fn new(
        txn_id: TxnId,
        ty: TxnType,
        isolation: IsolationLevel,
        read_ts: u64,
        deadline: Instant,
    ) -> Self {
        TransactionContext {
            txn_id,
            ty,
            state: TxnState::Active,
            isolation,
            read_ts,
            write_ts: None,
            updates: Vec::new(),
            extra_deps: Vec::new(),
            conflicts: Vec::new(),
            mvcc_versions: Vec::new(),
            cursor: ProgressCursor::start(),
            checkpoints: Vec::new(),
            next_checkpoint: 1,
            next_op_id: 0,
            deadline,
            begun: Instant::now(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Transition state, validating the edge.
    pub fn transition(&mut self, to: TxnState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(HotswapError::transaction_state(
                self.txn_id,
                self.state.to_string(),
                to.to_string(),
            ));
        }
        self.state = to;
        Ok(())
    }

    /// Require a specific state.
    pub fn require_state(&self, required: TxnState) -> Result<()> {
        if self.state != required {
            return Err(HotswapError::transaction_state(
                self.txn_id,
                self.state.to_string(),
                required.to_string(),
            ));
        }
        Ok(())
    }

    /// Stage a module update. Updates stay sorted by module id, which is
    /// also the lock acquisition order at commit.
    pub fn add_module_update(&mut self, module: ModuleId, image: Arc<CodeImage>) -> Result<()> {
        self.require_state(TxnState::Active)?;
        if self.updates.iter().any(|u| u.module == module) {
            return Err(HotswapError::invalid_argument(format!(
                "module {} already staged in {}",
                module, self.txn_id
            )));
        }
        let new_version = image.version;
        self.updates.push(ModuleUpdate {
            module,
            image,
            new_version,
            staged_state: None,
            pre_version: None,
            pre_snapshot: None,
            post_snapshot: None,
            action: None,
            prepared: false,
            migrated: false,
        });
        self.updates.sort_by_key(|u| u.module);
        Ok(())
    }

    /// Supply explicit state bytes for a staged module instead of letting
    /// the prepare step serialize the live module.
    pub fn add_state_preservation(&mut self, module: ModuleId, bytes: Vec<u8>) -> Result<()> {
        self.require_state(TxnState::Active)?;
        let update = self
            .update_mut(module)
            .ok_or(HotswapError::ModuleNotFound { module })?;
        update.staged_state = Some(bytes);
        Ok(())
    }

    /// Declare an extra dependency edge for commit ordering.
    pub fn add_dependency(&mut self, module: ModuleId, requires: ModuleId) -> Result<()> {
        self.require_state(TxnState::Active)?;
        if module == requires {
            return Err(HotswapError::invalid_argument("module cannot require itself"));
        }
        self.extra_deps.push((module, requires));
        Ok(())
    }

    /// The staged update for `module`.
    pub fn update_for(&self, module: ModuleId) -> Option<&ModuleUpdate> {
        self.updates.iter().find(|u| u.module == module)
    }

    /// Mutable staged update for `module`.
    pub fn update_mut(&mut self, module: ModuleId) -> Option<&mut ModuleUpdate> {
        self.updates.iter_mut().find(|u| u.module == module)
    }

    /// Modules staged in this transaction, ascending.
    pub fn modules(&self) -> Vec<ModuleId> {
        self.updates.iter().map(|u| u.module).collect()
    }

    /// Updates surviving conflict resolution.
    pub fn effective_updates(&self) -> impl Iterator<Item = &ModuleUpdate> {
        self.updates.iter().filter(|u| u.is_effective())
    }

    /// Conflicts with no resolution applied.
    pub fn unresolved_conflicts(&self) -> usize {
        self.conflicts.iter().filter(|c| c.resolution.is_none()).count()
    }

    /// Allocate the next WAL op id.
    pub fn next_op_id(&mut self) -> u32 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    /// True once the deadline passed.
    pub fn deadline_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Record a checkpoint; updates staged after it can be discarded by
    /// [`TransactionContext::rollback_to_checkpoint`].
    pub fn checkpoint(&mut self) -> u32 {
        let id = self.next_checkpoint;
        self.next_checkpoint += 1;
        self.checkpoints.push((id, self.modules()));
        id
    }

    /// Discard updates for modules staged after the checkpoint.
    ///
    /// Staged updates are kept sorted by module id, not staging order, so
    /// each checkpoint pins the *set of modules* present when it was taken;
    /// rollback drops everything outside that set, along with later
    /// checkpoints and any conflicts that named the dropped modules.
    pub fn rollback_to_checkpoint(&mut self, checkpoint: u32) -> Result<()> {
        self.require_state(TxnState::Active)?;
        let position = self
            .checkpoints
            .iter()
            .position(|(id, _)| *id == checkpoint)
            .ok_or_else(|| {
                HotswapError::invalid_argument(format!("unknown checkpoint {}", checkpoint))
            })?;
        let kept: std::collections::HashSet<ModuleId> =
            self.checkpoints[position].1.iter().copied().collect();
        self.updates.retain(|u| kept.contains(&u.module));
        self.checkpoints.truncate(position + 1);
        self.conflicts.retain(|c| kept.contains(&c.module));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_registry::ArtifactBuilder;
    use std::time::Duration;

    fn image(name: &str, version: ModuleVersion) -> Arc<CodeImage> {
        CodeImage::from_artifact(
            ArtifactBuilder::new(name, version).build(),
            std::path::PathBuf::from(format!("/tmp/{}.hart", name)),
        )
    }

    fn ctx() -> TransactionContext {
        TransactionContext::new(
            TxnId(1),
            TxnType::SingleModule,
            IsolationLevel::Serializable,
            10,
            Instant::now() + Duration::from_secs(5),
        )
    }

    #[test]
    fn test_new_context_is_active() {
        let c = ctx();
        assert_eq!(c.state(), TxnState::Active);
        assert_eq!(c.cursor.phase, ReloadPhase::Staging);
        assert!(!c.deadline_expired());
    }

    #[test]
    fn test_state_machine_commit_path() {
        let mut c = ctx();
        c.transition(TxnState::Preparing).unwrap();
        c.transition(TxnState::Prepared).unwrap();
        c.transition(TxnState::Committing).unwrap();
        c.transition(TxnState::Committed).unwrap();
        assert!(c.state().is_terminal());
    }

    #[test]
    fn test_state_machine_rejects_bad_edges() {
        let mut c = ctx();
        assert!(c.transition(TxnState::Committed).is_err());
        c.transition(TxnState::Aborting).unwrap();
        c.transition(TxnState::Aborted).unwrap();
        assert!(c.transition(TxnState::Active).is_err());
    }

    #[test]
    fn test_updates_sorted_by_module_id() {
        let mut c = ctx();
        c.add_module_update(ModuleId(9), image("z", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        c.add_module_update(ModuleId(2), image("a", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        assert_eq!(c.modules(), vec![ModuleId(2), ModuleId(9)]);
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let mut c = ctx();
        c.add_module_update(ModuleId(1), image("a", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        assert!(c
            .add_module_update(ModuleId(1), image("a", ModuleVersion::new(1, 0, 0, 2)))
            .is_err());
    }

    #[test]
    fn test_state_preservation_requires_staged_module() {
        let mut c = ctx();
        assert!(matches!(
            c.add_state_preservation(ModuleId(1), vec![1]),
            Err(HotswapError::ModuleNotFound { .. })
        ));
        c.add_module_update(ModuleId(1), image("a", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        c.add_state_preservation(ModuleId(1), vec![1, 2]).unwrap();
        assert_eq!(
            c.update_for(ModuleId(1)).unwrap().staged_state,
            Some(vec![1, 2])
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut c = ctx();
        assert!(c.add_dependency(ModuleId(1), ModuleId(1)).is_err());
        c.add_dependency(ModuleId(2), ModuleId(1)).unwrap();
        assert_eq!(c.extra_deps, vec![(ModuleId(2), ModuleId(1))]);
    }

    #[test]
    fn test_op_ids_are_sequential() {
        let mut c = ctx();
        assert_eq!(c.next_op_id(), 0);
        assert_eq!(c.next_op_id(), 1);
        assert_eq!(c.next_op_id(), 2);
    }

    #[test]
    fn test_checkpoint_rollback_discards_later_updates() {
        let mut c = ctx();
        c.add_module_update(ModuleId(1), image("a", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        let cp = c.checkpoint();
        c.add_module_update(ModuleId(2), image("b", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        c.add_module_update(ModuleId(3), image("c", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();

        c.rollback_to_checkpoint(cp).unwrap();
        assert_eq!(c.modules(), vec![ModuleId(1)]);
        assert!(c.rollback_to_checkpoint(99).is_err());
    }

    #[test]
    fn test_checkpoint_rollback_keeps_staging_order_not_id_order() {
        // The staged set is sorted by module id, so a module staged after
        // the checkpoint can sort ahead of one staged before it. Rollback
        // must honor staging time, not position.
        let mut c = ctx();
        c.add_module_update(ModuleId(5), image("e", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        let cp = c.checkpoint();
        c.add_module_update(ModuleId(2), image("b", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        c.add_module_update(ModuleId(7), image("g", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        assert_eq!(c.modules(), vec![ModuleId(2), ModuleId(5), ModuleId(7)]);

        c.rollback_to_checkpoint(cp).unwrap();
        assert_eq!(c.modules(), vec![ModuleId(5)]);
    }

    #[test]
    fn test_rollback_drops_later_checkpoints() {
        let mut c = ctx();
        c.add_module_update(ModuleId(1), image("a", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        let first = c.checkpoint();
        c.add_module_update(ModuleId(2), image("b", ModuleVersion::new(1, 0, 0, 1)))
            .unwrap();
        let second = c.checkpoint();

        c.rollback_to_checkpoint(first).unwrap();
        assert_eq!(c.modules(), vec![ModuleId(1)]);
        // The later checkpoint died with the rollback.
        assert!(c.rollback_to_checkpoint(second).is_err());
        // The surviving one can be rolled back to again.
        c.rollback_to_checkpoint(first).unwrap();
        assert_eq!(c.modules(), vec![ModuleId(1)]);
    }

    #[test]
    fn test_operations_require_active_state() {
        let mut c = ctx();
        c.transition(TxnState::Aborting).unwrap();
        assert!(c
            .add_module_update(ModuleId(1), image("a", ModuleVersion::new(1, 0, 0, 1)))
            .is_err());
        assert!(c.add_dependency(ModuleId(1), ModuleId(2)).is_err());
    }

    #[test]
    fn test_expired_deadline_detected() {
        let mut c = ctx();
        c.deadline = Instant::now() - Duration::from_millis(1);
        assert!(c.deadline_expired());
    }
}
