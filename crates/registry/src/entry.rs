//! Module entries and lifecycle
//!
//! One [`ModuleEntry`] exists per module identity for the whole process
//! lifetime; it is created at registration and never destroyed. The entry's
//! code-image slot is the single linearization point of a reload: readers
//! take the slot's read lock for the duration of an `Arc` clone, writers
//! replace the `Arc` under the write lock, so a lookup observes either the
//! pre-swap or post-swap image and never a torn pointer.

use crate::image::CodeImage;
use hotswap_core::module::SecurityContext;
use hotswap_core::{HotswapError, ModuleId, ModuleInterface, ModuleVersion, Result, SnapshotId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle state of a module entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Registered but no code image active
    Unloaded,
    /// First load in progress
    Loading,
    /// Code image live, symbols resolvable
    Active,
    /// A newer artifact is queued for this module
    ReloadPending,
    /// A reload transaction currently holds this module
    ReloadInProgress,
    /// Repeated reload failures; skipped until cleared
    Quarantined,
    /// Load or init failed; no live image
    Failed,
}

impl LifecycleState {
    /// Whether the state machine allows `self -> to`.
    pub fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (*self, to),
            (Unloaded, Loading)
                | (Loading, Active)
                | (Loading, Failed)
                | (Active, ReloadPending)
                | (Active, Unloaded)
                | (ReloadPending, ReloadInProgress)
                | (ReloadPending, Active)
                | (ReloadInProgress, Active)
                | (ReloadInProgress, Failed)
                | (ReloadInProgress, Quarantined)
                | (Quarantined, ReloadPending)
                | (Quarantined, Unloaded)
                | (Failed, Loading)
                | (Failed, Unloaded)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loading => "loading",
            LifecycleState::Active => "active",
            LifecycleState::ReloadPending => "reload-pending",
            LifecycleState::ReloadInProgress => "reload-in-progress",
            LifecycleState::Quarantined => "quarantined",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Consecutive reload failures before a module is quarantined.
pub const QUARANTINE_THRESHOLD: u32 = 3;

/// Registry-owned record for one module identity.
pub struct ModuleEntry {
    /// Stable id
    pub id: ModuleId,
    /// Stable name
    pub name: String,
    /// Critical modules fail their whole batch on error
    pub critical: bool,
    /// Security context fixed at registration
    pub security: SecurityContext,

    /// Current code image. The write lock is the entry's writer lock.
    image: RwLock<Option<Arc<CodeImage>>>,
    /// Interface table of the active version
    interface: RwLock<Arc<dyn ModuleInterface>>,
    /// Lifecycle state
    state: Mutex<LifecycleState>,
    /// Snapshot holding the module's committed state
    current_snapshot: Mutex<Option<SnapshotId>>,
    /// Module ids this entry requires
    dependencies: RwLock<Vec<ModuleId>>,
    /// Versions of each dependency the active image was built against
    built_against: RwLock<HashMap<ModuleId, ModuleVersion>>,
    /// Module ids requiring this entry
    dependents: RwLock<BTreeSet<ModuleId>>,
    /// Active callers of this module's symbols
    refcount: AtomicU32,
    /// Consecutive reload failures
    failures: AtomicU32,
    /// Microseconds since epoch of the last successful activation
    last_load_ts: AtomicU64,
}

impl ModuleEntry {
    pub(crate) fn new(
        id: ModuleId,
        name: String,
        critical: bool,
        security: SecurityContext,
        interface: Arc<dyn ModuleInterface>,
    ) -> Self {
        ModuleEntry {
            id,
            name,
            critical,
            security,
            image: RwLock::new(None),
            interface: RwLock::new(interface),
            state: Mutex::new(LifecycleState::Unloaded),
            current_snapshot: Mutex::new(None),
            dependencies: RwLock::new(Vec::new()),
            built_against: RwLock::new(HashMap::new()),
            dependents: RwLock::new(BTreeSet::new()),
            refcount: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            last_load_ts: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Transition the lifecycle state, validating the edge.
    pub fn set_state(&self, to: LifecycleState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition(to) {
            return Err(HotswapError::internal(format!(
                "module {} illegal lifecycle transition {} -> {}",
                self.id, *state, to
            )));
        }
        *state = to;
        Ok(())
    }

    /// Force a lifecycle state without edge validation.
    ///
    /// Recovery only: replay reconstructs states that did not arise through
    /// live transitions.
    pub fn force_state(&self, to: LifecycleState) {
        *self.state.lock() = to;
    }

    /// Clone the current image handle, if any.
    pub fn image(&self) -> Option<Arc<CodeImage>> {
        self.image.read().clone()
    }

    /// Version of the current image.
    pub fn current_version(&self) -> Option<ModuleVersion> {
        self.image.read().as_ref().map(|img| img.version)
    }

    /// Publish a new code image, returning the prior one.
    ///
    /// This is the single "publish code image" primitive: the new `Arc` is
    /// fully constructed before the write lock is taken, so any reader that
    /// observes it observes a complete image.
    pub fn publish_image(&self, image: Arc<CodeImage>) -> Option<Arc<CodeImage>> {
        let prior = {
            let mut slot = self.image.write();
            slot.replace(image)
        };
        self.last_load_ts
            .store(hotswap_core::now_micros(), Ordering::Release);
        self.failures.store(0, Ordering::Release);
        prior
    }

    /// Clear the image slot, returning the prior image. Unload path only.
    pub(crate) fn take_image(&self) -> Option<Arc<CodeImage>> {
        self.image.write().take()
    }

    /// Interface table of the active version.
    pub fn interface(&self) -> Arc<dyn ModuleInterface> {
        self.interface.read().clone()
    }

    /// Replace the interface table (at activation of a new version).
    pub fn set_interface(&self, interface: Arc<dyn ModuleInterface>) {
        *self.interface.write() = interface;
    }

    /// Committed state snapshot id.
    pub fn current_snapshot(&self) -> Option<SnapshotId> {
        *self.current_snapshot.lock()
    }

    /// Record the committed state snapshot id.
    pub fn set_current_snapshot(&self, snapshot: Option<SnapshotId>) {
        *self.current_snapshot.lock() = snapshot;
    }

    /// Declared dependency ids.
    pub fn dependencies(&self) -> Vec<ModuleId> {
        self.dependencies.read().clone()
    }

    /// Replace the dependency set and the versions built against.
    pub fn set_dependencies(&self, deps: Vec<(ModuleId, ModuleVersion)>) {
        let mut ids = Vec::with_capacity(deps.len());
        let mut versions = HashMap::with_capacity(deps.len());
        for (id, v) in deps {
            ids.push(id);
            versions.insert(id, v);
        }
        *self.dependencies.write() = ids;
        *self.built_against.write() = versions;
    }

    /// Version of `dep` the active image was built against.
    pub fn built_against(&self, dep: ModuleId) -> Option<ModuleVersion> {
        self.built_against.read().get(&dep).copied()
    }

    /// Modules depending on this one.
    pub fn dependents(&self) -> Vec<ModuleId> {
        self.dependents.read().iter().copied().collect()
    }

    pub(crate) fn add_dependent(&self, id: ModuleId) {
        self.dependents.write().insert(id);
    }

    pub(crate) fn remove_dependent(&self, id: ModuleId) {
        self.dependents.write().remove(&id);
    }

    /// Current caller refcount.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_ref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow on {}", self.id);
    }

    /// Record a reload failure; returns true when the entry crossed the
    /// quarantine threshold.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        failures >= QUARANTINE_THRESHOLD
    }

    /// Consecutive failures so far.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Reset the failure counter (when quarantine is cleared).
    pub fn clear_failures(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Timestamp of the last successful activation.
    pub fn last_load_ts(&self) -> u64 {
        self.last_load_ts.load(Ordering::Acquire)
    }
}

/// RAII guard representing one active caller of a module's symbols.
///
/// Dropping the guard releases the reference. Entries with a nonzero
/// refcount cannot be deactivated.
pub struct ModuleRef {
    entry: Arc<ModuleEntry>,
}

impl ModuleRef {
    pub(crate) fn new(entry: Arc<ModuleEntry>) -> Self {
        entry.acquire_ref();
        ModuleRef { entry }
    }

    /// The referenced module id.
    pub fn module(&self) -> ModuleId {
        self.entry.id
    }
}

impl Drop for ModuleRef {
    fn drop(&mut self) {
        self.entry.release_ref();
    }
}
