//! Module registry
//!
//! The canonical table of known modules. The registry exclusively owns every
//! [`ModuleEntry`]; transactions and callers refer to modules by id and hold
//! shared `Arc` handles to code images, never raw pointers into the table.
//!
//! # Concurrency
//!
//! Entries live in a concurrent map, so symbol lookups from many reader
//! threads proceed in parallel. Mutation of one entry serializes on that
//! entry's image write lock. Transactions that touch several entries acquire
//! their writer locks in ascending module-id order, which keeps the global
//! lock order acyclic.

use crate::entry::{LifecycleState, ModuleEntry, ModuleRef};
use crate::image::{CodeImage, EntryPoint};
use dashmap::DashMap;
use hotswap_core::module::ModuleDescriptor;
use hotswap_core::{HotswapError, ModuleId, ModuleVersion, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Public snapshot of a module's registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Stable module name
    pub name: String,
    /// Active version, if any image is live
    pub version: Option<ModuleVersion>,
    /// Code image size in bytes (0 when unloaded)
    pub size: usize,
    /// Timestamp of last successful activation
    pub last_load_ts: u64,
    /// Active callers of this module's symbols
    pub refcount: u32,
    /// Whether the module is marked critical
    pub critical: bool,
}

/// Canonical set of known modules.
pub struct ModuleRegistry {
    entries: DashMap<ModuleId, Arc<ModuleEntry>>,
    by_name: DashMap<String, ModuleId>,
    next_id: AtomicU32,
    capacity: usize,
}

impl ModuleRegistry {
    /// Create a registry bounded at `capacity` modules.
    pub fn new(capacity: usize) -> Self {
        ModuleRegistry {
            entries: DashMap::new(),
            by_name: DashMap::new(),
            next_id: AtomicU32::new(1),
            capacity,
        }
    }

    /// Register a module, or refresh the interface of an existing one.
    ///
    /// The id assigned at first registration is returned on every
    /// subsequent call with the same name.
    pub fn register(&self, descriptor: ModuleDescriptor) -> Result<ModuleId> {
        if descriptor.name.is_empty() {
            return Err(HotswapError::invalid_argument("module name is empty"));
        }
        if let Some(existing) = self.by_name.get(&descriptor.name) {
            let id = *existing;
            if let Some(entry) = self.entries.get(&id) {
                entry.set_interface(descriptor.interface);
            }
            return Ok(id);
        }
        if self.entries.len() >= self.capacity {
            return Err(HotswapError::PoolExhausted {
                resource: "module registry".to_string(),
                limit: self.capacity,
            });
        }

        let id = ModuleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = Arc::new(ModuleEntry::new(
            id,
            descriptor.name.clone(),
            descriptor.critical,
            descriptor.security,
            descriptor.interface,
        ));
        self.entries.insert(id, entry);
        self.by_name.insert(descriptor.name.clone(), id);
        info!(module = %id, name = %descriptor.name, "module registered");
        Ok(id)
    }

    /// Register a module under an id recovered from a previous run.
    ///
    /// Module identity survives restarts: when a manifest names this module,
    /// its old id is reinstated so WAL history and snapshots keep pointing
    /// at the right entry. Fails if the id or name is already taken by a
    /// different module.
    pub fn register_recovered(
        &self,
        id: ModuleId,
        descriptor: ModuleDescriptor,
    ) -> Result<ModuleId> {
        if descriptor.name.is_empty() {
            return Err(HotswapError::invalid_argument("module name is empty"));
        }
        match self.by_name.get(&descriptor.name) {
            Some(existing) if *existing == id => {
                if let Some(entry) = self.entries.get(&id) {
                    entry.set_interface(descriptor.interface);
                }
                return Ok(id);
            }
            Some(existing) => {
                return Err(HotswapError::invalid_argument(format!(
                    "name {} already registered as {}",
                    descriptor.name, *existing
                )));
            }
            None => {}
        }
        if self.entries.contains_key(&id) {
            return Err(HotswapError::invalid_argument(format!(
                "module id {} already in use",
                id
            )));
        }
        if self.entries.len() >= self.capacity {
            return Err(HotswapError::PoolExhausted {
                resource: "module registry".to_string(),
                limit: self.capacity,
            });
        }

        let entry = Arc::new(ModuleEntry::new(
            id,
            descriptor.name.clone(),
            descriptor.critical,
            descriptor.security,
            descriptor.interface,
        ));
        self.entries.insert(id, entry);
        self.by_name.insert(descriptor.name.clone(), id);
        self.next_id.fetch_max(id.as_u32() + 1, Ordering::SeqCst);
        info!(module = %id, name = %descriptor.name, "module re-registered from recovery");
        Ok(id)
    }

    /// Fetch the entry for `id`.
    pub fn entry(&self, id: ModuleId) -> Result<Arc<ModuleEntry>> {
        self.entries
            .get(&id)
            .map(|e| Arc::clone(&e))
            .ok_or(HotswapError::ModuleNotFound { module: id })
    }

    /// Resolve a name to its stable id.
    pub fn lookup(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).map(|id| *id)
    }

    /// Resolve a symbol from the module's current image.
    ///
    /// Hot path: a concurrent-map read plus an image read-lock held only
    /// for the `Arc` clone.
    pub fn resolve_symbol(&self, id: ModuleId, symbol: &str) -> Result<EntryPoint> {
        let entry = self.entry(id)?;
        let image = entry.image().ok_or(HotswapError::ModuleNotFound { module: id })?;
        image.resolve(symbol).ok_or_else(|| HotswapError::SymbolNotFound {
            symbol: symbol.to_string(),
        })
    }

    /// Take a caller reference on a module.
    pub fn acquire(&self, id: ModuleId) -> Result<ModuleRef> {
        Ok(ModuleRef::new(self.entry(id)?))
    }

    /// Activate a code image for `id` — the atomic pointer swap.
    ///
    /// Dependency rule: every dependency named in the image's header must be
    /// Active at a version `>=` the one this image was built against. The
    /// caller (transaction manager) is responsible for holding an open
    /// transaction and the entry writer locks in id order.
    ///
    /// Returns the prior image so the caller can release it after commit.
    pub fn activate(&self, id: ModuleId, image: Arc<CodeImage>) -> Result<Option<Arc<CodeImage>>> {
        let entry = self.entry(id)?;

        // Resolve and validate dependencies before anything is published.
        let mut deps = Vec::with_capacity(image.dependencies.len());
        for req in &image.dependencies {
            let dep_id = self
                .lookup(&req.name)
                .ok_or_else(|| HotswapError::DependencyViolated {
                    module: id,
                    dependency: req.name.clone(),
                    required: req.min_version,
                })?;
            let dep_entry = self.entry(dep_id)?;
            let satisfied = dep_entry.state() == LifecycleState::Active
                && dep_entry
                    .current_version()
                    .is_some_and(|v| v.satisfies(&req.min_version));
            if !satisfied {
                return Err(HotswapError::DependencyViolated {
                    module: id,
                    dependency: req.name.clone(),
                    required: req.min_version,
                });
            }
            deps.push((dep_id, req.min_version));
        }

        // Maintain the reverse edges.
        for old_dep in entry.dependencies() {
            if !deps.iter().any(|(d, _)| *d == old_dep) {
                if let Ok(old_entry) = self.entry(old_dep) {
                    old_entry.remove_dependent(id);
                }
            }
        }
        for (dep_id, _) in &deps {
            self.entry(*dep_id)?.add_dependent(id);
        }
        entry.set_dependencies(deps);

        let version = image.version;
        let prior = entry.publish_image(image);
        debug!(module = %id, %version, "code image published");
        Ok(prior)
    }

    /// Deactivate a module, transitioning it to Unloaded.
    ///
    /// Forbidden while callers hold references or any dependent is Active.
    pub fn deactivate(&self, id: ModuleId) -> Result<Option<Arc<CodeImage>>> {
        let entry = self.entry(id)?;
        if entry.refcount() > 0 {
            return Err(HotswapError::invalid_argument(format!(
                "module {} has {} active caller(s)",
                id,
                entry.refcount()
            )));
        }
        for dep_id in entry.dependents() {
            let dep_entry = self.entry(dep_id)?;
            if dep_entry.state() == LifecycleState::Active {
                return Err(HotswapError::invalid_argument(format!(
                    "module {} is required by active module {}",
                    id, dep_id
                )));
            }
        }
        entry.set_state(LifecycleState::Unloaded)?;
        entry.interface().shutdown();
        Ok(entry.take_image())
    }

    /// Public info snapshot for one module.
    pub fn info(&self, id: ModuleId) -> Result<ModuleInfo> {
        let entry = self.entry(id)?;
        let image = entry.image();
        Ok(ModuleInfo {
            name: entry.name.clone(),
            version: image.as_ref().map(|i| i.version),
            size: image.as_ref().map(|i| i.size()).unwrap_or(0),
            last_load_ts: entry.last_load_ts(),
            refcount: entry.refcount(),
            critical: entry.critical,
        })
    }

    /// All registered module ids, ascending.
    pub fn module_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Topological order of `ids` over the dependency graph, dependencies
    /// first. Fails with `CyclicDependency` naming the offending modules.
    ///
    /// `proposed_deps` supplies edges for images being swapped in by the
    /// same batch, so a transaction is ordered by the graph it is about to
    /// create rather than the one currently live.
    pub fn topo_order(
        &self,
        ids: &[ModuleId],
        proposed_deps: &HashMap<ModuleId, Vec<ModuleId>>,
    ) -> Result<Vec<ModuleId>> {
        let set: std::collections::BTreeSet<ModuleId> = ids.iter().copied().collect();
        let deps_of = |id: ModuleId| -> Vec<ModuleId> {
            let declared = proposed_deps
                .get(&id)
                .cloned()
                .or_else(|| self.entries.get(&id).map(|e| e.dependencies()))
                .unwrap_or_default();
            declared.into_iter().filter(|d| set.contains(d)).collect()
        };

        let mut in_degree: HashMap<ModuleId, usize> = HashMap::new();
        let mut dependents_in_set: HashMap<ModuleId, Vec<ModuleId>> = HashMap::new();
        for &id in &set {
            let deps = deps_of(id);
            in_degree.insert(id, deps.len());
            for d in deps {
                dependents_in_set.entry(d).or_default().push(id);
            }
        }

        let mut queue: VecDeque<ModuleId> = set
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(set.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &dep in dependents_in_set.get(&id).into_iter().flatten() {
                let d = in_degree.get_mut(&dep).expect("dependent tracked");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if order.len() != set.len() {
            let stuck: Vec<ModuleId> = set
                .iter()
                .copied()
                .filter(|id| !order.contains(id))
                .collect();
            return Err(HotswapError::CyclicDependency { modules: stuck });
        }
        Ok(order)
    }
}
