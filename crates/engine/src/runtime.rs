//! Runtime root
//!
//! One [`Runtime`] owns every service: registry, state store, WAL service,
//! transaction manager, build pipeline, watcher, event bus and the frame
//! scheduler. Nothing here is a global — background threads reach services
//! through `Arc` handles owned by this root, and the simulation drives the
//! whole machine through `frame_tick`.

use crate::scheduler::FrameScheduler;
use crate::status::{RuntimeCounters, RuntimePhase, RuntimeStatus};
use hotswap_core::{
    now_micros, EventBus, EventEnvelope, HotswapError, ModuleDescriptor, ModuleId, ModuleVersion,
    Result, RuntimeConfig, SnapshotId, TxnId,
};
use hotswap_durability::{
    ManifestEntry, RecoveryCoordinator, RecoveryPlan, RegistryManifest, WalOp, WalService,
    WalWriter, DEFAULT_SEGMENT_BYTES,
};
use hotswap_pipeline::{
    BuildPipeline, BuildPriority, BuildRequest, Builder, BuiltArtifact, ChangeEvent, FileWatcher,
    LoadProbe, PipelineConfig,
};
use hotswap_registry::{ArtifactLoader, ModuleInfo, ModuleRegistry};
use hotswap_state::{RetentionPolicy, StateStore};
use hotswap_txn::TxnManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Background maintenance cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

/// Maintenance cycles between manifest checkpoints.
const MANIFEST_EVERY: u32 = 50;

/// Builder used when no toolchain is attached: the changed file is assumed
/// to already be the artifact.
struct PassthroughBuilder;

impl Builder for PassthroughBuilder {
    fn build(&self, request: &BuildRequest) -> std::result::Result<BuiltArtifact, String> {
        Ok(BuiltArtifact {
            artifact_path: request.source_path.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct RecoveredModule {
    id: ModuleId,
    version: Option<ModuleVersion>,
    snapshot: Option<SnapshotId>,
}

/// Configures and opens a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    builder: Option<Arc<dyn Builder>>,
    probe: Option<LoadProbe>,
}

impl RuntimeBuilder {
    /// Start from a configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        RuntimeBuilder {
            config,
            builder: None,
            probe: None,
        }
    }

    /// Attach the build toolchain boundary.
    pub fn with_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Override the system load probe (tests).
    pub fn with_load_probe(mut self, probe: LoadProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Open the runtime: create the instance directory, run crash recovery,
    /// start the WAL service, pipeline and background maintenance.
    pub fn open(self) -> Result<Runtime> {
        let config = self.config;
        std::fs::create_dir_all(&config.root_dir)?;
        let instance = *uuid::Uuid::new_v4().as_bytes();

        // WAL replay first; the plan drives everything else.
        let plan = RecoveryCoordinator::new(config.wal_dir())
            .recover()
            .map_err(|e| HotswapError::RecoveryFailed {
                reason: e.to_string(),
            })?;

        let store = Arc::new(StateStore::open_with_pool(
            config.snapshots_dir(),
            config.compression_threshold_bytes,
            RetentionPolicy {
                count: config.snapshot_retention_count,
                age: config.snapshot_retention_age,
            },
            config.memory_pool_bytes,
        )?);
        Self::apply_plan_to_store(&plan, &store);

        let manifest = RegistryManifest::load(&config.manifest_path())?;
        let mut recovered: HashMap<String, RecoveredModule> = HashMap::new();
        if let Some(manifest) = &manifest {
            for entry in &manifest.modules {
                recovered.insert(
                    entry.name.clone(),
                    RecoveredModule {
                        id: entry.id,
                        version: entry.version,
                        snapshot: entry.snapshot,
                    },
                );
            }
            // Commits newer than the manifest win.
            for committed in &plan.committed {
                for m in &committed.modules {
                    if let Some(rec) = recovered.values_mut().find(|r| r.id == m.module) {
                        rec.version = Some(m.version);
                        if m.snapshot.is_some() {
                            rec.snapshot = m.snapshot;
                        }
                    }
                }
            }
        }

        let registry = Arc::new(ModuleRegistry::new(config.max_concurrent_modules));
        let events = Arc::new(EventBus::new());
        let counters = Arc::new(RuntimeCounters::default());
        let degraded = Arc::new(AtomicBool::new(false));

        let writer = WalWriter::open(
            config.wal_dir(),
            instance,
            config.wal_durability,
            DEFAULT_SEGMENT_BYTES,
        )?;
        let wal_service = WalService::spawn(writer)?;

        let manager = Arc::new(TxnManager::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            wal_service.handle(),
            Arc::clone(&events),
            Arc::clone(&degraded),
            config.default_isolation,
            config.txn_deadline,
            config.phase1_timeout,
        ));
        manager.seed_after_recovery(plan.max_txn_id);

        let toolchain = self
            .builder
            .unwrap_or_else(|| Arc::new(PassthroughBuilder) as Arc<dyn Builder>);
        let pipeline_config = PipelineConfig {
            max_parallel_jobs: config.build.max_parallel_jobs,
            cpu_load_threshold: config.build.cpu_load_threshold,
            job_timeout: config.build.job_timeout,
        };
        let pipeline = Arc::new(match self.probe {
            Some(probe) => BuildPipeline::with_probe(
                pipeline_config,
                toolchain,
                Arc::clone(&events),
                probe,
            ),
            None => BuildPipeline::new(pipeline_config, toolchain, Arc::clone(&events)),
        });

        let scheduler = FrameScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            Arc::clone(&pipeline),
            ArtifactLoader::new(config.security.require_signature),
            Arc::clone(&events),
            Arc::clone(&counters),
            config.check_interval_frames,
            config.max_frame_budget_ns,
            config.adaptive_budgeting,
        );

        let runtime = Runtime {
            config,
            instance,
            registry,
            store,
            events,
            counters,
            manager,
            scheduler,
            pipeline,
            wal_service: Mutex::new(Some(wal_service)),
            degraded,
            watcher: Mutex::new(None),
            maintenance: Mutex::new(None),
            maintenance_stop: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(RuntimePhase::Running),
            recovered,
        };
        runtime.spawn_maintenance();
        info!(
            committed = plan.stats.txns_committed,
            rolled_back = plan.stats.txns_rolled_back,
            "runtime opened"
        );
        Ok(runtime)
    }

    fn apply_plan_to_store(plan: &RecoveryPlan, store: &StateStore) {
        for committed in &plan.committed {
            for m in &committed.modules {
                if let Some(snapshot) = m.snapshot {
                    store.restore_lineage(m.module, snapshot, None, true);
                }
            }
        }
        // Rolled-back transactions restore their pre-image as current,
        // unless a later committed transaction already owns the module.
        for rolled in &plan.rolled_back {
            for (module, pre) in &rolled.pre_images {
                if let Some(pre) = pre {
                    if store.current(*module).is_none() {
                        store.restore_lineage(*module, *pre, None, true);
                    }
                }
            }
        }
        store.collect_orphans(&plan.referenced_snapshots);
    }
}

/// The reload runtime.
pub struct Runtime {
    config: RuntimeConfig,
    instance: [u8; 16],
    registry: Arc<ModuleRegistry>,
    store: Arc<StateStore>,
    events: Arc<EventBus>,
    counters: Arc<RuntimeCounters>,
    manager: Arc<TxnManager>,
    scheduler: FrameScheduler,
    pipeline: Arc<BuildPipeline>,
    wal_service: Mutex<Option<WalService>>,
    degraded: Arc<AtomicBool>,
    watcher: Mutex<Option<(FileWatcher, Receiver<ChangeEvent>)>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    maintenance_stop: Arc<AtomicBool>,
    phase: Mutex<RuntimePhase>,
    recovered: HashMap<String, RecoveredModule>,
}

impl Runtime {
    /// Open with defaults; shorthand for `RuntimeBuilder::new(config).open()`.
    pub fn open(config: RuntimeConfig) -> Result<Runtime> {
        RuntimeBuilder::new(config).open()
    }

    /// Register a module's interface.
    ///
    /// Identity survives restarts: a name present in the recovered manifest
    /// gets its old id back, along with its committed state snapshot.
    pub fn register_module(&self, descriptor: ModuleDescriptor) -> Result<ModuleId> {
        let recovered = self.recovered.get(&descriptor.name).cloned();
        let id = match &recovered {
            Some(rec) => self.registry.register_recovered(rec.id, descriptor)?,
            None => self.registry.register(descriptor)?,
        };
        if let Some(rec) = recovered {
            let entry = self.registry.entry(id)?;
            entry.set_current_snapshot(rec.snapshot);
            if let Some(snapshot) = rec.snapshot {
                match self.store.load(id, snapshot) {
                    Ok(snap) => entry.interface().deserialize_state(&snap.bytes)?,
                    Err(e) => warn!(module = %id, error = %e, "recovered state unavailable"),
                }
            }
            debug!(module = %id, version = ?rec.version, "module identity recovered");
        }
        Ok(id)
    }

    /// Load an artifact and activate it synchronously (initial loads; not
    /// frame-budgeted). The module must be registered.
    pub fn load_module(&self, artifact_path: &std::path::Path) -> Result<ModuleId> {
        let loader = ArtifactLoader::new(self.config.security.require_signature);
        let image = loader.load(artifact_path)?;
        let module = self
            .registry
            .lookup(&image.module_name)
            .ok_or_else(|| HotswapError::invalid_argument(format!(
                "module {} is not registered",
                image.module_name
            )))?;

        let mut ctx = self.manager.begin(hotswap_txn::TxnType::SingleModule, None)?;
        ctx.add_module_update(module, image)?;
        self.manager.step_snapshot(&mut ctx, module)?;
        let conflicts = self.manager.detect_conflicts(&mut ctx)?;
        if conflicts > 0 {
            let unresolved = ctx.unresolved_conflicts();
            self.manager.abort(&mut ctx, "conflicts on direct load")?;
            return Err(HotswapError::ConflictUnresolved {
                txn: ctx.txn_id,
                count: unresolved,
            });
        }
        self.manager.step_migrate(&mut ctx, module)?;
        match self.manager.commit(&mut ctx) {
            Ok(()) => {
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                Ok(module)
            }
            Err(e) => {
                if !ctx.state().is_terminal() {
                    let _ = self.manager.abort(&mut ctx, &e.to_string());
                }
                self.counters.aborts.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Deactivate and unload a module.
    pub fn unload_module(&self, module: ModuleId) -> Result<()> {
        self.registry.deactivate(module)?;
        Ok(())
    }

    /// Resolve an exported symbol from a module's current image.
    pub fn resolve(&self, module: ModuleId, symbol: &str) -> Result<hotswap_registry::EntryPoint> {
        self.registry.resolve_symbol(module, symbol)
    }

    /// Public info for one module.
    pub fn info(&self, module: ModuleId) -> Result<ModuleInfo> {
        self.registry.info(module)
    }

    /// Watch a directory (or file) for artifact changes.
    pub fn watch(&self, path: &std::path::Path, recursive: bool) -> Result<()> {
        let mut slot = self.watcher.lock();
        if slot.is_none() {
            *slot = Some(FileWatcher::new(self.config.build.debounce)?);
        }
        let (watcher, _) = slot.as_mut().expect("just initialized");
        watcher.watch(path, recursive)
    }

    /// Queue a build for an artifact path directly (bypasses the watcher).
    pub fn request_build(&self, target: &str, source: &std::path::Path, priority: BuildPriority) -> Result<()> {
        self.pipeline.submit(BuildRequest {
            target: target.to_string(),
            source_path: source.to_path_buf(),
            priority,
            requested_ts: now_micros(),
        })
    }

    /// Drive one frame of reload work.
    pub fn frame_tick(&self, frame: u64, budget_ns: u64) -> Result<crate::status::FrameStats> {
        if *self.phase.lock() == RuntimePhase::ShutDown {
            return Err(HotswapError::invalid_argument("runtime is shut down"));
        }
        self.pump_watcher();
        self.scheduler.tick(frame, budget_ns)
    }

    /// Enable or disable reload processing.
    pub fn enable(&self, enabled: bool) {
        self.scheduler.set_enabled(enabled);
        let mut phase = self.phase.lock();
        if *phase != RuntimePhase::ShutDown {
            *phase = if enabled {
                RuntimePhase::Running
            } else {
                RuntimePhase::Disabled
            };
        }
    }

    /// Pause or resume the scheduler (builds keep queueing).
    pub fn pause(&self, paused: bool) {
        self.scheduler.set_paused(paused);
        let mut phase = self.phase.lock();
        if *phase != RuntimePhase::ShutDown {
            *phase = if paused {
                RuntimePhase::Paused
            } else {
                RuntimePhase::Running
            };
        }
    }

    /// Roll a module back to an earlier committed version.
    pub fn rollback_module(&self, module: ModuleId, to_version: &ModuleVersion) -> Result<()> {
        self.manager.rollback_module(module, to_version)
    }

    /// Subscribe to the observer event channel.
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// The transaction manager, for callers orchestrating their own
    /// multi-module transactions.
    pub fn manager(&self) -> Arc<TxnManager> {
        Arc::clone(&self.manager)
    }

    /// Status snapshot.
    pub fn status(&self) -> RuntimeStatus {
        let mut modules = HashMap::new();
        for id in self.registry.module_ids() {
            if let Ok(info) = self.registry.info(id) {
                modules.insert(info.name.clone(), info);
            }
        }
        RuntimeStatus {
            phase: *self.phase.lock(),
            degraded: self.degraded.load(Ordering::Acquire),
            modules,
            stats: self.counters.snapshot(),
            active_txns: self.manager.active_count(),
        }
    }

    /// Orderly shutdown: pause, abort in-flight work, drain the WAL, stop
    /// workers, write a final manifest checkpoint. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == RuntimePhase::ShutDown {
                return Ok(());
            }
            *phase = RuntimePhase::ShutDown;
        }
        info!("runtime shutting down");
        self.scheduler.set_paused(true);
        self.scheduler.abort_pending("runtime shutdown");

        *self.watcher.lock() = None;
        self.pipeline.shutdown();

        self.maintenance_stop.store(true, Ordering::Release);
        if let Some(handle) = self.maintenance.lock().take() {
            let _ = handle.join();
        }

        self.write_manifest();
        if let Some(service) = self.wal_service.lock().take() {
            let _ = service.handle().append(TxnId(0), 0, WalOp::Checkpoint);
            let _ = service.handle().flush();
            service.shutdown();
        }
        Ok(())
    }

    fn pump_watcher(&self) {
        let slot = self.watcher.lock();
        let Some((_, rx)) = slot.as_ref() else {
            return;
        };
        for change in rx.try_iter() {
            let Some(target) = change
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
            else {
                continue;
            };
            debug!(target = %target, path = %change.path.display(), "change observed");
            let _ = self.pipeline.submit(BuildRequest {
                target,
                source_path: change.path,
                priority: BuildPriority::Normal,
                requested_ts: change.ts,
            });
        }
    }

    fn spawn_maintenance(&self) {
        let stop = Arc::clone(&self.maintenance_stop);
        let manager = Arc::clone(&self.manager);
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let manifest_path = self.config.manifest_path();
        let instance = self.instance;
        let mvcc = self.manager.mvcc();

        let handle = std::thread::Builder::new()
            .name("hotswap-maint".to_string())
            .spawn(move || {
                let mut cycle: u32 = 0;
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(MAINTENANCE_INTERVAL);
                    cycle = cycle.wrapping_add(1);

                    mvcc.gc(manager.gc_horizon());
                    store.collect_garbage(&manager.protected_snapshots());
                    manager.deadlock_sweep();

                    if cycle % MANIFEST_EVERY == 0 {
                        write_manifest_checkpoint(&registry, &store, &manifest_path, instance);
                    }
                }
            })
            .expect("failed to spawn maintenance thread");
        *self.maintenance.lock() = Some(handle);
    }

    fn write_manifest(&self) {
        write_manifest_checkpoint(
            &self.registry,
            &self.store,
            &self.config.manifest_path(),
            self.instance,
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn write_manifest_checkpoint(
    registry: &ModuleRegistry,
    store: &StateStore,
    path: &std::path::Path,
    instance: [u8; 16],
) {
    let mut entries = Vec::new();
    for id in registry.module_ids() {
        if let Ok(info) = registry.info(id) {
            entries.push(ManifestEntry {
                id,
                name: info.name,
                version: info.version,
                snapshot: store.current(id),
                critical: info.critical,
            });
        }
    }
    let manifest = RegistryManifest::new(instance, entries);
    if let Err(e) = manifest.save(path) {
        warn!(error = %e, "manifest checkpoint failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_core::module::testing::BufferModule;
    use hotswap_core::ModuleVersion;
    use hotswap_registry::ArtifactBuilder;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig::for_testing(dir)
    }

    fn register(runtime: &Runtime, name: &str, version: ModuleVersion) -> ModuleId {
        runtime
            .register_module(ModuleDescriptor::new(
                name,
                Arc::new(BufferModule::new(version).with_state(b"state".to_vec())),
            ))
            .unwrap()
    }

    #[test]
    fn test_open_shutdown_cycle() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::open(config(dir.path())).unwrap();
        assert_eq!(runtime.status().phase, RuntimePhase::Running);
        runtime.shutdown().unwrap();
        assert_eq!(runtime.status().phase, RuntimePhase::ShutDown);
        // Idempotent.
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_frame_tick_with_no_modules_is_cheap() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::open(config(dir.path())).unwrap();
        let stats = runtime.frame_tick(0, 1_000_000).unwrap();
        assert!(stats.worked);
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.artifacts_drained, 0);
        // Well under 1% of a 1ms budget is unverifiable on shared CI, but
        // an empty tick must at least not consume the whole budget.
        assert!(stats.consumed_ns < 1_000_000);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_zero_budget_performs_no_reload_work() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::open(config(dir.path())).unwrap();
        let m = register(&runtime, "sim", ModuleVersion::new(1, 0, 0, 1));

        let artifact = dir.path().join("sim.hart");
        ArtifactBuilder::new("sim", ModuleVersion::new(1, 0, 0, 1))
            .write_to(&artifact)
            .unwrap();
        runtime
            .request_build("sim", &artifact, BuildPriority::Normal)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let stats = runtime.frame_tick(0, 0).unwrap();
        assert_eq!(stats.committed, 0);
        assert!(runtime.info(m).unwrap().version.is_none());
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_load_module_directly() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::open(config(dir.path())).unwrap();
        register(&runtime, "sim", ModuleVersion::new(1, 0, 0, 1));

        let artifact = dir.path().join("sim.hart");
        ArtifactBuilder::new("sim", ModuleVersion::new(1, 0, 0, 1))
            .export("step", 8)
            .write_to(&artifact)
            .unwrap();

        let module = runtime.load_module(&artifact).unwrap();
        let info = runtime.info(module).unwrap();
        assert_eq!(info.version, Some(ModuleVersion::new(1, 0, 0, 1)));
        assert!(runtime.resolve(module, "step").is_ok());
        assert_eq!(runtime.status().stats.commits, 1);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_load_unregistered_module_fails() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::open(config(dir.path())).unwrap();
        let artifact = dir.path().join("ghost.hart");
        ArtifactBuilder::new("ghost", ModuleVersion::new(1, 0, 0, 1))
            .write_to(&artifact)
            .unwrap();
        assert!(runtime.load_module(&artifact).is_err());
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_pause_blocks_reload_work() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::open(config(dir.path())).unwrap();
        register(&runtime, "sim", ModuleVersion::new(1, 0, 0, 1));
        runtime.pause(true);
        assert_eq!(runtime.status().phase, RuntimePhase::Paused);

        let stats = runtime.frame_tick(0, 1_000_000).unwrap();
        assert!(!stats.worked);
        runtime.pause(false);
        assert_eq!(runtime.status().phase, RuntimePhase::Running);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_module_identity_survives_restart() {
        let dir = tempdir().unwrap();
        let id_before;
        {
            let runtime = Runtime::open(config(dir.path())).unwrap();
            register(&runtime, "sim", ModuleVersion::new(1, 0, 0, 1));
            let artifact = dir.path().join("sim.hart");
            ArtifactBuilder::new("sim", ModuleVersion::new(1, 0, 0, 1))
                .write_to(&artifact)
                .unwrap();
            id_before = runtime.load_module(&artifact).unwrap();
            runtime.shutdown().unwrap();
        }
        {
            let runtime = Runtime::open(config(dir.path())).unwrap();
            let id_after = register(&runtime, "sim", ModuleVersion::new(1, 0, 0, 1));
            assert_eq!(id_after, id_before);
            runtime.shutdown().unwrap();
        }
    }
}
