//! Build pipeline behavior through the runtime: throttling under load,
//! priority draining, timeouts, and the watcher-to-reload data flow.

use hotswap::module::testing::BufferModule;
use hotswap::{
    ArtifactBuilder, BuildPriority, Builder, BuiltArtifact, ModuleDescriptor, ModuleVersion,
    Runtime, RuntimeBuilder, RuntimeConfig,
};
use hotswap_pipeline::{BuildRequest, SystemLoad};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn v(major: u16, minor: u16, patch: u16, build: u32) -> ModuleVersion {
    ModuleVersion::new(major, minor, patch, build)
}

struct InstrumentedBuilder {
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    started_order: Mutex<Vec<String>>,
}

impl InstrumentedBuilder {
    fn new(delay: Duration) -> Self {
        InstrumentedBuilder {
            delay,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            started_order: Mutex::new(Vec::new()),
        }
    }
}

impl Builder for InstrumentedBuilder {
    fn build(&self, request: &BuildRequest) -> Result<BuiltArtifact, String> {
        let now = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent.fetch_max(now, Ordering::AcqRel);
        self.started_order.lock().push(request.target.clone());
        std::thread::sleep(self.delay);
        self.concurrent.fetch_sub(1, Ordering::AcqRel);
        Ok(BuiltArtifact {
            artifact_path: request.source_path.clone(),
        })
    }
}

#[test]
fn s6_high_cpu_load_throttles_to_one_job_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let mut config = RuntimeConfig::for_testing(dir.path().join("data"));
    config.build.max_parallel_jobs = 4;

    let builder = Arc::new(InstrumentedBuilder::new(Duration::from_millis(25)));
    let runtime = RuntimeBuilder::new(config)
        .with_builder(Arc::clone(&builder) as Arc<dyn Builder>)
        .with_load_probe(Box::new(|| SystemLoad {
            cpu_load: 0.95, // above the 85% threshold
            mem_headroom_jobs: usize::MAX,
        }))
        .open()
        .unwrap();

    // Ten change events queued; the first admitted job occupies the single
    // slot while the rest pile up behind it.
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    runtime
        .request_build("warmup", &src.join("warmup"), BuildPriority::Background)
        .unwrap();
    std::thread::sleep(Duration::from_millis(10));
    for i in 0..9 {
        let priority = match i % 3 {
            0 => BuildPriority::Low,
            1 => BuildPriority::Critical,
            _ => BuildPriority::Normal,
        };
        runtime
            .request_build(&format!("job-{i}"), &src.join(format!("job-{i}")), priority)
            .unwrap();
    }

    // Wait for the queue to drain.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let done = builder.started_order.lock().len();
        if done == 10 {
            break;
        }
        assert!(Instant::now() < deadline, "builds did not drain");
        std::thread::sleep(Duration::from_millis(10));
    }

    // At most one job ran at any moment.
    assert_eq!(builder.max_concurrent.load(Ordering::Acquire), 1);

    // Critical jobs drained before Normal before Low (after the warmup job
    // that was already running).
    let order = builder.started_order.lock().clone();
    let rank = |target: &str| -> usize {
        if target.starts_with("job-") {
            let i: usize = target[4..].parse().unwrap();
            match i % 3 {
                1 => 0, // Critical
                2 => 1, // Normal
                _ => 2, // Low
            }
        } else {
            0
        }
    };
    let queued = &order[1..];
    for pair in queued.windows(2) {
        assert!(
            rank(&pair[0]) <= rank(&pair[1]),
            "priority inversion: {:?}",
            order
        );
    }
    runtime.shutdown().unwrap();
}

struct SlowBuilder {
    delay: Duration,
}

impl Builder for SlowBuilder {
    fn build(&self, request: &BuildRequest) -> Result<BuiltArtifact, String> {
        std::thread::sleep(self.delay);
        Ok(BuiltArtifact {
            artifact_path: request.source_path.clone(),
        })
    }
}

#[test]
fn job_exceeding_timeout_emits_build_failed_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = RuntimeConfig::for_testing(dir.path().join("data"));
    config.build.job_timeout = Duration::from_millis(10);

    let runtime = RuntimeBuilder::new(config)
        .with_builder(Arc::new(SlowBuilder {
            delay: Duration::from_millis(60),
        }))
        .open()
        .unwrap();
    let events = runtime.subscribe();

    runtime
        .request_build("laggard", Path::new("/src/laggard"), BuildPriority::Normal)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let reason = loop {
        assert!(Instant::now() < deadline, "no BuildFailed event arrived");
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(envelope) => {
                if let hotswap::Event::BuildFailed { target, reason } = envelope.event {
                    assert_eq!(target, "laggard");
                    break reason;
                }
            }
            Err(_) => continue,
        }
    };
    assert_eq!(reason, "timeout");
    runtime.shutdown().unwrap();
}

#[test]
fn watcher_change_flows_through_build_to_reload() {
    let dir = TempDir::new().unwrap();
    let artifacts = dir.path().join("artifacts");
    std::fs::create_dir_all(&artifacts).unwrap();

    let runtime = Runtime::open(RuntimeConfig::for_testing(dir.path().join("data"))).unwrap();
    runtime
        .register_module(ModuleDescriptor::new(
            "graphics",
            Arc::new(BufferModule::new(v(1, 0, 0, 1)).with_state(b"gfx".to_vec())),
        ))
        .unwrap();

    // Initial load, then watch the artifact directory.
    let path = artifacts.join("graphics.hart");
    ArtifactBuilder::new("graphics", v(1, 0, 0, 1)).write_to(&path).unwrap();
    runtime.load_module(&path).unwrap();
    runtime.watch(&artifacts, true).unwrap();

    // Rebuild on disk; the watcher feeds the pipeline, the scheduler swaps.
    ArtifactBuilder::new("graphics", v(1, 0, 1, 2)).write_to(&path).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut frame = 0u64;
    loop {
        let stats = runtime.frame_tick(frame, 10_000_000).unwrap();
        frame += 1;
        if stats.committed > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "reload never arrived");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(
        runtime.status().modules["graphics"].version,
        Some(v(1, 0, 1, 2))
    );
    runtime.shutdown().unwrap();
}

#[test]
fn build_failure_does_not_disturb_active_module() {
    struct FailingBuilder;
    impl Builder for FailingBuilder {
        fn build(&self, _request: &BuildRequest) -> Result<BuiltArtifact, String> {
            Err("compiler exploded".to_string())
        }
    }

    let dir = TempDir::new().unwrap();
    let artifacts = dir.path().join("artifacts");
    std::fs::create_dir_all(&artifacts).unwrap();

    // Direct load activates the module; the broken toolchain only affects
    // rebuilds queued through the pipeline.
    let runtime = RuntimeBuilder::new(RuntimeConfig::for_testing(dir.path().join("data")))
        .with_builder(Arc::new(FailingBuilder))
        .open()
        .unwrap();
    runtime
        .register_module(ModuleDescriptor::new(
            "sim",
            Arc::new(BufferModule::new(v(1, 0, 0, 1))),
        ))
        .unwrap();
    let path = artifacts.join("sim.hart");
    ArtifactBuilder::new("sim", v(1, 0, 0, 1)).write_to(&path).unwrap();
    runtime.load_module(&path).unwrap();

    let events = runtime.subscribe();
    runtime.request_build("sim", &path, BuildPriority::High).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    for frame in 0..10 {
        runtime.frame_tick(frame, 10_000_000).unwrap();
    }

    // The failure was reported and the module still serves 1.0.0.
    let saw_failure = events
        .try_iter()
        .any(|e| matches!(e.event, hotswap::Event::BuildFailed { .. }));
    assert!(saw_failure);
    assert_eq!(
        runtime.status().modules["sim"].version,
        Some(v(1, 0, 0, 1))
    );
    assert_eq!(runtime.status().stats.commits, 1);
    runtime.shutdown().unwrap();
}
