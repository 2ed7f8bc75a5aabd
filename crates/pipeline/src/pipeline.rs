//! Build pipeline
//!
//! Consumes change events as build requests, runs them on a bounded worker
//! pool, and parks completed artifacts for the scheduler to drain once per
//! frame. The actual toolchain invocation lives behind the [`Builder`]
//! trait; the pipeline owns admission, priorities, timeouts and duration
//! accounting.
//!
//! Admission: at most `min(max_parallel_jobs, memory headroom)` jobs run
//! concurrently, clamped to one whenever system CPU load exceeds the
//! configured threshold.

use crate::estimate::DurationEstimator;
use crate::queue::{BuildQueue, BuildRequest};
use hotswap_core::{Event, EventBus, HotswapError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Successful build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    /// Path of the produced artifact
    pub artifact_path: PathBuf,
}

/// Why a build failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildFailReason {
    /// The job ran past its timeout
    Timeout,
    /// The toolchain reported an error
    Error(String),
}

impl std::fmt::Display for BuildFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildFailReason::Timeout => f.write_str("timeout"),
            BuildFailReason::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Terminal outcome of one build job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The target built; its artifact is ready for the loader
    Built {
        /// Target name
        target: String,
        /// Artifact produced
        artifact_path: PathBuf,
        /// Wall-clock build duration
        duration: Duration,
        /// Priority the request carried
        priority: crate::queue::BuildPriority,
    },
    /// The target failed to build
    Failed {
        /// Target name
        target: String,
        /// Failure cause
        reason: BuildFailReason,
    },
}

/// Toolchain boundary: turns a build request into an artifact.
pub trait Builder: Send + Sync {
    /// Run the build. Errors are toolchain diagnostics, not I/O plumbing.
    fn build(&self, request: &BuildRequest) -> std::result::Result<BuiltArtifact, String>;
}

/// Snapshot of system load consulted at admission time.
#[derive(Debug, Clone, Copy)]
pub struct SystemLoad {
    /// Normalized CPU load, 0.0..=1.0 per core
    pub cpu_load: f32,
    /// How many more jobs memory headroom allows
    pub mem_headroom_jobs: usize,
}

/// Probe producing [`SystemLoad`]; swappable for tests.
pub type LoadProbe = Box<dyn Fn() -> SystemLoad + Send + Sync>;

/// Probe reading `/proc`; degrades to "unconstrained" when unreadable.
pub fn system_load_probe() -> SystemLoad {
    let cpus = num_cpus::get().max(1);
    let cpu_load = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .next()
                .and_then(|first| first.parse::<f32>().ok())
        })
        .map(|load1| load1 / cpus as f32)
        .unwrap_or(0.0);

    // Budget half a gigabyte of available memory per concurrent job.
    let mem_headroom_jobs = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("MemAvailable:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map(|kb| (kb / (512 * 1024)).max(1) as usize)
        .unwrap_or(usize::MAX);

    SystemLoad {
        cpu_load,
        mem_headroom_jobs,
    }
}

/// Pipeline configuration.
pub struct PipelineConfig {
    /// Upper bound on concurrently running jobs
    pub max_parallel_jobs: usize,
    /// CPU load above which admission clamps to one job
    pub cpu_load_threshold: f32,
    /// Per-job wall-clock timeout
    pub job_timeout: Duration,
}

struct PipelineInner {
    queue: Mutex<BuildQueue>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
    completed: Mutex<VecDeque<BuildOutcome>>,
    builder: Arc<dyn Builder>,
    events: Arc<EventBus>,
    estimator: DurationEstimator,
    probe: LoadProbe,
    max_parallel: usize,
    cpu_threshold: f32,
    timeout: Duration,
}

impl PipelineInner {
    /// Concurrency ceiling under current load.
    fn effective_limit(&self) -> usize {
        let load = (self.probe)();
        if load.cpu_load > self.cpu_threshold {
            1
        } else {
            self.max_parallel.min(load.mem_headroom_jobs).max(1)
        }
    }
}

/// Bounded build worker pool with a priority queue.
pub struct BuildPipeline {
    inner: Arc<PipelineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildPipeline {
    /// Spawn the pipeline with the default `/proc` load probe.
    pub fn new(config: PipelineConfig, builder: Arc<dyn Builder>, events: Arc<EventBus>) -> Self {
        Self::with_probe(config, builder, events, Box::new(system_load_probe))
    }

    /// Spawn the pipeline with a custom load probe (tests).
    pub fn with_probe(
        config: PipelineConfig,
        builder: Arc<dyn Builder>,
        events: Arc<EventBus>,
        probe: LoadProbe,
    ) -> Self {
        let inner = Arc::new(PipelineInner {
            queue: Mutex::new(BuildQueue::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: Mutex::new(VecDeque::new()),
            builder,
            events,
            estimator: DurationEstimator::default(),
            probe,
            max_parallel: config.max_parallel_jobs.max(1),
            cpu_threshold: config.cpu_load_threshold,
            timeout: config.job_timeout,
        });

        let mut workers = Vec::with_capacity(inner.max_parallel);
        for i in 0..inner.max_parallel {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("hotswap-build-{}", i))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn build worker");
            workers.push(handle);
        }

        BuildPipeline {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a build request.
    pub fn submit(&self, request: BuildRequest) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(HotswapError::invalid_argument("pipeline is shut down"));
        }
        debug!(target = %request.target, priority = ?request.priority, "build queued");
        self.inner.queue.lock().push(request);
        self.inner.work_ready.notify_all();
        Ok(())
    }

    /// Predicted duration for a target (exponential blend of history).
    pub fn predict_duration(&self, target: &str) -> Duration {
        self.inner.estimator.predict(target)
    }

    /// Drain up to `max` completed outcomes, oldest first.
    pub fn drain_completed(&self, max: usize) -> Vec<BuildOutcome> {
        let mut completed = self.inner.completed.lock();
        let take = completed.len().min(max);
        completed.drain(..take).collect()
    }

    /// Jobs currently running.
    pub fn active_jobs(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Requests waiting in the queue.
    pub fn queued_jobs(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Stop accepting work, finish nothing further, and join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.work_ready.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("build worker panicked during shutdown");
            }
        }
        info!("build pipeline stopped");
    }
}

impl Drop for BuildPipeline {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

fn worker_loop(inner: &Arc<PipelineInner>) {
    loop {
        let request = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                // Admission: pop only while below the current ceiling.
                if !queue.is_empty()
                    && inner.active.load(Ordering::Acquire) < inner.effective_limit()
                {
                    break;
                }
                inner
                    .work_ready
                    .wait_for(&mut queue, Duration::from_millis(50));
            }
            inner.active.fetch_add(1, Ordering::AcqRel);
            queue.pop().expect("non-empty queue under lock")
        };

        inner.events.publish(Event::BuildStarted {
            target: request.target.clone(),
        });
        let started = Instant::now();
        let result = inner.builder.build(&request);
        let duration = started.elapsed();
        inner.estimator.observe(&request.target, duration);

        let outcome = match result {
            Ok(_) if duration > inner.timeout => {
                warn!(target = %request.target, ?duration, "build exceeded its timeout");
                BuildOutcome::Failed {
                    target: request.target.clone(),
                    reason: BuildFailReason::Timeout,
                }
            }
            Ok(artifact) => BuildOutcome::Built {
                target: request.target.clone(),
                artifact_path: artifact.artifact_path,
                duration,
                priority: request.priority,
            },
            Err(e) => BuildOutcome::Failed {
                target: request.target.clone(),
                reason: BuildFailReason::Error(e),
            },
        };

        match &outcome {
            BuildOutcome::Built { artifact_path, .. } => {
                inner.events.publish(Event::BuildCompleted {
                    target: request.target.clone(),
                    artifact: artifact_path.display().to_string(),
                    duration_ms: duration.as_millis() as u64,
                });
            }
            BuildOutcome::Failed { reason, .. } => {
                inner.events.publish(Event::BuildFailed {
                    target: request.target.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        inner.completed.lock().push_back(outcome);
        inner.active.fetch_sub(1, Ordering::AcqRel);
        inner.work_ready.notify_all();
    }
}
