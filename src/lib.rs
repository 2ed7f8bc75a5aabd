//! # Hotswap
//!
//! A hot-module-reload runtime for frame-driven simulation processes: it
//! watches compiled module artifacts on disk, rebuilds them out of band,
//! and atomically swaps running code and its in-memory state into the live
//! process without restarting it — inside a per-frame time budget, so the
//! simulation clock never stutters.
//!
//! # Quick Start
//!
//! ```no_run
//! use hotswap::{ModuleDescriptor, ModuleVersion, Runtime, RuntimeConfig};
//! use hotswap::module::testing::BufferModule;
//! use std::sync::Arc;
//!
//! fn main() -> hotswap::Result<()> {
//!     let runtime = Runtime::open(RuntimeConfig::new("./hotswap-data"))?;
//!
//!     // Each module registers its interface table once.
//!     let module = runtime.register_module(ModuleDescriptor::new(
//!         "graphics",
//!         Arc::new(BufferModule::new(ModuleVersion::new(1, 0, 0, 1))),
//!     ))?;
//!
//!     // Initial artifact load, then watch for rebuilt artifacts.
//!     runtime.load_module(std::path::Path::new("./artifacts/graphics.hart"))?;
//!     runtime.watch(std::path::Path::new("./artifacts"), true)?;
//!
//!     // The simulation calls frame_tick once per frame.
//!     let mut frame = 0u64;
//!     loop {
//!         let stats = runtime.frame_tick(frame, 1_000_000)?;
//!         if stats.committed > 0 {
//!             println!("reloaded {} module(s)", stats.committed);
//!         }
//!         frame += 1;
//!         # if frame > 3 { break; }
//!     }
//!     let _ = module;
//!     runtime.shutdown()
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |---|---|
//! | `hotswap-core` | Ids, versions, errors, events, config, module traits |
//! | `hotswap-registry` | Module registry, artifact loader, code images |
//! | `hotswap-state` | Snapshots, compression, diffing, migration routing |
//! | `hotswap-durability` | WAL, crash recovery, registry manifest |
//! | `hotswap-txn` | MVCC transactions, conflicts, 2PC commit |
//! | `hotswap-pipeline` | File watcher, build queue, admission control |
//! | `hotswap-engine` | Runtime root and frame scheduler |
//!
//! The [`Runtime`] struct is the only entry point; internal crates are
//! re-exported selectively and carry no stability promise.

pub use hotswap_core::{
    module, DurabilityLevel, Event, EventBus, EventEnvelope, HotswapError, IsolationLevel,
    ModuleDescriptor, ModuleId, ModuleInterface, ModuleVersion, Result, RuntimeConfig, SnapshotId,
    TxnId, VersionFlags,
};
pub use hotswap_engine::{FrameStats, Runtime, RuntimeBuilder, RuntimePhase, RuntimeStatus};
pub use hotswap_pipeline::{BuildOutcome, BuildPriority, Builder, BuiltArtifact};
pub use hotswap_registry::{ArtifactBuilder, CodeImage, EntryPoint, LifecycleState, ModuleInfo};
pub use hotswap_state::DiffSpec;
pub use hotswap_txn::{ResolutionStrategy, TransactionContext, TxnManager, TxnType};
