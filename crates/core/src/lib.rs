//! Core types for the hotswap reload runtime
//!
//! Ids, versions, the error taxonomy, the observer event bus, runtime
//! configuration and the module-facing interface contracts. Everything here
//! is dependency-light; the heavier crates (registry, state, durability,
//! txn, pipeline, engine) build on these types.

pub mod config;
pub mod error;
pub mod events;
pub mod module;
pub mod types;
pub mod version;

pub use config::{BuildConfig, DurabilityLevel, IsolationLevel, RuntimeConfig, SecurityConfig};
pub use error::{HotswapError, Result};
pub use events::{Event, EventBus, EventEnvelope};
pub use module::{DependencyReq, ModuleDescriptor, ModuleInterface, SecurityContext, TrustLevel};
pub use types::{now_micros, Lsn, ModuleId, SnapshotId, TxnId};
pub use version::{ModuleVersion, VersionFlags};
