//! Module-facing contracts
//!
//! A loaded module hands the runtime one [`ModuleInterface`] table through
//! its entry symbol. The runtime routes state bytes through it and never
//! interprets them itself: serialize must be deterministic and side-effect
//! free, deserialize must reject corrupt input, and migrate is the single
//! arbiter of cross-version state compatibility (including three-way
//! merges).

use crate::error::Result;
use crate::version::ModuleVersion;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How far a module is trusted by the loader and scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Unverified third-party code
    Untrusted,
    /// Verified but capability-restricted
    Sandboxed,
    /// First-party module
    Trusted,
    /// Engine-critical module; reload failures quarantine instead of retry
    System,
}

/// Security context attached to a module entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Named capabilities the module may use
    pub capabilities: Vec<String>,
    /// Memory ceiling for the module's state, in bytes
    pub memory_limit: u64,
    /// Trust classification
    pub trust: TrustLevel,
}

impl Default for SecurityContext {
    fn default() -> Self {
        SecurityContext {
            capabilities: Vec::new(),
            memory_limit: 64 * 1024 * 1024,
            trust: TrustLevel::Trusted,
        }
    }
}

/// Minimum dependency version a module was built against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReq {
    /// Dependency module name
    pub name: String,
    /// Version the dependent was compiled against
    pub min_version: ModuleVersion,
}

/// The interface table a module exports through its entry symbol.
///
/// Callback methods default to no-ops; state capabilities are mandatory.
/// Implementations must be `Send + Sync` — they are invoked from the frame
/// thread and referenced from worker threads holding transaction contexts.
pub trait ModuleInterface: Send + Sync {
    /// Called once after first activation.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the module is deactivated for good.
    fn shutdown(&self) {}

    /// Capture the module's live state as opaque bytes.
    ///
    /// Must be deterministic and side-effect free.
    fn serialize_state(&self) -> Result<Vec<u8>>;

    /// Install state previously produced by [`serialize_state`].
    ///
    /// [`serialize_state`]: ModuleInterface::serialize_state
    fn deserialize_state(&self, bytes: &[u8]) -> Result<()>;

    /// Transform state bytes from one version's layout to another's.
    ///
    /// Returns the migrated bytes, or `MigrationImpossible` when no path
    /// exists. `migrate_state(v, v, x)` must be the identity.
    fn migrate_state(
        &self,
        from: &ModuleVersion,
        to: &ModuleVersion,
        bytes: &[u8],
    ) -> Result<Vec<u8>>;

    /// Version this interface implementation was built as.
    fn declared_version(&self) -> ModuleVersion;

    /// Modules that must be active before this one.
    fn declared_dependencies(&self) -> Vec<DependencyReq> {
        Vec::new()
    }

    /// Phase-1 hook: the module's update is prepared but not yet live.
    fn on_reload_prepared(&self) {}

    /// The module's new image and state are live.
    fn on_reload_committed(&self) {}

    /// The reload was abandoned; prior image and state remain live.
    fn on_reload_aborted(&self) {}
}

/// Registration-time description of a module.
pub struct ModuleDescriptor {
    /// Stable module name
    pub name: String,
    /// Interface table for the currently built version
    pub interface: Arc<dyn ModuleInterface>,
    /// Critical modules fail the whole batch instead of being skipped
    pub critical: bool,
    /// Security context
    pub security: SecurityContext,
}

impl ModuleDescriptor {
    /// Descriptor with default security and non-critical standing.
    pub fn new(name: impl Into<String>, interface: Arc<dyn ModuleInterface>) -> Self {
        ModuleDescriptor {
            name: name.into(),
            interface,
            critical: false,
            security: SecurityContext::default(),
        }
    }

    /// Mark the module critical
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

pub mod testing {
    //! A byte-buffer module used across the workspace's tests.

    use super::*;
    use crate::error::HotswapError;
    use parking_lot::Mutex;

    /// Module whose state is a plain byte buffer. Serialize/deserialize are
    /// identity; migrate appends nothing by default but can be configured
    /// to refuse.
    pub struct BufferModule {
        version: ModuleVersion,
        state: Mutex<Vec<u8>>,
        refuse_migration: bool,
        deps: Vec<DependencyReq>,
    }

    impl BufferModule {
        pub fn new(version: ModuleVersion) -> Self {
            BufferModule {
                version,
                state: Mutex::new(Vec::new()),
                refuse_migration: false,
                deps: Vec::new(),
            }
        }

        pub fn with_state(self, bytes: Vec<u8>) -> Self {
            *self.state.lock() = bytes;
            self
        }

        pub fn refusing_migration(mut self) -> Self {
            self.refuse_migration = true;
            self
        }

        pub fn with_dependency(mut self, name: &str, min: ModuleVersion) -> Self {
            self.deps.push(DependencyReq {
                name: name.to_string(),
                min_version: min,
            });
            self
        }

        pub fn current_state(&self) -> Vec<u8> {
            self.state.lock().clone()
        }
    }

    impl ModuleInterface for BufferModule {
        fn serialize_state(&self) -> Result<Vec<u8>> {
            Ok(self.state.lock().clone())
        }

        fn deserialize_state(&self, bytes: &[u8]) -> Result<()> {
            *self.state.lock() = bytes.to_vec();
            Ok(())
        }

        fn migrate_state(
            &self,
            from: &ModuleVersion,
            to: &ModuleVersion,
            bytes: &[u8],
        ) -> Result<Vec<u8>> {
            if from == to {
                return Ok(bytes.to_vec());
            }
            if self.refuse_migration {
                return Err(HotswapError::MigrationImpossible {
                    module: crate::types::ModuleId(0),
                    from: *from,
                    to: *to,
                });
            }
            Ok(bytes.to_vec())
        }

        fn declared_version(&self) -> ModuleVersion {
            self.version
        }

        fn declared_dependencies(&self) -> Vec<DependencyReq> {
            self.deps.clone()
        }
    }
}
