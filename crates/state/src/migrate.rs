//! Migration routing
//!
//! The core never interprets module state; it routes bytes through the
//! module's own `migrate_state` capability. The one shortcut taken here is
//! the identity skip: a version change confined to patch/build with no
//! breaking flag on the target is applied without calling the module at all.

use hotswap_core::{ModuleId, ModuleInterface, ModuleVersion, Result, VersionFlags};
use std::sync::Arc;
use tracing::debug;

/// How a migration was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Source and target versions are equal
    SameVersion,
    /// Patch-level change without schema break; bytes passed through
    IdentitySkip,
    /// The module's migrate capability transformed the bytes
    ModuleMigrated,
}

/// Result of one migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// Migrated state bytes
    pub bytes: Vec<u8>,
    /// Which path produced them
    pub kind: MigrationKind,
}

/// Routes state bytes between versions.
#[derive(Debug, Default)]
pub struct MigrationEngine;

impl MigrationEngine {
    /// Create the engine.
    pub fn new() -> Self {
        MigrationEngine
    }

    /// Migrate `bytes` from `from` to `to` for `module`.
    ///
    /// Identity shortcuts:
    /// - `from == to` (precedence-equal) is always identity.
    /// - A patch/build-only difference is identity unless the target carries
    ///   the breaking flag, which is the module's schema-change signal.
    ///
    /// Everything else goes to the module, whose `MigrationImpossible` is
    /// surfaced unchanged.
    pub fn migrate(
        &self,
        module: ModuleId,
        interface: &Arc<dyn ModuleInterface>,
        from: &ModuleVersion,
        to: &ModuleVersion,
        bytes: &[u8],
    ) -> Result<MigrationOutcome> {
        if from.precedence(to) == std::cmp::Ordering::Equal {
            return Ok(MigrationOutcome {
                bytes: bytes.to_vec(),
                kind: MigrationKind::SameVersion,
            });
        }

        let schema_change = to.flags.contains(VersionFlags::BREAKING);
        if from.patch_level_change(to) && !schema_change {
            debug!(module = %module, %from, %to, "migration identity skip");
            return Ok(MigrationOutcome {
                bytes: bytes.to_vec(),
                kind: MigrationKind::IdentitySkip,
            });
        }

        let migrated = interface.migrate_state(from, to, bytes)?;
        debug!(
            module = %module,
            %from,
            %to,
            in_bytes = bytes.len(),
            out_bytes = migrated.len(),
            "module migrated state"
        );
        Ok(MigrationOutcome {
            bytes: migrated,
            kind: MigrationKind::ModuleMigrated,
        })
    }
}
