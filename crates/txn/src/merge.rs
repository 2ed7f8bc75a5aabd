//! Three-way state merge
//!
//! Merging is not byte splicing: the module's own migrate capability is the
//! arbiter. Given a common-ancestor state plus the current and incoming
//! states, the trivial cases (one side unchanged) resolve without the
//! module; everything else is handed to `migrate_state` from the current
//! version to the incoming version, and a module that cannot bridge the two
//! makes the conflict unmergeable.

use hotswap_core::{HotswapError, ModuleId, ModuleInterface, ModuleVersion, Result};
use std::sync::Arc;
use tracing::debug;

/// Inputs to a three-way merge.
pub struct MergeInput<'a> {
    /// Common ancestor state
    pub base: &'a [u8],
    /// State currently live
    pub current: &'a [u8],
    /// State arriving with the new version
    pub incoming: &'a [u8],
    /// Version of the live state
    pub current_version: ModuleVersion,
    /// Version of the incoming state
    pub incoming_version: ModuleVersion,
}

/// Merge `current` and `incoming` over `base`.
///
/// Fast paths:
/// - current == incoming → either side
/// - current == base (only the incoming side changed) → incoming
/// - incoming == base (only the live side changed) → current, migrated to
///   the incoming version so it matches the new code
///
/// Both-sides-changed goes to the module. `MigrationImpossible` from the
/// module is reported as `ConflictUnmergeable`.
pub fn three_way_merge(
    module: ModuleId,
    interface: &Arc<dyn ModuleInterface>,
    input: MergeInput<'_>,
) -> Result<Vec<u8>> {
    if input.current == input.incoming {
        return Ok(input.incoming.to_vec());
    }
    if input.current == input.base {
        debug!(module = %module, "merge fast path: only incoming changed");
        return Ok(input.incoming.to_vec());
    }

    let migrate = |bytes: &[u8]| {
        interface
            .migrate_state(&input.current_version, &input.incoming_version, bytes)
            .map_err(|e| match e {
                HotswapError::MigrationImpossible { .. } => HotswapError::ConflictUnmergeable {
                    module,
                    reason: format!(
                        "module cannot merge {} into {}",
                        input.current_version, input.incoming_version
                    ),
                },
                other => other,
            })
    };

    if input.incoming == input.base {
        debug!(module = %module, "merge fast path: only current changed");
        return migrate(input.current);
    }

    debug!(module = %module, "merge: both sides changed, module arbitrates");
    migrate(input.current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_core::module::testing::BufferModule;

    fn versions() -> (ModuleVersion, ModuleVersion) {
        (ModuleVersion::new(1, 1, 0, 1), ModuleVersion::new(1, 2, 0, 2))
    }

    fn iface(refusing: bool) -> Arc<dyn ModuleInterface> {
        let m = BufferModule::new(ModuleVersion::new(1, 2, 0, 2));
        if refusing {
            Arc::new(m.refusing_migration())
        } else {
            Arc::new(m)
        }
    }

    #[test]
    fn test_identical_sides_merge_trivially() {
        let (cv, iv) = versions();
        let merged = three_way_merge(
            ModuleId(1),
            &iface(true),
            MergeInput {
                base: b"old",
                current: b"same",
                incoming: b"same",
                current_version: cv,
                incoming_version: iv,
            },
        )
        .unwrap();
        assert_eq!(merged, b"same");
    }

    #[test]
    fn test_only_incoming_changed_takes_incoming() {
        let (cv, iv) = versions();
        let merged = three_way_merge(
            ModuleId(1),
            &iface(true),
            MergeInput {
                base: b"base",
                current: b"base",
                incoming: b"new",
                current_version: cv,
                incoming_version: iv,
            },
        )
        .unwrap();
        assert_eq!(merged, b"new");
    }

    #[test]
    fn test_only_current_changed_migrates_current() {
        let (cv, iv) = versions();
        let merged = three_way_merge(
            ModuleId(1),
            &iface(false),
            MergeInput {
                base: b"base",
                current: b"live-edits",
                incoming: b"base",
                current_version: cv,
                incoming_version: iv,
            },
        )
        .unwrap();
        // BufferModule migrates by identity.
        assert_eq!(merged, b"live-edits");
    }

    #[test]
    fn test_both_changed_module_arbitrates() {
        let (cv, iv) = versions();
        let merged = three_way_merge(
            ModuleId(1),
            &iface(false),
            MergeInput {
                base: b"base",
                current: b"ours",
                incoming: b"theirs",
                current_version: cv,
                incoming_version: iv,
            },
        )
        .unwrap();
        assert_eq!(merged, b"ours");
    }

    #[test]
    fn test_module_refusal_is_unmergeable() {
        let (cv, iv) = versions();
        let err = three_way_merge(
            ModuleId(1),
            &iface(true),
            MergeInput {
                base: b"base",
                current: b"ours",
                incoming: b"theirs",
                current_version: cv,
                incoming_version: iv,
            },
        )
        .unwrap_err();
        assert!(matches!(err, HotswapError::ConflictUnmergeable { .. }));
    }
}
