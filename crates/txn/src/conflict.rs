//! Conflict detection and resolution
//!
//! Each staged module update is compared against the module's committed
//! version; the result is a list of [`ConflictRecord`]s with severities and
//! resolution hints. Resolution applies a strategy across the records and
//! marks each with the action the commit path honors.
//!
//! # Conflict kinds
//!
//! | Kind | Trigger | Severity | Auto |
//! |---|---|---|---|
//! | MajorBreaking | attempted.major != current.major | 224 | no |
//! | MinorIncompatible | attempted.minor < current.minor | 128 | yes (KeepCurrent) |
//! | PatchDivergent | attempted.patch < current.patch | 64 | yes (KeepCurrent) |
//! | DeprecatedVersion | deprecated flag on attempted | 80 | yes (UseNew) |
//! | SecurityFlagged | security flag on attempted | 160 | no (OverrideNew only) |
//! | DependencyViolation | deps unsatisfied by proposed set | 192 | no |

use hotswap_core::{ModuleId, ModuleVersion, VersionFlags};
use std::fmt;

/// Kind of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Major version change; interface break
    MajorBreaking,
    /// Attempted minor version is older than the committed one
    MinorIncompatible,
    /// Attempted patch version is older than the committed one
    PatchDivergent,
    /// Attempted version is flagged deprecated
    DeprecatedVersion,
    /// Attempted version carries a security flag
    SecurityFlagged,
    /// Dependency requirements unsatisfied within the proposed set
    DependencyViolation,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::MajorBreaking => "MajorBreaking",
            ConflictKind::MinorIncompatible => "MinorIncompatible",
            ConflictKind::PatchDivergent => "PatchDivergent",
            ConflictKind::DeprecatedVersion => "DeprecatedVersion",
            ConflictKind::SecurityFlagged => "SecurityFlagged",
            ConflictKind::DependencyViolation => "DependencyViolation",
        };
        f.write_str(s)
    }
}

/// How conflicts should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Apply each record's automatic resolution where allowed
    AutoMerge,
    /// Merge state through the module's migrate capability
    ThreeWayMerge,
    /// Force the attempted version through
    OverrideNew,
    /// Keep the committed version everywhere
    KeepCurrent,
    /// Leave everything for the operator
    Manual,
}

/// Action a resolved conflict applies to its module update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Swap in the attempted version
    UseNew,
    /// Keep the committed version; drop the update from the swap set
    KeepCurrent,
    /// Swap in the attempted version with three-way-merged state
    Merge,
}

/// One detected conflict.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    /// Record id, unique within the transaction
    pub conflict_id: u64,
    /// Conflicted module
    pub module: ModuleId,
    /// Version currently committed (None on first load)
    pub current_version: Option<ModuleVersion>,
    /// Version the transaction attempts to install
    pub attempted_version: ModuleVersion,
    /// Conflict kind
    pub kind: ConflictKind,
    /// Where the conflict was found (component path, dependency name)
    pub location: String,
    /// Severity 0..=255
    pub severity: u8,
    /// Strategy most likely to resolve this record
    pub strategy_hint: ResolutionStrategy,
    /// Whether AutoMerge may resolve this record
    pub auto_resolvable: bool,
    /// Human-readable detail
    pub detail: String,
    /// Resolution applied, if any
    pub resolution: Option<ConflictAction>,
}

/// Detect version conflicts for one module update.
///
/// `current` is the committed version visible to the transaction; `None`
/// (first load) never conflicts.
pub fn detect_version_conflicts(
    next_id: &mut u64,
    module: ModuleId,
    current: Option<ModuleVersion>,
    attempted: ModuleVersion,
) -> Vec<ConflictRecord> {
    let mut records = Vec::new();
    let mut push = |kind: ConflictKind,
                    severity: u8,
                    auto: bool,
                    hint: ResolutionStrategy,
                    detail: String| {
        records.push(ConflictRecord {
            conflict_id: {
                let id = *next_id;
                *next_id += 1;
                id
            },
            module,
            current_version: current,
            attempted_version: attempted,
            kind,
            location: format!("module:{}", module),
            severity,
            strategy_hint: hint,
            auto_resolvable: auto,
            detail,
            resolution: None,
        });
    };

    if let Some(current) = current {
        if attempted.major != current.major {
            push(
                ConflictKind::MajorBreaking,
                224,
                false,
                ResolutionStrategy::OverrideNew,
                format!("major version change {} -> {}", current, attempted),
            );
        } else if attempted.minor < current.minor {
            push(
                ConflictKind::MinorIncompatible,
                128,
                true,
                ResolutionStrategy::KeepCurrent,
                format!("attempted minor {} below committed {}", attempted, current),
            );
        } else if attempted.minor == current.minor && attempted.patch < current.patch {
            push(
                ConflictKind::PatchDivergent,
                64,
                true,
                ResolutionStrategy::KeepCurrent,
                format!("attempted patch {} below committed {}", attempted, current),
            );
        }
    }

    if attempted.flags.contains(VersionFlags::DEPRECATED) {
        push(
            ConflictKind::DeprecatedVersion,
            80,
            true,
            ResolutionStrategy::AutoMerge,
            format!("{} is flagged deprecated", attempted),
        );
    }
    if attempted.flags.contains(VersionFlags::SECURITY) {
        push(
            ConflictKind::SecurityFlagged,
            160,
            false,
            ResolutionStrategy::OverrideNew,
            format!("{} carries a security flag", attempted),
        );
    }

    records
}

/// Build a dependency-violation record.
pub fn dependency_violation(
    next_id: &mut u64,
    module: ModuleId,
    attempted: ModuleVersion,
    dependency: &str,
    required: ModuleVersion,
) -> ConflictRecord {
    let id = *next_id;
    *next_id += 1;
    ConflictRecord {
        conflict_id: id,
        module,
        current_version: None,
        attempted_version: attempted,
        kind: ConflictKind::DependencyViolation,
        location: format!("dependency:{}", dependency),
        severity: 192,
        strategy_hint: ResolutionStrategy::Manual,
        auto_resolvable: false,
        detail: format!(
            "module {} requires {} >= {} within the proposed set",
            module, dependency, required
        ),
        resolution: None,
    }
}

/// Apply a strategy across unresolved records. Returns how many were
/// resolved by this call.
pub fn resolve_conflicts(records: &mut [ConflictRecord], strategy: ResolutionStrategy) -> usize {
    let mut resolved = 0usize;
    for record in records.iter_mut().filter(|r| r.resolution.is_none()) {
        let action = match strategy {
            ResolutionStrategy::AutoMerge => {
                if !record.auto_resolvable {
                    continue;
                }
                match record.kind {
                    ConflictKind::MinorIncompatible | ConflictKind::PatchDivergent => {
                        ConflictAction::KeepCurrent
                    }
                    ConflictKind::DeprecatedVersion => ConflictAction::UseNew,
                    _ => continue,
                }
            }
            ResolutionStrategy::ThreeWayMerge => match record.kind {
                ConflictKind::MinorIncompatible | ConflictKind::PatchDivergent => {
                    ConflictAction::Merge
                }
                // Merge cannot bridge an interface break or stand in for a
                // security decision.
                _ => continue,
            },
            ResolutionStrategy::OverrideNew => ConflictAction::UseNew,
            ResolutionStrategy::KeepCurrent => ConflictAction::KeepCurrent,
            ResolutionStrategy::Manual => continue,
        };
        record.resolution = Some(action);
        resolved += 1;
    }
    resolved
}

/// The action resolution settled on for `module`, if any record names it.
///
/// KeepCurrent wins over Merge wins over UseNew when several records touch
/// the same module — the most conservative action is honored.
pub fn action_for_module(records: &[ConflictRecord], module: ModuleId) -> Option<ConflictAction> {
    let mut action: Option<ConflictAction> = None;
    for record in records.iter().filter(|r| r.module == module) {
        match record.resolution {
            Some(ConflictAction::KeepCurrent) => return Some(ConflictAction::KeepCurrent),
            Some(ConflictAction::Merge) => action = Some(ConflictAction::Merge),
            Some(ConflictAction::UseNew) => {
                if action.is_none() {
                    action = Some(ConflictAction::UseNew);
                }
            }
            None => {}
        }
    }
    action
}
