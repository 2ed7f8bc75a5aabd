//! Module version identity
//!
//! A [`ModuleVersion`] names one build of one module. Precedence (which build
//! is newer) is lexicographic on `(major, minor, patch, build)`. Compatibility
//! is a separate judgement made by conflict detection: a version can be newer
//! and still be rejected, so `ModuleVersion` deliberately does not implement
//! `Ord` — callers compare through [`ModuleVersion::precedence`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Classification flags carried by a version.
///
/// Stored as a bitmask so versions stay `Copy` and cheap to embed in WAL
/// payloads and snapshot headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct VersionFlags(u8);

impl VersionFlags {
    /// Production-ready build
    pub const STABLE: VersionFlags = VersionFlags(0b0000_0001);
    /// Beta-channel build
    pub const BETA: VersionFlags = VersionFlags(0b0000_0010);
    /// Alpha-channel build
    pub const ALPHA: VersionFlags = VersionFlags(0b0000_0100);
    /// Contains breaking interface changes
    pub const BREAKING: VersionFlags = VersionFlags(0b0000_1000);
    /// Scheduled for removal
    pub const DEPRECATED: VersionFlags = VersionFlags(0b0001_0000);
    /// Carries a security fix
    pub const SECURITY: VersionFlags = VersionFlags(0b0010_0000);

    /// Empty flag set
    pub const fn empty() -> Self {
        VersionFlags(0)
    }

    /// Check whether all bits of `other` are set
    #[inline]
    pub const fn contains(&self, other: VersionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets
    #[inline]
    pub const fn union(&self, other: VersionFlags) -> VersionFlags {
        VersionFlags(self.0 | other.0)
    }

    /// Raw bits (for persisted formats)
    #[inline]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Reconstruct from raw bits; unknown bits are preserved
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        VersionFlags(bits)
    }
}

impl std::ops::BitOr for VersionFlags {
    type Output = VersionFlags;

    fn bitor(self, rhs: VersionFlags) -> VersionFlags {
        self.union(rhs)
    }
}

/// Version of one module build.
///
/// `timestamp` and `content_hash` identify the artifact the version was built
/// from; they never participate in precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    /// Major component; a change here is an interface break
    pub major: u16,
    /// Minor component; additive changes
    pub minor: u16,
    /// Patch component; behavior-preserving fixes
    pub patch: u16,
    /// Build counter, assigned by the build pipeline
    pub build: u32,
    /// Classification flags
    pub flags: VersionFlags,
    /// Build timestamp, microseconds since epoch
    pub timestamp: u64,
    /// Hash of the artifact payload this version was built into
    pub content_hash: u64,
}

impl ModuleVersion {
    /// Create a version with empty flags and no artifact identity.
    ///
    /// Flags, timestamp and hash are normally filled in by the loader from
    /// the artifact header; this constructor covers registration defaults
    /// and tests.
    pub const fn new(major: u16, minor: u16, patch: u16, build: u32) -> Self {
        ModuleVersion {
            major,
            minor,
            patch,
            build,
            flags: VersionFlags::empty(),
            timestamp: 0,
            content_hash: 0,
        }
    }

    /// Same version with the given flags
    pub const fn with_flags(mut self, flags: VersionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Precedence ordering: lexicographic on (major, minor, patch, build).
    ///
    /// `Equal` means "same build slot", not "same artifact" — two artifacts
    /// can share numbers and differ in content hash.
    pub fn precedence(&self, other: &ModuleVersion) -> Ordering {
        (self.major, self.minor, self.patch, self.build).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.build,
        ))
    }

    /// True when `self` is strictly newer than `other`
    #[inline]
    pub fn is_newer_than(&self, other: &ModuleVersion) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    /// True when this version satisfies a minimum requirement.
    ///
    /// Used by the dependency rule: an active dependency must be at a
    /// version `>=` the one the dependent was built against.
    #[inline]
    pub fn satisfies(&self, minimum: &ModuleVersion) -> bool {
        self.precedence(minimum) != Ordering::Less
    }

    /// True when the difference from `other` stays within patch/build.
    ///
    /// Migrations between such versions may take the identity shortcut as
    /// long as the module declares no schema change.
    pub fn patch_level_change(&self, other: &ModuleVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}+{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flags_contains_and_union() {
        let f = VersionFlags::STABLE | VersionFlags::SECURITY;
        assert!(f.contains(VersionFlags::STABLE));
        assert!(f.contains(VersionFlags::SECURITY));
        assert!(!f.contains(VersionFlags::BREAKING));
        assert_eq!(VersionFlags::from_bits(f.bits()), f);
    }

    #[test]
    fn test_precedence_is_lexicographic() {
        let base = ModuleVersion::new(1, 2, 3, 100);
        assert!(ModuleVersion::new(1, 2, 4, 0).is_newer_than(&base));
        assert!(ModuleVersion::new(1, 3, 0, 0).is_newer_than(&base));
        assert!(ModuleVersion::new(2, 0, 0, 0).is_newer_than(&base));
        assert!(ModuleVersion::new(1, 2, 3, 101).is_newer_than(&base));
        assert!(!base.is_newer_than(&base));
    }

    #[test]
    fn test_flags_do_not_affect_precedence() {
        let a = ModuleVersion::new(1, 0, 0, 1);
        let b = ModuleVersion::new(1, 0, 0, 1).with_flags(VersionFlags::BREAKING);
        assert_eq!(a.precedence(&b), Ordering::Equal);
    }

    #[test]
    fn test_satisfies_minimum() {
        let min = ModuleVersion::new(1, 1, 0, 0);
        assert!(ModuleVersion::new(1, 1, 0, 0).satisfies(&min));
        assert!(ModuleVersion::new(1, 2, 0, 0).satisfies(&min));
        assert!(!ModuleVersion::new(1, 0, 9, 50).satisfies(&min));
    }

    #[test]
    fn test_patch_level_change() {
        let a = ModuleVersion::new(1, 2, 3, 100);
        assert!(a.patch_level_change(&ModuleVersion::new(1, 2, 4, 101)));
        assert!(!a.patch_level_change(&ModuleVersion::new(1, 3, 0, 102)));
        assert!(!a.patch_level_change(&ModuleVersion::new(2, 2, 3, 103)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ModuleVersion::new(1, 2, 3, 100).to_string(), "1.2.3+100");
    }

    proptest! {
        #[test]
        fn prop_precedence_total_and_antisymmetric(
            a in (0u16..8, 0u16..8, 0u16..8, 0u32..8),
            b in (0u16..8, 0u16..8, 0u16..8, 0u32..8),
        ) {
            let va = ModuleVersion::new(a.0, a.1, a.2, a.3);
            let vb = ModuleVersion::new(b.0, b.1, b.2, b.3);
            match va.precedence(&vb) {
                Ordering::Less => prop_assert_eq!(vb.precedence(&va), Ordering::Greater),
                Ordering::Greater => prop_assert_eq!(vb.precedence(&va), Ordering::Less),
                Ordering::Equal => prop_assert_eq!(vb.precedence(&va), Ordering::Equal),
            }
        }

        #[test]
        fn prop_satisfies_is_reflexive(
            a in (0u16..8, 0u16..8, 0u16..8, 0u32..8),
        ) {
            let v = ModuleVersion::new(a.0, a.1, a.2, a.3);
            prop_assert!(v.satisfies(&v));
        }
    }
}
