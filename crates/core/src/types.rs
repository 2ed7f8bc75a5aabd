//! Identifier and timestamp types shared across the runtime
//!
//! Every entity that crosses a component boundary is referred to by a small
//! copyable id. Only the owning table (registry, state store, transaction
//! manager) holds the actual data; everything else resolves ids through it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable numeric identity of a module.
///
/// Assigned at first registration and never reused for the lifetime of the
/// process. Survives any number of reloads of the module's code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// Get the raw numeric value
    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Transaction identifier.
///
/// Monotonically increasing. Younger transactions have larger ids, which is
/// what the deadlock detector relies on when picking a victim.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Get the raw numeric value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn{}", self.0)
    }
}

/// State snapshot identifier, unique per runtime instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Get the raw numeric value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap{}", self.0)
    }
}

/// Log sequence number of a WAL record.
///
/// Dense and monotonic within one runtime instance. Recovery replays records
/// in LSN order and never observes a gap except at a discarded corrupt tail.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Get the raw numeric value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The next LSN in sequence
    #[inline]
    pub const fn next(&self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn{}", self.0)
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// Used for persisted record timestamps. Ordering decisions inside the
/// transaction manager use the logical clock instead, never wall time.
pub fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}
