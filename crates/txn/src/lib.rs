//! Transactional swap engine
//!
//! ACID reload transactions over the module registry: MVCC visibility of
//! module versions, conflict detection and resolution, three-way state
//! merge, WAL-backed single-module commit and in-process two-phase commit
//! for dependency chains, deadline expiry and deadlock victim selection.

pub mod conflict;
pub mod context;
pub mod deadlock;
pub mod manager;
pub mod merge;
pub mod mvcc;

pub use conflict::{
    ConflictAction, ConflictKind, ConflictRecord, ResolutionStrategy,
};
pub use context::{
    ModuleUpdate, ProgressCursor, ReloadPhase, TransactionContext, TxnState, TxnType,
};
pub use deadlock::WaitGraph;
pub use manager::TxnManager;
pub use merge::{three_way_merge, MergeInput};
pub use mvcc::{LogicalClock, MvccRecord, MvccTable};
