//! Unified error type for the reload runtime
//!
//! Every fallible operation across the workspace returns [`Result`]. The
//! variants follow the failure taxonomy the runtime recovers from locally
//! (budget exhaustion, deadlock victims, transient build failures) versus
//! what it surfaces to callers (commit failures, integrity rejections,
//! migration impossibility, WAL health).
//!
//! Classification predicates (`is_retryable`, `is_caller_error`,
//! `is_serious`) drive that policy at the call sites instead of ad-hoc
//! matching.

use crate::types::{ModuleId, SnapshotId, TxnId};
use crate::version::ModuleVersion;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, HotswapError>;

/// Error type for all reload runtime operations
#[derive(Debug, Error)]
pub enum HotswapError {
    // =========================================================================
    // Caller errors — never recovered internally
    // =========================================================================
    /// Invalid argument supplied by the caller
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the input
        message: String,
    },

    /// Referenced module does not exist in the registry
    #[error("module not found: {module}")]
    ModuleNotFound {
        /// The missing module
        module: ModuleId,
    },

    /// Referenced snapshot does not exist in the state store
    #[error("snapshot not found: {snapshot}")]
    SnapshotNotFound {
        /// The missing snapshot
        snapshot: SnapshotId,
    },

    /// Symbol is not present in a code image's export table
    #[error("symbol not found: {symbol}")]
    SymbolNotFound {
        /// Requested symbol name
        symbol: String,
    },

    // =========================================================================
    // Resource errors
    // =========================================================================
    /// A capacity limit was reached
    #[error("pool exhausted: {resource} (limit {limit})")]
    PoolExhausted {
        /// Which pool hit its limit
        resource: String,
        /// The configured limit
        limit: usize,
    },

    // =========================================================================
    // Artifact / loader errors — the module stays on its prior image
    // =========================================================================
    /// Artifact could not be mapped into a code image
    #[error("load failed for {path}: {reason}")]
    LoadFailed {
        /// Artifact path
        path: PathBuf,
        /// Why mapping failed
        reason: String,
    },

    /// Artifact content hash does not match its header
    #[error("integrity check failed for {path}: {reason}")]
    IntegrityFailed {
        /// Artifact path
        path: PathBuf,
        /// Mismatch detail
        reason: String,
    },

    /// Artifact signature missing or wrong while signatures are required
    #[error("signature invalid for {path}")]
    SignatureInvalid {
        /// Artifact path
        path: PathBuf,
    },

    // =========================================================================
    // Dependency errors — transaction aborts, no registry mutation
    // =========================================================================
    /// A module's dependency is missing or below the required version
    #[error("dependency violated: {module} requires {dependency} >= {required}")]
    DependencyViolated {
        /// The dependent module
        module: ModuleId,
        /// The dependency that failed the check
        dependency: String,
        /// Minimum version the dependent was built against
        required: ModuleVersion,
    },

    /// The dependency graph of a batch contains a cycle
    #[error("cyclic dependency among modules {modules:?}")]
    CyclicDependency {
        /// Modules participating in the cycle
        modules: Vec<ModuleId>,
    },

    // =========================================================================
    // Conflict errors
    // =========================================================================
    /// Conflicts were detected and block the commit until resolved
    #[error("{count} unresolved conflict(s) on transaction {txn}")]
    ConflictUnresolved {
        /// Transaction holding the conflicts
        txn: TxnId,
        /// How many conflicts remain
        count: usize,
    },

    /// Three-way merge could not produce a result
    #[error("unmergeable conflict on module {module}: {reason}")]
    ConflictUnmergeable {
        /// Module whose state could not be merged
        module: ModuleId,
        /// Why the merge failed
        reason: String,
    },

    // =========================================================================
    // State errors — transaction aborts and restores the pre-state snapshot
    // =========================================================================
    /// The module cannot migrate its state between the two versions
    #[error("migration impossible for {module}: {from} -> {to}")]
    MigrationImpossible {
        /// Module being migrated
        module: ModuleId,
        /// Source version
        from: ModuleVersion,
        /// Target version
        to: ModuleVersion,
    },

    /// Snapshot bytes failed their checksum or decode
    #[error("state corrupted in {snapshot}: {reason}")]
    StateCorrupted {
        /// The damaged snapshot
        snapshot: SnapshotId,
        /// Corruption detail
        reason: String,
    },

    // =========================================================================
    // Durability errors
    // =========================================================================
    /// A WAL append or sync failed; the runtime enters degraded mode
    #[error("WAL write failed: {reason}")]
    WalWriteFailed {
        /// Underlying failure
        reason: String,
    },

    /// The runtime is degraded and rejects new commits until the WAL heals
    #[error("runtime degraded: commits rejected until WAL is healthy")]
    Degraded,

    /// Crash recovery could not complete during init
    #[error("crash recovery failed: {reason}")]
    RecoveryFailed {
        /// What recovery choked on
        reason: String,
    },

    // =========================================================================
    // Scheduling errors — recovered locally by the scheduler
    // =========================================================================
    /// Frame budget exhausted; remaining work deferred to the next frame
    #[error("frame budget exceeded during {operation}")]
    BudgetExceeded {
        /// The step that ran out of budget
        operation: String,
    },

    /// The scheduler is disabled
    #[error("reload scheduler is disabled")]
    SchedulerDisabled,

    /// A transaction ran past its deadline
    #[error("deadline expired for transaction {txn}")]
    DeadlineExpired {
        /// The expired transaction
        txn: TxnId,
    },

    /// A waits-for cycle was broken by aborting this transaction
    #[error("transaction {victim} aborted to break a deadlock")]
    Deadlock {
        /// The chosen victim (youngest in the cycle)
        victim: TxnId,
    },

    // =========================================================================
    // Transaction lifecycle errors
    // =========================================================================
    /// Operation attempted on a transaction outside the required state
    #[error("transaction {txn} is {state}, operation requires {required}")]
    TransactionState {
        /// The transaction
        txn: TxnId,
        /// Its current state
        state: String,
        /// The state the operation needed
        required: String,
    },

    /// The transaction was aborted
    #[error("transaction {txn} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction
        txn: TxnId,
        /// Why it aborted
        reason: String,
    },

    // =========================================================================
    // Infrastructure errors
    // =========================================================================
    /// I/O failure outside the WAL path
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a persisted structure failed
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong
        message: String,
    },

    /// Invariant violation; indicates a bug
    #[error("internal error: {message}")]
    Internal {
        /// Description of the broken invariant
        message: String,
    },
}

impl HotswapError {
    /// Create an InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        HotswapError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a LoadFailed error
    pub fn load_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HotswapError::LoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an IntegrityFailed error
    pub fn integrity_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HotswapError::IntegrityFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a StateCorrupted error
    pub fn state_corrupted(snapshot: SnapshotId, reason: impl Into<String>) -> Self {
        HotswapError::StateCorrupted {
            snapshot,
            reason: reason.into(),
        }
    }

    /// Create a WalWriteFailed error
    pub fn wal_write_failed(reason: impl Into<String>) -> Self {
        HotswapError::WalWriteFailed {
            reason: reason.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        HotswapError::Serialization {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        HotswapError::Internal {
            message: message.into(),
        }
    }

    /// Create a TransactionState error
    pub fn transaction_state(
        txn: TxnId,
        state: impl Into<String>,
        required: impl Into<String>,
    ) -> Self {
        HotswapError::TransactionState {
            txn,
            state: state.into(),
            required: required.into(),
        }
    }

    /// Caller mistakes: bad arguments and dangling references.
    ///
    /// Never retried and never recovered internally.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            HotswapError::InvalidArgument { .. }
                | HotswapError::ModuleNotFound { .. }
                | HotswapError::SnapshotNotFound { .. }
                | HotswapError::SymbolNotFound { .. }
        )
    }

    /// Errors the scheduler recovers from by retrying on a later frame.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HotswapError::BudgetExceeded { .. }
                | HotswapError::Deadlock { .. }
                | HotswapError::TransactionAborted { .. }
        )
    }

    /// Artifact rejections that leave the module on its prior code image.
    pub fn is_artifact_rejection(&self) -> bool {
        matches!(
            self,
            HotswapError::LoadFailed { .. }
                | HotswapError::IntegrityFailed { .. }
                | HotswapError::SignatureInvalid { .. }
                | HotswapError::SymbolNotFound { .. }
        )
    }

    /// Corruption and broken invariants. Log loudly and investigate.
    pub fn is_serious(&self) -> bool {
        matches!(
            self,
            HotswapError::StateCorrupted { .. }
                | HotswapError::Internal { .. }
                | HotswapError::RecoveryFailed { .. }
        )
    }

    /// Failures that push the runtime into degraded mode.
    pub fn is_wal_failure(&self) -> bool {
        matches!(
            self,
            HotswapError::WalWriteFailed { .. } | HotswapError::Degraded
        )
    }
}

impl From<bincode::Error> for HotswapError {
    fn from(e: bincode::Error) -> Self {
        HotswapError::Serialization {
            message: e.to_string(),
        }
    }
}
