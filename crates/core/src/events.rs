//! Observer event channel
//!
//! The core publishes a typed stream of reload, build and transaction events.
//! Dashboards, analytics and compliance reporters are pure consumers: they
//! call [`EventBus::subscribe`] and read from the returned receiver. The core
//! never knows who is listening, and a slow or dropped consumer never blocks
//! a publisher.

use crate::types::{now_micros, ModuleId, SnapshotId, TxnId};
use crate::version::ModuleVersion;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

/// One event as observed by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A reload transaction started working on a module
    ReloadStarted {
        /// Module being reloaded
        module: ModuleId,
        /// Version currently active
        from: Option<ModuleVersion>,
        /// Version being swapped in
        to: ModuleVersion,
    },
    /// A module's new code image and state are live
    ReloadCompleted {
        /// Reloaded module
        module: ModuleId,
        /// Now-active version
        version: ModuleVersion,
        /// End-to-end reload latency in microseconds
        duration_us: u64,
    },
    /// A reload was rejected or aborted
    ReloadFailed {
        /// Affected module
        module: ModuleId,
        /// Failure description
        reason: String,
    },
    /// Conflict detection raised a record
    ConflictDetected {
        /// Conflicted module
        module: ModuleId,
        /// Conflict kind name
        kind: String,
        /// Severity 0..255
        severity: u8,
    },
    /// Module state was migrated between versions
    StateMigrated {
        /// Migrated module
        module: ModuleId,
        /// Source version
        from: ModuleVersion,
        /// Target version
        to: ModuleVersion,
        /// Post-migration snapshot
        snapshot: SnapshotId,
    },
    /// A build job was admitted to a worker
    BuildStarted {
        /// Build target name
        target: String,
    },
    /// A build job produced an artifact
    BuildCompleted {
        /// Build target name
        target: String,
        /// Artifact path as a string
        artifact: String,
        /// Build duration in milliseconds
        duration_ms: u64,
    },
    /// A build job failed
    BuildFailed {
        /// Build target name
        target: String,
        /// Failure description
        reason: String,
    },
    /// Phase 1 of a multi-module commit finished for a transaction
    TransactionPrepared {
        /// Prepared transaction
        txn: TxnId,
    },
    /// A transaction committed
    TransactionCommitted {
        /// Committed transaction
        txn: TxnId,
        /// Modules it touched
        modules: Vec<ModuleId>,
    },
    /// A transaction aborted
    TransactionAborted {
        /// Aborted transaction
        txn: TxnId,
        /// Abort reason
        reason: String,
    },
}

impl Event {
    /// Short name for logging and conflict payloads
    pub fn name(&self) -> &'static str {
        match self {
            Event::ReloadStarted { .. } => "ReloadStarted",
            Event::ReloadCompleted { .. } => "ReloadCompleted",
            Event::ReloadFailed { .. } => "ReloadFailed",
            Event::ConflictDetected { .. } => "ConflictDetected",
            Event::StateMigrated { .. } => "StateMigrated",
            Event::BuildStarted { .. } => "BuildStarted",
            Event::BuildCompleted { .. } => "BuildCompleted",
            Event::BuildFailed { .. } => "BuildFailed",
            Event::TransactionPrepared { .. } => "TransactionPrepared",
            Event::TransactionCommitted { .. } => "TransactionCommitted",
            Event::TransactionAborted { .. } => "TransactionAborted",
        }
    }
}

/// Event plus its publication timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Microseconds since epoch at publish time
    pub ts: u64,
    /// The event
    pub event: Event,
}

/// Fan-out channel from the core to its observers.
///
/// Publishing walks the subscriber list and drops senders whose receiver is
/// gone, so an abandoned dashboard cannot leak or block.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EventEnvelope>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a new consumer. Events published after this call are delivered.
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to all live subscribers.
    pub fn publish(&self, event: Event) {
        let envelope = EventEnvelope {
            ts: now_micros(),
            event,
        };
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    /// Number of currently attached subscribers (diagnostics only)
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
