//! Multi-version concurrency control over module versions
//!
//! Each module has an append-only chain of version records. A transaction
//! stages a record with no commit timestamp; commit stamps every record of
//! the transaction with its write timestamp, abort removes them. Readers
//! resolve visibility against a logical timestamp: the newest record with
//! `committed_ts <= read_ts`.
//!
//! Records hold a strong reference to their code image, which is what keeps
//! a superseded image alive while any transaction can still see it. The GC
//! prunes records no active reader can reach, dropping those references.

use dashmap::DashMap;
use hotswap_core::{IsolationLevel, ModuleId, ModuleVersion, SnapshotId, TxnId};
use hotswap_registry::CodeImage;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic logical clock for read/write timestamps.
#[derive(Debug, Default)]
pub struct LogicalClock {
    counter: AtomicU64,
}

impl LogicalClock {
    /// Clock starting at `initial`.
    pub fn new(initial: u64) -> Self {
        LogicalClock {
            counter: AtomicU64::new(initial),
        }
    }

    /// Allocate the next timestamp.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Latest allocated timestamp.
    pub fn now(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// One version record in a module's chain.
#[derive(Clone)]
pub struct MvccRecord {
    /// Record id, unique across modules
    pub version_id: u64,
    /// Module
    pub module: ModuleId,
    /// Logical timestamp at staging
    pub created_ts: u64,
    /// Logical commit timestamp; `None` while staged
    pub committed_ts: Option<u64>,
    /// Transaction that staged the record
    pub creating_txn: TxnId,
    /// Module version this record installs
    pub version: ModuleVersion,
    /// Committed state snapshot
    pub snapshot: Option<SnapshotId>,
    /// Code image of the version (strong reference)
    pub image: Option<Arc<CodeImage>>,
}

/// Per-module version chains.
#[derive(Default)]
pub struct MvccTable {
    chains: DashMap<ModuleId, RwLock<Vec<MvccRecord>>>,
    next_version_id: AtomicU64,
}

impl MvccTable {
    /// Empty table.
    pub fn new() -> Self {
        MvccTable {
            chains: DashMap::new(),
            next_version_id: AtomicU64::new(1),
        }
    }

    /// Stage a version record for `txn`. Returns the record id.
    pub fn stage(
        &self,
        txn: TxnId,
        module: ModuleId,
        created_ts: u64,
        version: ModuleVersion,
        snapshot: Option<SnapshotId>,
        image: Option<Arc<CodeImage>>,
    ) -> u64 {
        let version_id = self.next_version_id.fetch_add(1, Ordering::SeqCst);
        let record = MvccRecord {
            version_id,
            module,
            created_ts,
            committed_ts: None,
            creating_txn: txn,
            version,
            snapshot,
            image,
        };
        self.chains.entry(module).or_default().write().push(record);
        version_id
    }

    /// Stamp every record staged by `txn` with `write_ts`.
    pub fn commit(&self, txn: TxnId, write_ts: u64) {
        for chain in self.chains.iter() {
            let mut chain = chain.write();
            for record in chain.iter_mut() {
                if record.creating_txn == txn && record.committed_ts.is_none() {
                    record.committed_ts = Some(write_ts);
                }
            }
        }
    }

    /// Remove every staged (uncommitted) record of `txn`.
    pub fn abort(&self, txn: TxnId) {
        for chain in self.chains.iter() {
            chain
                .write()
                .retain(|r| !(r.creating_txn == txn && r.committed_ts.is_none()));
        }
    }

    /// The record visible to a reader at `read_ts`: newest committed record
    /// with `committed_ts <= read_ts`. Uncommitted records are never
    /// visible to other transactions.
    pub fn visible_at(&self, module: ModuleId, read_ts: u64) -> Option<MvccRecord> {
        let chain = self.chains.get(&module)?;
        let chain = chain.read();
        chain
            .iter()
            .filter(|r| r.committed_ts.map(|ts| ts <= read_ts).unwrap_or(false))
            .max_by_key(|r| r.committed_ts)
            .cloned()
    }

    /// Visibility resolved by isolation level: snapshot isolation levels
    /// pin to `read_ts`, the others chase the newest committed record.
    pub fn visible(
        &self,
        module: ModuleId,
        isolation: IsolationLevel,
        read_ts: u64,
    ) -> Option<MvccRecord> {
        match isolation {
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                self.visible_at(module, read_ts)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                self.visible_at(module, u64::MAX)
            }
        }
    }

    /// Newest commit timestamp on a module's chain.
    ///
    /// The Serializable write check compares this against a transaction's
    /// read timestamp: anything newer means a concurrent writer won.
    pub fn newest_committed_ts(&self, module: ModuleId) -> Option<u64> {
        let chain = self.chains.get(&module)?;
        let chain = chain.read();
        chain.iter().filter_map(|r| r.committed_ts).max()
    }

    /// Find a committed record installing exactly `version` (rollback path).
    pub fn find_version(&self, module: ModuleId, version: &ModuleVersion) -> Option<MvccRecord> {
        let chain = self.chains.get(&module)?;
        let chain = chain.read();
        chain
            .iter()
            .filter(|r| r.committed_ts.is_some() && r.version == *version)
            .max_by_key(|r| r.committed_ts)
            .cloned()
    }

    /// Prune records invisible to every reader at or after `horizon_ts`.
    ///
    /// For each module the newest committed record with `committed_ts <=
    /// horizon` survives (it is what a reader at the horizon sees), along
    /// with everything newer and everything still uncommitted. Returns the
    /// number of records dropped; their image references drop with them.
    pub fn gc(&self, horizon_ts: u64) -> usize {
        let mut pruned = 0usize;
        for chain in self.chains.iter() {
            let mut chain = chain.write();
            let keep_floor = chain
                .iter()
                .filter(|r| r.committed_ts.map(|ts| ts <= horizon_ts).unwrap_or(false))
                .max_by_key(|r| r.committed_ts)
                .map(|r| r.version_id);
            if let Some(floor) = keep_floor {
                let before = chain.len();
                chain.retain(|r| {
                    r.committed_ts.is_none()
                        || r.version_id == floor
                        || r.committed_ts.map(|ts| ts > horizon_ts).unwrap_or(false)
                });
                pruned += before - chain.len();
            }
        }
        pruned
    }

    /// Number of records across all chains (diagnostics).
    pub fn record_count(&self) -> usize {
        self.chains.iter().map(|c| c.read().len()).sum()
    }
}
