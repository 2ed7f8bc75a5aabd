//! State store
//!
//! Per-module chains of state snapshots. Each chain entry records its parent
//! snapshot, which is the lineage three-way merge walks to find a common
//! ancestor. The chain itself is guarded by a per-module mutex; snapshot
//! bytes are immutable once written.
//!
//! Retention: the pre-image of an active transaction is protected until that
//! transaction terminates, the committed snapshot of a module is always
//! protected, and everything else falls to the count/age policy.

use crate::snapshot::{
    read_snapshot, read_snapshot_header, snapshot_path, write_snapshot, CompressionKind,
    SnapshotHeader, StateSnapshot,
};
use dashmap::DashMap;
use hotswap_core::{now_micros, HotswapError, ModuleId, ModuleVersion, Result, SnapshotId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One link in a module's snapshot chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntry {
    /// Snapshot id
    pub snapshot: SnapshotId,
    /// Module version the state was serialized under
    pub version: ModuleVersion,
    /// Snapshot this one was derived from
    pub parent: Option<SnapshotId>,
    /// Set when the owning transaction committed
    pub committed: bool,
    /// Marked when a checksum failure was observed; migration is forbidden
    pub failed: bool,
    /// Creation timestamp, microseconds since epoch
    pub created_ts: u64,
    /// Uncompressed size
    pub size: u64,
}

/// Retention policy applied by [`StateStore::collect_garbage`].
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Keep at most this many non-protected snapshots per module
    pub count: usize,
    /// Drop non-protected snapshots older than this
    pub age: Duration,
}

/// Per-module snapshot chains plus the files backing them.
pub struct StateStore {
    dir: PathBuf,
    chains: DashMap<ModuleId, Mutex<Vec<ChainEntry>>>,
    current: DashMap<ModuleId, SnapshotId>,
    next_id: AtomicU64,
    compression_threshold: usize,
    retention: RetentionPolicy,
    /// Ceiling on the sum of tracked (uncompressed) snapshot bytes
    pool_limit: u64,
    pool_used: AtomicU64,
}

impl StateStore {
    /// Open a store rooted at `dir`, scanning any existing snapshot files to
    /// rebuild the chains (used after restart; the WAL decides which of the
    /// rediscovered snapshots are meaningful).
    pub fn open(
        dir: impl Into<PathBuf>,
        compression_threshold: usize,
        retention: RetentionPolicy,
    ) -> Result<StateStore> {
        Self::open_with_pool(dir, compression_threshold, retention, u64::MAX)
    }

    /// Open with an allocation ceiling; `capture` fails with `PoolExhausted`
    /// once tracked snapshot bytes would exceed it.
    pub fn open_with_pool(
        dir: impl Into<PathBuf>,
        compression_threshold: usize,
        retention: RetentionPolicy,
        pool_limit: u64,
    ) -> Result<StateStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let store = StateStore {
            dir,
            chains: DashMap::new(),
            current: DashMap::new(),
            next_id: AtomicU64::new(1),
            compression_threshold,
            retention,
            pool_limit,
            pool_used: AtomicU64::new(0),
        };
        store.scan_existing()?;
        Ok(store)
    }

    fn scan_existing(&self) -> Result<()> {
        let mut max_id = 0u64;
        let mut scanned = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "snap").unwrap_or(true) {
                continue;
            }
            let header = match read_snapshot_header(&path) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                    continue;
                }
            };
            max_id = max_id.max(header.snapshot_id.as_u64());
            self.pool_used.fetch_add(header.size, Ordering::AcqRel);
            self.chain(header.module_id).lock().push(ChainEntry {
                snapshot: header.snapshot_id,
                version: header.version,
                parent: None,
                committed: false,
                failed: false,
                created_ts: header.created_ts,
                size: header.size,
            });
            scanned += 1;
        }
        for chain in self.chains.iter() {
            chain.value().lock().sort_by_key(|e| e.snapshot);
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        if scanned > 0 {
            info!(snapshots = scanned, "state store rescanned existing snapshots");
        }
        Ok(())
    }

    fn chain(&self, module: ModuleId) -> dashmap::mapref::one::Ref<'_, ModuleId, Mutex<Vec<ChainEntry>>> {
        self.chains.entry(module).or_default().downgrade()
    }

    /// Capture state bytes as a new snapshot.
    ///
    /// `parent` records lineage (the snapshot these bytes were derived
    /// from). The snapshot starts uncommitted; [`StateStore::mark_committed`]
    /// finalizes it at transaction commit.
    pub fn capture(
        &self,
        module: ModuleId,
        version: ModuleVersion,
        bytes: &[u8],
        parent: Option<SnapshotId>,
    ) -> Result<SnapshotId> {
        let used = self.pool_used.load(Ordering::Acquire);
        if used.saturating_add(bytes.len() as u64) > self.pool_limit {
            return Err(HotswapError::PoolExhausted {
                resource: "snapshot memory pool".to_string(),
                limit: self.pool_limit as usize,
            });
        }
        let id = SnapshotId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut header = SnapshotHeader {
            snapshot_id: id,
            module_id: module,
            version,
            size: 0,
            checksum: 0,
            compression: CompressionKind::None,
            created_ts: now_micros(),
        };
        write_snapshot(&self.dir, &mut header, bytes, self.compression_threshold)?;

        self.pool_used.fetch_add(header.size, Ordering::AcqRel);
        self.chain(module).lock().push(ChainEntry {
            snapshot: id,
            version,
            parent,
            committed: false,
            failed: false,
            created_ts: header.created_ts,
            size: header.size,
        });
        debug!(module = %module, snapshot = %id, size = header.size, "state captured");
        Ok(id)
    }

    /// Bytes currently tracked against the pool limit.
    pub fn pool_used(&self) -> u64 {
        self.pool_used.load(Ordering::Acquire)
    }

    /// Load and verify a snapshot's bytes.
    ///
    /// A checksum failure marks the chain entry failed — the snapshot can
    /// never again be a migration source — and surfaces `StateCorrupted`.
    pub fn load(&self, module: ModuleId, id: SnapshotId) -> Result<StateSnapshot> {
        {
            let chain = self.chain(module);
            let chain = chain.lock();
            let entry = chain
                .iter()
                .find(|e| e.snapshot == id)
                .ok_or(HotswapError::SnapshotNotFound { snapshot: id })?;
            if entry.failed {
                return Err(HotswapError::state_corrupted(
                    id,
                    "snapshot previously failed verification",
                ));
            }
        }

        match read_snapshot(&snapshot_path(&self.dir, id)) {
            Ok(snap) => Ok(snap),
            Err(e) => {
                if matches!(e, HotswapError::StateCorrupted { .. }) {
                    let chain = self.chain(module);
                    let mut chain = chain.lock();
                    if let Some(entry) = chain.iter_mut().find(|e| e.snapshot == id) {
                        entry.failed = true;
                    }
                }
                Err(e)
            }
        }
    }

    /// Mark a snapshot committed and make it the module's current snapshot.
    pub fn mark_committed(&self, module: ModuleId, id: SnapshotId) -> Result<()> {
        let chain = self.chain(module);
        let mut chain = chain.lock();
        let entry = chain
            .iter_mut()
            .find(|e| e.snapshot == id)
            .ok_or(HotswapError::SnapshotNotFound { snapshot: id })?;
        entry.committed = true;
        drop(chain);
        self.current.insert(module, id);
        Ok(())
    }

    /// The module's committed snapshot, if any.
    pub fn current(&self, module: ModuleId) -> Option<SnapshotId> {
        self.current.get(&module).map(|s| *s)
    }

    /// Version recorded for a snapshot.
    pub fn version_of(&self, module: ModuleId, id: SnapshotId) -> Result<ModuleVersion> {
        let chain = self.chain(module);
        let chain = chain.lock();
        chain
            .iter()
            .find(|e| e.snapshot == id)
            .map(|e| e.version)
            .ok_or(HotswapError::SnapshotNotFound { snapshot: id })
    }

    /// Walk lineage to find the nearest common ancestor of two snapshots.
    pub fn common_ancestor(
        &self,
        module: ModuleId,
        a: SnapshotId,
        b: SnapshotId,
    ) -> Option<SnapshotId> {
        let chain = self.chain(module);
        let chain = chain.lock();
        let parent_of = |id: SnapshotId| -> Option<SnapshotId> {
            chain.iter().find(|e| e.snapshot == id).and_then(|e| e.parent)
        };

        let mut ancestors_of_a = HashSet::new();
        let mut cursor = Some(a);
        while let Some(id) = cursor {
            ancestors_of_a.insert(id);
            cursor = parent_of(id);
        }

        let mut cursor = Some(b);
        while let Some(id) = cursor {
            if ancestors_of_a.contains(&id) {
                return Some(id);
            }
            cursor = parent_of(id);
        }
        None
    }

    /// Apply the retention policy.
    ///
    /// `protected` holds snapshot ids that must survive regardless of age or
    /// count: pre-images of live transactions, plus anything the caller
    /// wants pinned. Committed current snapshots are always kept.
    pub fn collect_garbage(&self, protected: &HashSet<SnapshotId>) -> usize {
        let now = now_micros();
        let max_age_us = self.retention.age.as_micros() as u64;
        let mut removed = 0usize;

        for item in self.chains.iter() {
            let module = *item.key();
            let current = self.current(module);
            let mut chain = item.value().lock();

            // Newest first; keep the first `count` survivors.
            let mut keep: Vec<SnapshotId> = Vec::new();
            let mut victims: Vec<SnapshotId> = Vec::new();
            let mut ordered: Vec<ChainEntry> = chain.clone();
            ordered.sort_by(|x, y| y.snapshot.cmp(&x.snapshot));

            for entry in &ordered {
                let pinned = protected.contains(&entry.snapshot) || current == Some(entry.snapshot);
                let expired = max_age_us > 0 && now.saturating_sub(entry.created_ts) > max_age_us;
                if pinned || (keep.len() < self.retention.count && !expired) {
                    keep.push(entry.snapshot);
                } else {
                    victims.push(entry.snapshot);
                }
            }

            for id in victims {
                let path = snapshot_path(&self.dir, id);
                if let Err(e) = fs::remove_file(&path) {
                    warn!(snapshot = %id, error = %e, "snapshot file removal failed");
                    continue;
                }
                if let Some(entry) = chain.iter().find(|e| e.snapshot == id) {
                    self.pool_used.fetch_sub(entry.size, Ordering::AcqRel);
                }
                chain.retain(|e| e.snapshot != id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "snapshot retention sweep");
        }
        removed
    }

    /// Delete snapshots not referenced by `referenced` (recovery orphan GC).
    pub fn collect_orphans(&self, referenced: &HashSet<SnapshotId>) -> usize {
        let mut removed = 0usize;
        for item in self.chains.iter() {
            let mut chain = item.value().lock();
            let victims: Vec<SnapshotId> = chain
                .iter()
                .filter(|e| !referenced.contains(&e.snapshot))
                .map(|e| e.snapshot)
                .collect();
            for id in victims {
                let _ = fs::remove_file(snapshot_path(&self.dir, id));
                if let Some(entry) = chain.iter().find(|e| e.snapshot == id) {
                    self.pool_used.fetch_sub(entry.size, Ordering::AcqRel);
                }
                chain.retain(|e| e.snapshot != id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "orphaned snapshots collected");
        }
        removed
    }

    /// Record chain metadata reconstructed by recovery (parent lineage and
    /// commit flags come from the WAL, not the scanned files).
    pub fn restore_lineage(
        &self,
        module: ModuleId,
        id: SnapshotId,
        parent: Option<SnapshotId>,
        committed: bool,
    ) {
        let chain = self.chain(module);
        let mut chain = chain.lock();
        if let Some(entry) = chain.iter_mut().find(|e| e.snapshot == id) {
            entry.parent = parent;
            entry.committed = committed;
        }
        drop(chain);
        if committed {
            self.current.insert(module, id);
        }
    }

    /// Number of snapshots currently tracked for a module.
    pub fn chain_len(&self, module: ModuleId) -> usize {
        self.chain(module).lock().len()
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> StateStore {
        StateStore::open(
            dir,
            1024,
            RetentionPolicy {
                count: 2,
                age: Duration::from_secs(3600),
            },
        )
        .unwrap()
    }

    fn v(patch: u16) -> ModuleVersion {
        ModuleVersion::new(1, 0, patch, patch as u32)
    }

    #[test]
    fn test_capture_load_roundtrip() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let id = s.capture(ModuleId(1), v(0), b"hello state", None).unwrap();

        let snap = s.load(ModuleId(1), id).unwrap();
        assert_eq!(snap.bytes, b"hello state");
        assert_eq!(snap.header.module_id, ModuleId(1));
    }

    #[test]
    fn test_mark_committed_sets_current() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let a = s.capture(ModuleId(1), v(0), b"a", None).unwrap();
        assert_eq!(s.current(ModuleId(1)), None);

        s.mark_committed(ModuleId(1), a).unwrap();
        assert_eq!(s.current(ModuleId(1)), Some(a));
    }

    #[test]
    fn test_corrupted_snapshot_forbids_future_loads() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let id = s.capture(ModuleId(1), v(0), &[5u8; 200], None).unwrap();

        let path = snapshot_path(dir.path(), id);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            s.load(ModuleId(1), id),
            Err(HotswapError::StateCorrupted { .. })
        ));
        // Second attempt is rejected from the chain flag, not the file.
        assert!(matches!(
            s.load(ModuleId(1), id),
            Err(HotswapError::StateCorrupted { .. })
        ));
    }

    #[test]
    fn test_common_ancestor_linear_chain() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let base = s.capture(ModuleId(1), v(0), b"base", None).unwrap();
        let left = s.capture(ModuleId(1), v(1), b"left", Some(base)).unwrap();
        let right = s.capture(ModuleId(1), v(2), b"right", Some(base)).unwrap();

        assert_eq!(s.common_ancestor(ModuleId(1), left, right), Some(base));
        assert_eq!(s.common_ancestor(ModuleId(1), left, base), Some(base));
        assert_eq!(s.common_ancestor(ModuleId(1), left, left), Some(left));
    }

    #[test]
    fn test_no_common_ancestor_between_roots() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let a = s.capture(ModuleId(1), v(0), b"a", None).unwrap();
        let b = s.capture(ModuleId(1), v(1), b"b", None).unwrap();
        assert_eq!(s.common_ancestor(ModuleId(1), a, b), None);
    }

    #[test]
    fn test_retention_keeps_protected_and_current() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let m = ModuleId(1);
        let ids: Vec<SnapshotId> = (0..6)
            .map(|i| s.capture(m, v(i), &[i as u8; 16], None).unwrap())
            .collect();
        s.mark_committed(m, ids[0]).unwrap();

        let mut protected = HashSet::new();
        protected.insert(ids[1]);

        let removed = s.collect_garbage(&protected);
        assert!(removed > 0);

        // Current and protected always survive.
        assert!(s.load(m, ids[0]).is_ok());
        assert!(s.load(m, ids[1]).is_ok());
        // The two newest survive via the count policy.
        assert!(s.load(m, ids[5]).is_ok());
        assert!(s.load(m, ids[4]).is_ok());
        // Older, unprotected ones are gone.
        assert!(s.load(m, ids[2]).is_err());
    }

    #[test]
    fn test_orphan_collection() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let m = ModuleId(1);
        let keep = s.capture(m, v(0), b"keep", None).unwrap();
        let orphan = s.capture(m, v(1), b"orphan", None).unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(keep);
        let removed = s.collect_orphans(&referenced);
        assert_eq!(removed, 1);
        assert!(s.load(m, keep).is_ok());
        assert!(s.load(m, orphan).is_err());
    }

    #[test]
    fn test_reopen_rescans_files() {
        let dir = tempdir().unwrap();
        let first = store(dir.path());
        let id = first.capture(ModuleId(3), v(0), b"persisted", None).unwrap();
        drop(first);

        let second = store(dir.path());
        assert_eq!(second.chain_len(ModuleId(3)), 1);
        let snap = second.load(ModuleId(3), id).unwrap();
        assert_eq!(snap.bytes, b"persisted");
        // New captures continue after the rescanned max id.
        let next = second.capture(ModuleId(3), v(1), b"next", Some(id)).unwrap();
        assert!(next > id);
    }

    #[test]
    fn test_pool_limit_rejects_capture() {
        let dir = tempdir().unwrap();
        let s = StateStore::open_with_pool(
            dir.path(),
            1024,
            RetentionPolicy {
                count: 8,
                age: Duration::from_secs(60),
            },
            100,
        )
        .unwrap();

        s.capture(ModuleId(1), v(0), &[0u8; 60], None).unwrap();
        assert_eq!(s.pool_used(), 60);

        let err = s.capture(ModuleId(1), v(1), &[0u8; 60], None).unwrap_err();
        assert!(matches!(err, HotswapError::PoolExhausted { .. }));

        // A zero-count retention policy frees the pool on reopen.
        drop(s);
        let tight = StateStore::open_with_pool(
            dir.path(),
            1024,
            RetentionPolicy {
                count: 0,
                age: Duration::from_secs(60),
            },
            100,
        )
        .unwrap();
        tight.collect_garbage(&HashSet::new());
        assert_eq!(tight.pool_used(), 0);
        tight.capture(ModuleId(1), v(2), &[0u8; 60], None).unwrap();
    }

    #[test]
    fn test_restore_lineage_after_reopen() {
        let dir = tempdir().unwrap();
        let first = store(dir.path());
        let base = first.capture(ModuleId(1), v(0), b"base", None).unwrap();
        let child = first.capture(ModuleId(1), v(1), b"child", Some(base)).unwrap();
        drop(first);

        let second = store(dir.path());
        second.restore_lineage(ModuleId(1), base, None, true);
        second.restore_lineage(ModuleId(1), child, Some(base), false);
        assert_eq!(second.current(ModuleId(1)), Some(base));
        assert_eq!(second.common_ancestor(ModuleId(1), child, base), Some(base));
    }
}
