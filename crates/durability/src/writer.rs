//! WAL writer
//!
//! Appends records with the configured durability level and rotates
//! segments by size. LSNs are allocated here, densely, starting after the
//! highest LSN already on disk.
//!
//! Durability levels:
//! - `Buffered` — records reach the OS page cache; fsync on rotation/close.
//! - `FsyncOnCommit` — fsync whenever an outcome record is appended, so a
//!   reported commit is durable.
//! - `FsyncEveryRecord` — fsync after each append.

use crate::reader::WalReader;
use crate::record::{WalOp, WalRecord};
use crate::segment::{list_segments, WalSegment};
use hotswap_core::{now_micros, DurabilityLevel, HotswapError, Lsn, Result, TxnId};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default segment rotation threshold.
pub const DEFAULT_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

/// Appending side of the WAL.
pub struct WalWriter {
    dir: PathBuf,
    instance: [u8; 16],
    durability: DurabilityLevel,
    max_segment_bytes: u64,
    segment: WalSegment,
    next_lsn: u64,
}

impl WalWriter {
    /// Open the WAL at `dir`, resuming the newest segment or creating the
    /// first one. Scans existing records once to continue the LSN sequence.
    pub fn open(
        dir: impl Into<PathBuf>,
        instance: [u8; 16],
        durability: DurabilityLevel,
        max_segment_bytes: u64,
    ) -> Result<WalWriter> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let existing = list_segments(&dir)?;
        let max_lsn = if existing.is_empty() {
            None
        } else {
            WalReader::new().read_all(&dir)?.max_lsn
        };

        let (segment, number) = match existing.last() {
            Some(&last) => match WalSegment::open_append(&dir, last) {
                Ok(seg) => (seg, last),
                Err(_) => {
                    // Unreadable active segment; leave it for the reader's
                    // corruption handling and start a fresh one.
                    let next = last + 1;
                    (WalSegment::create(&dir, next, instance)?, next)
                }
            },
            None => (WalSegment::create(&dir, 1, instance)?, 1),
        };

        let next_lsn = max_lsn.map(|l| l.as_u64() + 1).unwrap_or(1);
        info!(segment = number, next_lsn, "WAL opened");
        Ok(WalWriter {
            dir,
            instance,
            durability,
            max_segment_bytes,
            segment,
            next_lsn,
        })
    }

    /// Append one operation, returning its LSN.
    ///
    /// Any I/O failure surfaces as `WalWriteFailed`; the caller is expected
    /// to fail its transaction and flip the runtime into degraded mode.
    pub fn append(&mut self, txn: TxnId, op_id: u32, op: WalOp) -> Result<Lsn> {
        let lsn = Lsn(self.next_lsn);
        let record = WalRecord::new(lsn, txn, now_micros(), op_id, op);
        let bytes = record.to_bytes();

        if self.segment.len() + bytes.len() as u64 > self.max_segment_bytes
            && !self.segment.is_empty()
        {
            self.rotate()?;
        }

        self.segment
            .append(&bytes)
            .map_err(|e| HotswapError::wal_write_failed(format!("append: {}", e)))?;

        let must_sync = match self.durability {
            DurabilityLevel::FsyncEveryRecord => true,
            DurabilityLevel::FsyncOnCommit => record.op.is_outcome(),
            DurabilityLevel::Buffered => false,
        };
        if must_sync {
            self.segment
                .sync()
                .map_err(|e| HotswapError::wal_write_failed(format!("fsync: {}", e)))?;
        }

        self.next_lsn += 1;
        debug!(lsn = %lsn, txn = %txn, op = record.op.name(), "WAL append");
        Ok(lsn)
    }

    fn rotate(&mut self) -> Result<()> {
        self.segment
            .sync()
            .map_err(|e| HotswapError::wal_write_failed(format!("rotate fsync: {}", e)))?;
        let next = self.segment.number() + 1;
        self.segment = WalSegment::create(&self.dir, next, self.instance)
            .map_err(|e| HotswapError::wal_write_failed(format!("rotate create: {}", e)))?;
        info!(segment = next, "WAL segment rotated");
        Ok(())
    }

    /// Force everything to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.segment
            .sync()
            .map_err(|e| HotswapError::wal_write_failed(format!("flush: {}", e)))
    }

    /// LSN the next append will receive.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn)
    }

    /// Active segment number.
    pub fn current_segment(&self) -> u64 {
        self.segment.number()
    }

    /// WAL directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.segment.sync();
    }
}
