//! WAL reader
//!
//! Reads every record across all segments in LSN order. A damaged record
//! ends the scan: everything before it is returned, the damage location is
//! reported, and [`WalReader::truncate_corrupt_tail`] can physically discard
//! the tail so the writer resumes from the last good record.

use crate::record::{WalRecord, WalRecordError};
use crate::segment::{list_segments, read_segment, segment_path, WalSegment, SEGMENT_HEADER_SIZE};
use hotswap_core::{Lsn, Result};
use std::path::Path;
use tracing::{info, warn};

/// Location and cause of a damaged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCorruption {
    /// Segment containing the damage
    pub segment: u64,
    /// Byte offset of the first damaged record within the segment file
    pub offset: u64,
    /// Parse error encountered
    pub reason: WalRecordError,
}

/// Result of a full WAL scan.
#[derive(Debug, Default)]
pub struct WalReadOutcome {
    /// All intact records, in LSN order
    pub records: Vec<WalRecord>,
    /// Number of segment files visited
    pub segments_read: usize,
    /// Highest LSN observed
    pub max_lsn: Option<Lsn>,
    /// Damage found at the end of the scan, if any
    pub corruption: Option<TailCorruption>,
}

/// Reading side of the WAL.
#[derive(Debug, Default)]
pub struct WalReader;

impl WalReader {
    /// Create a reader.
    pub fn new() -> Self {
        WalReader
    }

    /// Scan every segment under `dir`.
    ///
    /// Stops at the first damaged record; records after the damage are
    /// unreachable by design (the log has no resynchronization points).
    pub fn read_all(&self, dir: &Path) -> Result<WalReadOutcome> {
        let mut outcome = WalReadOutcome::default();
        if !dir.exists() {
            return Ok(outcome);
        }

        for number in list_segments(dir)? {
            let (_header, body) = read_segment(dir, number)?;
            outcome.segments_read += 1;

            let mut offset = 0usize;
            while offset < body.len() {
                match WalRecord::from_bytes(&body[offset..]) {
                    Ok((record, used)) => {
                        outcome.max_lsn = Some(record.lsn);
                        outcome.records.push(record);
                        offset += used;
                    }
                    Err(reason) => {
                        warn!(
                            segment = number,
                            offset = offset + SEGMENT_HEADER_SIZE,
                            error = %reason,
                            "WAL scan stopped at damaged record"
                        );
                        outcome.corruption = Some(TailCorruption {
                            segment: number,
                            offset: (offset + SEGMENT_HEADER_SIZE) as u64,
                            reason,
                        });
                        return Ok(outcome);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Physically discard a damaged tail found by [`WalReader::read_all`].
    ///
    /// Truncates the damaged segment at the corruption offset and deletes
    /// any later segments. Returns the number of segment files removed.
    pub fn truncate_corrupt_tail(&self, dir: &Path, corruption: &TailCorruption) -> Result<usize> {
        let mut segment = WalSegment::open_append(dir, corruption.segment)?;
        segment.truncate(corruption.offset)?;
        segment.sync()?;
        drop(segment);

        let mut removed = 0usize;
        for number in list_segments(dir)? {
            if number > corruption.segment {
                std::fs::remove_file(segment_path(dir, number))?;
                removed += 1;
            }
        }
        info!(
            segment = corruption.segment,
            offset = corruption.offset,
            segments_removed = removed,
            "WAL corrupt tail discarded"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalOp;
    use crate::writer::WalWriter;
    use hotswap_core::{DurabilityLevel, TxnId};
    use tempfile::tempdir;

    fn fill(dir: &Path, n: u64) {
        let mut w =
            WalWriter::open(dir, [1; 16], DurabilityLevel::FsyncEveryRecord, 1 << 20).unwrap();
        for i in 1..=n {
            w.append(TxnId(i), 0, WalOp::Checkpoint).unwrap();
        }
    }

    #[test]
    fn test_empty_dir_reads_empty() {
        let dir = tempdir().unwrap();
        let outcome = WalReader::new().read_all(&dir.path().join("absent")).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.max_lsn, None);
        assert!(outcome.corruption.is_none());
    }

    #[test]
    fn test_reads_records_in_lsn_order() {
        let dir = tempdir().unwrap();
        fill(dir.path(), 7);
        let outcome = WalReader::new().read_all(dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 7);
        assert_eq!(outcome.max_lsn, Some(Lsn(7)));
        for pair in outcome.records.windows(2) {
            assert!(pair[0].lsn < pair[1].lsn);
        }
    }

    #[test]
    fn test_corrupt_tail_stops_scan() {
        let dir = tempdir().unwrap();
        fill(dir.path(), 5);

        // Flip one byte inside the last record's body.
        let path = segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 6] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let outcome = WalReader::new().read_all(dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.max_lsn, Some(Lsn(4)));
        let corruption = outcome.corruption.expect("corruption reported");
        assert_eq!(corruption.segment, 1);
    }

    #[test]
    fn test_truncate_tail_enables_clean_reopen() {
        let dir = tempdir().unwrap();
        fill(dir.path(), 5);

        let path = segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 6] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let reader = WalReader::new();
        let outcome = reader.read_all(dir.path()).unwrap();
        let corruption = outcome.corruption.clone().unwrap();
        reader.truncate_corrupt_tail(dir.path(), &corruption).unwrap();

        // Scan is now clean and the writer resumes at LSN 5.
        let clean = reader.read_all(dir.path()).unwrap();
        assert_eq!(clean.records.len(), 4);
        assert!(clean.corruption.is_none());

        let mut w = WalWriter::open(
            dir.path(),
            [1; 16],
            DurabilityLevel::FsyncEveryRecord,
            1 << 20,
        )
        .unwrap();
        assert_eq!(w.next_lsn(), Lsn(5));
        w.append(TxnId(9), 0, WalOp::Checkpoint).unwrap();
        assert_eq!(reader.read_all(dir.path()).unwrap().records.len(), 5);
    }

    #[test]
    fn test_partial_record_at_end_is_tail_corruption() {
        let dir = tempdir().unwrap();
        fill(dir.path(), 3);

        // Chop the last record in half.
        let path = segment_path(dir.path(), 1);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        let outcome = WalReader::new().read_all(dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(matches!(
            outcome.corruption.unwrap().reason,
            WalRecordError::InsufficientData | WalRecordError::ChecksumMismatch { .. }
        ));
    }
}
