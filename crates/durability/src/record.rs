//! WAL record format
//!
//! Each record frames one reload operation. Records are self-delimiting and
//! individually checksummed so recovery can stop exactly at the first
//! damaged byte of a torn tail.
//!
//! # Record Layout
//!
//! ```text
//! ┌───────────┬────────────┬─────────┬─────────┬────────┬──────────┬───────────────┬──────────┐
//! │ Length (4)│ Format (1) │ LSN (8) │ Txn (8) │ TS (8) │ OpId (4) │ Op (bincode)  │ CRC32 (4)│
//! └───────────┴────────────┴─────────┴─────────┴────────┴──────────┴───────────────┴──────────┘
//! ```
//!
//! The length field counts everything after itself. The CRC covers format
//! byte through op bytes.

use crc32fast::Hasher;
use hotswap_core::{Lsn, ModuleId, ModuleVersion, SnapshotId, TxnId};
use serde::{Deserialize, Serialize};

/// Current record format version
pub const WAL_RECORD_FORMAT_VERSION: u8 = 1;

/// Fixed bytes between the length prefix and the op payload
const RECORD_FIXED_SIZE: usize = 1 + 8 + 8 + 8 + 4;

/// Reload operation recorded in the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    /// Transaction opened
    TxnBegin {
        /// Numeric transaction-type tag (engine-defined)
        txn_kind: u8,
    },
    /// Phase-1 intent for one module
    Prepare {
        /// Module being updated
        module: ModuleId,
        /// Version being swapped in
        new_version: ModuleVersion,
        /// Pre-image snapshot captured before any mutation
        pre_snapshot: Option<SnapshotId>,
    },
    /// Migrated post-state persisted for one module
    StateMigrated {
        /// Module whose state was migrated
        module: ModuleId,
        /// Post-image snapshot
        post_snapshot: SnapshotId,
    },
    /// Transaction outcome: all listed modules are live at the new versions
    Committed {
        /// Module, committed version, committed snapshot
        modules: Vec<(ModuleId, ModuleVersion, Option<SnapshotId>)>,
    },
    /// 2PC coordinator decision: every prepared participant must commit
    GlobalCommit,
    /// 2PC coordinator decision: every participant restores its pre-image
    GlobalAbort,
    /// Transaction aborted; pre-images restored
    Aborted,
    /// Transaction failed non-recoverably (WAL write failure path)
    Failed,
    /// Explicit version rollback of one module
    Rollback {
        /// Module rolled back
        module: ModuleId,
        /// Version restored
        to_version: ModuleVersion,
        /// Snapshot restored
        to_snapshot: Option<SnapshotId>,
    },
    /// Registry manifest checkpoint marker
    Checkpoint,
}

impl WalOp {
    /// Outcome records decide a transaction's fate and are the fsync points
    /// under `FsyncOnCommit`.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            WalOp::Committed { .. }
                | WalOp::GlobalCommit
                | WalOp::GlobalAbort
                | WalOp::Aborted
                | WalOp::Failed
        )
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            WalOp::TxnBegin { .. } => "TxnBegin",
            WalOp::Prepare { .. } => "Prepare",
            WalOp::StateMigrated { .. } => "StateMigrated",
            WalOp::Committed { .. } => "Committed",
            WalOp::GlobalCommit => "GlobalCommit",
            WalOp::GlobalAbort => "GlobalAbort",
            WalOp::Aborted => "Aborted",
            WalOp::Failed => "Failed",
            WalOp::Rollback { .. } => "Rollback",
            WalOp::Checkpoint => "Checkpoint",
        }
    }
}

/// One WAL record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Log sequence number, dense and monotonic
    pub lsn: Lsn,
    /// Owning transaction
    pub txn_id: TxnId,
    /// Append timestamp, microseconds since epoch
    pub ts: u64,
    /// Operation sequence within the transaction
    pub op_id: u32,
    /// The operation
    pub op: WalOp,
}

/// WAL record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalRecordError {
    /// Not enough bytes for a complete record
    #[error("insufficient data for record")]
    InsufficientData,

    /// Framing is structurally invalid
    #[error("invalid record framing")]
    InvalidFormat,

    /// Stored and computed checksums disagree
    #[error("checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum read from the record
        stored: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// Record was written by an unknown format version
    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u8),

    /// Op payload failed to decode
    #[error("op decode failed: {0}")]
    OpDecode(String),
}

impl WalRecord {
    /// Create a record.
    pub fn new(lsn: Lsn, txn_id: TxnId, ts: u64, op_id: u32, op: WalOp) -> Self {
        WalRecord {
            lsn,
            txn_id,
            ts,
            op_id,
            op,
        }
    }

    /// Serialize for appending.
    pub fn to_bytes(&self) -> Vec<u8> {
        let op_bytes = bincode::serialize(&self.op).expect("WalOp serialization is infallible");

        let mut body = Vec::with_capacity(RECORD_FIXED_SIZE + op_bytes.len());
        body.push(WAL_RECORD_FORMAT_VERSION);
        body.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        body.extend_from_slice(&self.txn_id.as_u64().to_le_bytes());
        body.extend_from_slice(&self.ts.to_le_bytes());
        body.extend_from_slice(&self.op_id.to_le_bytes());
        body.extend_from_slice(&op_bytes);

        let crc = compute_crc(&body);
        let total = body.len() + 4;
        let mut out = Vec::with_capacity(4 + total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse one record from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(WalRecord, usize), WalRecordError> {
        if bytes.len() < 4 {
            return Err(WalRecordError::InsufficientData);
        }
        let total = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")) as usize;
        if total < RECORD_FIXED_SIZE + 4 {
            return Err(WalRecordError::InvalidFormat);
        }
        if bytes.len() < 4 + total {
            return Err(WalRecordError::InsufficientData);
        }

        let body = &bytes[4..4 + total - 4];
        let stored =
            u32::from_le_bytes(bytes[4 + total - 4..4 + total].try_into().expect("4 bytes"));
        let computed = compute_crc(body);
        if stored != computed {
            return Err(WalRecordError::ChecksumMismatch { stored, computed });
        }

        let format = body[0];
        if format != WAL_RECORD_FORMAT_VERSION {
            return Err(WalRecordError::UnsupportedVersion(format));
        }
        let lsn = u64::from_le_bytes(body[1..9].try_into().expect("8 bytes"));
        let txn = u64::from_le_bytes(body[9..17].try_into().expect("8 bytes"));
        let ts = u64::from_le_bytes(body[17..25].try_into().expect("8 bytes"));
        let op_id = u32::from_le_bytes(body[25..29].try_into().expect("4 bytes"));
        let op: WalOp = bincode::deserialize(&body[29..])
            .map_err(|e| WalRecordError::OpDecode(e.to_string()))?;

        Ok((
            WalRecord {
                lsn: Lsn(lsn),
                txn_id: TxnId(txn),
                ts,
                op_id,
                op,
            },
            4 + total,
        ))
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lsn: u64, op: WalOp) -> WalRecord {
        WalRecord::new(Lsn(lsn), TxnId(7), 123_456, 2, op)
    }

    #[test]
    fn test_roundtrip_every_op_kind() {
        let version = ModuleVersion::new(1, 2, 3, 4);
        let ops = vec![
            WalOp::TxnBegin { txn_kind: 1 },
            WalOp::Prepare {
                module: ModuleId(1),
                new_version: version,
                pre_snapshot: Some(SnapshotId(10)),
            },
            WalOp::StateMigrated {
                module: ModuleId(1),
                post_snapshot: SnapshotId(11),
            },
            WalOp::Committed {
                modules: vec![(ModuleId(1), version, Some(SnapshotId(11)))],
            },
            WalOp::GlobalCommit,
            WalOp::GlobalAbort,
            WalOp::Aborted,
            WalOp::Failed,
            WalOp::Rollback {
                module: ModuleId(1),
                to_version: version,
                to_snapshot: None,
            },
            WalOp::Checkpoint,
        ];

        for (i, op) in ops.into_iter().enumerate() {
            let rec = record(i as u64, op);
            let bytes = rec.to_bytes();
            let (parsed, consumed) = WalRecord::from_bytes(&bytes).unwrap();
            assert_eq!(parsed, rec);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_corrupted_byte_fails_checksum() {
        let rec = record(1, WalOp::GlobalCommit);
        let mut bytes = rec.to_bytes();
        bytes[9] ^= 0xFF;
        assert!(matches!(
            WalRecord::from_bytes(&bytes),
            Err(WalRecordError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_record_is_insufficient() {
        let rec = record(1, WalOp::Aborted);
        let bytes = rec.to_bytes();
        assert!(matches!(
            WalRecord::from_bytes(&bytes[..bytes.len() - 3]),
            Err(WalRecordError::InsufficientData)
        ));
        assert!(matches!(
            WalRecord::from_bytes(&bytes[..2]),
            Err(WalRecordError::InsufficientData)
        ));
    }

    #[test]
    fn test_zero_length_frame_is_invalid() {
        let bytes = [0u8, 0, 0, 0, 1, 2, 3];
        assert!(matches!(
            WalRecord::from_bytes(&bytes),
            Err(WalRecordError::InvalidFormat)
        ));
    }

    #[test]
    fn test_unknown_format_version_rejected() {
        let rec = record(1, WalOp::Checkpoint);
        let mut bytes = rec.to_bytes();
        // Rewrite format byte and recompute the CRC so only the version check fires.
        bytes[4] = 99;
        let total = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let crc = compute_crc(&bytes[4..4 + total - 4]);
        let crc_at = 4 + total - 4;
        bytes[crc_at..crc_at + 4].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            WalRecord::from_bytes(&bytes),
            Err(WalRecordError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_outcome_classification() {
        assert!(WalOp::Committed { modules: vec![] }.is_outcome());
        assert!(WalOp::GlobalAbort.is_outcome());
        assert!(WalOp::Failed.is_outcome());
        assert!(!WalOp::TxnBegin { txn_kind: 0 }.is_outcome());
        assert!(!WalOp::Checkpoint.is_outcome());
    }

    #[test]
    fn test_sequential_records_parse_in_order() {
        let mut stream = Vec::new();
        for i in 0..5u64 {
            stream.extend_from_slice(&record(i, WalOp::Checkpoint).to_bytes());
        }
        let mut offset = 0;
        let mut next_lsn = 0;
        while offset < stream.len() {
            let (rec, used) = WalRecord::from_bytes(&stream[offset..]).unwrap();
            assert_eq!(rec.lsn.as_u64(), next_lsn);
            next_lsn += 1;
            offset += used;
        }
        assert_eq!(next_lsn, 5);
    }
}
