//! Write-ahead log and crash recovery
//!
//! Append-only segmented WAL with per-record checksums, a single-writer
//! flusher thread fed over an MPSC channel, forward replay into a recovery
//! plan, and the optional registry manifest checkpoint.

pub mod flusher;
pub mod manifest;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod writer;

pub use flusher::{WalHandle, WalService};
pub use manifest::{ManifestEntry, RegistryManifest};
pub use reader::{TailCorruption, WalReadOutcome, WalReader};
pub use record::{WalOp, WalRecord, WalRecordError, WAL_RECORD_FORMAT_VERSION};
pub use recovery::{
    CommittedTxn, ModuleCommit, RecoveryCoordinator, RecoveryPlan, RecoveryStats, RolledBackTxn,
};
pub use segment::{list_segments, segment_path, SegmentHeader, WalSegment, SEGMENT_HEADER_SIZE};
pub use writer::{WalWriter, DEFAULT_SEGMENT_BYTES};
