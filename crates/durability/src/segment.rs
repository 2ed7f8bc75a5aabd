//! WAL segment files
//!
//! The log is a directory of segments named `wal-NNNNNN.seg`, rotated by
//! size. Only the newest segment accepts appends; sealed segments are
//! immutable.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment header (40 bytes)          │
//! ├────────────────────────────────────┤
//! │ WAL records, back to back          │
//! └────────────────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a WAL segment: "HWAL"
pub const SEGMENT_MAGIC: [u8; 4] = *b"HWAL";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Segment header size in bytes
pub const SEGMENT_HEADER_SIZE: usize = 40;

/// Segment file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes
    pub magic: [u8; 4],
    /// Format version
    pub format_version: u32,
    /// Segment number, ascending across the directory
    pub number: u64,
    /// Runtime instance that wrote the segment
    pub instance: [u8; 16],
    /// Creation timestamp, microseconds since epoch
    pub created_ts: u64,
}

impl SegmentHeader {
    /// Header for a fresh segment.
    pub fn new(number: u64, instance: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            number,
            instance,
            created_ts: hotswap_core::now_micros(),
        }
    }

    /// Encode to the fixed 40-byte layout.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        out[8..16].copy_from_slice(&self.number.to_le_bytes());
        out[16..32].copy_from_slice(&self.instance);
        out[32..40].copy_from_slice(&self.created_ts.to_le_bytes());
        out
    }

    /// Decode from the fixed layout; `None` on size or magic mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return None;
        }
        let header = SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            number: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            instance: bytes[16..32].try_into().ok()?,
            created_ts: u64::from_le_bytes(bytes[32..40].try_into().ok()?),
        };
        (header.magic == SEGMENT_MAGIC).then_some(header)
    }
}

/// Path of segment `number` within `dir`: `wal-NNNNNN.seg`.
pub fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("wal-{:06}.seg", number))
}

/// Segment numbers present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(rest) = name.strip_prefix("wal-") {
            if let Some(num) = rest.strip_suffix(".seg") {
                if let Ok(n) = num.parse::<u64>() {
                    numbers.push(n);
                }
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Writable handle to the active segment.
pub struct WalSegment {
    file: File,
    header: SegmentHeader,
    len: u64,
    path: PathBuf,
}

impl WalSegment {
    /// Create segment `number`, writing its header.
    pub fn create(dir: &Path, number: u64, instance: [u8; 16]) -> std::io::Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let header = SegmentHeader::new(number, instance);
        file.write_all(&header.to_bytes())?;
        Ok(WalSegment {
            file,
            header,
            len: SEGMENT_HEADER_SIZE as u64,
            path,
        })
    }

    /// Open segment `number` for appending, validating the header.
    pub fn open_append(dir: &Path, number: u64) -> std::io::Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid segment header")
        })?;
        if header.number != number {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment number mismatch: file says {}", header.number),
            ));
        }

        let len = file.seek(SeekFrom::End(0))?;
        Ok(WalSegment {
            file,
            header,
            len,
            path,
        })
    }

    /// Append raw record bytes.
    pub fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// fsync the segment.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    /// Truncate to `len` bytes (recovery discards a torn tail this way).
    pub fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        self.len = len;
        Ok(())
    }

    /// Current size in bytes, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when only the header has been written.
    pub fn is_empty(&self) -> bool {
        self.len <= SEGMENT_HEADER_SIZE as u64
    }

    /// Segment number.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a whole segment's record region, validating the header first.
///
/// Returns `(header, record_bytes)`.
pub fn read_segment(dir: &Path, number: u64) -> std::io::Result<(SegmentHeader, Vec<u8>)> {
    let bytes = std::fs::read(segment_path(dir, number))?;
    let header = SegmentHeader::from_bytes(&bytes).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid segment header")
    })?;
    Ok((header, bytes[SEGMENT_HEADER_SIZE.min(bytes.len())..].to_vec()))
}
