//! Snapshot file format
//!
//! One file per snapshot under `snapshots/`, named by snapshot id.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┬─────────────────┐
//! │ Magic (4)    │ Format ver (2)   │ Header len (4)   │ Header (bincode)│
//! ├──────────────┴──────────────────┴──────────────────┴─────────────────┤
//! │ Body (raw or zstd-compressed state bytes)                            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `checksum` is the xxh3 of the *uncompressed* bytes, so corruption is
//! detected identically whether or not the body was compressed. Compression
//! is verified by round-tripping before the file is written; a snapshot that
//! cannot round-trip is never persisted.

use hotswap_core::{HotswapError, ModuleId, ModuleVersion, Result, SnapshotId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes identifying a snapshot file: "HSNP"
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"HSNP";

/// Current snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

/// Fixed preamble size preceding the encoded header
pub const SNAPSHOT_PREAMBLE_SIZE: usize = 10;

/// zstd level used for snapshot bodies
const ZSTD_LEVEL: i32 = 3;

/// Body encoding of a snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    /// Raw bytes
    None,
    /// zstd-compressed bytes
    Zstd,
}

/// Snapshot metadata persisted ahead of the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Snapshot identity
    pub snapshot_id: SnapshotId,
    /// Module the state belongs to
    pub module_id: ModuleId,
    /// Module version the state was serialized under
    pub version: ModuleVersion,
    /// Uncompressed size in bytes
    pub size: u64,
    /// xxh3 of the uncompressed bytes
    pub checksum: u64,
    /// Body encoding
    pub compression: CompressionKind,
    /// Creation timestamp, microseconds since epoch
    pub created_ts: u64,
}

/// A snapshot loaded into memory (bytes always uncompressed).
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Metadata
    pub header: SnapshotHeader,
    /// Uncompressed state bytes
    pub bytes: Vec<u8>,
}

/// Compute the checksum stored in a snapshot header.
pub fn state_checksum(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Filename of a snapshot within the snapshots directory.
pub fn snapshot_path(dir: &Path, id: SnapshotId) -> PathBuf {
    dir.join(format!("{:016}.snap", id.as_u64()))
}

/// Write a snapshot file.
///
/// Bodies larger than `compression_threshold` are zstd-compressed; the
/// compressed body is decompressed and compared before anything touches
/// disk, keeping the lossless guarantee independent of the codec.
pub fn write_snapshot(
    dir: &Path,
    header: &mut SnapshotHeader,
    bytes: &[u8],
    compression_threshold: usize,
) -> Result<PathBuf> {
    header.size = bytes.len() as u64;
    header.checksum = state_checksum(bytes);

    let body: Vec<u8> = if bytes.len() > compression_threshold {
        let compressed = zstd::bulk::compress(bytes, ZSTD_LEVEL)
            .map_err(|e| HotswapError::serialization(format!("zstd compress: {}", e)))?;
        let restored = zstd::bulk::decompress(&compressed, bytes.len())
            .map_err(|e| HotswapError::serialization(format!("zstd verify: {}", e)))?;
        if restored != bytes {
            return Err(HotswapError::internal(format!(
                "compression round-trip mismatch for {}",
                header.snapshot_id
            )));
        }
        header.compression = CompressionKind::Zstd;
        compressed
    } else {
        header.compression = CompressionKind::None;
        bytes.to_vec()
    };

    let header_bytes = bincode::serialize(header)?;
    let mut out = Vec::with_capacity(SNAPSHOT_PREAMBLE_SIZE + header_bytes.len() + body.len());
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body);

    fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, header.snapshot_id);
    fs::write(&path, out)?;
    Ok(path)
}

/// Read only the header of a snapshot file.
pub fn read_snapshot_header(path: &Path) -> Result<SnapshotHeader> {
    let bytes = fs::read(path)?;
    let (header, _body_start) = parse_header(path, &bytes)?;
    Ok(header)
}

/// Read and verify a full snapshot.
///
/// A checksum mismatch yields `StateCorrupted`; migration from such a
/// snapshot is forbidden by the store.
pub fn read_snapshot(path: &Path) -> Result<StateSnapshot> {
    let raw = fs::read(path)?;
    let (header, body_start) = parse_header(path, &raw)?;
    let body = &raw[body_start..];

    let bytes = match header.compression {
        CompressionKind::None => body.to_vec(),
        CompressionKind::Zstd => zstd::bulk::decompress(body, header.size as usize)
            .map_err(|e| {
                HotswapError::state_corrupted(header.snapshot_id, format!("zstd: {}", e))
            })?,
    };

    if bytes.len() as u64 != header.size {
        return Err(HotswapError::state_corrupted(
            header.snapshot_id,
            format!("size mismatch: header {}, body {}", header.size, bytes.len()),
        ));
    }
    let computed = state_checksum(&bytes);
    if computed != header.checksum {
        return Err(HotswapError::state_corrupted(
            header.snapshot_id,
            format!(
                "checksum mismatch: header {:016x}, computed {:016x}",
                header.checksum, computed
            ),
        ));
    }

    Ok(StateSnapshot { header, bytes })
}

fn parse_header(path: &Path, raw: &[u8]) -> Result<(SnapshotHeader, usize)> {
    if raw.len() < SNAPSHOT_PREAMBLE_SIZE {
        return Err(HotswapError::serialization(format!(
            "snapshot {} shorter than preamble",
            path.display()
        )));
    }
    if raw[0..4] != SNAPSHOT_MAGIC {
        return Err(HotswapError::serialization(format!(
            "snapshot {} has bad magic",
            path.display()
        )));
    }
    let format = u16::from_le_bytes([raw[4], raw[5]]);
    if format != SNAPSHOT_FORMAT_VERSION {
        return Err(HotswapError::serialization(format!(
            "snapshot {} has unsupported format {}",
            path.display(),
            format
        )));
    }
    let header_len = u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]) as usize;
    let body_start = SNAPSHOT_PREAMBLE_SIZE
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| {
            HotswapError::serialization(format!(
                "snapshot {} header length exceeds file",
                path.display()
            ))
        })?;
    let header = bincode::deserialize(&raw[SNAPSHOT_PREAMBLE_SIZE..body_start])?;
    Ok((header, body_start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_core::now_micros;
    use tempfile::tempdir;

    fn header(id: u64) -> SnapshotHeader {
        SnapshotHeader {
            snapshot_id: SnapshotId(id),
            module_id: ModuleId(1),
            version: ModuleVersion::new(1, 2, 3, 4),
            size: 0,
            checksum: 0,
            compression: CompressionKind::None,
            created_ts: now_micros(),
        }
    }

    #[test]
    fn test_small_snapshot_stays_raw() {
        let dir = tempdir().unwrap();
        let bytes = vec![42u8; 100];
        let mut h = header(1);
        write_snapshot(dir.path(), &mut h, &bytes, 1024).unwrap();

        assert_eq!(h.compression, CompressionKind::None);
        let read = read_snapshot(&snapshot_path(dir.path(), SnapshotId(1))).unwrap();
        assert_eq!(read.bytes, bytes);
        assert_eq!(read.header.size, 100);
    }

    #[test]
    fn test_large_snapshot_compressed_and_restored() {
        let dir = tempdir().unwrap();
        let bytes = vec![7u8; 64 * 1024];
        let mut h = header(2);
        let path = write_snapshot(dir.path(), &mut h, &bytes, 1024).unwrap();

        assert_eq!(h.compression, CompressionKind::Zstd);
        // Highly compressible body must actually be smaller on disk.
        assert!(fs::metadata(&path).unwrap().len() < bytes.len() as u64);

        let read = read_snapshot(&path).unwrap();
        assert_eq!(read.bytes, bytes);
        assert_eq!(read.header.checksum, state_checksum(&bytes));
    }

    #[test]
    fn test_corrupted_body_detected() {
        let dir = tempdir().unwrap();
        let bytes = vec![1u8; 256];
        let mut h = header(3);
        let path = write_snapshot(dir.path(), &mut h, &bytes, 4096).unwrap();

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(matches!(err, HotswapError::StateCorrupted { .. }));
    }

    #[test]
    fn test_header_only_read() {
        let dir = tempdir().unwrap();
        let mut h = header(4);
        let path = write_snapshot(dir.path(), &mut h, &[9u8; 50], 1024).unwrap();

        let read = read_snapshot_header(&path).unwrap();
        assert_eq!(read.snapshot_id, SnapshotId(4));
        assert_eq!(read.module_id, ModuleId(1));
        assert_eq!(read.size, 50);
    }

    #[test]
    fn test_empty_state_roundtrip() {
        let dir = tempdir().unwrap();
        let mut h = header(5);
        let path = write_snapshot(dir.path(), &mut h, &[], 1024).unwrap();
        let read = read_snapshot(&path).unwrap();
        assert!(read.bytes.is_empty());
    }

    #[test]
    fn test_snapshot_path_format() {
        let p = snapshot_path(Path::new("/tmp/s"), SnapshotId(42));
        assert_eq!(p, PathBuf::from("/tmp/s/0000000000000042.snap"));
    }
}
