//! Registry manifest checkpoint
//!
//! A periodic snapshot of the registry written beside the WAL so restart
//! can seed module versions without replaying history. The WAL stays
//! authoritative: a missing or damaged manifest degrades to a plain WAL
//! recovery, never to an error.

use crc32fast::Hasher;
use hotswap_core::{now_micros, ModuleId, ModuleVersion, Result, SnapshotId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Magic bytes identifying a manifest file: "HMAN"
pub const MANIFEST_MAGIC: [u8; 4] = *b"HMAN";

/// Current manifest format version
pub const MANIFEST_FORMAT_VERSION: u16 = 1;

/// One module's row in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Stable module id
    pub id: ModuleId,
    /// Stable module name
    pub name: String,
    /// Committed version at checkpoint time
    pub version: Option<ModuleVersion>,
    /// Committed snapshot at checkpoint time
    pub snapshot: Option<SnapshotId>,
    /// Critical flag
    pub critical: bool,
}

/// Snapshot of the registry at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    /// Instance that wrote the manifest
    pub instance: [u8; 16],
    /// Checkpoint timestamp, microseconds since epoch
    pub created_ts: u64,
    /// Module rows
    pub modules: Vec<ManifestEntry>,
}

impl RegistryManifest {
    /// Fresh manifest for `instance`.
    pub fn new(instance: [u8; 16], modules: Vec<ManifestEntry>) -> Self {
        RegistryManifest {
            instance,
            created_ts: now_micros(),
            modules,
        }
    }

    /// Write atomically: temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(4 + 2 + 4 + body.len() + 4);
        out.extend_from_slice(&MANIFEST_MAGIC);
        out.extend_from_slice(&MANIFEST_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);

        let mut hasher = Hasher::new();
        hasher.update(&body);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());

        let tmp = path.with_extension("manifest.tmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a manifest; `None` when absent, damaged, or from an unknown
    /// format (the caller falls back to WAL-only recovery).
    pub fn load(path: &Path) -> Result<Option<RegistryManifest>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        if raw.len() < 10 || raw[0..4] != MANIFEST_MAGIC {
            warn!(path = %path.display(), "manifest has bad framing; ignoring");
            return Ok(None);
        }
        let format = u16::from_le_bytes([raw[4], raw[5]]);
        if format != MANIFEST_FORMAT_VERSION {
            warn!(path = %path.display(), format, "manifest format unknown; ignoring");
            return Ok(None);
        }
        let body_len = u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]) as usize;
        if raw.len() < 10 + body_len + 4 {
            warn!(path = %path.display(), "manifest truncated; ignoring");
            return Ok(None);
        }
        let body = &raw[10..10 + body_len];
        let stored = u32::from_le_bytes(
            raw[10 + body_len..10 + body_len + 4]
                .try_into()
                .expect("4 bytes"),
        );
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored {
            warn!(path = %path.display(), "manifest checksum mismatch; ignoring");
            return Ok(None);
        }

        match bincode::deserialize(body) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "manifest decode failed; ignoring");
                Ok(None)
            }
        }
    }
}
