//! On-disk artifact format
//!
//! An artifact is the build pipeline's output for one module. The loader is
//! the only reader; the build toolchain (outside this workspace) is the only
//! legitimate writer, though tests forge artifacts through [`ArtifactBuilder`].
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┬─────────────────┐
//! │ Magic (4)    │ Format ver (2)   │ Header len (4)   │ Header (bincode)│
//! ├──────────────┴──────────────────┴──────────────────┴─────────────────┤
//! │ Payload (module code bytes, variable)                                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `content_hash` in the header is the xxh3 of the payload; `signature`, when
//! present, is a sha256 digest over the payload. Both are verified by the
//! loader before a code image is constructed.

use hotswap_core::module::DependencyReq;
use hotswap_core::{HotswapError, ModuleVersion, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes identifying an artifact file: "HART"
pub const ARTIFACT_MAGIC: [u8; 4] = *b"HART";

/// Current artifact format version
pub const ARTIFACT_FORMAT_VERSION: u16 = 1;

/// Size of the fixed preamble preceding the encoded header
pub const ARTIFACT_PREAMBLE_SIZE: usize = 10;

/// The well-known entry symbol every module must export.
pub const ENTRY_SYMBOL: &str = "hotswap_module_entry";

/// One exported symbol: name plus its offset into the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    /// Symbol name
    pub name: String,
    /// Offset of the entry point within the payload
    pub offset: u64,
}

/// Decoded artifact header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// Module this artifact was built for
    pub module_name: String,
    /// Version the artifact was built as
    pub version: ModuleVersion,
    /// Dependency versions the module was compiled against
    pub dependencies: Vec<DependencyReq>,
    /// Exported symbol table
    pub exports: Vec<ExportEntry>,
    /// xxh3 hash of the payload
    pub content_hash: u64,
    /// Optional sha256 signature over the payload
    pub signature: Option<[u8; 32]>,
}

/// A parsed artifact: header plus payload bytes.
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    /// Decoded header
    pub header: ArtifactHeader,
    /// Module code bytes
    pub payload: Vec<u8>,
}

impl ArtifactFile {
    /// Read and structurally parse an artifact.
    ///
    /// Only the framing is validated here; hash and signature checks belong
    /// to the loader so that rejection reasons stay distinguishable.
    pub fn read(path: &Path) -> Result<ArtifactFile> {
        let bytes = fs::read(path)
            .map_err(|e| HotswapError::load_failed(path, format!("read failed: {}", e)))?;
        Self::parse(path, &bytes)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<ArtifactFile> {
        if bytes.len() < ARTIFACT_PREAMBLE_SIZE {
            return Err(HotswapError::load_failed(path, "file shorter than preamble"));
        }
        if bytes[0..4] != ARTIFACT_MAGIC {
            return Err(HotswapError::load_failed(path, "bad magic bytes"));
        }
        let format_version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if format_version != ARTIFACT_FORMAT_VERSION {
            return Err(HotswapError::load_failed(
                path,
                format!("unsupported format version {}", format_version),
            ));
        }
        let header_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let header_end = ARTIFACT_PREAMBLE_SIZE
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| HotswapError::load_failed(path, "header length exceeds file"))?;

        let header: ArtifactHeader = bincode::deserialize(&bytes[ARTIFACT_PREAMBLE_SIZE..header_end])
            .map_err(|e| HotswapError::load_failed(path, format!("header decode: {}", e)))?;
        let payload = bytes[header_end..].to_vec();

        Ok(ArtifactFile { header, payload })
    }

    /// Serialize preamble + header + payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header_bytes = bincode::serialize(&self.header)?;
        let mut out =
            Vec::with_capacity(ARTIFACT_PREAMBLE_SIZE + header_bytes.len() + self.payload.len());
        out.extend_from_slice(&ARTIFACT_MAGIC);
        out.extend_from_slice(&ARTIFACT_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Write the artifact to `path`, replacing any existing file.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

/// Compute the payload hash the header is expected to carry.
pub fn payload_hash(payload: &[u8]) -> u64 {
    xxh3_64(payload)
}

/// Compute the sha256 signature digest for a payload.
pub fn payload_signature(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Forges well-formed artifacts. Production artifacts come from the build
/// toolchain; this exists for tests and local tooling.
pub struct ArtifactBuilder {
    module_name: String,
    version: ModuleVersion,
    dependencies: Vec<DependencyReq>,
    exports: Vec<ExportEntry>,
    payload: Vec<u8>,
    signed: bool,
}

impl ArtifactBuilder {
    /// Start an artifact for `module_name` at `version`.
    ///
    /// The well-known entry symbol is pre-populated at offset 0.
    pub fn new(module_name: impl Into<String>, version: ModuleVersion) -> Self {
        ArtifactBuilder {
            module_name: module_name.into(),
            version,
            dependencies: Vec::new(),
            exports: vec![ExportEntry {
                name: ENTRY_SYMBOL.to_string(),
                offset: 0,
            }],
            payload: vec![0u8; 64],
            signed: false,
        }
    }

    /// Set the payload bytes
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Add an exported symbol
    pub fn export(mut self, name: impl Into<String>, offset: u64) -> Self {
        self.exports.push(ExportEntry {
            name: name.into(),
            offset,
        });
        self
    }

    /// Declare a dependency requirement
    pub fn dependency(mut self, name: impl Into<String>, min_version: ModuleVersion) -> Self {
        self.dependencies.push(DependencyReq {
            name: name.into(),
            min_version,
        });
        self
    }

    /// Drop the entry symbol (for negative tests)
    pub fn without_entry_symbol(mut self) -> Self {
        self.exports.retain(|e| e.name != ENTRY_SYMBOL);
        self
    }

    /// Attach a signature digest
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Finish building
    pub fn build(self) -> ArtifactFile {
        let content_hash = payload_hash(&self.payload);
        let signature = self.signed.then(|| payload_signature(&self.payload));
        ArtifactFile {
            header: ArtifactHeader {
                module_name: self.module_name,
                version: self.version,
                dependencies: self.dependencies,
                exports: self.exports,
                content_hash,
                signature,
            },
            payload: self.payload,
        }
    }

    /// Build and write to `path` in one step.
    pub fn write_to(self, path: &Path) -> Result<ArtifactFile> {
        let artifact = self.build();
        artifact.write(path)?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn version() -> ModuleVersion {
        ModuleVersion::new(1, 2, 3, 100)
    }

    #[test]
    fn test_artifact_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graphics.hart");

        let written = ArtifactBuilder::new("graphics", version())
            .payload(vec![7; 128])
            .export("draw", 16)
            .write_to(&path)
            .unwrap();

        let read = ArtifactFile::read(&path).unwrap();
        assert_eq!(read.header, written.header);
        assert_eq!(read.payload, written.payload);
        assert_eq!(read.header.module_name, "graphics");
        assert_eq!(read.header.content_hash, payload_hash(&read.payload));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.hart");
        let mut bytes = ArtifactBuilder::new("a", version()).build().to_bytes().unwrap();
        bytes[0] = b'X';
        std::fs::write(&path, bytes).unwrap();

        let err = ArtifactFile::read(&path).unwrap_err();
        assert!(matches!(err, HotswapError::LoadFailed { .. }));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.hart");
        std::fs::write(&path, b"HAR").unwrap();
        assert!(matches!(
            ArtifactFile::read(&path),
            Err(HotswapError::LoadFailed { .. })
        ));
    }

    #[test]
    fn test_header_len_beyond_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.hart");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ARTIFACT_MAGIC);
        bytes.extend_from_slice(&ARTIFACT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let err = ArtifactFile::read(&path).unwrap_err();
        assert!(err.to_string().contains("header length"));
    }

    #[test]
    fn test_unsupported_format_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.hart");
        let mut bytes = ArtifactBuilder::new("a", version()).build().to_bytes().unwrap();
        bytes[4] = 0xFF;
        bytes[5] = 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = ArtifactFile::read(&path).unwrap_err();
        assert!(err.to_string().contains("format version"));
    }

    #[test]
    fn test_signature_digest_changes_with_payload() {
        let a = payload_signature(&[1, 2, 3]);
        let b = payload_signature(&[1, 2, 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_builder_entry_symbol_present_by_default() {
        let artifact = ArtifactBuilder::new("a", version()).build();
        assert!(artifact
            .header
            .exports
            .iter()
            .any(|e| e.name == ENTRY_SYMBOL));

        let stripped = ArtifactBuilder::new("a", version())
            .without_entry_symbol()
            .build();
        assert!(!stripped
            .header
            .exports
            .iter()
            .any(|e| e.name == ENTRY_SYMBOL));
    }
}
