//! Code images
//!
//! A [`CodeImage`] is the immutable in-memory form of a loaded artifact:
//! payload bytes plus the resolved export table. Images are shared through
//! `Arc` — the registry entry holds one strong reference, and every
//! transaction staging the image holds another. An image's backing bytes
//! are freed exactly when the last `Arc` drops, which cannot happen while
//! either the registry or an active transaction still references it.

use crate::artifact::{ArtifactFile, ENTRY_SYMBOL};
use hotswap_core::module::DependencyReq;
use hotswap_core::{now_micros, ModuleVersion};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Resolved entry point: an offset into the image payload.
///
/// Opaque to the core; the simulation interprets it through the module's
/// interface table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(pub u64);

/// Immutable loaded representation of one artifact.
#[derive(Debug)]
pub struct CodeImage {
    /// Module the image belongs to
    pub module_name: String,
    /// Version the image was built as
    pub version: ModuleVersion,
    /// Artifact the image was mapped from
    pub artifact_path: PathBuf,
    /// Dependency requirements carried over from the artifact header
    pub dependencies: Vec<DependencyReq>,
    /// Payload bytes (strong reference to the backing artifact content)
    payload: Arc<[u8]>,
    /// Resolved export table
    exports: HashMap<String, EntryPoint>,
    /// When the image was constructed, microseconds since epoch
    pub loaded_ts: u64,
}

impl CodeImage {
    /// Construct an image from a parsed artifact.
    ///
    /// Callers must have validated integrity first; construction itself
    /// cannot fail and the result is fully initialized before it becomes
    /// reachable anywhere (publication happens by storing the `Arc` in a
    /// registry slot).
    pub fn from_artifact(artifact: ArtifactFile, path: PathBuf) -> Arc<CodeImage> {
        let exports = artifact
            .header
            .exports
            .iter()
            .map(|e| (e.name.clone(), EntryPoint(e.offset)))
            .collect();
        Arc::new(CodeImage {
            module_name: artifact.header.module_name,
            version: artifact.header.version,
            artifact_path: path,
            dependencies: artifact.header.dependencies,
            payload: artifact.payload.into(),
            exports,
            loaded_ts: now_micros(),
        })
    }

    /// Resolve a symbol from the export table.
    pub fn resolve(&self, symbol: &str) -> Option<EntryPoint> {
        self.exports.get(symbol).copied()
    }

    /// The module's well-known entry point.
    pub fn entry_point(&self) -> Option<EntryPoint> {
        self.resolve(ENTRY_SYMBOL)
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of exported symbols
    pub fn export_count(&self) -> usize {
        self.exports.len()
    }
}
