//! Artifact loader
//!
//! Maps an artifact file into a [`CodeImage`]: structural parse, content
//! hash verification, optional signature verification, and resolution of
//! the well-known entry symbol. Each rejection keeps its own error kind so
//! the scheduler can report precisely why a module stayed on its prior
//! image.

use crate::artifact::{payload_hash, payload_signature, ArtifactFile};
use crate::image::CodeImage;
use hotswap_core::{HotswapError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Loader with the instance's security policy applied.
#[derive(Debug, Clone)]
pub struct ArtifactLoader {
    require_signature: bool,
}

impl ArtifactLoader {
    /// Create a loader.
    pub fn new(require_signature: bool) -> Self {
        ArtifactLoader { require_signature }
    }

    /// Load an artifact into an immutable code image.
    ///
    /// Verification order: framing, content hash, signature, entry symbol.
    /// On any failure nothing is published and the caller's registry entry
    /// is untouched.
    pub fn load(&self, path: &Path) -> Result<Arc<CodeImage>> {
        let artifact = ArtifactFile::read(path)?;
        self.verify(path, &artifact)?;

        let image = CodeImage::from_artifact(artifact, path.to_path_buf());
        debug!(
            module = %image.module_name,
            version = %image.version,
            size = image.size(),
            exports = image.export_count(),
            "artifact mapped"
        );
        Ok(image)
    }

    fn verify(&self, path: &Path, artifact: &ArtifactFile) -> Result<()> {
        let computed = payload_hash(&artifact.payload);
        if computed != artifact.header.content_hash {
            warn!(path = %path.display(), "artifact content hash mismatch");
            return Err(HotswapError::integrity_failed(
                path,
                format!(
                    "content hash mismatch: header {:016x}, payload {:016x}",
                    artifact.header.content_hash, computed
                ),
            ));
        }

        match artifact.header.signature {
            Some(sig) => {
                if sig != payload_signature(&artifact.payload) {
                    return Err(HotswapError::SignatureInvalid {
                        path: path.to_path_buf(),
                    });
                }
            }
            None if self.require_signature => {
                return Err(HotswapError::SignatureInvalid {
                    path: path.to_path_buf(),
                });
            }
            None => {}
        }

        let has_entry = artifact
            .header
            .exports
            .iter()
            .any(|e| e.name == crate::artifact::ENTRY_SYMBOL);
        if !has_entry {
            return Err(HotswapError::SymbolNotFound {
                symbol: crate::artifact::ENTRY_SYMBOL.to_string(),
            });
        }

        Ok(())
    }
}
