//! Module registry and artifact loader
//!
//! Tracks module identity, versions, dependencies and code-image lifecycle.
//! The registry is the single owner of module entries; the loader turns
//! on-disk artifacts into immutable, shareable [`CodeImage`]s.

pub mod artifact;
pub mod entry;
pub mod image;
pub mod loader;
pub mod registry;

pub use artifact::{ArtifactBuilder, ArtifactFile, ArtifactHeader, ExportEntry, ENTRY_SYMBOL};
pub use entry::{LifecycleState, ModuleEntry, ModuleRef, QUARANTINE_THRESHOLD};
pub use image::{CodeImage, EntryPoint};
pub use loader::ArtifactLoader;
pub use registry::{ModuleInfo, ModuleRegistry};
