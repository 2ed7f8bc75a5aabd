//! File watcher and build pipeline
//!
//! Debounced filesystem change events feed a priority build queue drained
//! by a bounded worker pool; completed artifacts park until the frame
//! scheduler drains them.

pub mod estimate;
pub mod pipeline;
pub mod queue;
pub mod watcher;

pub use estimate::DurationEstimator;
pub use pipeline::{
    system_load_probe, BuildFailReason, BuildOutcome, BuildPipeline, Builder, BuiltArtifact,
    LoadProbe, PipelineConfig, SystemLoad,
};
pub use queue::{BuildPriority, BuildQueue, BuildRequest};
pub use watcher::{ChangeEvent, FileWatcher};
