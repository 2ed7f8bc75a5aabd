//! Reload runtime engine
//!
//! Ties the registry, state store, WAL, transaction manager and build
//! pipeline together under one [`Runtime`] root and drives them from the
//! frame-budgeted [`FrameScheduler`].

pub mod runtime;
pub mod scheduler;
pub mod status;

pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::FrameScheduler;
pub use status::{FrameStats, RuntimePhase, RuntimeStats, RuntimeStatus};
