//! Pipeline execution.
//!
//! Steps run one at a time against a shared [`crate::context::StepState`].
//! Each step that started is compensated in reverse order when the run ends.

mod runner;

pub use runner::{PipelineOutcome, PipelineStatus, StepPipeline};
