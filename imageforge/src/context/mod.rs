//! Execution state shared across the steps of a build.

mod state;

pub use state::StepState;
