//! The step contract and the halt protocol.
//!
//! Every step has a forward operation (`run`) and a compensation (`cleanup`).
//! A forward operation reports a fatal failure only through
//! [`halt_on_error`], which records the error in the state, shows it to the
//! user, and returns [`StepAction::Halt`]. Compensations cannot halt.

use crate::context::StepState;
use crate::errors::ProvisionError;
use async_trait::async_trait;
use std::fmt::{self, Debug, Display};
use tracing::error;

/// What the pipeline should do after a forward operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Run the next step.
    Continue,
    /// Stop and unwind.
    Halt,
}

impl StepAction {
    /// Returns true for `Halt`.
    #[must_use]
    pub fn is_halt(self) -> bool {
        matches!(self, Self::Halt)
    }
}

/// The error recorded when a step halts.
#[derive(Debug, Clone)]
pub struct HaltReason {
    /// Message shown to the user.
    pub message: String,
    /// The underlying error.
    pub cause: ProvisionError,
}

impl Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A provisioning step.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the name of the step.
    fn name(&self) -> &str;

    /// Runs the forward operation.
    async fn run(&self, state: &mut StepState) -> StepAction;

    /// Undoes whatever `run` left behind.
    ///
    /// Called after the step ran, whether it continued or halted, and must be
    /// safe to call when `run` did nothing. Failures are logged, never
    /// returned.
    async fn cleanup(&self, state: &mut StepState);
}

/// Records a fatal error and asks the pipeline to halt.
///
/// `context` names the failing operation, e.g. `DefineDomain.RPC`. The
/// message stored in `state.error` and shown through the UI is
/// `"{context}: {err}"`.
pub fn halt_on_error(state: &mut StepState, err: ProvisionError, context: impl Display) -> StepAction {
    let message = format!("{context}: {err}");

    error!(
        run_id = %state.run_id,
        error_kind = err.kind(),
        "{}", message
    );
    state.ui.error(&message);
    state.error = Some(HaltReason {
        message,
        cause: err,
    });

    StepAction::Halt
}
