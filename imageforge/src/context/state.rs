//! The mutable state shared by every step of a build.

use crate::cancellation::CancellationToken;
use crate::config::BuilderConfig;
use crate::descriptor::DomainDescriptor;
use crate::driver::{DomainHandle, VirtDriver};
use crate::network::CommunicatorAddressHelper;
use crate::step::HaltReason;
use crate::ui::Ui;
use crate::volume::PreparedVolume;
use std::sync::Arc;
use uuid::Uuid;

/// State passed by `&mut` to every step, in order.
///
/// The collaborators (`config`, `ui`, `driver`, `cancel`) are fixed for the
/// run. The remaining fields are written by steps: each one documents which
/// step produces it.
pub struct StepState {
    /// Identifier of this run, attached to log records.
    pub run_id: Uuid,
    /// Build configuration.
    pub config: Arc<BuilderConfig>,
    /// Progress sink.
    pub ui: Arc<dyn Ui>,
    /// Virtualization service client.
    pub driver: Arc<dyn VirtDriver>,
    /// Cancellation signal checked before remote calls.
    pub cancel: Arc<CancellationToken>,
    /// Pending domain descriptor; refreshed in place after definition.
    pub domain_def: DomainDescriptor,
    /// The service's XML for the defined domain, as last fetched. Carries the
    /// content `domain_def` does not model. Set by `DefineDomainStep`.
    pub domain_xml: Option<String>,
    /// Handle of the defined domain. Set by `DefineDomainStep`, cleared by its
    /// cleanup.
    pub domain: Option<DomainHandle>,
    /// Communicator interface lookup. Set by `DefineDomainStep`.
    pub communicator_address_helper: Option<CommunicatorAddressHelper>,
    /// Volumes prepared by `PrepareVolumesStep`, in creation order.
    pub volumes: Vec<PreparedVolume>,
    /// Terminal error recorded by the halt protocol.
    pub error: Option<HaltReason>,
    /// Logs full descriptors when set.
    pub debug: bool,
}

impl StepState {
    /// Creates the state for a new run.
    #[must_use]
    pub fn new(
        config: Arc<BuilderConfig>,
        ui: Arc<dyn Ui>,
        driver: Arc<dyn VirtDriver>,
        domain_def: DomainDescriptor,
    ) -> Self {
        let debug = config.packer_debug;
        Self {
            run_id: Uuid::new_v4(),
            config,
            ui,
            driver,
            cancel: Arc::new(CancellationToken::new()),
            domain_def,
            domain_xml: None,
            domain: None,
            communicator_address_helper: None,
            volumes: Vec::new(),
            error: None,
            debug,
        }
    }

    /// Shares an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the debug flag.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns true once a step has halted.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Returns the recorded error message, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

impl std::fmt::Debug for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepState")
            .field("run_id", &self.run_id)
            .field("domain_name", &self.domain_def.name)
            .field("domain", &self.domain)
            .field("volumes", &self.volumes.len())
            .field("error", &self.error_message())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
