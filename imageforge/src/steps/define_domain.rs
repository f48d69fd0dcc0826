//! Defines the build domain on the service.

use crate::context::StepState;
use crate::descriptor::DomainDescriptor;
use crate::network::{map_network_address_source, CommunicatorAddressHelper};
use crate::step::{halt_on_error, Step, StepAction};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Submits the pending domain descriptor and resolves the communicator
/// interface.
///
/// After the define succeeds the descriptor is refreshed from the service so
/// that service-assigned fields (MAC addresses, UUID) are visible to later
/// steps. The refresh is best-effort: on failure the submitted descriptor is
/// kept.
#[derive(Debug, Clone, Default)]
pub struct DefineDomainStep;

impl DefineDomainStep {
    /// Creates the step.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn refresh_descriptor(state: &mut StepState) {
        let Some(handle) = state.domain.as_ref() else {
            return;
        };

        let raw = match state.driver.get_domain_descriptor(handle, 0).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(domain = %handle, "couldn't refresh domain definition: {}", err);
                return;
            }
        };

        match DomainDescriptor::from_xml(&raw) {
            Ok(descriptor) => state.domain_def = descriptor,
            Err(err) => warn!(domain = %handle, "couldn't refresh domain definition: {}", err),
        }
        state.domain_xml = Some(raw);
    }

    fn resolve_communicator(state: &StepState) -> CommunicatorAddressHelper {
        let alias = state.config.communicator_interface.as_str();
        let (interface, matches) = state.domain_def.find_interface_by_alias(alias);

        if matches > 1 {
            debug!(alias, matches, "several interfaces share the communicator alias, using the last");
        }

        let source = match map_network_address_source(&state.config.network_address_source) {
            Ok(source) => source,
            Err(err) => {
                warn!("{}; falling back to lease lookup", err);
                Default::default()
            }
        };

        CommunicatorAddressHelper::new(interface, source)
    }
}

#[async_trait]
impl Step for DefineDomainStep {
    fn name(&self) -> &str {
        "define_domain"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        state.ui.say("Sending the domain definition to libvirt");

        let xml = match state.domain_def.to_xml() {
            Ok(xml) => xml,
            Err(err) => return halt_on_error(state, err, "DefineDomain.Marshal"),
        };

        if state.debug {
            debug!(run_id = %state.run_id, "domain definition XML:\n{}", xml);
        }

        if let Err(err) = state.cancel.check("DefineDomain") {
            return halt_on_error(state, err, "DefineDomain.RPC");
        }

        let handle = match state.driver.define_domain(&xml).await {
            Ok(handle) => handle,
            Err(err) => return halt_on_error(state, err.into(), "DefineDomain.RPC"),
        };

        info!(run_id = %state.run_id, domain = %handle, "domain defined");
        state.domain = Some(handle);

        if let Err(err) = state.cancel.check("DefineDomain.Refresh") {
            return halt_on_error(state, err, "DefineDomain.Refresh");
        }
        Self::refresh_descriptor(state).await;

        let helper = Self::resolve_communicator(state);
        if helper.interface.is_none() {
            debug!(
                alias = %state.config.communicator_interface,
                "no interface matches the communicator alias"
            );
        }
        state.communicator_address_helper = Some(helper);

        StepAction::Continue
    }

    async fn cleanup(&self, state: &mut StepState) {
        // Cleared before the call so an interrupted undefine leaves no handle.
        state.domain_xml = None;
        let Some(handle) = state.domain.take() else {
            return;
        };

        state.ui.say("Undefining the domain...");
        if let Err(err) = state.driver.undefine_domain(&handle, 0).await {
            warn!(domain = %handle, "failed to undefine domain: {}", err);
        }
    }
}
