//! Ready-made step state for tests.

use super::InMemoryDriver;
use crate::config::BuilderConfig;
use crate::context::StepState;
use crate::descriptor::DomainDescriptor;
use crate::driver::VirtDriver;
use crate::ui::CollectingUi;
use std::sync::Arc;

/// Name of the domain in states built by this module.
pub const TEST_DOMAIN: &str = "build-vm";

/// Builds a state backed by a fresh [`InMemoryDriver`] and [`CollectingUi`].
#[must_use]
pub fn test_state(config: BuilderConfig) -> (StepState, Arc<CollectingUi>, Arc<InMemoryDriver>) {
    let driver = Arc::new(InMemoryDriver::new());
    let (state, ui) = test_state_with_driver(config, Arc::clone(&driver) as Arc<dyn VirtDriver>);
    (state, ui, driver)
}

/// Builds a state around a caller-supplied driver.
#[must_use]
pub fn test_state_with_driver(
    config: BuilderConfig,
    driver: Arc<dyn VirtDriver>,
) -> (StepState, Arc<CollectingUi>) {
    let ui = Arc::new(CollectingUi::new());
    let state = StepState::new(
        Arc::new(config),
        Arc::clone(&ui) as Arc<dyn crate::ui::Ui>,
        driver,
        DomainDescriptor::new(TEST_DOMAIN),
    );
    (state, ui)
}
