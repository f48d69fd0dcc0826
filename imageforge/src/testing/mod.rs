//! Testing utilities for provisioning steps.
//!
//! This module provides:
//! - An in-memory virtualization service with call counting and failure injection
//! - Step state fixtures wired to a collecting UI

mod driver;
mod fixtures;

pub use driver::InMemoryDriver;
pub use fixtures::{test_state, test_state_with_driver, TEST_DOMAIN};
