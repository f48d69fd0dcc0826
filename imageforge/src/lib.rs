//! # Imageforge
//!
//! Provisioning steps for building virtual machine images on a libvirt-style
//! virtualization service.
//!
//! A build runs an ordered list of steps against shared [`context::StepState`]:
//!
//! - **Volume preparation**: create, clone or overlay storage volumes and attach them
//! - **Domain definition**: submit the domain descriptor and resolve the communicator interface
//! - **Compensation**: every started step is cleaned up in reverse order
//! - **Cancellation**: a shared token is checked before each remote call
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use imageforge::prelude::*;
//!
//! let config = BuilderConfig::from_file("build.json")?;
//! config.validate()?;
//!
//! let mut state = StepState::new(
//!     Arc::new(config),
//!     Arc::new(LoggingUi),
//!     driver,
//!     DomainDescriptor::new("build-vm").with_memory_kib(2 << 20),
//! );
//! let outcome = StepPipeline::provisioning().run(&mut state).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod driver;
pub mod errors;
pub mod network;
pub mod observability;
pub mod pipeline;
pub mod step;
pub mod steps;
pub mod testing;
pub mod ui;
pub mod volume;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BuilderConfig, VolumeConfig, VolumeSource};
    pub use crate::context::StepState;
    pub use crate::descriptor::{
        DomainDescriptor, DomainDisk, DomainInterface, StorageVolumeDescriptor,
    };
    pub use crate::driver::{DomainHandle, StoragePoolHandle, StorageVolumeHandle, VirtDriver};
    pub use crate::errors::{DriverError, ProvisionError};
    pub use crate::network::{CommunicatorAddressHelper, NetworkAddressSource};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{PipelineOutcome, PipelineStatus, StepPipeline};
    pub use crate::step::{halt_on_error, HaltReason, Step, StepAction};
    pub use crate::steps::{DefineDomainStep, PrepareVolumesStep};
    pub use crate::ui::{CollectingUi, LoggingUi, Ui};
    pub use crate::volume::{PreparedVolume, VolumePreparationContext};
    pub use std::sync::Arc;
}
