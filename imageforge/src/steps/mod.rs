//! The provisioning steps.

mod define_domain;
mod prepare_volumes;

pub use define_domain::DefineDomainStep;
pub use prepare_volumes::PrepareVolumesStep;
