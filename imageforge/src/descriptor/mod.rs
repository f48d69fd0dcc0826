//! Typed libvirt XML descriptors.
//!
//! This module provides:
//! - Domain descriptors (devices, disks, interfaces and their aliases)
//! - Storage volume descriptors (capacity, target format, backing store)
//! - Marshal/unmarshal helpers over the XML wire format

mod domain;
mod volume;

pub use domain::{
    DomainAlias, DomainChannel, DomainChannelSource, DomainChannelTarget, DomainCpu,
    DomainDescriptor, DomainDevices, DomainDisk, DomainDiskDriver, DomainDiskSource,
    DomainDiskTarget, DomainGraphics, DomainInterface, DomainInterfaceMac, DomainInterfaceModel,
    DomainInterfaceSource, DomainInterfaceTarget, DomainMemory, DomainOs, DomainOsBoot,
    DomainOsType, DomainVcpu, GUEST_AGENT_CHANNEL,
};
pub use volume::{
    StorageVolumeBackingStore, StorageVolumeDescriptor, StorageVolumeTarget, VolumeFormat,
    VolumeSize,
};

use crate::errors::ProvisionError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes a descriptor to its XML wire form.
pub fn marshal<T: Serialize>(value: &T) -> Result<String, ProvisionError> {
    quick_xml::se::to_string(value).map_err(ProvisionError::marshal)
}

/// Parses a descriptor from its XML wire form.
pub fn unmarshal<T: DeserializeOwned>(xml: &str) -> Result<T, ProvisionError> {
    quick_xml::de::from_str(xml).map_err(ProvisionError::marshal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarshal_rejects_garbage() {
        let result: Result<DomainDescriptor, _> = unmarshal("<domain><name>vm");
        assert!(matches!(result, Err(ProvisionError::Marshal(_))));
    }
}
