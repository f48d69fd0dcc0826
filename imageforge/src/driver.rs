//! The seam to the virtualization management service.
//!
//! The provisioning steps talk to libvirt only through [`VirtDriver`]. The
//! transport behind it (remote RPC, local socket, a fake in tests) is not
//! this crate's concern.

use crate::errors::DriverError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Service-side identity of a defined domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainHandle {
    /// Domain name.
    pub name: String,
    /// Domain UUID.
    pub uuid: String,
}

impl fmt::Display for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// Service-side identity of a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoragePoolHandle {
    /// Pool name.
    pub name: String,
    /// Pool UUID.
    pub uuid: String,
}

impl fmt::Display for StoragePoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Service-side identity of a storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageVolumeHandle {
    /// Name of the pool holding the volume.
    pub pool: String,
    /// Volume name.
    pub name: String,
    /// Volume key, usually the host path.
    pub key: String,
}

impl fmt::Display for StorageVolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

/// Typed operations of the virtualization service.
///
/// Every call is awaited to completion by the caller; steps never run two
/// calls concurrently. `flags` are passed through to the service untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VirtDriver: Send + Sync {
    /// Defines (but does not start) a domain from its XML descriptor.
    async fn define_domain(&self, xml: &str) -> Result<DomainHandle, DriverError>;

    /// Fetches the live XML descriptor of a domain.
    async fn get_domain_descriptor(
        &self,
        domain: &DomainHandle,
        flags: u32,
    ) -> Result<String, DriverError>;

    /// Removes a domain definition.
    async fn undefine_domain(&self, domain: &DomainHandle, flags: u32) -> Result<(), DriverError>;

    /// Looks up a storage pool by name.
    async fn lookup_pool(&self, name: &str) -> Result<StoragePoolHandle, DriverError>;

    /// Looks up a volume by name within a pool.
    async fn lookup_volume(
        &self,
        pool: &StoragePoolHandle,
        name: &str,
    ) -> Result<StorageVolumeHandle, DriverError>;

    /// Creates a volume in a pool from its XML descriptor.
    async fn create_volume(
        &self,
        pool: &StoragePoolHandle,
        xml: &str,
        flags: u32,
    ) -> Result<StorageVolumeHandle, DriverError>;

    /// Creates a volume in a pool, copying content from an existing volume.
    async fn clone_volume(
        &self,
        pool: &StoragePoolHandle,
        xml: &str,
        source: &StorageVolumeHandle,
        flags: u32,
    ) -> Result<StorageVolumeHandle, DriverError>;

    /// Fetches the live XML descriptor of a volume.
    async fn get_volume_descriptor(
        &self,
        volume: &StorageVolumeHandle,
        flags: u32,
    ) -> Result<String, DriverError>;

    /// Deletes a volume.
    async fn delete_volume(&self, volume: &StorageVolumeHandle, flags: u32) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        let domain = DomainHandle {
            name: "vm".to_string(),
            uuid: "1234".to_string(),
        };
        let volume = StorageVolumeHandle {
            pool: "default".to_string(),
            name: "disk0.qcow2".to_string(),
            key: "/images/disk0.qcow2".to_string(),
        };

        assert_eq!(domain.to_string(), "vm (1234)");
        assert_eq!(volume.to_string(), "default/disk0.qcow2");
    }
}
