//! Storage volume descriptor.

use super::{marshal, unmarshal};
use crate::errors::ProvisionError;
use serde::{Deserialize, Serialize};

/// Declarative description of a storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "volume")]
pub struct StorageVolumeDescriptor {
    /// Volume type, e.g. "file".
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Volume name, unique within its pool.
    pub name: String,
    /// Service-assigned key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Logical size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<VolumeSize>,
    /// Allocated size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<VolumeSize>,
    /// Target path and format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<StorageVolumeTarget>,
    /// Copy-on-write base image.
    #[serde(rename = "backingStore", default, skip_serializing_if = "Option::is_none")]
    pub backing_store: Option<StorageVolumeBackingStore>,
}

impl StorageVolumeDescriptor {
    /// Creates a volume descriptor with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            kind: None,
            name: name.into(),
            key: None,
            capacity: None,
            allocation: None,
            target: None,
            backing_store: None,
        }
    }

    /// Sets the capacity in bytes.
    #[must_use]
    pub fn with_capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity = Some(VolumeSize::bytes(bytes));
        self
    }

    /// Sets the target image format.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        let target = self.target.get_or_insert_with(StorageVolumeTarget::default);
        target.format = Some(VolumeFormat::new(format));
        self
    }

    /// Sets the backing store.
    #[must_use]
    pub fn with_backing_store(mut self, path: impl Into<String>, format: Option<String>) -> Self {
        self.backing_store = Some(StorageVolumeBackingStore {
            path: path.into(),
            format: format.map(VolumeFormat::new),
        });
        self
    }

    /// Returns the target path, if the service has reported one.
    #[must_use]
    pub fn target_path(&self) -> Option<&str> {
        self.target.as_ref().and_then(|t| t.path.as_deref())
    }

    /// Returns the target format type, if set.
    #[must_use]
    pub fn format(&self) -> Option<&str> {
        self.target
            .as_ref()
            .and_then(|t| t.format.as_ref())
            .map(|f| f.kind.as_str())
    }

    /// Serializes the descriptor to XML.
    pub fn to_xml(&self) -> Result<String, ProvisionError> {
        marshal(self)
    }

    /// Parses a descriptor from XML.
    pub fn from_xml(xml: &str) -> Result<Self, ProvisionError> {
        unmarshal(xml)
    }
}

/// Size element: `<capacity unit="bytes">1073741824</capacity>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSize {
    /// Size unit.
    #[serde(rename = "@unit", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Size.
    #[serde(rename = "$text")]
    pub value: u64,
}

impl VolumeSize {
    /// Creates a size in bytes.
    #[must_use]
    pub fn bytes(value: u64) -> Self {
        Self {
            unit: Some("bytes".to_string()),
            value,
        }
    }
}

/// Volume target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolumeTarget {
    /// Path on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Image format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
}

/// Format element: `<format type="qcow2"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeFormat {
    /// Format type.
    #[serde(rename = "@type")]
    pub kind: String,
}

impl VolumeFormat {
    /// Creates a format.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Backing store element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolumeBackingStore {
    /// Path of the base image.
    pub path: String,
    /// Format of the base image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
}
