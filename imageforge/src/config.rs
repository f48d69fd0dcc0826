//! Build configuration.
//!
//! Parsing happens at the edge (`from_json_str`, `from_file`); the steps only
//! ever see an already-validated [`BuilderConfig`].

use crate::descriptor::StorageVolumeDescriptor;
use crate::errors::ProvisionError;
use crate::network::{map_network_address_source, NetworkAddressSource};
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static VOLUME_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.+-]+$").expect("volume name pattern is valid")
});

/// Configuration consumed by the provisioning steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Alias of the interface the communicator connects through.
    #[serde(default)]
    pub communicator_interface: String,
    /// Address discovery strategy name ("lease", "agent" or "arp").
    #[serde(default = "default_network_address_source")]
    pub network_address_source: String,
    /// Logs full descriptors when set.
    #[serde(default)]
    pub packer_debug: bool,
    /// Volumes to prepare before the domain is defined.
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    /// Upper bound for all compensations of one pipeline run, in seconds.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_seconds: f64,
}

fn default_network_address_source() -> String {
    "lease".to_string()
}

fn default_cleanup_timeout() -> f64 {
    30.0
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            communicator_interface: String::new(),
            network_address_source: default_network_address_source(),
            packer_debug: false,
            volumes: Vec::new(),
            cleanup_timeout_seconds: default_cleanup_timeout(),
        }
    }
}

impl BuilderConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the communicator interface alias.
    #[must_use]
    pub fn with_communicator_interface(mut self, alias: impl Into<String>) -> Self {
        self.communicator_interface = alias.into();
        self
    }

    /// Sets the network address source name.
    #[must_use]
    pub fn with_network_address_source(mut self, source: impl Into<String>) -> Self {
        self.network_address_source = source.into();
        self
    }

    /// Enables debug descriptor logging.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.packer_debug = debug;
        self
    }

    /// Adds a volume.
    #[must_use]
    pub fn with_volume(mut self, volume: VolumeConfig) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Sets the cleanup timeout.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, seconds: f64) -> Self {
        self.cleanup_timeout_seconds = seconds;
        self
    }

    /// Gets the cleanup timeout as a Duration.
    ///
    /// Values a `Duration` cannot hold fall back to the default; `validate`
    /// reports them.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.cleanup_timeout_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_cleanup_timeout()))
    }

    /// Resolves the configured address source.
    pub fn address_source(&self) -> Result<NetworkAddressSource, ProvisionError> {
        map_network_address_source(&self.network_address_source)
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ProvisionError> {
        serde_json::from_str(json).map_err(ProvisionError::marshal)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Checks the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let mut problems = Vec::new();

        if let Err(err) = self.address_source() {
            problems.push(format!(
                "{err}; expected one of {}",
                NetworkAddressSource::NAMES.join(", ")
            ));
        }

        if self.cleanup_timeout_seconds <= 0.0
            || Duration::try_from_secs_f64(self.cleanup_timeout_seconds).is_err()
        {
            problems.push(format!(
                "cleanup_timeout_seconds must be a positive number of seconds, got {}",
                self.cleanup_timeout_seconds
            ));
        }

        let mut seen = HashSet::new();
        let mut target_devs = HashSet::new();
        for volume in &self.volumes {
            if !seen.insert((volume.pool.as_str(), volume.name.as_str())) {
                problems.push(format!("volume '{}' is declared twice in pool '{}'", volume.name, volume.pool));
            }
            if !target_devs.insert(volume.target_dev.as_str()) {
                problems.push(format!(
                    "volume '{}' reuses target device '{}'",
                    volume.name, volume.target_dev
                ));
            }
            problems.extend(volume.problems());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::InvalidConfig(problems))
        }
    }
}

/// Where a volume's initial content comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    /// A new, empty volume.
    #[default]
    Empty,
    /// A full copy of an existing volume.
    CloneFrom {
        /// Pool of the source volume.
        pool: String,
        /// Source volume name.
        volume: String,
    },
    /// A copy-on-write overlay over a base image.
    BackingStore {
        /// Path of the base image.
        path: String,
        /// Format of the base image.
        #[serde(default)]
        format: Option<String>,
    },
}

/// Configuration of one storage volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume name.
    pub name: String,
    /// Pool to create the volume in.
    #[serde(default = "default_pool")]
    pub pool: String,
    /// Capacity in bytes. Clones default to the source size.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    /// Image format.
    #[serde(default = "default_format")]
    pub format: String,
    /// Initial content.
    #[serde(default)]
    pub source: VolumeSource,
    /// Guest device name, e.g. "vda".
    #[serde(default = "default_target_dev")]
    pub target_dev: String,
    /// Guest bus.
    #[serde(default = "default_bus")]
    pub bus: String,
    /// Keeps the volume after a successful build.
    #[serde(default)]
    pub artifact: bool,
}

fn default_pool() -> String {
    "default".to_string()
}

fn default_format() -> String {
    "qcow2".to_string()
}

fn default_target_dev() -> String {
    "vda".to_string()
}

fn default_bus() -> String {
    "virtio".to_string()
}

impl VolumeConfig {
    /// Creates an empty-volume configuration with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: default_pool(),
            capacity_bytes: None,
            format: default_format(),
            source: VolumeSource::Empty,
            target_dev: default_target_dev(),
            bus: default_bus(),
            artifact: false,
        }
    }

    /// Sets the pool.
    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    /// Sets the content source.
    #[must_use]
    pub fn with_source(mut self, source: VolumeSource) -> Self {
        self.source = source;
        self
    }

    /// Sets the guest device name.
    #[must_use]
    pub fn with_target_dev(mut self, dev: impl Into<String>) -> Self {
        self.target_dev = dev.into();
        self
    }

    /// Marks the volume as a build artifact.
    #[must_use]
    pub fn as_artifact(mut self) -> Self {
        self.artifact = true;
        self
    }

    /// Builds the descriptor submitted to the service.
    #[must_use]
    pub fn to_descriptor(&self) -> StorageVolumeDescriptor {
        let mut descriptor = StorageVolumeDescriptor::new(&self.name).with_format(&self.format);

        if let Some(bytes) = self.capacity_bytes {
            descriptor = descriptor.with_capacity_bytes(bytes);
        }

        if let VolumeSource::BackingStore { path, format } = &self.source {
            descriptor = descriptor.with_backing_store(path, format.clone());
        }

        descriptor
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !VOLUME_NAME.is_match(&self.name) {
            problems.push(format!("volume name '{}' is not valid", self.name));
        }
        if self.pool.is_empty() {
            problems.push(format!("volume '{}' has an empty pool name", self.name));
        }
        if self.target_dev.is_empty() {
            problems.push(format!("volume '{}' has an empty target device", self.name));
        }

        match &self.source {
            VolumeSource::Empty | VolumeSource::BackingStore { .. } if self.capacity_bytes.is_none() => {
                problems.push(format!("volume '{}' needs capacity_bytes", self.name));
            }
            VolumeSource::CloneFrom { pool, volume } if pool.is_empty() || volume.is_empty() => {
                problems.push(format!("volume '{}' clone source is incomplete", self.name));
            }
            _ => {}
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BuilderConfig::default();

        assert_eq!(config.network_address_source, "lease");
        assert!(!config.packer_debug);
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = BuilderConfig::from_json_str(
            r#"{
                "communicator_interface": "ua-communicator",
                "volumes": [
                    {"name": "disk0.qcow2", "capacity_bytes": 1073741824},
                    {"name": "clone.qcow2", "target_dev": "vdb", "source": {"type": "clone_from", "pool": "images", "volume": "base.qcow2"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.communicator_interface, "ua-communicator");
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].pool, "default");
        assert_eq!(config.volumes[0].format, "qcow2");
        assert_eq!(config.volumes[0].source, VolumeSource::Empty);
        assert_eq!(
            config.volumes[1].source,
            VolumeSource::CloneFrom {
                pool: "images".to_string(),
                volume: "base.qcow2".to_string()
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_unknown_address_source() {
        let config = BuilderConfig::new().with_network_address_source("dhcp");

        let err = config.validate().unwrap_err();
        let ProvisionError::InvalidConfig(problems) = err else {
            panic!("expected InvalidConfig");
        };
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("dhcp"));
        assert!(problems[0].contains("lease, agent, arp"));
    }

    #[test]
    fn test_validate_collects_volume_problems() {
        let config = BuilderConfig::new()
            .with_volume(VolumeConfig::new("bad name"))
            .with_volume(VolumeConfig::new("disk.qcow2").with_capacity_bytes(1))
            .with_volume(VolumeConfig::new("disk.qcow2").with_capacity_bytes(1));

        let ProvisionError::InvalidConfig(problems) = config.validate().unwrap_err() else {
            panic!("expected InvalidConfig");
        };

        assert!(problems.iter().any(|p| p.contains("'bad name' is not valid")));
        assert!(problems.iter().any(|p| p.contains("needs capacity_bytes")));
        assert!(problems.iter().any(|p| p.contains("declared twice")));
    }

    #[test]
    fn test_validate_rejects_shared_target_device() {
        let config = BuilderConfig::new()
            .with_volume(VolumeConfig::new("root.qcow2").with_capacity_bytes(1))
            .with_volume(VolumeConfig::new("data.qcow2").with_capacity_bytes(1));

        let ProvisionError::InvalidConfig(problems) = config.validate().unwrap_err() else {
            panic!("expected InvalidConfig");
        };

        assert_eq!(problems, vec!["volume 'data.qcow2' reuses target device 'vda'".to_string()]);

        let mut fixed = config;
        fixed.volumes[1].target_dev = "vdb".to_string();
        assert!(fixed.validate().is_ok());
    }

    #[test]
    fn test_unrepresentable_cleanup_timeout() {
        let config = BuilderConfig::from_json_str(r#"{"cleanup_timeout_seconds": 1e20}"#).unwrap();

        let ProvisionError::InvalidConfig(problems) = config.validate().unwrap_err() else {
            panic!("expected InvalidConfig");
        };
        assert!(problems[0].contains("cleanup_timeout_seconds"));
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(30));

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = BuilderConfig::new().with_cleanup_timeout(bad);
            assert!(config.validate().is_err(), "{bad} accepted");
            assert_eq!(config.cleanup_timeout(), Duration::from_secs(30));
        }
    }

    #[test]
    fn test_descriptor_from_backing_store_config() {
        let volume = VolumeConfig::new("overlay.qcow2")
            .with_capacity_bytes(4096)
            .with_source(VolumeSource::BackingStore {
                path: "/images/base.qcow2".to_string(),
                format: Some("qcow2".to_string()),
            });

        let descriptor = volume.to_descriptor();

        assert_eq!(descriptor.name, "overlay.qcow2");
        assert_eq!(descriptor.capacity.as_ref().unwrap().value, 4096);
        assert_eq!(descriptor.format(), Some("qcow2"));
        assert_eq!(descriptor.backing_store.unwrap().path, "/images/base.qcow2");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"network_address_source": "agent", "packer_debug": true}}"#).unwrap();

        let config = BuilderConfig::from_file(file.path()).unwrap();

        assert!(config.packer_debug);
        assert_eq!(config.address_source().unwrap(), NetworkAddressSource::Agent);
    }

    #[test]
    fn test_from_file_missing() {
        let err = BuilderConfig::from_file("/nonexistent/imageforge.json").unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
