//! Domain descriptor.
//!
//! The typed model covers what a build writes or reads: memory, CPU, boot,
//! lifecycle actions, disks, interfaces, guest agent channels and consoles.
//! Elements it does not model (PCI addresses, seclabels, ...) are skipped on
//! parse; the step state keeps the service's raw XML next to the typed view.

use super::{marshal, unmarshal};
use crate::errors::ProvisionError;
use serde::{Deserialize, Serialize};

/// Declarative description of a virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainDescriptor {
    /// Hypervisor type, e.g. "kvm".
    #[serde(rename = "@type")]
    pub kind: String,
    /// Domain name.
    pub name: String,
    /// Domain UUID, usually assigned by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Guest memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<DomainMemory>,
    /// Virtual CPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<DomainVcpu>,
    /// Boot configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<DomainOs>,
    /// CPU model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<DomainCpu>,
    /// Action on guest power off, e.g. "destroy".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_poweroff: Option<String>,
    /// Action on guest reboot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reboot: Option<String>,
    /// Action on guest crash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_crash: Option<String>,
    /// Attached devices.
    #[serde(default)]
    pub devices: DomainDevices,
}

impl Default for DomainDescriptor {
    fn default() -> Self {
        Self {
            kind: "kvm".to_string(),
            name: String::new(),
            uuid: None,
            memory: None,
            vcpu: None,
            os: None,
            cpu: None,
            on_poweroff: None,
            on_reboot: None,
            on_crash: None,
            devices: DomainDevices::default(),
        }
    }
}

impl DomainDescriptor {
    /// Creates a KVM domain descriptor with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the memory size in KiB.
    #[must_use]
    pub fn with_memory_kib(mut self, kib: u64) -> Self {
        self.memory = Some(DomainMemory {
            unit: Some("KiB".to_string()),
            value: kib,
        });
        self
    }

    /// Sets the vCPU count.
    #[must_use]
    pub fn with_vcpus(mut self, count: u32) -> Self {
        self.vcpu = Some(DomainVcpu {
            placement: None,
            value: count,
        });
        self
    }

    /// Adds a network interface.
    #[must_use]
    pub fn with_interface(mut self, interface: DomainInterface) -> Self {
        self.devices.interfaces.push(interface);
        self
    }

    /// Sets the CPU mode, e.g. "host-passthrough".
    #[must_use]
    pub fn with_cpu_mode(mut self, mode: impl Into<String>) -> Self {
        self.cpu = Some(DomainCpu {
            mode: Some(mode.into()),
            check: None,
        });
        self
    }

    /// Adds the virtio channel the qemu guest agent listens on.
    ///
    /// The `agent` address source needs it.
    #[must_use]
    pub fn with_guest_agent_channel(mut self) -> Self {
        self.devices.channels.push(DomainChannel::guest_agent());
        self
    }

    /// Adds a disk.
    #[must_use]
    pub fn with_disk(mut self, disk: DomainDisk) -> Self {
        self.devices.disks.push(disk);
        self
    }

    /// Serializes the descriptor to XML.
    pub fn to_xml(&self) -> Result<String, ProvisionError> {
        marshal(self)
    }

    /// Parses a descriptor from XML.
    pub fn from_xml(xml: &str) -> Result<Self, ProvisionError> {
        unmarshal(xml)
    }

    /// Returns the network interfaces in document order.
    #[must_use]
    pub fn interfaces(&self) -> &[DomainInterface] {
        &self.devices.interfaces
    }

    /// Finds the interface whose alias name equals `alias`.
    ///
    /// When several interfaces carry the same alias the last one wins. The
    /// match is returned by value, together with the number of matches.
    #[must_use]
    pub fn find_interface_by_alias(&self, alias: &str) -> (Option<DomainInterface>, usize) {
        let mut matched = None;
        let mut count = 0;

        for interface in &self.devices.interfaces {
            if interface.alias_name() == Some(alias) {
                matched = Some(interface.clone());
                count += 1;
            }
        }

        (matched, count)
    }
}

/// Memory element: `<memory unit="KiB">1048576</memory>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMemory {
    /// Size unit.
    #[serde(rename = "@unit", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Size.
    #[serde(rename = "$text")]
    pub value: u64,
}

/// vCPU element: `<vcpu placement="static">2</vcpu>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainVcpu {
    /// CPU placement mode.
    #[serde(rename = "@placement", default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    /// Number of vCPUs.
    #[serde(rename = "$text")]
    pub value: u32,
}

/// OS element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOs {
    /// OS type, e.g. "hvm".
    #[serde(rename = "type")]
    pub os_type: DomainOsType,
    /// Boot devices in order.
    #[serde(rename = "boot", default, skip_serializing_if = "Vec::is_empty")]
    pub boot: Vec<DomainOsBoot>,
}

/// OS type element: `<type arch="x86_64" machine="q35">hvm</type>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOsType {
    /// Guest architecture.
    #[serde(rename = "@arch", default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Machine type.
    #[serde(rename = "@machine", default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    /// OS type.
    #[serde(rename = "$text")]
    pub value: String,
}

/// Boot device: `<boot dev="hd"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOsBoot {
    /// Device kind.
    #[serde(rename = "@dev")]
    pub dev: String,
}

/// Devices element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainDevices {
    /// Emulator binary path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
    /// Disks.
    #[serde(rename = "disk", default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DomainDisk>,
    /// Network interfaces.
    #[serde(rename = "interface", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<DomainInterface>,
    /// Host-guest channels.
    #[serde(rename = "channel", default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<DomainChannel>,
    /// Graphics consoles.
    #[serde(rename = "graphics", default, skip_serializing_if = "Vec::is_empty")]
    pub graphics: Vec<DomainGraphics>,
}

/// CPU element: `<cpu mode="host-passthrough" check="none"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCpu {
    /// CPU mode.
    #[serde(rename = "@mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Compatibility check level.
    #[serde(rename = "@check", default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
}

/// Name of the qemu guest agent channel.
pub const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";

/// Channel device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainChannel {
    /// Channel type, e.g. "unix".
    #[serde(rename = "@type")]
    pub kind: String,
    /// Host side of the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DomainChannelSource>,
    /// Guest side of the channel.
    pub target: DomainChannelTarget,
    /// Device alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<DomainAlias>,
}

impl DomainChannel {
    /// Creates a unix channel for the qemu guest agent.
    #[must_use]
    pub fn guest_agent() -> Self {
        Self {
            kind: "unix".to_string(),
            source: None,
            target: DomainChannelTarget {
                kind: "virtio".to_string(),
                name: Some(GUEST_AGENT_CHANNEL.to_string()),
                state: None,
            },
            alias: None,
        }
    }

    /// Returns true for the qemu guest agent channel.
    #[must_use]
    pub fn is_guest_agent(&self) -> bool {
        self.target.name.as_deref() == Some(GUEST_AGENT_CHANNEL)
    }
}

/// Channel source: `<source mode="bind" path="/run/..."/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainChannelSource {
    /// Socket mode.
    #[serde(rename = "@mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Socket path.
    #[serde(rename = "@path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Channel target: `<target type="virtio" name="org.qemu.guest_agent.0"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainChannelTarget {
    /// Target type.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Port name.
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Connection state reported by the service.
    #[serde(rename = "@state", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Device alias: `<alias name="ua-net0"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAlias {
    /// Alias name.
    #[serde(rename = "@name")]
    pub name: String,
}

impl DomainAlias {
    /// Creates an alias.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Disk device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDisk {
    /// Disk source type, e.g. "volume" or "file".
    #[serde(rename = "@type")]
    pub kind: String,
    /// Device kind, e.g. "disk" or "cdrom".
    #[serde(rename = "@device", default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DomainDiskDriver>,
    /// Source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DomainDiskSource>,
    /// Guest-side target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DomainDiskTarget>,
    /// Alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<DomainAlias>,
}

impl DomainDisk {
    /// Creates a disk backed by a pool volume.
    #[must_use]
    pub fn volume(pool: impl Into<String>, volume: impl Into<String>, target_dev: impl Into<String>) -> Self {
        Self {
            kind: "volume".to_string(),
            device: Some("disk".to_string()),
            driver: None,
            source: Some(DomainDiskSource {
                pool: Some(pool.into()),
                volume: Some(volume.into()),
                file: None,
            }),
            target: Some(DomainDiskTarget {
                dev: target_dev.into(),
                bus: None,
            }),
            alias: None,
        }
    }

    /// Sets the driver format type, e.g. "qcow2".
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.driver = Some(DomainDiskDriver {
            name: Some("qemu".to_string()),
            format: Some(format.into()),
        });
        self
    }

    /// Sets the target bus.
    #[must_use]
    pub fn with_bus(mut self, bus: impl Into<String>) -> Self {
        if let Some(target) = self.target.as_mut() {
            target.bus = Some(bus.into());
        }
        self
    }

    /// Sets the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(DomainAlias::new(alias));
        self
    }
}

/// Disk driver: `<driver name="qemu" type="qcow2"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDiskDriver {
    /// Driver name.
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Image format.
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Disk source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDiskSource {
    /// Storage pool name.
    #[serde(rename = "@pool", default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Volume name within the pool.
    #[serde(rename = "@volume", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// Image path for file disks.
    #[serde(rename = "@file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Disk target: `<target dev="vda" bus="virtio"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDiskTarget {
    /// Guest device name.
    #[serde(rename = "@dev")]
    pub dev: String,
    /// Bus type.
    #[serde(rename = "@bus", default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

/// Network interface device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterface {
    /// Interface type, e.g. "network" or "bridge".
    #[serde(rename = "@type")]
    pub kind: String,
    /// MAC address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<DomainInterfaceMac>,
    /// Source network or bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DomainInterfaceSource>,
    /// Host-side device name, assigned by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DomainInterfaceTarget>,
    /// Device model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<DomainInterfaceModel>,
    /// Alias used to identify the interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<DomainAlias>,
}

impl DomainInterface {
    /// Creates an interface attached to a libvirt network.
    #[must_use]
    pub fn network(network: impl Into<String>) -> Self {
        Self {
            kind: "network".to_string(),
            mac: None,
            source: Some(DomainInterfaceSource {
                network: Some(network.into()),
                bridge: None,
                dev: None,
            }),
            target: None,
            model: None,
            alias: None,
        }
    }

    /// Creates an interface attached to a host bridge.
    #[must_use]
    pub fn bridge(bridge: impl Into<String>) -> Self {
        Self {
            kind: "bridge".to_string(),
            mac: None,
            source: Some(DomainInterfaceSource {
                network: None,
                bridge: Some(bridge.into()),
                dev: None,
            }),
            target: None,
            model: None,
            alias: None,
        }
    }

    /// Sets the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(DomainAlias::new(alias));
        self
    }

    /// Sets the MAC address.
    #[must_use]
    pub fn with_mac(mut self, address: impl Into<String>) -> Self {
        self.mac = Some(DomainInterfaceMac {
            address: address.into(),
        });
        self
    }

    /// Sets the device model, e.g. "virtio".
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(DomainInterfaceModel { kind: model.into() });
        self
    }

    /// Returns the alias name, if any.
    #[must_use]
    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_ref().map(|a| a.name.as_str())
    }
}

/// MAC address: `<mac address="52:54:00:00:00:01"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterfaceMac {
    /// The address.
    #[serde(rename = "@address")]
    pub address: String,
}

/// Interface source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterfaceSource {
    /// libvirt network name.
    #[serde(rename = "@network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Host bridge name.
    #[serde(rename = "@bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Host device for direct interfaces.
    #[serde(rename = "@dev", default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

/// Interface target: `<target dev="vnet3"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterfaceTarget {
    /// Host tap device.
    #[serde(rename = "@dev")]
    pub dev: String,
}

/// Interface model: `<model type="virtio"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterfaceModel {
    /// Model name.
    #[serde(rename = "@type")]
    pub kind: String,
}

/// Graphics console: `<graphics type="vnc" port="-1"/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainGraphics {
    /// Console type.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Port, -1 for autoport.
    #[serde(rename = "@port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Listen address.
    #[serde(rename = "@listen", default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}
