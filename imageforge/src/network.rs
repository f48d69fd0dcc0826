//! Guest address discovery settings.

use crate::descriptor::DomainInterface;
use crate::errors::ProvisionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the guest's network address is discovered.
///
/// Values match libvirt's `VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAddressSource {
    /// DHCP lease table of the libvirt network.
    #[default]
    Lease,
    /// Query the guest agent.
    Agent,
    /// Host ARP table.
    Arp,
}

impl NetworkAddressSource {
    /// All recognized configuration spellings.
    pub const NAMES: [&'static str; 3] = ["lease", "agent", "arp"];

    /// Returns the libvirt flag value.
    #[must_use]
    pub fn as_libvirt_flag(self) -> u32 {
        match self {
            Self::Lease => 0,
            Self::Agent => 1,
            Self::Arp => 2,
        }
    }
}

impl fmt::Display for NetworkAddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lease => write!(f, "lease"),
            Self::Agent => write!(f, "agent"),
            Self::Arp => write!(f, "arp"),
        }
    }
}

/// Maps a configuration string to an address source.
///
/// Matching is exact; anything outside [`NetworkAddressSource::NAMES`] is an
/// `UnrecognizedConfiguration` error.
pub fn map_network_address_source(value: &str) -> Result<NetworkAddressSource, ProvisionError> {
    match value {
        "lease" => Ok(NetworkAddressSource::Lease),
        "agent" => Ok(NetworkAddressSource::Agent),
        "arp" => Ok(NetworkAddressSource::Arp),
        other => Err(ProvisionError::unrecognized("network_address_source", other)),
    }
}

/// The communicator interface and the strategy for finding its address.
///
/// `interface` is `None` when no interface alias matched the configured name;
/// consumers must handle that case.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommunicatorAddressHelper {
    /// The matched interface, copied out of the domain descriptor.
    pub interface: Option<DomainInterface>,
    /// Address discovery strategy.
    pub source: NetworkAddressSource,
}

impl CommunicatorAddressHelper {
    /// Creates a helper.
    #[must_use]
    pub fn new(interface: Option<DomainInterface>, source: NetworkAddressSource) -> Self {
        Self { interface, source }
    }

    /// Returns the MAC address of the matched interface, if known.
    #[must_use]
    pub fn mac_address(&self) -> Option<&str> {
        self.interface
            .as_ref()
            .and_then(|i| i.mac.as_ref())
            .map(|m| m.address.as_str())
    }

    /// Returns the alias of the matched interface, if any.
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        self.interface.as_ref().and_then(DomainInterface::alias_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_known_sources() {
        assert_eq!(map_network_address_source("lease").unwrap(), NetworkAddressSource::Lease);
        assert_eq!(map_network_address_source("agent").unwrap(), NetworkAddressSource::Agent);
        assert_eq!(map_network_address_source("arp").unwrap(), NetworkAddressSource::Arp);
    }

    #[test]
    fn test_map_unknown_source() {
        let err = map_network_address_source("dhcp").unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::UnrecognizedConfiguration { ref value, .. } if value == "dhcp"
        ));
    }

    #[test]
    fn test_map_is_case_sensitive() {
        assert!(map_network_address_source("Agent").is_err());
        assert!(map_network_address_source("").is_err());
    }

    #[test]
    fn test_libvirt_flags() {
        assert_eq!(NetworkAddressSource::default().as_libvirt_flag(), 0);
        assert_eq!(NetworkAddressSource::Agent.as_libvirt_flag(), 1);
        assert_eq!(NetworkAddressSource::Arp.as_libvirt_flag(), 2);
    }

    #[test]
    fn test_display_round_trips_through_mapper() {
        for name in NetworkAddressSource::NAMES {
            let source = map_network_address_source(name).unwrap();
            assert_eq!(source.to_string(), name);
        }
    }

    #[test]
    fn test_helper_accessors() {
        let helper = CommunicatorAddressHelper::new(
            Some(
                DomainInterface::network("default")
                    .with_alias("ua-net0")
                    .with_mac("52:54:00:00:00:01"),
            ),
            NetworkAddressSource::Agent,
        );

        assert_eq!(helper.mac_address(), Some("52:54:00:00:00:01"));
        assert_eq!(helper.alias(), Some("ua-net0"));

        let empty = CommunicatorAddressHelper::default();
        assert!(empty.mac_address().is_none());
        assert_eq!(empty.source, NetworkAddressSource::Lease);
    }
}
