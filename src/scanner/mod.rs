pub mod arp;
pub mod gate;
pub mod hostname;
pub mod http;
pub mod manager;
pub mod mdns;
pub mod onvif;
pub mod port;
pub mod rtsp;
pub mod scope;
pub mod ssdp;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Discovery protocols and OS facilities the engine may find unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Ssdp,
    Bonjour,
    Onvif,
    Arp,
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanType::Ssdp => write!(f, "ssdp"),
            ScanType::Bonjour => write!(f, "bonjour"),
            ScanType::Onvif => write!(f, "onvif"),
            ScanType::Arp => write!(f, "arp"),
        }
    }
}

/// Open ports found on one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub ip: Ipv4Addr,
    pub open_ports: Vec<u16>,
}

/// SSDP/UPnP discovery result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpResult {
    pub ip: Ipv4Addr,
    pub location: String,
    pub server: Option<String>,
    pub search_target: Option<String>,
    pub usn: Option<String>,
    pub friendly_name: Option<String>,
    pub model_name: Option<String>,
}

/// A resolved Bonjour/mDNS service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BonjourResult {
    pub ip: Ipv4Addr,
    pub name: String,
    pub service_type: String,
    pub port: u16,
    pub txt: BTreeMap<String, String>,
    pub hostname: Option<String>,
}

/// One WS-Discovery ProbeMatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnvifDiscoveryResult {
    pub ip: Ipv4Addr,
    pub xaddrs: Vec<String>,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
}

/// One OS ARP table entry with its resolved vendor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub vendor: Option<String>,
}

/// What one HTTP(S) GET revealed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpFingerprint {
    pub status: Option<u16>,
    pub server: Option<String>,
    pub auth_challenge: Option<String>,
    pub title: Option<String>,
}

/// Full result list of a multicast discovery window
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome<T> {
    pub results: Vec<T>,
    /// False when no multicast socket could be opened on this platform
    pub multicast_available: bool,
}

impl<T> DiscoveryOutcome<T> {
    pub fn unavailable() -> Self {
        Self {
            results: Vec::new(),
            multicast_available: false,
        }
    }
}

/// Scan capabilities of the current platform
#[derive(Debug, Clone, Serialize)]
pub struct ScanCapabilities {
    pub can_arp: bool,
    pub can_multicast: bool,
}

/// Check what this platform lets the engine do
pub fn check_scan_capabilities() -> ScanCapabilities {
    ScanCapabilities {
        can_arp: arp::arp_table_supported(),
        can_multicast: check_multicast_socket(),
    }
}

fn check_multicast_socket() -> bool {
    use socket2::{Domain, Protocol, Socket, Type};
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .and_then(|s| s.set_multicast_ttl_v4(2))
        .is_ok()
}

/// Human readable note recorded once per session when a scanner is degraded
pub fn capability_note(scan_type: ScanType) -> String {
    match scan_type {
        ScanType::Ssdp => "SSDP unavailable: multicast socket could not be opened".to_string(),
        ScanType::Bonjour => "Bonjour unavailable: mDNS daemon could not start".to_string(),
        ScanType::Onvif => {
            "ONVIF discovery unavailable: multicast socket could not be opened".to_string()
        }
        ScanType::Arp => "ARP table unavailable on this platform".to_string(),
    }
}
