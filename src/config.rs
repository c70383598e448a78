//! Engine configuration. Everything here is plain serde data so the binary can
//! load it from a JSON file and layer command line flags on top.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::scanner::port::PROBE_PORTS;

/// One sweep, or sweeps repeated until stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    OneShot,
    Continuous,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanMode::OneShot => write!(f, "one_shot"),
            ScanMode::Continuous => write!(f, "continuous"),
        }
    }
}

/// Inclusive explicit address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

/// What the operator asked to scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeRequest {
    pub cidr: String,
    pub ip_range: Option<IpRange>,
    pub only_local_subnet: bool,
}

impl Default for ScopeRequest {
    fn default() -> Self {
        Self {
            cidr: String::new(),
            ip_range: None,
            only_local_subnet: true,
        }
    }
}

/// Ports and timeouts used by the probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub ports: Vec<u16>,
    pub rtsp_port: u16,
    pub connect_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ports: PROBE_PORTS.to_vec(),
            rtsp_port: 554,
            connect_timeout_ms: 1500,
            warmup_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Blocks RTSP media probing and ONVIF RTSP-URI fetches
    pub safe_mode: bool,
    pub mode: ScanMode,
    pub scope: ScopeRequest,
    pub enable_onvif_discovery: bool,
    pub enable_service_discovery: bool,
    pub enable_arp_warmup: bool,
    /// Pause between continuous sweeps
    pub scan_interval_secs: Option<u64>,
    pub probe: ProbeSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safe_mode: true,
            mode: ScanMode::OneShot,
            scope: ScopeRequest::default(),
            enable_onvif_discovery: true,
            enable_service_discovery: true,
            enable_arp_warmup: true,
            scan_interval_secs: None,
            probe: ProbeSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ScanError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ScanError> {
        serde_json::from_str(raw).map_err(|e| ScanError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert!(config.safe_mode);
        assert_eq!(config.mode, ScanMode::OneShot);
        assert!(config.scope.only_local_subnet);
        assert!(config.enable_onvif_discovery);
        assert!(config.enable_service_discovery);
        assert!(config.enable_arp_warmup);
        assert_eq!(config.probe.ports, vec![80, 443, 554, 8000, 8080, 8443, 1935, 3702, 8554]);
        assert_eq!(config.probe.rtsp_port, 554);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{"mode": "continuous", "scope": {"cidr": "10.0.0.0/24"}, "safe_mode": false}"#,
        )
        .unwrap();
        assert_eq!(config.mode, ScanMode::Continuous);
        assert_eq!(config.scope.cidr, "10.0.0.0/24");
        assert!(config.scope.only_local_subnet);
        assert!(!config.safe_mode);
        assert_eq!(config.probe.connect_timeout_ms, 1500);
    }

    #[test]
    fn test_ip_range_json() {
        let config = EngineConfig::from_json(
            r#"{"scope": {"ip_range": {"start": "192.168.1.10", "end": "192.168.1.20"}}}"#,
        )
        .unwrap();
        let range = config.scope.ip_range.unwrap();
        assert_eq!(range.start, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(range.end, Ipv4Addr::new(192, 168, 1, 20));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ScanError::Config(_))
        ));
    }

    #[test]
    fn test_scan_mode_display() {
        assert_eq!(format!("{}", ScanMode::OneShot), "one_shot");
        assert_eq!(format!("{}", ScanMode::Continuous), "continuous");
    }
}
