//! LAN discovery and device fingerprinting.
//!
//! `ScanManager` sweeps an IPv4 scope with TCP connect probes while SSDP, mDNS and
//! ONVIF WS-Discovery run alongside, then merges everything into per-IP host and
//! device records with confidence scores.

pub mod config;
pub mod error;
pub mod inventory;
pub mod oui;
pub mod scanner;

pub use config::{EngineConfig, IpRange, ProbeSettings, ScanMode, ScopeRequest};
pub use error::{OnvifError, ScanError};
pub use inventory::{
    ConfidenceScore, ConfidenceTier, Credentials, DeviceRecord, HostRecord, RtspProbeResult,
    ScanStatus, ScanSummary,
};
pub use oui::{NoVendorLookup, OuiTable, VendorLookup};
pub use scanner::manager::{OnvifFetchReason, ScanEvent, ScanManager, ScanSnapshot};
