//! Error types shared by the scan engine.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Failures surfaced to callers of the public scan operations.
///
/// Individual probe failures never become a `ScanError`; they are recorded on
/// the affected host or device record instead.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no active IPv4 interface")]
    NoActiveInterface,

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("scope {0} contains no scannable hosts")]
    EmptyScope(String),

    #[error("scan already in progress")]
    AlreadyRunning,

    #[error("unknown device {0}")]
    UnknownDevice(Ipv4Addr),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the ONVIF SOAP client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OnvifError {
    #[error("device advertises no ONVIF XAddrs")]
    NoXAddrs,

    #[error("auth required")]
    Unauthorized,

    #[error("http error: {0}")]
    Http(String),

    #[error("SOAP fault: {0}")]
    Fault(String),

    #[error("response missing {0}")]
    MissingField(&'static str),
}

impl OnvifError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, OnvifError::Unauthorized)
    }
}
