//! TCP port probe. Connect-based liveness check for the fixed camera/NVR port list,
//! with every attempt going through the global port gate.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PortResult;
use super::gate::Gate;

/// Ports probed on every candidate, in probe order
pub const PROBE_PORTS: &[u16] = &[
    80,   // HTTP
    443,  // HTTPS
    554,  // RTSP
    8000, // Hikvision SDK / alt HTTP
    8080, // HTTP Alt
    8443, // HTTPS Alt
    1935, // RTMP
    3702, // WS-Discovery
    8554, // RTSP Alt
];

/// Plain HTTP ports, in title-fetch order
pub const HTTP_PORTS: &[u16] = &[80, 8000, 8080];

/// TLS ports, tried after the plain ones
pub const HTTPS_PORTS: &[u16] = &[443, 8443];

/// Map probe ports to service names for logs
pub fn port_to_service_name(port: u16) -> Option<&'static str> {
    match port {
        80 => Some("HTTP"),
        443 => Some("HTTPS"),
        554 => Some("RTSP"),
        8000 => Some("HTTP-Alt"),
        8080 => Some("HTTP-Alt"),
        8443 => Some("HTTPS-Alt"),
        1935 => Some("RTMP"),
        3702 => Some("WS-Discovery"),
        8554 => Some("RTSP-Alt"),
        _ => None,
    }
}

/// TCP connect probe
#[derive(Debug, Clone)]
pub struct PortScanner {
    timeout_ms: u64,
    ports: Vec<u16>,
}

impl PortScanner {
    pub fn new() -> Self {
        Self {
            timeout_ms: 1500,
            ports: PROBE_PORTS.to_vec(),
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Probe a single port; the gate is held only around the connect
    pub async fn probe_port(&self, ip: Ipv4Addr, port: u16, gate: &Gate) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(ip), port);
        let timeout_duration = Duration::from_millis(self.timeout_ms);

        gate.run(async {
            match timeout(timeout_duration, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => true,
                Ok(Err(e)) => {
                    debug!(ip = %ip, port, error = %e, "Port closed");
                    false
                }
                Err(_) => false,
            }
        })
        .await
    }

    /// Probe the port list on one host, one port at a time
    pub async fn probe_host(&self, ip: Ipv4Addr, gate: &Gate, cancel: &CancellationToken) -> PortResult {
        let mut open_ports = Vec::new();

        for &port in &self.ports {
            if cancel.is_cancelled() {
                break;
            }
            if self.probe_port(ip, port, gate).await {
                debug!(
                    ip = %ip,
                    port,
                    service = port_to_service_name(port).unwrap_or("unknown"),
                    "Port open"
                );
                open_ports.push(port);
            }
        }

        PortResult { ip, open_ports }
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_port_order() {
        assert_eq!(PROBE_PORTS, &[80, 443, 554, 8000, 8080, 8443, 1935, 3702, 8554]);
    }

    #[test]
    fn test_port_to_service_name() {
        assert_eq!(port_to_service_name(554), Some("RTSP"));
        assert_eq!(port_to_service_name(3702), Some("WS-Discovery"));
        assert_eq!(port_to_service_name(12345), None);
    }

    #[test]
    fn test_scanner_default() {
        let scanner = PortScanner::default();
        assert_eq!(scanner.timeout_ms, 1500);
        assert_eq!(scanner.ports, PROBE_PORTS.to_vec());
    }

    #[test]
    fn test_scanner_with_timeout() {
        let scanner = PortScanner::new().with_timeout(5000);
        assert_eq!(scanner.timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_probe_host_finds_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let scanner = PortScanner::new()
            .with_timeout(500)
            .with_ports(vec![closed, open]);
        let gate = Gate::new("port", 4);
        let result = scanner
            .probe_host(Ipv4Addr::LOCALHOST, &gate, &CancellationToken::new())
            .await;

        assert_eq!(result.open_ports, vec![open]);
        assert_eq!(gate.available(), 4);
    }

    #[tokio::test]
    async fn test_probe_host_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = PortScanner::new()
            .probe_host(Ipv4Addr::LOCALHOST, &Gate::new("port", 1), &token)
            .await;
        assert!(result.open_ports.is_empty());
    }
}
