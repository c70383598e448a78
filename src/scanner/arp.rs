//! ARP table bridge. Reads the OS neighbour cache through `arp -a -n` and resolves
//! vendors through the OUI lookup. A warmup pass pokes every candidate first so
//! the cache is populated before it is read.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ArpEntry;
use super::gate::Gate;
use crate::error::ScanError;
use crate::oui::{VendorLookup, normalize_mac};

/// The OS ARP table is not readable on mobile targets
pub fn arp_table_supported() -> bool {
    !cfg!(any(target_os = "ios", target_os = "android"))
}

fn is_unicast(mac: &str) -> bool {
    mac != "ff:ff:ff:ff:ff:ff"
        && mac != "00:00:00:00:00:00"
        && u8::from_str_radix(&mac[..2], 16).is_ok_and(|first| first & 0x01 == 0)
}

/// Parse `? (ip) at mac ...` lines as printed by BSD and net-tools `arp`.
/// Incomplete, broadcast and multicast entries are skipped.
pub fn parse_arp_table(output: &str) -> Vec<(Ipv4Addr, String)> {
    let mut entries: Vec<(Ipv4Addr, String)> = Vec::new();

    for line in output.lines() {
        let Some(open) = line.find('(') else {
            continue;
        };
        let Some(close) = line[open..].find(')').map(|i| open + i) else {
            continue;
        };
        let Ok(ip) = line[open + 1..close].trim().parse::<Ipv4Addr>() else {
            continue;
        };
        let rest = &line[close + 1..];
        let Some(at) = rest.find(" at ") else {
            continue;
        };
        let Some(raw_mac) = rest[at + 4..].split_whitespace().next() else {
            continue;
        };
        if raw_mac.contains("incomplete") {
            continue;
        }
        let Some(mac) = normalize_mac(raw_mac).filter(|m| is_unicast(m)) else {
            continue;
        };
        if !entries.iter().any(|(known, _)| *known == ip) {
            entries.push((ip, mac));
        }
    }
    entries
}

/// ARP cache reader and warmup
pub struct ArpScanner {
    timeout_ms: u64,
    warmup_port: u16,
}

impl ArpScanner {
    pub fn new() -> Self {
        Self {
            timeout_ms: 200,
            warmup_port: 80,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Fire-and-forget TCP connects so the OS resolves every candidate's MAC
    pub async fn warmup(&self, ips: &[Ipv4Addr], gate: &Gate, cancel: &CancellationToken) {
        let timeout_duration = Duration::from_millis(self.timeout_ms);
        let port = self.warmup_port;

        let pokes = ips.iter().map(|&ip| async move {
            if cancel.is_cancelled() {
                return;
            }
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            gate.run(async {
                let _ = timeout(timeout_duration, TcpStream::connect(addr)).await;
            })
            .await;
        });
        join_all(pokes).await;
        debug!(candidates = ips.len(), "ARP warmup finished");
    }

    /// Dump and parse the OS ARP table, resolving vendors with `lookup`
    pub async fn read_table(&self, lookup: &dyn VendorLookup) -> Result<Vec<ArpEntry>, ScanError> {
        let output = Command::new("arp").args(["-a", "-n"]).output().await?;
        if !output.status.success() && output.stdout.is_empty() {
            return Err(ScanError::Io(std::io::Error::other(format!(
                "arp exited with {}",
                output.status
            ))));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let entries: Vec<ArpEntry> = parse_arp_table(&text)
            .into_iter()
            .map(|(ip, mac)| ArpEntry {
                ip,
                vendor: lookup.vendor_for_mac(&mac),
                mac,
            })
            .collect();
        debug!(entries = entries.len(), "Read ARP table");
        Ok(entries)
    }
}

impl Default for ArpScanner {
    fn default() -> Self {
        Self::new()
    }
}
