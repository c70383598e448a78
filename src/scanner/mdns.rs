//! Bonjour/mDNS browser. Browses a fixed set of service types for a short window
//! and reports every resolved IPv4 service instance.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BonjourResult, DiscoveryOutcome};

/// Service types browsed during a sweep
pub const SERVICE_TYPES: &[&str] = &[
    "_rtsp._tcp.local.",
    "_onvif._tcp.local.",
    "_axis-video._tcp.local.",
    "_http._tcp.local.",
    "_https._tcp.local.",
    "_hap._tcp.local.",
    "_airplay._tcp.local.",
    "_googlecast._tcp.local.",
    "_workstation._tcp.local.",
    "_device-info._tcp.local.",
    "_smb._tcp.local.",
    "_ipp._tcp.local.",
];

/// Instance label of a full service name (`Front Door._rtsp._tcp.local.` -> `Front Door`)
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|n| n.trim_end_matches('.'))
        .filter(|n| !n.is_empty())
        .unwrap_or(fullname)
        .to_string()
}

fn clean_hostname(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// mDNS service browser
pub struct BonjourBrowser {
    timeout_secs: u64,
}

impl BonjourBrowser {
    pub fn new() -> Self {
        Self { timeout_secs: 3 }
    }

    /// Browse for the configured window. Results are sent on `tx` as services
    /// resolve; the daemon runs on a blocking thread.
    pub async fn discover(
        &self,
        tx: mpsc::Sender<BonjourResult>,
        cancel: CancellationToken,
    ) -> DiscoveryOutcome<BonjourResult> {
        let window = Duration::from_secs(self.timeout_secs);

        let task = tokio::task::spawn_blocking(move || {
            let mdns = match ServiceDaemon::new() {
                Ok(daemon) => daemon,
                Err(e) => {
                    warn!(error = %e, "Failed to create mDNS daemon");
                    return DiscoveryOutcome::unavailable();
                }
            };

            let receivers: Vec<_> = SERVICE_TYPES
                .iter()
                .filter_map(|ty| mdns.browse(ty).ok())
                .collect();

            let mut results = Vec::new();
            let start = Instant::now();
            while start.elapsed() < window && !cancel.is_cancelled() {
                for receiver in &receivers {
                    while let Ok(event) = receiver.try_recv() {
                        let ServiceEvent::ServiceResolved(info) = event else {
                            continue;
                        };
                        let service_type = info.ty_domain.clone();
                        let txt: BTreeMap<String, String> = info
                            .get_properties()
                            .iter()
                            .map(|p| (p.key().to_string(), p.val_str().to_string()))
                            .collect();

                        for addr in info.get_addresses() {
                            let IpAddr::V4(ip) = addr.to_ip_addr() else {
                                continue;
                            };
                            let result = BonjourResult {
                                ip,
                                name: instance_name(info.get_fullname(), &service_type),
                                service_type: service_type.clone(),
                                port: info.get_port(),
                                txt: txt.clone(),
                                hostname: clean_hostname(info.get_hostname()),
                            };
                            debug!(ip = %ip, service = %result.service_type, "mDNS service resolved");
                            let _ = tx.blocking_send(result.clone());
                            results.push(result);
                        }
                    }
                }
                std::thread::sleep(Duration::from_millis(50));
            }

            for ty in SERVICE_TYPES {
                let _ = mdns.stop_browse(ty);
            }
            let _ = mdns.shutdown();

            DiscoveryOutcome {
                results,
                multicast_available: true,
            }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "mDNS browse task failed");
                DiscoveryOutcome::unavailable()
            }
        }
    }
}

impl Default for BonjourBrowser {
    fn default() -> Self {
        Self::new()
    }
}
