//! Scan state: the host and device maps and the one merge path that mutates them.
//! Probes and discovery clients only produce `Evidence`; `Inventory::apply`
//! folds it in and recomputes the confidence of the touched IP.

pub mod confidence;
mod patterns;
mod types;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::config::ScanMode;
use crate::error::OnvifError;
use crate::scanner::{ArpEntry, BonjourResult, HttpFingerprint, OnvifDiscoveryResult, SsdpResult};

pub use types::{
    BonjourService, ConfidenceReason, ConfidenceScore, ConfidenceTier, Credentials, DeviceRecord,
    EvidenceSource, HostRecord, HttpEvidence, Provenance, RtspProbeResult, ScanStatus,
    ScanSummary, SsdpEvidence,
};

/// A single observation about one IP
#[derive(Debug, Clone)]
pub enum Evidence {
    OpenPorts { ip: Ipv4Addr, ports: Vec<u16> },
    HttpTitle { ip: Ipv4Addr, title: String },
    Http { ip: Ipv4Addr, fingerprint: HttpFingerprint },
    Ssdp(SsdpResult),
    Bonjour(BonjourResult),
    Onvif(OnvifDiscoveryResult),
    Arp(ArpEntry),
    Hostname { ip: Ipv4Addr, hostname: String },
    OnvifStreamUri { ip: Ipv4Addr, result: Result<String, OnvifError> },
    RtspResults {
        ip: Ipv4Addr,
        results: Vec<RtspProbeResult>,
        manual: bool,
    },
}

impl Evidence {
    pub fn ip(&self) -> Ipv4Addr {
        match self {
            Evidence::OpenPorts { ip, .. }
            | Evidence::HttpTitle { ip, .. }
            | Evidence::Http { ip, .. }
            | Evidence::Hostname { ip, .. }
            | Evidence::OnvifStreamUri { ip, .. }
            | Evidence::RtspResults { ip, .. } => *ip,
            Evidence::Ssdp(r) => r.ip,
            Evidence::Bonjour(r) => r.ip,
            Evidence::Onvif(r) => r.ip,
            Evidence::Arp(e) => e.ip,
        }
    }

    fn source(&self) -> EvidenceSource {
        match self {
            Evidence::OpenPorts { .. } => EvidenceSource::PortProbe,
            Evidence::HttpTitle { .. } | Evidence::Http { .. } => EvidenceSource::Http,
            Evidence::Ssdp(_) => EvidenceSource::Ssdp,
            Evidence::Bonjour(_) => EvidenceSource::Bonjour,
            Evidence::Onvif(_) | Evidence::OnvifStreamUri { .. } => EvidenceSource::Onvif,
            Evidence::Arp(_) => EvidenceSource::Arp,
            Evidence::Hostname { .. } => EvidenceSource::Hostname,
            Evidence::RtspResults { manual: true, .. } => EvidenceSource::Manual,
            Evidence::RtspResults { .. } => EvidenceSource::Rtsp,
        }
    }
}

/// Work the orchestrator should start because of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    FetchOnvifRtsp(Ipv4Addr),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub host_changed: bool,
    pub device_changed: bool,
    pub follow_up: Option<FollowUp>,
}

fn fill<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
    if slot.is_none()
        && let Some(v) = value
    {
        *slot = Some(v.clone());
    }
}

/// Best working URI and a one-line description of a probe run
pub fn summarize_rtsp(results: &[RtspProbeResult]) -> (Option<String>, String) {
    let successes = results.iter().filter(|r| r.success).count();
    let best = results.iter().find(|r| r.success).map(|r| r.uri.clone());

    let summary = match &best {
        Some(uri) => {
            let codecs: BTreeSet<&str> = results
                .iter()
                .filter(|r| r.success)
                .flat_map(|r| r.codec_hints.iter().map(String::as_str))
                .collect();
            let codecs = if codecs.is_empty() {
                String::from("unknown codec")
            } else {
                codecs.into_iter().collect::<Vec<_>>().join("/")
            };
            format!(
                "{}/{} candidates streamed video ({}); best {}",
                successes,
                results.len(),
                codecs,
                uri
            )
        }
        None if results.is_empty() => String::from("no RTSP candidates probed"),
        None => {
            let needs_auth = results.iter().any(|r| r.status_code == Some(401));
            let last_error = results
                .iter()
                .rev()
                .find_map(|r| r.error.as_deref())
                .unwrap_or("no response");
            if needs_auth {
                format!(
                    "no working stream in {} attempts; camera requires credentials",
                    results.len()
                )
            } else {
                format!(
                    "no working stream in {} attempts; last error: {}",
                    results.len(),
                    last_error
                )
            }
        }
    };

    (best, summary)
}

/// The host and device maps, keyed by IP
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: BTreeMap<Ipv4Addr, HostRecord>,
    devices: BTreeMap<Ipv4Addr, DeviceRecord>,
    interesting_ports: BTreeSet<u16>,
    scan_mode: ScanMode,
}

impl Inventory {
    pub fn new(interesting_ports: &[u16], scan_mode: ScanMode) -> Self {
        Self {
            hosts: BTreeMap::new(),
            devices: BTreeMap::new(),
            interesting_ports: interesting_ports.iter().copied().collect(),
            scan_mode,
        }
    }

    pub fn set_scan_mode(&mut self, scan_mode: ScanMode) {
        self.scan_mode = scan_mode;
    }

    pub fn host(&self, ip: Ipv4Addr) -> Option<&HostRecord> {
        self.hosts.get(&ip)
    }

    pub fn device(&self, ip: Ipv4Addr) -> Option<&DeviceRecord> {
        self.devices.get(&ip)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Alive hosts whose address is in `scope`
    pub fn alive_count_in(&self, scope: &HashSet<Ipv4Addr>) -> usize {
        self.hosts
            .values()
            .filter(|h| h.alive && scope.contains(&h.ip))
            .count()
    }

    pub fn device_count_in(&self, scope: &HashSet<Ipv4Addr>) -> usize {
        self.devices.keys().filter(|ip| scope.contains(ip)).count()
    }

    fn host_entry(
        &mut self,
        ip: Ipv4Addr,
        source: EvidenceSource,
        at: DateTime<Utc>,
    ) -> &mut HostRecord {
        let scan_mode = self.scan_mode;
        let host = self
            .hosts
            .entry(ip)
            .or_insert_with(|| HostRecord::new(ip, source, scan_mode, at));
        host.provenance.observe(source, at);
        host
    }

    fn device_entry(&mut self, ip: Ipv4Addr) -> &mut DeviceRecord {
        self.devices
            .entry(ip)
            .or_insert_with(|| DeviceRecord::new(ip))
    }

    /// Merge one observation. Fields only fill in; the vendor is the exception
    /// and follows the latest ARP answer.
    pub fn apply(&mut self, evidence: Evidence, at: DateTime<Utc>) -> MergeOutcome {
        let ip = evidence.ip();
        let source = evidence.source();
        let mut outcome = MergeOutcome::default();

        match evidence {
            Evidence::OpenPorts { ports, .. } => {
                if ports.is_empty() {
                    return outcome;
                }
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                host.open_ports.extend(ports.iter().copied());
                if ports.iter().any(|p| self.interesting_ports.contains(p)) {
                    self.device_entry(ip);
                    outcome.device_changed = true;
                }
            }
            Evidence::HttpTitle { title, .. } => {
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                let http = host.http.get_or_insert_with(HttpEvidence::default);
                fill(&mut http.title, Some(&title));
            }
            Evidence::Http { fingerprint, .. } => {
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                let http = host.http.get_or_insert_with(HttpEvidence::default);
                fill(&mut http.status, fingerprint.status.as_ref());
                fill(&mut http.server, fingerprint.server.as_ref());
                fill(&mut http.auth_challenge, fingerprint.auth_challenge.as_ref());
                fill(&mut http.title, fingerprint.title.as_ref());
            }
            Evidence::Ssdp(result) => {
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                let ssdp = host.ssdp.get_or_insert_with(SsdpEvidence::default);
                fill(&mut ssdp.server, result.server.as_ref());
                fill(&mut ssdp.location, Some(&result.location));
                fill(&mut ssdp.search_target, result.search_target.as_ref());
                fill(&mut ssdp.usn, result.usn.as_ref());
                fill(&mut ssdp.friendly_name, result.friendly_name.as_ref());
                fill(&mut ssdp.model_name, result.model_name.as_ref());
            }
            Evidence::Bonjour(result) => {
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                fill(&mut host.hostname, result.hostname.as_ref());
                let known = host
                    .bonjour_services
                    .iter_mut()
                    .find(|s| s.name == result.name && s.service_type == result.service_type);
                match known {
                    Some(service) => {
                        for (k, v) in result.txt {
                            service.txt.entry(k).or_insert(v);
                        }
                    }
                    None => {
                        host.bonjour_services.push(BonjourService {
                            name: result.name,
                            service_type: result.service_type,
                            port: result.port,
                            txt: result.txt,
                        });
                        host.bonjour_services.sort_by(|a, b| {
                            (&a.service_type, &a.name).cmp(&(&b.service_type, &b.name))
                        });
                    }
                }
            }
            Evidence::Onvif(result) => {
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                let device = self.device_entry(ip);
                device.onvif_discovered = true;
                device.onvif_xaddrs.extend(result.xaddrs);
                device.onvif_device_types.extend(result.types);
                device.onvif_scopes.extend(result.scopes);
                if !device.onvif_xaddrs.is_empty() && device.onvif_rtsp_uri.is_none() {
                    outcome.follow_up = Some(FollowUp::FetchOnvifRtsp(ip));
                }
                outcome.device_changed = true;
            }
            Evidence::Arp(entry) => {
                let host = self.host_entry(ip, source, at);
                host.alive = true;
                host.mac = Some(entry.mac);
                host.vendor = entry.vendor;
            }
            Evidence::Hostname { hostname, .. } => {
                let Some(host) = self.hosts.get_mut(&ip) else {
                    return outcome;
                };
                host.provenance.observe(source, at);
                fill(&mut host.hostname, Some(&hostname));
            }
            Evidence::OnvifStreamUri { result, .. } => {
                let Some(device) = self.devices.get_mut(&ip) else {
                    return outcome;
                };
                match result {
                    Ok(uri) => {
                        device.onvif_rtsp_uri = Some(uri);
                        device.onvif_requires_auth = false;
                        device.onvif_last_error = None;
                    }
                    Err(e) if e.is_unauthorized() => {
                        device.onvif_requires_auth = true;
                        device.onvif_last_error = Some(String::from("auth required"));
                    }
                    Err(e) => device.onvif_last_error = Some(e.to_string()),
                }
                outcome.device_changed = true;
            }
            Evidence::RtspResults { results, .. } => {
                self.host_entry(ip, source, at);
                let device = self.device_entry(ip);
                let (best, summary) = summarize_rtsp(&results);
                device.rtsp_probe_results = results;
                device.best_rtsp_uri = best;
                device.rtsp_summary = Some(summary);
                device.rtsp_in_progress = false;
                outcome.device_changed = true;
            }
        }

        outcome.host_changed = true;
        self.recompute(ip);
        outcome
    }

    /// Flag a device as being probed. Returns false for unknown devices.
    pub fn mark_rtsp_in_progress(&mut self, ip: Ipv4Addr, in_progress: bool) -> bool {
        match self.devices.get_mut(&ip) {
            Some(device) => {
                device.rtsp_in_progress = in_progress;
                true
            }
            None => false,
        }
    }

    /// Store or clear (both empty) credentials. Returns false for unknown devices.
    pub fn set_credentials(&mut self, ip: Ipv4Addr, username: &str, password: &str) -> bool {
        let Some(device) = self.devices.get_mut(&ip) else {
            return false;
        };
        device.credentials = if username.is_empty() && password.is_empty() {
            None
        } else {
            Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
        };
        true
    }

    /// Rebuild both confidence scores of one IP from scratch and copy the
    /// identity fields onto the device record.
    fn recompute(&mut self, ip: Ipv4Addr) {
        let Some(host) = self.hosts.get_mut(&ip) else {
            return;
        };
        let device = self.devices.get_mut(&ip);

        host.vendor_confidence = confidence::vendor_confidence(host);
        let score = confidence::host_confidence(host, device.as_deref());
        host.host_confidence = score.clone();

        if let Some(device) = device {
            device.hostname = host.hostname.clone();
            device.mac = host.mac.clone();
            device.vendor = host.vendor.clone();
            device.open_ports = host.open_ports.clone();
            device.confidence = score;
        }
    }
}
