use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScanMode;

/// Which kind of observation contributed to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    PortProbe,
    Http,
    Ssdp,
    Bonjour,
    Onvif,
    Arp,
    Hostname,
    Rtsp,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub sources: BTreeSet<EvidenceSource>,
    pub scan_mode: ScanMode,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Provenance {
    pub(crate) fn new(source: EvidenceSource, scan_mode: ScanMode, at: DateTime<Utc>) -> Self {
        Self {
            sources: BTreeSet::from([source]),
            scan_mode,
            first_seen: at,
            last_seen: at,
        }
    }

    pub(crate) fn observe(&mut self, source: EvidenceSource, at: DateTime<Utc>) {
        self.sources.insert(source);
        self.first_seen = self.first_seen.min(at);
        self.last_seen = self.last_seen.max(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn for_score(score: u8) -> Self {
        match score {
            0..=39 => ConfidenceTier::Low,
            40..=69 => ConfidenceTier::Medium,
            _ => ConfidenceTier::High,
        }
    }
}

/// One justification for a confidence score
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceReason {
    pub reason: String,
    pub delta: i32,
}

/// A 0-100 score with the signed reasons that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub score: u8,
    pub tier: ConfidenceTier,
    pub reasons: Vec<ConfidenceReason>,
}

impl ConfidenceScore {
    /// Sum the reasons and clamp into 0..=100. Reasons are ranked by weight,
    /// heaviest first; equal weights keep their order.
    pub fn from_reasons(mut reasons: Vec<ConfidenceReason>) -> Self {
        reasons.sort_by_key(|r| std::cmp::Reverse(r.delta.abs()));
        let total: i32 = reasons.iter().map(|r| r.delta).sum();
        let score = total.clamp(0, 100) as u8;
        Self {
            score,
            tier: ConfidenceTier::for_score(score),
            reasons,
        }
    }
}

impl Default for ConfidenceScore {
    fn default() -> Self {
        Self::from_reasons(Vec::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SsdpEvidence {
    pub server: Option<String>,
    pub location: Option<String>,
    pub search_target: Option<String>,
    pub usn: Option<String>,
    pub friendly_name: Option<String>,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BonjourService {
    pub name: String,
    pub service_type: String,
    pub port: u16,
    pub txt: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpEvidence {
    pub status: Option<u16>,
    pub server: Option<String>,
    pub auth_challenge: Option<String>,
    pub title: Option<String>,
}

/// Everything observed about one IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRecord {
    pub ip: Ipv4Addr,
    pub alive: bool,
    pub open_ports: BTreeSet<u16>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub vendor_confidence: ConfidenceScore,
    pub host_confidence: ConfidenceScore,
    pub ssdp: Option<SsdpEvidence>,
    pub bonjour_services: Vec<BonjourService>,
    pub http: Option<HttpEvidence>,
    pub provenance: Provenance,
}

impl HostRecord {
    pub(crate) fn new(
        ip: Ipv4Addr,
        source: EvidenceSource,
        scan_mode: ScanMode,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            ip,
            alive: false,
            open_ports: BTreeSet::new(),
            hostname: None,
            mac: None,
            vendor: None,
            vendor_confidence: ConfidenceScore::default(),
            host_confidence: ConfidenceScore::default(),
            ssdp: None,
            bonjour_services: Vec::new(),
            http: None,
            provenance: Provenance::new(source, scan_mode, at),
        }
    }
}

/// Operator-supplied stream credentials. Held in memory only; the password is
/// never serialized.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Outcome of one RTSP DESCRIBE attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtspProbeResult {
    pub uri: String,
    pub status_code: Option<u16>,
    pub server: Option<String>,
    pub has_video: bool,
    pub codec_hints: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// A host judged worth a closer look
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub open_ports: BTreeSet<u16>,
    pub confidence: ConfidenceScore,

    pub onvif_discovered: bool,
    pub onvif_xaddrs: BTreeSet<String>,
    pub onvif_device_types: BTreeSet<String>,
    pub onvif_scopes: BTreeSet<String>,
    pub onvif_rtsp_uri: Option<String>,
    pub onvif_requires_auth: bool,
    pub onvif_last_error: Option<String>,

    pub credentials: Option<Credentials>,

    pub rtsp_in_progress: bool,
    pub rtsp_probe_results: Vec<RtspProbeResult>,
    pub best_rtsp_uri: Option<String>,
    pub rtsp_summary: Option<String>,
}

impl DeviceRecord {
    pub(crate) fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            hostname: None,
            mac: None,
            vendor: None,
            open_ports: BTreeSet::new(),
            confidence: ConfidenceScore::default(),
            onvif_discovered: false,
            onvif_xaddrs: BTreeSet::new(),
            onvif_device_types: BTreeSet::new(),
            onvif_scopes: BTreeSet::new(),
            onvif_rtsp_uri: None,
            onvif_requires_auth: false,
            onvif_last_error: None,
            credentials: None,
            rtsp_in_progress: false,
            rtsp_probe_results: Vec::new(),
            best_rtsp_uri: None,
            rtsp_summary: None,
        }
    }

    pub fn rtsp_succeeded(&self) -> bool {
        self.rtsp_probe_results.iter().any(|r| r.success)
    }
}

/// Lifecycle of the engine as seen by callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Idle => write!(f, "idle"),
            ScanStatus::Running => write!(f, "running"),
            ScanStatus::Completed => write!(f, "completed"),
            ScanStatus::Stopped => write!(f, "stopped"),
            ScanStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scope: String,
    pub candidate_count: usize,
    pub alive_hosts: usize,
    pub interesting_devices: usize,
    pub safe_mode: bool,
    pub mode: ScanMode,
    pub status: ScanStatus,
}

impl Default for ScanSummary {
    fn default() -> Self {
        Self {
            started_at: None,
            finished_at: None,
            scope: String::new(),
            candidate_count: 0,
            alive_hosts: 0,
            interesting_devices: 0,
            safe_mode: true,
            mode: ScanMode::OneShot,
            status: ScanStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(ConfidenceTier::for_score(0), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::for_score(39), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::for_score(40), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::for_score(69), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::for_score(70), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::for_score(100), ConfidenceTier::High);
    }

    #[test]
    fn test_score_is_clamped() {
        let reasons = vec![
            ConfidenceReason { reason: "a".into(), delta: 80 },
            ConfidenceReason { reason: "b".into(), delta: 40 },
        ];
        assert_eq!(ConfidenceScore::from_reasons(reasons).score, 100);

        let reasons = vec![ConfidenceReason { reason: "neg".into(), delta: -15 }];
        assert_eq!(ConfidenceScore::from_reasons(reasons).score, 0);
    }

    #[test]
    fn test_reasons_ranked_by_weight() {
        let reason = |text: &str, delta| ConfidenceReason {
            reason: text.into(),
            delta,
        };
        let score = ConfidenceScore::from_reasons(vec![
            reason("port", 10),
            reason("local mac", -15),
            reason("onvif", 40),
            reason("http", 10),
        ]);
        let order: Vec<&str> = score.reasons.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(order, vec!["onvif", "local mac", "port", "http"]);
        assert_eq!(score.score, 45);
    }

    #[test]
    fn test_credentials_password_not_serialized() {
        let creds = Credentials {
            username: "admin".into(),
            password: "hunter2".into(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("admin"));
        assert!(!json.contains("hunter2"));
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
