//! Confidence scoring. Scores are always rebuilt from the full current evidence
//! of one IP, so calling these twice on the same records yields the same result.

use super::patterns::{
    CAMERA_BRANDS, CAMERA_KEYWORDS, HTTP_LIVE_STATUSES, MAX_VENDOR_KEYWORDS, MEDIA_KEYWORDS,
    VENDOR_STOPWORDS,
};
use super::types::{ConfidenceReason, ConfidenceScore, DeviceRecord, HostRecord};
use crate::oui::is_locally_administered;

const RTSP_PORT: u16 = 554;

/// Distinctive lowercase tokens of a vendor name, at most three, in order
pub fn vendor_keywords(vendor: &str) -> Vec<String> {
    let lower = vendor.to_lowercase().replace(['&', '.'], " ");
    let keywords: Vec<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 3 && !VENDOR_STOPWORDS.contains(token))
        .take(MAX_VENDOR_KEYWORDS)
        .map(str::to_string)
        .collect();

    if keywords.is_empty() {
        vec![vendor.trim().to_lowercase()]
    } else {
        keywords
    }
}

fn contains_any(text: Option<&str>, keywords: &[String]) -> bool {
    text.is_some_and(|t| {
        let t = t.to_lowercase();
        keywords.iter().any(|k| !k.is_empty() && t.contains(k.as_str()))
    })
}

fn reason(text: &str, delta: i32) -> ConfidenceReason {
    ConfidenceReason {
        reason: text.to_string(),
        delta,
    }
}

/// How much the rest of the evidence agrees with the OUI vendor
pub fn vendor_confidence(host: &HostRecord) -> ConfidenceScore {
    let Some(vendor) = host.vendor.as_deref().filter(|v| !v.trim().is_empty()) else {
        return ConfidenceScore::from_reasons(vec![reason("no OUI match", 0)]);
    };

    let keywords = vendor_keywords(vendor);
    let http = host.http.as_ref();
    let ssdp = host.ssdp.as_ref();
    let mut reasons = vec![reason("OUI vendor match", 60)];

    let strong = [
        ("HTTP server mentions vendor", http.and_then(|h| h.server.as_deref())),
        ("HTTP title mentions vendor", http.and_then(|h| h.title.as_deref())),
        ("SSDP server mentions vendor", ssdp.and_then(|s| s.server.as_deref())),
        ("hostname mentions vendor", host.hostname.as_deref()),
    ];
    for (label, text) in strong {
        if contains_any(text, &keywords) {
            reasons.push(reason(label, 10));
        }
    }

    let weak = [
        ("SSDP search target mentions vendor", ssdp.and_then(|s| s.search_target.as_deref())),
        ("SSDP USN mentions vendor", ssdp.and_then(|s| s.usn.as_deref())),
        ("SSDP location mentions vendor", ssdp.and_then(|s| s.location.as_deref())),
    ];
    for (label, text) in weak {
        if contains_any(text, &keywords) {
            reasons.push(reason(label, 5));
        }
    }

    if host.mac.as_deref().is_some_and(is_locally_administered) {
        reasons.push(reason("locally administered MAC", -15));
    }

    ConfidenceScore::from_reasons(reasons)
}

fn mentions_camera(text: Option<&str>) -> bool {
    text.is_some_and(|t| {
        let t = t.to_lowercase();
        CAMERA_KEYWORDS.iter().any(|k| t.contains(k))
    })
}

/// Token match for UPnP strings. Short keywords such as `av` must match a
/// whole token; longer ones may appear inside a token (`MediaServer:1`).
fn mentions_media(text: Option<&str>) -> bool {
    let Some(text) = text else {
        return false;
    };
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .any(|token| {
            MEDIA_KEYWORDS
                .iter()
                .any(|k| token == *k || (k.len() >= 4 && token.contains(k)))
        })
}

/// Camera/NVR likelihood for one IP, combining host and device evidence
pub fn host_confidence(host: &HostRecord, device: Option<&DeviceRecord>) -> ConfidenceScore {
    let mut reasons = Vec::new();

    if let Some(device) = device {
        if !device.onvif_xaddrs.is_empty() {
            reasons.push(reason("ONVIF XAddrs advertised", 40));
        } else if device.onvif_discovered {
            reasons.push(reason("ONVIF discovered without XAddrs", 10));
        }
    }

    if device.is_some_and(DeviceRecord::rtsp_succeeded) {
        reasons.push(reason("RTSP stream with video", 25));
    } else if host.open_ports.contains(&RTSP_PORT) {
        reasons.push(reason("RTSP port 554 open", 10));
    }

    if let Some(http) = &host.http {
        match http.status {
            Some(status) if HTTP_LIVE_STATUSES.contains(&status) => {
                reasons.push(reason(&format!("HTTP responds {}", status), 10));
            }
            Some(404) => reasons.push(reason("HTTP responds 404", 5)),
            _ => {}
        }
        if mentions_camera(http.server.as_deref()) || mentions_camera(http.title.as_deref()) {
            reasons.push(reason("HTTP banner looks like a camera", 15));
        }
    }

    if let Some(ssdp) = &host.ssdp {
        let fields = [
            ssdp.server.as_deref(),
            ssdp.search_target.as_deref(),
            ssdp.usn.as_deref(),
            ssdp.location.as_deref(),
            ssdp.friendly_name.as_deref(),
            ssdp.model_name.as_deref(),
        ];
        if fields.into_iter().any(mentions_media) {
            reasons.push(reason("SSDP advertises media device", 15));
        }
    }

    if host.open_ports.contains(&8000) {
        reasons.push(reason("port 8000 open", 10));
    }
    if host.open_ports.contains(&8554) {
        reasons.push(reason("port 8554 open", 5));
    }

    if let Some(vendor) = host.vendor.as_deref().filter(|v| !v.trim().is_empty()) {
        let lower = vendor.to_lowercase();
        if CAMERA_BRANDS.iter().any(|b| lower.contains(b)) {
            reasons.push(reason("camera vendor", 10));
        } else {
            reasons.push(reason("known vendor", 5));
        }
    }

    ConfidenceScore::from_reasons(reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanMode;
    use crate::inventory::types::{
        EvidenceSource, HttpEvidence, RtspProbeResult, SsdpEvidence,
    };
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn host() -> HostRecord {
        HostRecord::new(
            Ipv4Addr::new(192, 168, 1, 64),
            EvidenceSource::PortProbe,
            ScanMode::OneShot,
            Utc::now(),
        )
    }

    fn rtsp_success() -> RtspProbeResult {
        RtspProbeResult {
            uri: "rtsp://192.168.1.64:554/".into(),
            status_code: Some(200),
            server: None,
            has_video: true,
            codec_hints: vec!["H264".into()],
            success: true,
            error: None,
        }
    }

    #[test]
    fn test_vendor_keywords_hikvision() {
        assert_eq!(
            vendor_keywords("Hikvision Digital Technology Co., Ltd."),
            vec!["hikvision", "digital"]
        );
    }

    #[test]
    fn test_vendor_keywords_limits_and_fallback() {
        assert_eq!(
            vendor_keywords("Axis Communications AB Sweden Extra"),
            vec!["axis", "communications", "sweden"]
        );
        assert_eq!(vendor_keywords("Procter & Gamble"), vec!["procter", "gamble"]);
        assert_eq!(vendor_keywords(" LG Co "), vec!["lg co"]);
    }

    #[test]
    fn test_vendor_confidence_no_vendor() {
        let mut h = host();
        h.mac = Some("44:19:b6:00:00:01".into());
        let score = vendor_confidence(&h);
        assert_eq!(score.score, 0);
        assert_eq!(score.reasons[0].reason, "no OUI match");
    }

    #[test]
    fn test_vendor_confidence_signals() {
        let mut h = host();
        h.mac = Some("44:19:b6:00:00:01".into());
        h.vendor = Some("Hangzhou Hikvision Digital Technology Co.,Ltd.".into());
        assert_eq!(vendor_confidence(&h).score, 60);

        h.http = Some(HttpEvidence {
            status: Some(200),
            server: Some("Hikvision-Webs".into()),
            auth_challenge: None,
            title: None,
        });
        h.ssdp = Some(SsdpEvidence {
            location: Some("http://192.168.1.64/hikvision.xml".into()),
            ..Default::default()
        });
        let score = vendor_confidence(&h);
        assert_eq!(score.score, 75);
        assert_eq!(score.reasons.len(), 3);
    }

    #[test]
    fn test_vendor_confidence_locally_administered_penalty() {
        let mut h = host();
        h.mac = Some("02:19:b6:00:00:01".into());
        h.vendor = Some("Axis Communications AB".into());
        assert_eq!(vendor_confidence(&h).score, 45);
    }

    #[test]
    fn test_host_confidence_empty_host() {
        let score = host_confidence(&host(), None);
        assert_eq!(score.score, 0);
        assert!(score.reasons.is_empty());
    }

    #[test]
    fn test_host_confidence_camera_profile() {
        let mut h = host();
        h.open_ports.extend([80, 554, 8000]);
        h.vendor = Some("Hikvision".into());
        h.http = Some(HttpEvidence {
            status: Some(401),
            server: Some("App-webs/".into()),
            auth_challenge: Some("Digest realm=\"IP Camera\"".into()),
            title: None,
        });
        let mut d = crate::inventory::types::DeviceRecord::new(h.ip);
        d.onvif_discovered = true;
        d.onvif_xaddrs.insert("http://192.168.1.64/onvif/device_service".into());

        let score = host_confidence(&h, Some(&d));
        // 40 xaddrs + 10 port 554 + 10 http 401 + 10 port 8000 + 10 camera vendor
        assert_eq!(score.score, 80);
        assert_eq!(score.tier, crate::inventory::types::ConfidenceTier::High);

        d.rtsp_probe_results.push(rtsp_success());
        assert_eq!(host_confidence(&h, Some(&d)).score, 95);
    }

    #[test]
    fn test_host_confidence_is_idempotent() {
        let mut h = host();
        h.open_ports.extend([554, 8554]);
        h.ssdp = Some(SsdpEvidence {
            search_target: Some("urn:schemas-upnp-org:device:MediaServer:1".into()),
            ..Default::default()
        });
        let first = host_confidence(&h, None);
        let second = host_confidence(&h, None);
        assert_eq!(first, second);
        assert_eq!(first.score, 30);
    }

    #[test]
    fn test_positive_signal_never_decreases_score() {
        let mut h = host();
        h.open_ports.insert(554);
        let mut d = crate::inventory::types::DeviceRecord::new(h.ip);
        let mut last = host_confidence(&h, Some(&d)).score;

        d.onvif_discovered = true;
        let next = host_confidence(&h, Some(&d)).score;
        assert!(next >= last);
        last = next;

        d.onvif_xaddrs.insert("http://x/onvif".into());
        let next = host_confidence(&h, Some(&d)).score;
        assert!(next >= last);
        last = next;

        d.rtsp_probe_results.push(rtsp_success());
        let next = host_confidence(&h, Some(&d)).score;
        assert!(next >= last);
        last = next;

        h.http = Some(HttpEvidence {
            status: Some(404),
            ..Default::default()
        });
        let next = host_confidence(&h, Some(&d)).score;
        assert!(next >= last);
        last = next;

        h.http.as_mut().unwrap().status = Some(200);
        assert!(host_confidence(&h, Some(&d)).score >= last);
    }

    #[test]
    fn test_media_keyword_matching() {
        assert!(mentions_media(Some("urn:schemas-upnp-org:device:MediaRenderer:1")));
        assert!(mentions_media(Some("Linux/3.4 UPnP/1.0 DLNA")));
        assert!(mentions_media(Some("urn:x:device:AV:1")));
        assert!(!mentions_media(Some("Java/1.8 Avahi")));
        assert!(!mentions_media(None));
    }
}
