//! ONVIF support: WS-Discovery probing over UDP multicast, and a minimal SOAP
//! client that walks GetCapabilities -> GetProfiles -> GetStreamUri to find the
//! RTSP URI of a camera.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::gate::Gate;
use super::ssdp::extract_xml_element;
use super::{DiscoveryOutcome, OnvifDiscoveryResult};
use crate::error::OnvifError;
use crate::inventory::Credentials;

pub const WS_DISCOVERY_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 3702);

const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

fn probe_message(message_id: &Uuid) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</a:Action>
    <a:MessageID>uuid:{}</a:MessageID>
    <a:ReplyTo>
      <a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:To s:mustUnderstand="1">urn:schemas-xmlsoap-org:ws:2005:04:discovery</a:To>
  </s:Header>
  <s:Body>
    <Probe xmlns="http://schemas.xmlsoap.org/ws/2005/04/discovery">
      <d:Types xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery" xmlns:dp0="http://www.onvif.org/ver10/network/wsdl">dp0:NetworkVideoTransmitter</d:Types>
    </Probe>
  </s:Body>
</s:Envelope>"#,
        message_id
    )
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Parse a ProbeMatches reply. `None` when it carries no ProbeMatch at all.
pub fn parse_probe_match(xml: &str, ip: Ipv4Addr) -> Option<OnvifDiscoveryResult> {
    if !xml.contains("ProbeMatch") {
        return None;
    }
    Some(OnvifDiscoveryResult {
        ip,
        xaddrs: split_list(extract_xml_element(xml, "XAddrs")),
        types: split_list(extract_xml_element(xml, "Types")),
        scopes: split_list(extract_xml_element(xml, "Scopes")),
    })
}

fn multicast_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    UdpSocket::from_std(socket.into())
}

/// WS-Discovery prober
pub struct OnvifDiscovery {
    timeout_secs: u64,
}

impl OnvifDiscovery {
    pub fn new() -> Self {
        Self { timeout_secs: 3 }
    }

    /// Send one Probe and collect ProbeMatches for the window. Matches are sent
    /// on `tx` as they arrive; the outcome merges them per IP.
    pub async fn discover(
        &self,
        tx: &mpsc::Sender<OnvifDiscoveryResult>,
        cancel: &CancellationToken,
    ) -> DiscoveryOutcome<OnvifDiscoveryResult> {
        let socket = match multicast_socket() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "WS-Discovery socket unavailable");
                return DiscoveryOutcome::unavailable();
            }
        };

        let probe = probe_message(&Uuid::new_v4());
        if let Err(e) = socket.send_to(probe.as_bytes(), WS_DISCOVERY_ADDR).await {
            warn!(error = %e, "WS-Discovery probe could not be sent");
            return DiscoveryOutcome::unavailable();
        }

        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);
        let mut merged: BTreeMap<Ipv4Addr, OnvifDiscoveryResult> = BTreeMap::new();
        let mut buffer = vec![0u8; 16 * 1024];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = timeout_at(deadline, socket.recv_from(&mut buffer)) => r,
            };
            let (size, from) = match received {
                Ok(Ok(packet)) => packet,
                Ok(Err(e)) => {
                    debug!(error = %e, "WS-Discovery receive error");
                    continue;
                }
                Err(_) => break,
            };
            let IpAddr::V4(ip) = from.ip() else {
                continue;
            };
            let xml = String::from_utf8_lossy(&buffer[..size]);
            let Some(result) = parse_probe_match(&xml, ip) else {
                continue;
            };

            debug!(ip = %ip, xaddrs = result.xaddrs.len(), "ONVIF device discovered");
            let _ = tx.send(result.clone()).await;

            let entry = merged.entry(ip).or_insert_with(|| OnvifDiscoveryResult {
                ip,
                xaddrs: Vec::new(),
                types: Vec::new(),
                scopes: Vec::new(),
            });
            for (target, source) in [
                (&mut entry.xaddrs, result.xaddrs),
                (&mut entry.types, result.types),
                (&mut entry.scopes, result.scopes),
            ] {
                for value in source {
                    if !target.contains(&value) {
                        target.push(value);
                    }
                }
            }
        }

        DiscoveryOutcome {
            results: merged.into_values().collect(),
            multicast_available: true,
        }
    }
}

impl Default for OnvifDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// `Base64(SHA1(nonce + created + password))`
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// WS-Security UsernameToken header with a fresh nonce
pub fn security_header(username: &str, password: &str) -> String {
    let nonce = Uuid::new_v4().into_bytes();
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let digest = password_digest(&nonce, &created, password);

    format!(
        r#"<wsse:Security s:mustUnderstand="1" xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"><wsse:UsernameToken><wsse:Username>{}</wsse:Username><wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{}</wsse:Password><wsse:Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{}</wsse:Nonce><wsu:Created>{}</wsu:Created></wsse:UsernameToken></wsse:Security>"#,
        xml_escape(username),
        digest,
        STANDARD.encode(nonce),
        created
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn envelope(body: &str, credentials: Option<&Credentials>) -> String {
    let header = credentials
        .filter(|c| !c.username.is_empty())
        .map(|c| security_header(&c.username, &c.password))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tds="http://www.onvif.org/ver10/device/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema"><s:Header>{}</s:Header><s:Body>{}</s:Body></s:Envelope>"#,
        header, body
    )
}

/// The first element whose local name is `element`, tags included
fn section<'a>(xml: &'a str, element: &str) -> Option<&'a str> {
    let mut offset = 0;
    while let Some(open) = xml[offset..].find('<') {
        let start = offset + open;
        let close = start + 1 + xml[start + 1..].find('>')?;
        let name = xml[start + 1..close].split_whitespace().next().unwrap_or("");

        if !name.starts_with('/') && name.rsplit(':').next() == Some(element) {
            let end_tag = format!("</{}>", name);
            let end = xml[close..]
                .find(&end_tag)
                .map(|i| close + i + end_tag.len())
                .unwrap_or(xml.len());
            return Some(&xml[start..end]);
        }
        offset = close + 1;
    }
    None
}

/// Value of `attr` on the first element whose local name is `element`
fn attribute(xml: &str, element: &str, attr: &str) -> Option<String> {
    let mut search = xml;
    while let Some(open) = search.find('<') {
        let rest = &search[open + 1..];
        let close = rest.find('>')?;
        let tag = &rest[..close];
        let name = tag.split_whitespace().next().unwrap_or("");
        if name.rsplit(':').next() == Some(element) {
            let key = format!("{}=", attr);
            let at = tag.find(&key)? + key.len();
            let value = &tag[at..];
            let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let value = &value[quote.len_utf8()..];
            return value.find(quote).map(|end| value[..end].to_string());
        }
        search = &rest[close + 1..];
    }
    None
}

fn fault_reason(xml: &str) -> Option<String> {
    if !xml.contains("Fault>") && !xml.contains(":Fault ") {
        return None;
    }
    Some(
        extract_xml_element(xml, "Text")
            .or_else(|| extract_xml_element(xml, "faultstring"))
            .unwrap_or_else(|| "unknown fault".to_string()),
    )
}

/// SOAP client for one device
pub struct OnvifClient {
    http: reqwest::Client,
}

impl OnvifClient {
    pub fn new() -> Result<Self, OnvifError> {
        let http = reqwest::Client::builder()
            .timeout(SOAP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| OnvifError::Http(e.to_string()))?;
        Ok(Self { http })
    }

    async fn call(
        &self,
        url: &str,
        body: &str,
        credentials: Option<&Credentials>,
        gate: &Gate,
    ) -> Result<String, OnvifError> {
        let request = self
            .http
            .post(url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(envelope(body, credentials));

        gate.run(async {
            let response = request
                .send()
                .await
                .map_err(|e| OnvifError::Http(e.to_string()))?;
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status == reqwest::StatusCode::UNAUTHORIZED || text.contains("NotAuthorized") {
                return Err(OnvifError::Unauthorized);
            }
            if let Some(reason) = fault_reason(&text) {
                return Err(OnvifError::Fault(reason));
            }
            if !status.is_success() {
                return Err(OnvifError::Http(format!("status {}", status.as_u16())));
            }
            Ok(text)
        })
        .await
    }

    /// Media service XAddr advertised by the device service
    pub async fn media_xaddr(
        &self,
        device_xaddr: &str,
        credentials: Option<&Credentials>,
        gate: &Gate,
    ) -> Result<Option<String>, OnvifError> {
        let body = r#"<tds:GetCapabilities><tds:Category>Media</tds:Category></tds:GetCapabilities>"#;
        let xml = self.call(device_xaddr, body, credentials, gate).await?;
        Ok(section(&xml, "Media").and_then(|media| extract_xml_element(media, "XAddr")))
    }

    pub async fn first_profile_token(
        &self,
        media_xaddr: &str,
        credentials: Option<&Credentials>,
        gate: &Gate,
    ) -> Result<String, OnvifError> {
        let xml = self
            .call(media_xaddr, "<trt:GetProfiles/>", credentials, gate)
            .await?;
        attribute(&xml, "Profiles", "token").ok_or(OnvifError::MissingField("profile token"))
    }

    pub async fn stream_uri(
        &self,
        media_xaddr: &str,
        profile_token: &str,
        credentials: Option<&Credentials>,
        gate: &Gate,
    ) -> Result<String, OnvifError> {
        let body = format!(
            "<trt:GetStreamUri><trt:StreamSetup><tt:Stream>RTP-Unicast</tt:Stream><tt:Transport><tt:Protocol>RTSP</tt:Protocol></tt:Transport></trt:StreamSetup><trt:ProfileToken>{}</trt:ProfileToken></trt:GetStreamUri>",
            xml_escape(profile_token)
        );
        let xml = self.call(media_xaddr, &body, credentials, gate).await?;
        extract_xml_element(&xml, "Uri").ok_or(OnvifError::MissingField("stream uri"))
    }

    /// Resolve the RTSP URI of the first media profile
    pub async fn fetch_stream_uri(
        &self,
        xaddrs: &[String],
        credentials: Option<&Credentials>,
        gate: &Gate,
    ) -> Result<String, OnvifError> {
        let device_xaddr = xaddrs
            .iter()
            .find(|x| url::Url::parse(x).is_ok())
            .ok_or(OnvifError::NoXAddrs)?;

        let media = self
            .media_xaddr(device_xaddr, credentials, gate)
            .await?
            .unwrap_or_else(|| device_xaddr.clone());
        let token = self.first_profile_token(&media, credentials, gate).await?;
        self.stream_uri(&media, &token, credentials, gate).await
    }
}
