//! SSDP/UPnP scanner. Discovers network devices via multicast M-SEARCH requests
//! and fetches device description XML from UPnP location URLs.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gate::Gate;
use super::{DiscoveryOutcome, SsdpResult};

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// IPv4 host of a LOCATION URL
pub fn location_ip(location: &str) -> Option<Ipv4Addr> {
    let url = url::Url::parse(location).ok()?;
    match url.host_str()?.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// Extract a simple XML element value, tolerating a namespace prefix
pub fn extract_xml_element(xml: &str, element: &str) -> Option<String> {
    let mut search = xml;
    while let Some(open) = search.find('<') {
        let rest = &search[open + 1..];
        let close = rest.find('>')?;
        let tag = &rest[..close];
        let name = tag.split_whitespace().next().unwrap_or("");
        let local = name.rsplit(':').next().unwrap_or(name);

        if local == element && !tag.ends_with('/') {
            let content = &rest[close + 1..];
            let end = content.find("</")?;
            return non_empty(&content[..end]);
        }
        search = &rest[close + 1..];
    }
    None
}

/// Same device may respond once per service; keep the first response per IP
fn dedup_by_ip(results: &mut Vec<SsdpResult>) {
    results.sort_by_key(|r| r.ip);
    results.dedup_by_key(|r| r.ip);
}

/// SSDP/UPnP device discovery scanner
pub struct SsdpScanner {
    timeout_secs: u64,
}

impl SsdpScanner {
    pub fn new() -> Self {
        Self { timeout_secs: 3 }
    }

    /// Fetch and parse UPnP device description XML to get friendly name and model
    async fn fetch_device_info(location: &str) -> Option<(Option<String>, Option<String>)> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .ok()?;

        let response = client.get(location).send().await.ok()?;
        let xml = response.text().await.ok()?;

        let friendly_name = extract_xml_element(&xml, "friendlyName");
        let model_name = extract_xml_element(&xml, "modelName");
        Some((friendly_name, model_name))
    }

    /// Run one M-SEARCH window. Each response is sent on `tx` as it arrives; once
    /// the window closes, description documents are fetched and the enriched
    /// results are sent again.
    pub async fn discover(
        &self,
        tx: &mpsc::Sender<SsdpResult>,
        http_gate: &Gate,
        cancel: &CancellationToken,
    ) -> DiscoveryOutcome<SsdpResult> {
        let mut results = Vec::new();
        let search_target = ssdp_client::SearchTarget::All;

        let search = ssdp_client::search(
            &search_target,
            Duration::from_secs(self.timeout_secs),
            2,
            None,
        )
        .await;

        let mut responses = match search {
            Ok(responses) => responses,
            Err(e) => {
                warn!(error = %e, "SSDP search could not start");
                return DiscoveryOutcome::unavailable();
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = responses.next() => next,
            };
            let Some(response) = next else {
                break;
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "Bad SSDP response");
                    continue;
                }
            };
            let Some(ip) = location_ip(response.location()) else {
                continue;
            };

            let result = SsdpResult {
                ip,
                location: response.location().to_string(),
                server: non_empty(response.server()),
                search_target: non_empty(&response.search_target().to_string()),
                usn: non_empty(response.usn()),
                friendly_name: None,
                model_name: None,
            };
            let _ = tx.send(result.clone()).await;
            results.push(result);
        }

        dedup_by_ip(&mut results);

        let mut descriptions: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();
        for result in &mut results {
            if cancel.is_cancelled() {
                break;
            }
            if !descriptions.contains_key(&result.location) {
                let info = http_gate
                    .run(Self::fetch_device_info(&result.location))
                    .await
                    .unwrap_or((None, None));
                descriptions.insert(result.location.clone(), info);
            }
            if let Some((friendly_name, model_name)) = descriptions.get(&result.location)
                && (friendly_name.is_some() || model_name.is_some())
            {
                result.friendly_name = friendly_name.clone();
                result.model_name = model_name.clone();
                let _ = tx.send(result.clone()).await;
            }
        }

        debug!(devices = results.len(), "SSDP discovery finished");
        DiscoveryOutcome {
            results,
            multicast_available: true,
        }
    }
}

impl Default for SsdpScanner {
    fn default() -> Self {
        Self::new()
    }
}
