//! HTTP fingerprinting. Fetches the landing page of a device web UI and extracts
//! status, `Server`, `WWW-Authenticate` and `<title>`. Certificates are not validated.

use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::header::{SERVER, WWW_AUTHENTICATE};
use tracing::debug;

use super::HttpFingerprint;
use super::port::HTTPS_PORTS;

/// Timeout of the title-only fetch
pub const TITLE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Timeout of the full fingerprint
pub const FINGERPRINT_TIMEOUT: Duration = Duration::from_millis(2000);

const MAX_TITLE_LEN: usize = 200;

/// First `<title ...>...</title>` pair, case-insensitive
pub fn extract_title(html: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let content_start = open + lower[open..].find('>')? + 1;
    let content_end = content_start + lower[content_start..].find("</title")?;

    let title: String = html[content_start..content_end]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if title.is_empty() {
        None
    } else {
        Some(title.chars().take(MAX_TITLE_LEN).collect())
    }
}

pub fn url_for(ip: Ipv4Addr, port: u16) -> String {
    let scheme = if HTTPS_PORTS.contains(&port) {
        "https"
    } else {
        "http"
    };
    format!("{}://{}:{}/", scheme, ip, port)
}

fn build_client(timeout: Duration) -> Option<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .ok()
}

fn header(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Title of the first port that serves one; plain HTTP ports should come first
pub async fn fetch_title(ip: Ipv4Addr, ports: &[u16]) -> Option<String> {
    let client = build_client(TITLE_TIMEOUT)?;

    for &port in ports {
        let url = url_for(ip, port);
        let body = match client.get(&url).send().await {
            Ok(response) => response.text().await.ok(),
            Err(e) => {
                debug!(ip = %ip, port, error = %e, "Title fetch failed");
                None
            }
        };
        if let Some(title) = body.as_deref().and_then(extract_title) {
            return Some(title);
        }
    }
    None
}

/// Full fingerprint of one port; `None` when nothing answered
pub async fn fingerprint(ip: Ipv4Addr, port: u16) -> Option<HttpFingerprint> {
    let client = build_client(FINGERPRINT_TIMEOUT)?;
    let url = url_for(ip, port);

    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(ip = %ip, port, error = %e, "HTTP fingerprint failed");
            return None;
        }
    };

    let status = response.status().as_u16();
    let server = header(&response, SERVER);
    let auth_challenge = header(&response, WWW_AUTHENTICATE);
    let title = response
        .text()
        .await
        .ok()
        .as_deref()
        .and_then(extract_title);

    Some(HttpFingerprint {
        status: Some(status),
        server,
        auth_challenge,
        title,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    #[test]
    fn test_extract_title() {
        assert_eq!(
            extract_title("<html><head><TITLE>IP Camera</TITLE></head></html>"),
            Some("IP Camera".to_string())
        );
        assert_eq!(
            extract_title("<title lang=\"en\">\n  NVR   Login \n</title>"),
            Some("NVR Login".to_string())
        );
    }

    #[test]
    fn test_extract_title_malformed() {
        assert_eq!(extract_title("<html><body>no title</body></html>"), None);
        assert_eq!(extract_title("<title>unterminated"), None);
        assert_eq!(extract_title("<title></title>"), None);
        assert_eq!(extract_title("<title"), None);
    }

    #[test]
    fn test_url_for_scheme() {
        let ip = Ipv4Addr::new(192, 168, 1, 64);
        assert_eq!(url_for(ip, 80), "http://192.168.1.64:80/");
        assert_eq!(url_for(ip, 8443), "https://192.168.1.64:8443/");
    }

    #[tokio::test]
    async fn test_fingerprint_camera_login() {
        let port = serve_once(
            "HTTP/1.1 401 Unauthorized\r\n\
             Server: App-webs/\r\n\
             WWW-Authenticate: Digest realm=\"IP Camera\"\r\n\
             Content-Type: text/html\r\n\
             Content-Length: 46\r\n\
             Connection: close\r\n\r\n\
             <html><title>Network Camera</title></html>\n\n\n\n",
        )
        .await;

        let fp = fingerprint(Ipv4Addr::LOCALHOST, port).await.unwrap();
        assert_eq!(fp.status, Some(401));
        assert_eq!(fp.server.as_deref(), Some("App-webs/"));
        assert_eq!(fp.auth_challenge.as_deref(), Some("Digest realm=\"IP Camera\""));
        assert_eq!(fp.title.as_deref(), Some("Network Camera"));
    }

    #[tokio::test]
    async fn test_fetch_title_skips_dead_ports() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let live = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 28\r\nConnection: close\r\n\r\n\
             <title>Reolink</title>\n\n\n\n\n\n",
        )
        .await;

        let title = fetch_title(Ipv4Addr::LOCALHOST, &[dead, live]).await;
        assert_eq!(title.as_deref(), Some("Reolink"));
    }

    #[tokio::test]
    async fn test_fingerprint_nothing_listening() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(fingerprint(Ipv4Addr::LOCALHOST, dead).await.is_none());
    }
}
