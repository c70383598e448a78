//! Reverse DNS for alive hosts, bounded by the DNS gate.

use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use super::gate::Gate;

fn usable(ip: Ipv4Addr, name: String) -> Option<String> {
    let name = name.trim_end_matches('.').to_string();
    if name.is_empty() || name == ip.to_string() {
        None
    } else {
        Some(name)
    }
}

/// PTR lookup; `None` on failure or when the resolver just echoes the address
pub async fn reverse_lookup(ip: Ipv4Addr, gate: &Gate) -> Option<String> {
    let lookup = gate
        .run(tokio::task::spawn_blocking(move || {
            dns_lookup::lookup_addr(&IpAddr::V4(ip))
        }))
        .await;

    match lookup {
        Ok(Ok(name)) => usable(ip, name),
        Ok(Err(e)) => {
            debug!(ip = %ip, error = %e, "Reverse lookup failed");
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_names() {
        let ip = Ipv4Addr::new(192, 168, 1, 64);
        assert_eq!(usable(ip, "cam.lan.".into()), Some("cam.lan".to_string()));
        assert_eq!(usable(ip, "192.168.1.64".into()), None);
        assert_eq!(usable(ip, String::new()), None);
    }

    #[tokio::test]
    async fn test_reverse_lookup_releases_gate() {
        let gate = Gate::new("dns", 1);
        let _ = reverse_lookup(Ipv4Addr::LOCALHOST, &gate).await;
        assert_eq!(gate.available(), 1);
    }
}
