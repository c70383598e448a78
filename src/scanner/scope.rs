//! Scan scope resolution. Turns a CIDR / explicit range request into the list of
//! candidate IPs, gated to the active local subnet when requested.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;
use pnet::datalink;
use tracing::{debug, warn};

use crate::config::ScopeRequest;
use crate::error::ScanError;

/// Largest scope accepted before falling back to the active subnet
pub const MAX_SCOPE_ADDRESSES: u64 = 65_536;

/// Widest prefix swept when falling back to the active subnet
const FALLBACK_PREFIX: u8 = 16;

/// The candidate list a sweep will probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScope {
    pub description: String,
    pub hosts: Vec<Ipv4Addr>,
    /// Set when the request was replaced by the active subnet
    pub overridden: bool,
}

/// Canonical form of a subnet (network address, same prefix)
fn normalize(net: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(net.network(), net.prefix()).unwrap_or(net)
}

fn describe(net: &Ipv4Network) -> String {
    format!("{}/{}", net.network(), net.prefix())
}

/// Usable host addresses of a subnet, excluding network and broadcast
pub fn host_ips(net: &Ipv4Network) -> Vec<Ipv4Addr> {
    if net.prefix() >= 31 {
        return Vec::new();
    }
    let first = u32::from(net.network()) + 1;
    let last = u32::from(net.broadcast()) - 1;
    (first..=last).map(Ipv4Addr::from).collect()
}

/// First administratively up, non-loopback interface with an IPv4 address
pub fn detect_active_subnet() -> Option<Ipv4Network> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .find_map(|iface| {
            iface.ips.iter().find_map(|ip| match ip.ip() {
                IpAddr::V4(ipv4) if !ipv4.is_loopback() && !ipv4.is_link_local() => {
                    Ipv4Network::new(ipv4, ip.prefix()).ok()
                }
                _ => None,
            })
        })
}

fn within(active: &Ipv4Network, net: &Ipv4Network) -> bool {
    active.contains(net.network()) && active.contains(net.broadcast())
}

/// The active subnet, narrowed to the /16 around the interface address when wider
fn active_scope(active: Option<Ipv4Network>) -> Result<ResolvedScope, ScanError> {
    let mut active = active.ok_or(ScanError::NoActiveInterface)?;
    if active.prefix() < FALLBACK_PREFIX {
        let narrowed = Ipv4Network::new(active.ip(), FALLBACK_PREFIX).unwrap_or(active);
        warn!(
            active = %describe(&active),
            narrowed = %describe(&narrowed),
            "Active subnet too large, sweeping the block around the interface address"
        );
        active = narrowed;
    }
    let active = normalize(active);
    Ok(ResolvedScope {
        description: describe(&active),
        hosts: host_ips(&active),
        overridden: false,
    })
}

fn overridden(active: Option<Ipv4Network>, requested: &str) -> Result<ResolvedScope, ScanError> {
    let mut scope = active_scope(active)?;
    warn!(
        requested = %requested,
        active = %scope.description,
        "Safety override: requested scope is outside the local subnet, scanning active subnet instead"
    );
    scope.overridden = true;
    Ok(scope)
}

/// Resolve a scope request against the active subnet (if any).
///
/// An explicit range wins over the CIDR when it is well formed; an unparsable or
/// oversized CIDR falls back to the active subnet. With `only_local_subnet`, any
/// target not fully inside the active subnet is replaced by the active subnet.
pub fn resolve_scope(
    request: &ScopeRequest,
    active: Option<Ipv4Network>,
) -> Result<ResolvedScope, ScanError> {
    let scope = resolve_unchecked(request, active)?;
    if scope.hosts.is_empty() {
        return Err(ScanError::EmptyScope(scope.description));
    }
    debug!(scope = %scope.description, candidates = scope.hosts.len(), "Resolved scan scope");
    Ok(scope)
}

fn resolve_unchecked(
    request: &ScopeRequest,
    active: Option<Ipv4Network>,
) -> Result<ResolvedScope, ScanError> {
    if let Some(range) = request.ip_range {
        let (start, end) = (u32::from(range.start), u32::from(range.end));
        let description = format!("{}-{}", range.start, range.end);

        if start > end || u64::from(end - start) + 1 > MAX_SCOPE_ADDRESSES {
            warn!(range = %description, "Ignoring invalid IP range");
        } else {
            if request.only_local_subnet {
                let Some(active_net) = active else {
                    return Err(ScanError::NoActiveInterface);
                };
                if !(active_net.contains(range.start) && active_net.contains(range.end)) {
                    return overridden(active, &description);
                }
            }
            return Ok(ResolvedScope {
                description,
                hosts: (start..=end).map(Ipv4Addr::from).collect(),
                overridden: false,
            });
        }
    }

    let requested = request.cidr.trim();
    if requested.is_empty() {
        return active_scope(active);
    }

    let net = match requested.parse::<Ipv4Network>() {
        Ok(net) if (1u64 << (32 - u32::from(net.prefix()))) <= MAX_SCOPE_ADDRESSES => {
            normalize(net)
        }
        Ok(_) => {
            warn!(cidr = %requested, "Requested CIDR too large, using active subnet");
            return active_scope(active);
        }
        Err(e) => {
            warn!(cidr = %requested, error = %e, "Unparsable CIDR, using active subnet");
            return active_scope(active);
        }
    };

    if request.only_local_subnet {
        let Some(active_net) = active else {
            return Err(ScanError::NoActiveInterface);
        };
        if !within(&active_net, &net) {
            return overridden(active, requested);
        }
    }

    Ok(ResolvedScope {
        description: describe(&net),
        hosts: host_ips(&net),
        overridden: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpRange;

    fn active() -> Option<Ipv4Network> {
        Some(Ipv4Network::new(Ipv4Addr::new(192, 168, 1, 23), 24).unwrap())
    }

    fn request(cidr: &str, only_local: bool) -> ScopeRequest {
        ScopeRequest {
            cidr: cidr.to_string(),
            ip_range: None,
            only_local_subnet: only_local,
        }
    }

    #[test]
    fn test_host_ips_count() {
        for prefix in 16..=30u8 {
            let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), prefix).unwrap();
            let hosts = host_ips(&net);
            assert_eq!(hosts.len(), (1usize << (32 - prefix)) - 2);
            assert!(!hosts.contains(&net.network()));
            assert!(!hosts.contains(&net.broadcast()));
        }
    }

    #[test]
    fn test_host_ips_point_to_point() {
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 31).unwrap();
        assert!(host_ips(&net).is_empty());
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 1), 32).unwrap();
        assert!(host_ips(&net).is_empty());
    }

    #[test]
    fn test_resolve_local_cidr() {
        let scope = resolve_scope(&request("192.168.1.0/25", true), active()).unwrap();
        assert_eq!(scope.description, "192.168.1.0/25");
        assert_eq!(scope.hosts.len(), 126);
        assert!(!scope.overridden);
    }

    #[test]
    fn test_disjoint_cidr_is_overridden() {
        for cidr in ["10.0.0.0/24", "172.16.5.0/28", "192.168.0.0/16"] {
            let scope = resolve_scope(&request(cidr, true), active()).unwrap();
            assert_eq!(scope.description, "192.168.1.0/24");
            assert_eq!(scope.hosts.len(), 254);
            assert!(scope.overridden);
        }
    }

    #[test]
    fn test_remote_cidr_allowed_without_gate() {
        let scope = resolve_scope(&request("10.0.0.0/30", false), None).unwrap();
        assert_eq!(scope.hosts, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn test_unparsable_cidr_falls_back() {
        let scope = resolve_scope(&request("not-a-cidr", false), active()).unwrap();
        assert_eq!(scope.description, "192.168.1.0/24");
        assert!(matches!(
            resolve_scope(&request("not-a-cidr", false), None),
            Err(ScanError::NoActiveInterface)
        ));
    }

    #[test]
    fn test_oversized_cidr_falls_back() {
        let scope = resolve_scope(&request("10.0.0.0/8", false), active()).unwrap();
        assert_eq!(scope.description, "192.168.1.0/24");
    }

    #[test]
    fn test_wide_active_subnet_is_narrowed() {
        let wide = Some(Ipv4Network::new(Ipv4Addr::new(10, 1, 2, 3), 8).unwrap());
        let scope = resolve_scope(&request("10.0.0.0/8", false), wide).unwrap();
        assert_eq!(scope.description, "10.1.0.0/16");
        assert_eq!(scope.hosts.len(), 65_534);
        assert!(scope.hosts.len() as u64 <= MAX_SCOPE_ADDRESSES);

        let scope = resolve_scope(&request("172.16.0.0/24", true), wide).unwrap();
        assert!(scope.overridden);
        assert_eq!(scope.description, "10.1.0.0/16");

        let scope = resolve_scope(&request("10.1.2.0/24", true), wide).unwrap();
        assert_eq!(scope.description, "10.1.2.0/24");
    }

    #[test]
    fn test_empty_scope_is_error() {
        assert!(matches!(
            resolve_scope(&request("10.0.0.4/31", false), None),
            Err(ScanError::EmptyScope(_))
        ));
    }

    #[test]
    fn test_explicit_range_takes_precedence() {
        let req = ScopeRequest {
            cidr: "192.168.1.0/24".into(),
            ip_range: Some(IpRange {
                start: Ipv4Addr::new(192, 168, 1, 10),
                end: Ipv4Addr::new(192, 168, 1, 12),
            }),
            only_local_subnet: true,
        };
        let scope = resolve_scope(&req, active()).unwrap();
        assert_eq!(scope.description, "192.168.1.10-192.168.1.12");
        assert_eq!(scope.hosts.len(), 3);
    }

    #[test]
    fn test_remote_range_is_overridden() {
        let req = ScopeRequest {
            cidr: String::new(),
            ip_range: Some(IpRange {
                start: Ipv4Addr::new(10, 0, 0, 1),
                end: Ipv4Addr::new(10, 0, 0, 5),
            }),
            only_local_subnet: true,
        };
        let scope = resolve_scope(&req, active()).unwrap();
        assert!(scope.overridden);
        assert_eq!(scope.description, "192.168.1.0/24");
    }

    #[test]
    fn test_reversed_range_uses_cidr() {
        let req = ScopeRequest {
            cidr: "10.0.0.0/29".into(),
            ip_range: Some(IpRange {
                start: Ipv4Addr::new(10, 0, 0, 5),
                end: Ipv4Addr::new(10, 0, 0, 1),
            }),
            only_local_subnet: false,
        };
        let scope = resolve_scope(&req, None).unwrap();
        assert_eq!(scope.description, "10.0.0.0/29");
        assert_eq!(scope.hosts.len(), 6);
    }
}
