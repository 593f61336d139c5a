//! Resolution of the IP address a node binds its push sockets on and
//! advertises to peers.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::{debug, warn};

/// Address used to discover the outbound interface.  No packet is sent:
/// connecting a UDP socket only selects a route.
const PROBE_TARGET: &str = "8.8.8.8:80";

/// Returns `configured` if set, otherwise the address of the interface that
/// routes to the public internet, otherwise `127.0.0.1`.
pub fn resolve_host(configured: Option<IpAddr>) -> IpAddr {
    if let Some(ip) = configured {
        return ip;
    }
    match outbound_interface() {
        Some(ip) => {
            debug!("resolved host address {ip}");
            ip
        }
        None => {
            warn!("could not determine an outbound interface; using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn outbound_interface() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(PROBE_TARGET).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_address_wins() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(resolve_host(Some(ip)), ip);
    }

    #[test]
    fn test_resolved_address_is_never_unspecified() {
        // Depends on the machine's routes, so only the invariant is checked.
        assert!(!resolve_host(None).is_unspecified());
    }
}
