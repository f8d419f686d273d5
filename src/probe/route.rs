//! Source-address and egress-interface resolution.
//!
//! Raw-socket probes must carry a correct source: the TCP emitters resolve
//! the source IP the kernel would pick for a destination (UDP connect trick
//! — no packet leaves the machine), and the ARP emitter additionally needs
//! the egress interface's index, MAC and IPv4 address.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, UdpSocket};

use nix::ifaddrs::getifaddrs;

/// Resolve the IPv4 source address for reaching `dst`.
///
/// Connecting a UDP socket performs route selection without sending
/// anything; the local address of the connected socket is the answer.
pub fn source_addr_v4(probe: &UdpSocket, dst: Ipv4Addr) -> io::Result<Ipv4Addr> {
    probe.connect((dst, 80))?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("expected IPv4 source, got {other}"),
        )),
    }
}

/// Resolve the IPv6 source address for reaching `dst`.
pub fn source_addr_v6(probe: &UdpSocket, dst: Ipv6Addr) -> io::Result<Ipv6Addr> {
    probe.connect((dst, 80))?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V6(ip) => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("expected IPv6 source, got {other}"),
        )),
    }
}

/// Egress interface detail needed to emit a link-layer ARP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressInterface {
    pub name: String,
    pub index: i32,
    pub mac: [u8; 6],
    pub addr: Ipv4Addr,
}

/// True when `dst` falls inside the subnet `addr`/`mask`.
fn same_subnet(addr: Ipv4Addr, mask: Ipv4Addr, dst: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    (u32::from(addr) & mask) == (u32::from(dst) & mask)
}

/// Pick the interface an ARP request for `dst` should leave through.
///
/// Preference order: an interface whose IPv4 subnet contains `dst` (ARP only
/// resolves on-link), then the interface owning `src_hint` (the routed
/// source address). `None` means the host cannot be ARPed from here.
pub fn egress_interface_v4(dst: Ipv4Addr, src_hint: Ipv4Addr) -> Option<EgressInterface> {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, "getifaddrs failed, cannot resolve ARP interface");
            return None;
        }
    };

    // Two views of the interface list: link-layer info and IPv4 addressing.
    let mut links: Vec<(String, [u8; 6], i32)> = Vec::new();
    let mut inets: Vec<(String, Ipv4Addr, Ipv4Addr)> = Vec::new();

    for ifa in addrs {
        if let Some(link) = ifa.address.as_ref().and_then(|a| a.as_link_addr()) {
            if let Some(mac) = link.addr() {
                links.push((ifa.interface_name.clone(), mac, link.ifindex() as i32));
            }
            continue;
        }
        if let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let mask = ifa
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| m.ip())
                .unwrap_or(Ipv4Addr::BROADCAST);
            inets.push((ifa.interface_name.clone(), sin.ip(), mask));
        }
    }

    let pick = |name: &str, addr: Ipv4Addr| -> Option<EgressInterface> {
        links
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(n, mac, index)| EgressInterface {
                name: n.clone(),
                index: *index,
                mac: *mac,
                addr,
            })
    };

    for (name, addr, mask) in &inets {
        if same_subnet(*addr, *mask, dst) {
            if let Some(found) = pick(name, *addr) {
                return Some(found);
            }
        }
    }
    for (name, addr, _) in &inets {
        if *addr == src_hint {
            if let Some(found) = pick(name, *addr) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_subnet_24() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let addr = Ipv4Addr::new(192, 168, 1, 10);
        assert!(same_subnet(addr, mask, Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!same_subnet(addr, mask, Ipv4Addr::new(192, 168, 2, 77)));
    }

    #[test]
    fn test_same_subnet_host_route() {
        // A /32 netmask only matches the address itself.
        let mask = Ipv4Addr::BROADCAST;
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        assert!(same_subnet(addr, mask, addr));
        assert!(!same_subnet(addr, mask, Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    #[ignore] // Requires network access
    fn test_source_addr_v4_not_unspecified() {
        let probe = UdpSocket::bind("0.0.0.0:0").unwrap();
        let src = source_addr_v4(&probe, Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        assert!(!src.is_unspecified());
    }

    #[test]
    #[ignore] // Requires a configured interface
    fn test_egress_interface_for_loopback_hint() {
        let found = egress_interface_v4(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(127, 0, 0, 1));
        assert!(found.is_some());
    }
}
