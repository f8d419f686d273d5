//! Socket factory: raw and packet sockets for the probe emitters.
//!
//! Each enabled method gets the minimum socket set it needs, opened up front
//! so a missing capability fails the scan before any probe is sent. Sockets
//! are RAII wrappers around raw fds — on a partial init failure the already
//! opened fds close on drop, leaving nothing behind.
//!
//! Requires `CAP_NET_RAW`; root is not needed.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, UdpSocket};

use thiserror::Error;

use crate::AliveTest;

/// Socket kinds the factory can open, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    IcmpV4,
    IcmpV6,
    TcpV4,
    TcpV6,
    UdpV4,
    UdpV6,
    ArpV4,
    /// ICMPv6 socket used for Neighbor Discovery (the v6 ARP equivalent).
    NdV6,
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SocketKind::IcmpV4 => "ICMPv4",
            SocketKind::IcmpV6 => "ICMPv6",
            SocketKind::TcpV4 => "TCPv4",
            SocketKind::TcpV6 => "TCPv6",
            SocketKind::UdpV4 => "UDPv4",
            SocketKind::UdpV6 => "UDPv6",
            SocketKind::ArpV4 => "ARPv4",
            SocketKind::NdV6 => "NDv6",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to open {kind} socket (requires CAP_NET_RAW): {source}")]
    Open { kind: SocketKind, source: io::Error },
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII raw socket
// ─────────────────────────────────────────────────────────────────────────────

/// Owned raw socket fd, closed on drop.
#[derive(Debug)]
pub struct RawSocket {
    fd: i32,
}

impl RawSocket {
    fn open(domain: i32, protocol: i32, kind: SocketKind) -> Result<Self, SocketError> {
        let fd = unsafe { libc::socket(domain, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(SocketError::Open {
                kind,
                source: io::Error::last_os_error(),
            });
        }
        Ok(RawSocket { fd })
    }

    /// Send `buf` to an IPv4 destination.
    pub fn send_to_v4(&self, buf: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(dst.octets()),
            },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send `buf` to an IPv6 destination.
    pub fn send_to_v6(&self, buf: &[u8], dst: Ipv6Addr) -> io::Result<()> {
        let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_addr = libc::in6_addr {
            s6_addr: dst.octets(),
        };
        let ret = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send a link-layer frame out of the interface `ifindex`, addressed to
    /// the broadcast MAC.
    pub fn send_to_link(&self, frame: &[u8], ifindex: i32) -> io::Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        addr.sll_ifindex = ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&super::packet::MAC_BROADCAST);
        let ret = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket set
// ─────────────────────────────────────────────────────────────────────────────

/// The sockets held for the lifetime of one scan. Only the sockets of
/// enabled methods are populated.
#[derive(Debug, Default)]
pub struct SocketSet {
    pub icmpv4: Option<RawSocket>,
    pub icmpv6: Option<RawSocket>,
    pub tcpv4: Option<RawSocket>,
    pub tcpv6: Option<RawSocket>,
    /// Datagram sockets used only to probe source-address/route selection.
    pub udpv4: Option<UdpSocket>,
    pub udpv6: Option<UdpSocket>,
    pub arpv4: Option<RawSocket>,
    pub ndv6: Option<RawSocket>,
}

impl SocketSet {
    /// Open every socket the selected methods need.
    ///
    /// Returns the fully opened set or the error for the first socket kind
    /// that failed; partially opened sockets are closed by drop.
    pub fn open(selector: AliveTest) -> Result<Self, SocketError> {
        let mut set = SocketSet::default();

        if selector.contains(AliveTest::ICMP) {
            set.icmpv4 = Some(RawSocket::open(
                libc::AF_INET,
                libc::IPPROTO_ICMP,
                SocketKind::IcmpV4,
            )?);
            set.icmpv6 = Some(RawSocket::open(
                libc::AF_INET6,
                libc::IPPROTO_ICMPV6,
                SocketKind::IcmpV6,
            )?);
        }

        if selector.wants_tcp() {
            // IPPROTO_RAW implies IP_HDRINCL: the emitter's IPv4 header goes
            // on the wire verbatim.
            set.tcpv4 = Some(RawSocket::open(
                libc::AF_INET,
                libc::IPPROTO_RAW,
                SocketKind::TcpV4,
            )?);
            set.tcpv6 = Some(RawSocket::open(
                libc::AF_INET6,
                libc::IPPROTO_TCP,
                SocketKind::TcpV6,
            )?);
            set.udpv4 = Some(UdpSocket::bind("0.0.0.0:0").map_err(|source| {
                SocketError::Open {
                    kind: SocketKind::UdpV4,
                    source,
                }
            })?);
            set.udpv6 = Some(UdpSocket::bind("[::]:0").map_err(|source| SocketError::Open {
                kind: SocketKind::UdpV6,
                source,
            })?);
        }

        if selector.contains(AliveTest::ARP) {
            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW,
                    (libc::ETH_P_ARP as u16).to_be() as i32,
                )
            };
            if fd < 0 {
                return Err(SocketError::Open {
                    kind: SocketKind::ArpV4,
                    source: io::Error::last_os_error(),
                });
            }
            set.arpv4 = Some(RawSocket { fd });
            set.ndv6 = Some(RawSocket::open(
                libc::AF_INET6,
                libc::IPPROTO_ICMPV6,
                SocketKind::NdV6,
            )?);
        }

        Ok(set)
    }
}
