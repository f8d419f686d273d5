//! Wire-format builders for the probe emitters.
//!
//! Everything here is packet construction only — no sockets, no I/O — so the
//! byte layouts are fully exercised by unit tests without privileges. The
//! ICMPv4 and TCP checksums are computed here; ICMPv6 checksums are left
//! zero because the kernel fills them on raw `IPPROTO_ICMPV6` sockets.

use std::net::{Ipv4Addr, Ipv6Addr};

/// ICMPv4 echo request type.
pub const ICMP_ECHO_REQUEST: u8 = 8;
/// ICMPv6 echo request type.
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
/// ICMPv6 neighbor solicitation type.
pub const ICMPV6_NEIGHBOR_SOLICIT: u8 = 135;

/// TCP flag carried by the probe, chosen per scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlag {
    Syn,
    Ack,
}

impl TcpFlag {
    pub const fn bits(self) -> u8 {
        match self {
            TcpFlag::Syn => 0x02,
            TcpFlag::Ack => 0x10,
        }
    }
}

impl std::fmt::Display for TcpFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpFlag::Syn => write!(f, "SYN"),
            TcpFlag::Ack => write!(f, "ACK"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ICMP / ND
// ─────────────────────────────────────────────────────────────────────────────

/// Build an ICMPv4 echo request (header only, no payload).
///
/// The kernel prepends the IPv4 header on a raw `IPPROTO_ICMP` socket.
pub fn build_icmpv4_echo(id: u16, seq: u16) -> [u8; 8] {
    let mut pkt = [0u8; 8];
    pkt[0] = ICMP_ECHO_REQUEST;
    // code = 0
    pkt[4..6].copy_from_slice(&id.to_be_bytes());
    pkt[6..8].copy_from_slice(&seq.to_be_bytes());
    let cksum = ones_complement_sum(&pkt);
    pkt[2..4].copy_from_slice(&cksum.to_be_bytes());
    pkt
}

/// Build an ICMPv6 echo request (header only). Checksum stays zero — raw
/// `IPPROTO_ICMPV6` sockets must leave it to the kernel.
pub fn build_icmpv6_echo(id: u16, seq: u16) -> [u8; 8] {
    let mut pkt = [0u8; 8];
    pkt[0] = ICMPV6_ECHO_REQUEST;
    pkt[4..6].copy_from_slice(&id.to_be_bytes());
    pkt[6..8].copy_from_slice(&seq.to_be_bytes());
    pkt
}

/// Build a neighbor solicitation for `target`, sent unicast to the target
/// itself (conforming stacks answer unicast solicitations without a source
/// link-layer option). Checksum is kernel-filled, as for echo.
pub fn build_neighbor_solicit(target: &Ipv6Addr) -> [u8; 24] {
    let mut pkt = [0u8; 24];
    pkt[0] = ICMPV6_NEIGHBOR_SOLICIT;
    // code = 0, checksum kernel-filled, 4 reserved bytes zero
    pkt[8..24].copy_from_slice(&target.octets());
    pkt
}

// ─────────────────────────────────────────────────────────────────────────────
// TCP probes
// ─────────────────────────────────────────────────────────────────────────────

/// Size of a v4 TCP probe: 20-byte IPv4 header + 20-byte TCP header.
pub const TCP_PROBE_V4_SIZE: usize = 40;
/// Size of a v6 TCP probe segment (the kernel supplies the IPv6 header).
pub const TCP_PROBE_V6_SIZE: usize = 20;

/// Build a complete IPv4 + TCP probe packet for a raw `IPPROTO_RAW` socket
/// (implicit `IP_HDRINCL` — the header below goes on the wire verbatim).
pub fn build_tcp_probe_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flag: TcpFlag,
    seq: u32,
) -> [u8; TCP_PROBE_V4_SIZE] {
    let mut pkt = [0u8; TCP_PROBE_V4_SIZE];

    // IPv4 header (bytes 0–19)
    pkt[0] = 0x45; // version 4, IHL 5
    pkt[2..4].copy_from_slice(&(TCP_PROBE_V4_SIZE as u16).to_be_bytes());
    let ip_id: u16 = rand::random();
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
    pkt[8] = 64; // TTL
    pkt[9] = libc::IPPROTO_TCP as u8;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    // TCP header (bytes 20–39)
    write_tcp_header(&mut pkt[20..40], src_port, dst_port, flag, seq);

    let tcp_cksum = compute_tcp_checksum_v4(&pkt[20..40], &src, &dst);
    pkt[36..38].copy_from_slice(&tcp_cksum.to_be_bytes());

    let ip_cksum = compute_ip_checksum(&pkt[0..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    pkt
}

/// Build the TCP segment of a v6 probe. The kernel prepends the IPv6 header
/// on a raw `IPPROTO_TCP` socket; the pseudo-header checksum is ours.
pub fn build_tcp_probe_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    flag: TcpFlag,
    seq: u32,
) -> [u8; TCP_PROBE_V6_SIZE] {
    let mut pkt = [0u8; TCP_PROBE_V6_SIZE];
    write_tcp_header(&mut pkt, src_port, dst_port, flag, seq);
    let cksum = compute_tcp_checksum_v6(&pkt, &src, &dst);
    pkt[16..18].copy_from_slice(&cksum.to_be_bytes());
    pkt
}

fn write_tcp_header(buf: &mut [u8], src_port: u16, dst_port: u16, flag: TcpFlag, seq: u32) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    // acknowledgement = 0
    buf[12] = 5 << 4; // data offset 5 words, no options
    buf[13] = flag.bits();
    buf[14..16].copy_from_slice(&1024u16.to_be_bytes()); // window
                                                         // checksum computed by caller, urgent pointer 0
}

// ─────────────────────────────────────────────────────────────────────────────
// ARP
// ─────────────────────────────────────────────────────────────────────────────

/// Size of an ARP request frame: 14-byte Ethernet header + 28-byte ARP body.
pub const ARP_FRAME_SIZE: usize = 42;

/// Broadcast destination MAC.
pub const MAC_BROADCAST: [u8; 6] = [0xff; 6];

/// Build a broadcast ARP who-has frame for `dst_ip`, sourced from the
/// resolved egress interface's MAC and IPv4 address.
pub fn build_arp_request(
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) -> [u8; ARP_FRAME_SIZE] {
    let mut frame = [0u8; ARP_FRAME_SIZE];

    // Ethernet header
    frame[0..6].copy_from_slice(&MAC_BROADCAST);
    frame[6..12].copy_from_slice(&src_mac);
    frame[12..14].copy_from_slice(&(libc::ETH_P_ARP as u16).to_be_bytes());

    // ARP body
    frame[14..16].copy_from_slice(&1u16.to_be_bytes()); // htype: Ethernet
    frame[16..18].copy_from_slice(&0x0800u16.to_be_bytes()); // ptype: IPv4
    frame[18] = 6; // hlen
    frame[19] = 4; // plen
    frame[20..22].copy_from_slice(&1u16.to_be_bytes()); // opcode: request
    frame[22..28].copy_from_slice(&src_mac);
    frame[28..32].copy_from_slice(&src_ip.octets());
    // target MAC unknown (zero)
    frame[38..42].copy_from_slice(&dst_ip.octets());

    frame
}

// ─────────────────────────────────────────────────────────────────────────────
// Checksums
// ─────────────────────────────────────────────────────────────────────────────

/// Internet checksum: one's complement of the one's-complement sum of
/// 16-bit words, odd trailing byte padded with zero.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// IPv4 header checksum. The checksum field (bytes 10–11) must be zero when
/// this is called.
pub fn compute_ip_checksum(header: &[u8]) -> u16 {
    ones_complement_sum(header)
}

/// TCP checksum over the IPv4 pseudo-header (src, dst, proto, length) plus
/// the segment. The segment's checksum field must be zero.
pub fn compute_tcp_checksum_v4(segment: &[u8], src: &Ipv4Addr, dst: &Ipv4Addr) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.push(0);
    buf.push(libc::IPPROTO_TCP as u8);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    ones_complement_sum(&buf)
}

/// TCP checksum over the IPv6 pseudo-header plus the segment.
pub fn compute_tcp_checksum_v6(segment: &[u8], src: &Ipv6Addr, dst: &Ipv6Addr) -> u16 {
    let mut buf = Vec::with_capacity(40 + segment.len());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(&(segment.len() as u32).to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, libc::IPPROTO_TCP as u8]);
    buf.extend_from_slice(segment);
    ones_complement_sum(&buf)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
