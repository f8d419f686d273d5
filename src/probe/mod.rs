//! Probe emitter: one pass per enabled method over the target set.
//!
//! Each pass iterates every target, crafts the method's packet(s) and sends
//! them through the scan's raw sockets. Passes are burst-paced and stop
//! early once the alive-cap latch is set. Per-packet send failures are
//! logged and skipped; losing a socket fd mid-scan is the only fatal
//! emitter condition.

pub mod packet;
pub mod route;
pub mod sockets;

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::targets::{Target, TargetSet};
use crate::{BURST, BURST_TIMEOUT_US, FILTER_PORT};

pub use packet::TcpFlag;
pub use sockets::{SocketError, SocketKind, SocketSet};

/// A probing method the orchestrator can run a pass for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Tcp,
    Icmp,
    Arp,
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMethod::Tcp => write!(f, "tcp"),
            ProbeMethod::Icmp => write!(f, "icmp"),
            ProbeMethod::Arp => write!(f, "arp"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{kind} socket lost mid-scan: {source}")]
    SocketLost { kind: SocketKind, source: io::Error },

    #[error("{kind} socket missing for an enabled method")]
    SocketMissing { kind: SocketKind },
}

// ─────────────────────────────────────────────────────────────────────────────
// Burst pacing
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-count-then-sleep rate limiter, reset per method pass.
#[derive(Debug, Default)]
struct BurstPacer {
    sent: u32,
}

impl BurstPacer {
    fn new() -> Self {
        Self::default()
    }

    /// Count one emission; returns true when the pass should pause.
    fn tick(&mut self) -> bool {
        self.sent += 1;
        self.sent % BURST == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Emitter
// ─────────────────────────────────────────────────────────────────────────────

/// Per-scan probe emitter. Borrows the socket set and target set from the
/// orchestrator; reads the alive-cap latch lock-free between targets.
pub struct ProbeEmitter<'a> {
    sockets: &'a SocketSet,
    targets: &'a TargetSet,
    tcp_ports: &'a [u16],
    tcp_flag: TcpFlag,
    alive_cap: Arc<AtomicBool>,
}

impl<'a> ProbeEmitter<'a> {
    pub fn new(
        sockets: &'a SocketSet,
        targets: &'a TargetSet,
        tcp_ports: &'a [u16],
        tcp_flag: TcpFlag,
        alive_cap: Arc<AtomicBool>,
    ) -> Self {
        ProbeEmitter {
            sockets,
            targets,
            tcp_ports,
            tcp_flag,
            alive_cap,
        }
    }

    /// Run one pass of `method` over the target set.
    ///
    /// Returns the number of targets the pass reached before completing or
    /// being stopped by the alive cap (used for end-of-scan accounting).
    pub fn run_method(&self, method: ProbeMethod) -> Result<u64, ProbeError> {
        tracing::debug!(method = %method, "probe pass started");
        let checked = run_gated_pass(self.targets, &self.alive_cap, |target| match method {
            ProbeMethod::Tcp => self.emit_tcp(target),
            ProbeMethod::Icmp => self.emit_icmp(target),
            ProbeMethod::Arp => self.emit_arp(target),
        })?;
        tracing::debug!(method = %method, targets = checked, "probe pass finished");
        Ok(checked)
    }

    fn emit_icmp(&self, target: &Target) -> Result<(), ProbeError> {
        if let Some(dst) = target.addr6().to_ipv4_mapped() {
            let sock = require(&self.sockets.icmpv4, SocketKind::IcmpV4)?;
            let pkt = packet::build_icmpv4_echo(rand::random(), rand::random());
            if let Err(e) = sock.send_to_v4(&pkt, dst) {
                return send_failed(SocketKind::IcmpV4, target, e);
            }
        } else {
            let sock = require(&self.sockets.icmpv6, SocketKind::IcmpV6)?;
            let pkt = packet::build_icmpv6_echo(rand::random(), rand::random());
            if let Err(e) = sock.send_to_v6(&pkt, target.addr6()) {
                return send_failed(SocketKind::IcmpV6, target, e);
            }
        }
        Ok(())
    }

    fn emit_tcp(&self, target: &Target) -> Result<(), ProbeError> {
        if let Some(dst) = target.addr6().to_ipv4_mapped() {
            let sock = require(&self.sockets.tcpv4, SocketKind::TcpV4)?;
            let udp = require_udp(&self.sockets.udpv4, SocketKind::UdpV4)?;
            let src = match route::source_addr_v4(udp, dst) {
                Ok(src) => src,
                Err(e) => {
                    tracing::warn!(host = %target.canonical(), error = %e, "no route to host, skipping");
                    return Ok(());
                }
            };
            for &port in self.tcp_ports {
                let pkt = packet::build_tcp_probe_v4(
                    src,
                    dst,
                    FILTER_PORT,
                    port,
                    self.tcp_flag,
                    rand::random(),
                );
                if let Err(e) = sock.send_to_v4(&pkt, dst) {
                    return send_failed(SocketKind::TcpV4, target, e);
                }
            }
        } else {
            let dst = target.addr6();
            let sock = require(&self.sockets.tcpv6, SocketKind::TcpV6)?;
            let udp = require_udp(&self.sockets.udpv6, SocketKind::UdpV6)?;
            let src = match route::source_addr_v6(udp, dst) {
                Ok(src) => src,
                Err(e) => {
                    tracing::warn!(host = %target.canonical(), error = %e, "no route to host, skipping");
                    return Ok(());
                }
            };
            for &port in self.tcp_ports {
                let pkt = packet::build_tcp_probe_v6(
                    src,
                    dst,
                    FILTER_PORT,
                    port,
                    self.tcp_flag,
                    rand::random(),
                );
                if let Err(e) = sock.send_to_v6(&pkt, dst) {
                    return send_failed(SocketKind::TcpV6, target, e);
                }
            }
        }
        Ok(())
    }

    fn emit_arp(&self, target: &Target) -> Result<(), ProbeError> {
        if let Some(dst) = target.addr6().to_ipv4_mapped() {
            let sock = require(&self.sockets.arpv4, SocketKind::ArpV4)?;
            let hint = self
                .sockets
                .udpv4
                .as_ref()
                .and_then(|udp| route::source_addr_v4(udp, dst).ok())
                .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
            let Some(iface) = route::egress_interface_v4(dst, hint) else {
                tracing::warn!(host = %target.canonical(), "no ARP-capable interface, skipping");
                return Ok(());
            };
            let frame = packet::build_arp_request(iface.mac, iface.addr, dst);
            if let Err(e) = sock.send_to_link(&frame, iface.index) {
                return send_failed(SocketKind::ArpV4, target, e);
            }
        } else {
            // v6 has no ARP: Neighbor Discovery plays the same role.
            let sock = require(&self.sockets.ndv6, SocketKind::NdV6)?;
            let pkt = packet::build_neighbor_solicit(&target.addr6());
            if let Err(e) = sock.send_to_v6(&pkt, target.addr6()) {
                return send_failed(SocketKind::NdV6, target, e);
            }
        }
        Ok(())
    }
}

/// Iterate targets, re-checking the alive-cap latch before each one and
/// applying burst pacing after each emission. Factored out of the emitter
/// so the gating contract is testable without sockets.
fn run_gated_pass(
    targets: &TargetSet,
    alive_cap: &AtomicBool,
    mut emit: impl FnMut(&Target) -> Result<(), ProbeError>,
) -> Result<u64, ProbeError> {
    let mut pacer = BurstPacer::new();
    let mut checked = 0u64;
    for (_, target) in targets.iter() {
        if alive_cap.load(Ordering::Relaxed) {
            break;
        }
        emit(target)?;
        checked += 1;
        if pacer.tick() {
            std::thread::sleep(Duration::from_micros(BURST_TIMEOUT_US));
        }
    }
    Ok(checked)
}

fn require<'s>(
    sock: &'s Option<sockets::RawSocket>,
    kind: SocketKind,
) -> Result<&'s sockets::RawSocket, ProbeError> {
    sock.as_ref().ok_or(ProbeError::SocketMissing { kind })
}

fn require_udp<'s>(
    sock: &'s Option<UdpSocket>,
    kind: SocketKind,
) -> Result<&'s UdpSocket, ProbeError> {
    sock.as_ref().ok_or(ProbeError::SocketMissing { kind })
}

/// Per-packet failure policy: a vanished fd is fatal, anything else is a
/// transient send failure that must not end the scan.
fn send_failed(kind: SocketKind, target: &Target, e: io::Error) -> Result<(), ProbeError> {
    if e.raw_os_error() == Some(libc::EBADF) {
        return Err(ProbeError::SocketLost { kind, source: e });
    }
    tracing::debug!(host = %target.canonical(), socket = %kind, error = %e, "probe send failed");
    Ok(())
}
