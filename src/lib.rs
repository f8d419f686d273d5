//! Petrel — host-liveness preflight engine for vulnerability scanning.
//!
//! Given a target list of IPv4/IPv6 hosts, petrel probes each host with raw
//! ICMP echo requests, TCP SYN/ACK probes and ARP / Neighbor-Discovery
//! solicitations, sniffs the wire for matching replies through a BPF-filtered
//! capture handle, and publishes responsive hosts to a Redis-backed work
//! queue as they are observed. A downstream scanner consumes hosts from that
//! queue and is released by a terminal finish signal whose delivery is
//! guaranteed on every exit path.
//!
//! Linux only: requires `CAP_NET_RAW` for the probe sockets and the capture
//! handle. Root is not required.

pub mod cli;
pub mod config;
pub mod engine;
pub mod probe;
pub mod queue;
pub mod restrictions;
pub mod sniffer;
pub mod targets;

// Re-export the types a library consumer needs to drive a scan.
pub use config::ScanPrefs;
pub use engine::{AliveScan, ScanError, ScanSummary};
pub use queue::{MemorySink, RedisQueue, ResultSink};
pub use targets::{Target, TargetSet};

/// Source port of outgoing TCP probes. Replies are destined to this port,
/// which is what the sniffer's `dst port` filter term matches on.
pub const FILTER_PORT: u16 = 9910;

/// Number of probes to send before pausing within one method pass.
pub const BURST: u32 = 100;

/// Pause inserted after every [`BURST`] probes, in microseconds.
pub const BURST_TIMEOUT_US: u64 = 100_000;

// ─────────────────────────────────────────────────────────────────────────────
// Alive-test selector
// ─────────────────────────────────────────────────────────────────────────────

/// Bitset of liveness-detection methods for one scan.
///
/// The numeric values mirror the decimal bitmask accepted by the
/// `alive_test` preference, so a stored preference round-trips unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveTest(u8);

impl AliveTest {
    /// TCP probe with the ACK flag against the service port list.
    pub const TCP_ACK: AliveTest = AliveTest(1);
    /// ICMP echo request (ICMPv6 echo for v6 targets).
    pub const ICMP: AliveTest = AliveTest(2);
    /// ARP request (Neighbor Solicitation for v6 targets).
    pub const ARP: AliveTest = AliveTest(4);
    /// Skip probing entirely and mark every target alive.
    pub const CONSIDER_ALIVE: AliveTest = AliveTest(8);
    /// TCP probe with the SYN flag against the service port list.
    pub const TCP_SYN: AliveTest = AliveTest(16);

    /// No methods selected.
    pub const fn empty() -> Self {
        AliveTest(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: AliveTest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any TCP-based method is selected.
    pub const fn wants_tcp(self) -> bool {
        self.0 & (Self::TCP_ACK.0 | Self::TCP_SYN.0) != 0
    }

    /// Raw bitmask value, as stored in the `alive_test` preference.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Parse a selector from a preference string.
    ///
    /// Accepts a decimal bitmask ("3") or a comma-separated method list
    /// ("icmp,arp"). An empty selector falls back to ICMP, matching the
    /// scanner-wide default.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::ICMP);
        }
        if let Ok(bits) = s.parse::<u8>() {
            if bits & !0b11111 != 0 {
                return Err(format!("unknown alive test bits in '{s}'"));
            }
            let parsed = AliveTest(bits);
            return Ok(if parsed.is_empty() { Self::ICMP } else { parsed });
        }
        let mut out = Self::empty();
        for name in s.split(',') {
            out = out
                | match name.trim().to_ascii_lowercase().as_str() {
                    "icmp" => Self::ICMP,
                    "tcp_ack" | "tcp-ack" => Self::TCP_ACK,
                    "tcp_syn" | "tcp-syn" => Self::TCP_SYN,
                    "arp" => Self::ARP,
                    "consider_alive" | "consider-alive" => Self::CONSIDER_ALIVE,
                    other => return Err(format!("unknown alive test method '{other}'")),
                };
        }
        Ok(out)
    }
}

impl Default for AliveTest {
    fn default() -> Self {
        Self::ICMP
    }
}

impl std::ops::BitOr for AliveTest {
    type Output = AliveTest;

    fn bitor(self, rhs: AliveTest) -> AliveTest {
        AliveTest(self.0 | rhs.0)
    }
}

impl std::fmt::Display for AliveTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::TCP_ACK) {
            names.push("tcp_ack");
        }
        if self.contains(Self::ICMP) {
            names.push("icmp");
        }
        if self.contains(Self::ARP) {
            names.push("arp");
        }
        if self.contains(Self::CONSIDER_ALIVE) {
            names.push("consider_alive");
        }
        if self.contains(Self::TCP_SYN) {
            names.push("tcp_syn");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_test_bitmask_values() {
        assert_eq!(AliveTest::TCP_ACK.bits(), 1);
        assert_eq!(AliveTest::ICMP.bits(), 2);
        assert_eq!(AliveTest::ARP.bits(), 4);
        assert_eq!(AliveTest::CONSIDER_ALIVE.bits(), 8);
        assert_eq!(AliveTest::TCP_SYN.bits(), 16);
    }

    #[test]
    fn test_alive_test_parse_decimal() {
        let t = AliveTest::parse("3").unwrap();
        assert!(t.contains(AliveTest::TCP_ACK));
        assert!(t.contains(AliveTest::ICMP));
        assert!(!t.contains(AliveTest::ARP));
    }

    #[test]
    fn test_alive_test_parse_names() {
        let t = AliveTest::parse("icmp,arp").unwrap();
        assert!(t.contains(AliveTest::ICMP));
        assert!(t.contains(AliveTest::ARP));
        assert!(!t.wants_tcp());
    }

    #[test]
    fn test_alive_test_parse_empty_defaults_to_icmp() {
        assert_eq!(AliveTest::parse("").unwrap(), AliveTest::ICMP);
        assert_eq!(AliveTest::parse("0").unwrap(), AliveTest::ICMP);
    }

    #[test]
    fn test_alive_test_parse_rejects_unknown() {
        assert!(AliveTest::parse("smurf").is_err());
        assert!(AliveTest::parse("64").is_err());
    }

    #[test]
    fn test_alive_test_wants_tcp() {
        assert!(AliveTest::TCP_ACK.wants_tcp());
        assert!(AliveTest::TCP_SYN.wants_tcp());
        assert!(!(AliveTest::ICMP | AliveTest::ARP).wants_tcp());
    }

    #[test]
    fn test_alive_test_display_roundtrip() {
        let t = AliveTest::ICMP | AliveTest::ARP;
        assert_eq!(t.to_string(), "icmp,arp");
        assert_eq!(AliveTest::parse(&t.to_string()).unwrap(), t);
    }
}
