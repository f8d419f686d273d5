//! Target set: canonical IP string → target descriptor.
//!
//! Targets are stored in their 128-bit address form — IPv4 hosts as
//! IPv4-mapped IPv6 addresses — because the probe emitters branch on exactly
//! that property. The key set is fixed after construction; iteration order is
//! the order targets were added.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};

/// One host whose liveness is to be determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    addr: Ipv6Addr,
}

impl Target {
    pub fn new(ip: IpAddr) -> Self {
        let addr = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Target { addr }
    }

    /// The 128-bit address form (IPv4 targets are IPv4-mapped).
    pub fn addr6(&self) -> Ipv6Addr {
        self.addr
    }

    /// True when this target is an IPv4 host carried as a mapped address.
    pub fn is_v4(&self) -> bool {
        self.addr.to_ipv4_mapped().is_some()
    }

    /// The address in its natural family.
    pub fn ip(&self) -> IpAddr {
        match self.addr.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.addr),
        }
    }

    /// Canonical string form: dotted quad for IPv4, RFC 5952 lowercase for
    /// IPv6. This is the key used across the alive/suppressed/target sets.
    pub fn canonical(&self) -> String {
        self.ip().to_string()
    }
}

/// Canonical string form for any address, matching [`Target::canonical`].
pub fn canonical_str(ip: IpAddr) -> String {
    Target::new(ip).canonical()
}

/// The immutable set of hosts to alive-test, keyed by canonical string.
#[derive(Debug, Default)]
pub struct TargetSet {
    by_key: HashMap<String, Target>,
    order: Vec<String>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target. Duplicates (after canonicalisation) are ignored.
    pub fn insert(&mut self, ip: IpAddr) {
        let target = Target::new(ip);
        let key = target.canonical();
        if self.by_key.insert(key.clone(), target).is_none() {
            self.order.push(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate targets in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Target)> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), &self.by_key[k]))
    }

    /// Iterate canonical keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

impl FromIterator<IpAddr> for TargetSet {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut set = TargetSet::new();
        for ip in iter {
            set.insert(ip);
        }
        set
    }
}
