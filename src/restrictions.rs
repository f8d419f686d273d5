//! Restriction manager: quota accounting and reply bookkeeping.
//!
//! [`ScanState`] is shared between the sniffer thread and the orchestrator
//! behind one mutex. During the scan the sniffer is the only locker (plus
//! the main thread for consider-alive targets), so the probe path never
//! contends; the orchestrator locks again only after the sniffer has been
//! stopped. The single lock-free crossing is the emitter's read of the
//! alive-cap latch, a relaxed atomic — a delayed stop is acceptable, a torn
//! read is impossible.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::queue::{self, ResultSink};
use crate::targets::TargetSet;

/// Quota state for one scan.
///
/// Both caps default to effective infinity. When a scan cap is configured,
/// a smaller alive cap is raised to match it — stopping probe emission
/// below the publication budget could never fill the queue. An alive cap
/// configured on its own stands as given.
#[derive(Debug)]
pub struct ScanRestrictions {
    max_scan_hosts: u64,
    max_alive_hosts: u64,
    alive_count: u64,
    scan_cap_reached: bool,
    alive_cap: Arc<AtomicBool>,
}

impl ScanRestrictions {
    pub fn new(max_scan_hosts: Option<u64>, max_alive_hosts: Option<u64>) -> Self {
        let scan_cap_configured = max_scan_hosts.is_some();
        let max_scan_hosts = max_scan_hosts.unwrap_or(u64::MAX);
        let mut max_alive_hosts = max_alive_hosts.unwrap_or(u64::MAX);
        if scan_cap_configured && max_alive_hosts < max_scan_hosts {
            max_alive_hosts = max_scan_hosts;
        }
        ScanRestrictions {
            max_scan_hosts,
            max_alive_hosts,
            alive_count: 0,
            scan_cap_reached: false,
            alive_cap: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle to the latching alive-cap flag, polled lock-free by the
    /// emitter and the sniffer loop.
    pub fn alive_cap_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive_cap)
    }

    pub fn alive_count(&self) -> u64 {
        self.alive_count
    }

    pub fn scan_cap_reached(&self) -> bool {
        self.scan_cap_reached
    }

    pub fn alive_cap_reached(&self) -> bool {
        self.alive_cap.load(Ordering::Relaxed)
    }

    pub fn max_alive_hosts(&self) -> u64 {
        self.max_alive_hosts
    }
}

/// Reply bookkeeping plus the queue connection, owned by the orchestrator
/// and lent to the sniffer thread for the duration of the scan.
pub struct ScanState {
    /// Hosts seen responding, by canonical string. Grows monotonically; may
    /// include responders outside the target list.
    alive: HashSet<String>,
    /// Alive targets withheld from the queue because the scan cap had
    /// already latched. Counted as dead for progress reporting.
    suppressed: HashSet<String>,
    restrictions: ScanRestrictions,
    sink: Box<dyn ResultSink>,
}

impl ScanState {
    pub fn new(restrictions: ScanRestrictions, sink: Box<dyn ResultSink>) -> Self {
        ScanState {
            alive: HashSet::new(),
            suppressed: HashSet::new(),
            restrictions,
            sink,
        }
    }

    pub fn restrictions(&self) -> &ScanRestrictions {
        &self.restrictions
    }

    pub fn alive_len(&self) -> usize {
        self.alive.len()
    }

    /// Record a sniffed source address. Insertion into the alive set is the
    /// deduplication test: only the first sighting of an address that is
    /// also a target reaches [`observe`](Self::observe). Returns whether
    /// this call observed a new target.
    pub fn record_reply(&mut self, addr: &str, targets: &TargetSet) -> bool {
        if !self.alive.insert(addr.to_string()) {
            return false;
        }
        if !targets.contains(addr) {
            return false;
        }
        self.observe(addr);
        true
    }

    /// Account one newly-alive target and gate its publication.
    ///
    /// Ordering is load-bearing: the host that reaches `max_scan_hosts` is
    /// itself published, immediately followed by the finish sentinel; every
    /// later host is suppressed. The alive cap latches last so the emitter
    /// stops after the count first equals `max_alive_hosts`.
    pub fn observe(&mut self, addr: &str) {
        self.restrictions.alive_count += 1;

        if !self.restrictions.scan_cap_reached {
            if let Err(e) = self.sink.push_host(addr) {
                tracing::warn!(host = addr, error = %e, "failed to publish alive host");
            }
        } else {
            self.suppressed.insert(addr.to_string());
        }

        if !self.restrictions.scan_cap_reached
            && self.restrictions.alive_count == self.restrictions.max_scan_hosts
        {
            self.restrictions.scan_cap_reached = true;
            if let Err(e) = self.sink.push_finish() {
                tracing::debug!(error = %e, "failed to publish finish signal at scan cap");
            }
        }

        if self.restrictions.alive_count == self.restrictions.max_alive_hosts {
            self.restrictions.alive_cap.store(true, Ordering::Relaxed);
        }
    }

    /// Dead targets for progress reporting: targets with no reply, plus
    /// alive targets that were suppressed by the scan cap (no downstream
    /// scan will ever start for them).
    pub fn dead_host_count(&self, targets: &TargetSet) -> u64 {
        targets
            .keys()
            .filter(|k| !self.alive.contains(*k) || self.suppressed.contains(*k))
            .count() as u64
    }

    pub fn push_finish(&mut self) -> Result<(), queue::QueueError> {
        self.sink.push_finish()
    }

    pub fn push_status(&mut self, msg: &str) -> Result<(), queue::QueueError> {
        self.sink.push_status(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemorySink, QueueMessage};
    use std::net::IpAddr;

    fn targets(addrs: &[&str]) -> TargetSet {
        addrs
            .iter()
            .map(|s| s.parse::<IpAddr>().unwrap())
            .collect()
    }

    fn state_with_sink(
        max_scan: Option<u64>,
        max_alive: Option<u64>,
    ) -> (ScanState, MemorySink) {
        let sink = MemorySink::new();
        let state = ScanState::new(
            ScanRestrictions::new(max_scan, max_alive),
            Box::new(sink.clone()),
        );
        (state, sink)
    }

    #[test]
    fn test_alive_cap_raised_to_scan_cap() {
        let r = ScanRestrictions::new(Some(10), Some(3));
        assert_eq!(r.max_alive_hosts(), 10);
    }

    #[test]
    fn test_standalone_alive_cap_is_not_raised() {
        // Without a configured scan cap there is no publication budget to
        // protect; the alive cap must stand so emission actually halts.
        let r = ScanRestrictions::new(None, Some(3));
        assert_eq!(r.max_alive_hosts(), 3);
    }

    #[test]
    fn test_caps_default_to_infinity() {
        let r = ScanRestrictions::new(None, None);
        assert_eq!(r.max_alive_hosts(), u64::MAX);
        assert!(!r.scan_cap_reached());
        assert!(!r.alive_cap_reached());
    }

    #[test]
    fn test_duplicate_replies_observe_once() {
        let t = targets(&["10.0.0.1"]);
        let (mut state, sink) = state_with_sink(None, None);
        assert!(state.record_reply("10.0.0.1", &t));
        assert!(!state.record_reply("10.0.0.1", &t));
        assert!(!state.record_reply("10.0.0.1", &t));
        assert_eq!(state.restrictions().alive_count(), 1);
        assert_eq!(sink.hosts(), vec!["10.0.0.1"]);
    }

    #[test]
    fn test_non_target_replies_are_ignored() {
        let t = targets(&["10.0.0.1"]);
        let (mut state, sink) = state_with_sink(None, None);
        assert!(!state.record_reply("192.0.2.99", &t));
        assert_eq!(state.restrictions().alive_count(), 0);
        assert!(sink.hosts().is_empty());
        // Still remembered as alive so a later duplicate stays quiet.
        assert_eq!(state.alive_len(), 1);
    }

    #[test]
    fn test_scan_cap_publishes_k_hosts_then_finish() {
        // Five targets all alive, max_scan_hosts = 2: queue must carry the
        // first two hosts in arrival order, then the sentinel, nothing else.
        let t = targets(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
        let (mut state, sink) = state_with_sink(Some(2), None);
        for addr in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"] {
            state.record_reply(addr, &t);
        }
        assert_eq!(
            sink.messages(),
            vec![
                QueueMessage::Host("10.0.0.1".into()),
                QueueMessage::Host("10.0.0.2".into()),
                QueueMessage::Finish,
            ]
        );
        assert!(state.restrictions().scan_cap_reached());
        assert_eq!(state.dead_host_count(&t), 3, "suppressed hosts count dead");
    }

    #[test]
    fn test_alive_cap_latches_at_threshold() {
        let t = targets(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        let (mut state, _sink) = state_with_sink(None, Some(3));
        let cap = state.restrictions().alive_cap_handle();
        state.record_reply("10.0.0.1", &t);
        state.record_reply("10.0.0.2", &t);
        assert!(!cap.load(Ordering::Relaxed));
        state.record_reply("10.0.0.3", &t);
        assert!(cap.load(Ordering::Relaxed), "cap must latch at third host");
    }

    #[test]
    fn test_scan_cap_equal_alive_cap_single_finish() {
        let t = targets(&["10.0.0.1", "10.0.0.2"]);
        let (mut state, sink) = state_with_sink(Some(1), Some(1));
        state.record_reply("10.0.0.1", &t);
        state.record_reply("10.0.0.2", &t);
        assert_eq!(sink.hosts(), vec!["10.0.0.1"]);
        assert_eq!(sink.finish_count(), 1);
        assert!(state.restrictions().alive_cap_reached());
    }

    #[test]
    fn test_dead_host_count_two_live_one_dead() {
        let t = targets(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let (mut state, sink) = state_with_sink(None, None);
        state.record_reply("10.0.0.1", &t);
        state.record_reply("10.0.0.3", &t);
        assert_eq!(state.dead_host_count(&t), 1);
        assert_eq!(sink.hosts(), vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn test_dead_host_count_ignores_off_target_responders() {
        let t = targets(&["10.0.0.1"]);
        let (mut state, _sink) = state_with_sink(None, None);
        state.record_reply("198.51.100.4", &t);
        assert_eq!(state.dead_host_count(&t), 1);
    }
}
