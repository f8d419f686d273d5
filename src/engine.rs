//! Scan orchestrator.
//!
//! Drives one alive scan end to end: opens the queue connection and the
//! probe sockets, arms the sniffer behind a startup barrier, runs the
//! method passes, drains late replies, and tears everything down in a fixed
//! order. The finish sentinel is the hard postcondition — a drop guard
//! armed right after the sink exists attempts it on every exit path,
//! including panics and init failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{ConfigError, ScanPrefs};
use crate::probe::{ProbeEmitter, ProbeError, ProbeMethod, SocketError, SocketSet, TcpFlag};
use crate::queue::{self, QueueError, RedisQueue, ResultSink};
use crate::restrictions::{ScanRestrictions, ScanState};
use crate::sniffer::{self, SnifferError};
use crate::targets::TargetSet;
use crate::AliveTest;

/// How long to keep sniffing after the last probe was sent.
pub const WAIT_FOR_REPLIES_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after the startup barrier so the capture thread settles into its
/// poll loop before the first probe.
const SNIFFER_SETTLE: Duration = Duration::from_secs(2);

/// How long the sniffer gets to exit after the break request before it is
/// detached.
const SNIFFER_BREAK_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Sniffer(#[from] SnifferError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// End-of-scan accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Number of hosts in the target list.
    pub targets: u64,
    /// Unique targets observed responding (including suppressed ones).
    pub alive: u64,
    /// Targets reported dead downstream: no reply, or alive but suppressed
    /// by the scan cap.
    pub dead: u64,
    /// Wall-clock scan duration.
    pub duration: Duration,
}

/// One configured alive scan.
pub struct AliveScan {
    prefs: ScanPrefs,
    targets: Arc<TargetSet>,
}

impl AliveScan {
    pub fn new(prefs: ScanPrefs, targets: TargetSet) -> Self {
        AliveScan {
            prefs,
            targets: Arc::new(targets),
        }
    }

    /// Run the scan against the configured Redis queue.
    pub fn run(self) -> Result<ScanSummary, ScanError> {
        let queue = match RedisQueue::connect(&self.prefs.db_address, self.prefs.db_id) {
            Ok(q) => q,
            Err(e) => {
                // The one path where the finish signal cannot be delivered.
                tracing::warn!(error = %e, "queue unreachable, finish signal cannot be delivered");
                return Err(e.into());
            }
        };
        self.run_with_sink(Box::new(queue))
    }

    /// Run the scan publishing into an arbitrary sink (tests, dry-run).
    pub fn run_with_sink(self, sink: Box<dyn ResultSink>) -> Result<ScanSummary, ScanError> {
        let started = Instant::now();
        let selector = self.prefs.alive_test;

        let restrictions =
            ScanRestrictions::new(self.prefs.max_scan_hosts, self.prefs.max_alive_hosts);
        let alive_cap = restrictions.alive_cap_handle();
        let state = Arc::new(Mutex::new(ScanState::new(restrictions, sink)));
        let _finish_guard = FinishGuard {
            state: Arc::clone(&state),
        };

        tracing::info!(
            targets = self.targets.len(),
            methods = %selector,
            "alive scan started"
        );

        let checked = if selector.contains(AliveTest::CONSIDER_ALIVE) {
            self.consider_alive_pass(&state, &alive_cap)
        } else {
            self.probe_and_sniff(selector, &state, &alive_cap)?
        };

        // DONE: accounting and the terminal messages.
        let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
        if st.restrictions().alive_cap_reached() {
            let unchecked = (self.targets.len() as u64).saturating_sub(checked);
            let msg = format!(
                "Maximum allowed number of alive hosts identified. There are still \
                 {unchecked} hosts whose alive status will not be checked."
            );
            if let Err(e) = st.push_status(&queue::errmsg_status(&msg)) {
                tracing::warn!(error = %e, "failed to report alive-cap advisory");
            }
        }

        let alive = st.restrictions().alive_count();
        let dead = st.dead_host_count(&self.targets);
        if let Err(e) = st.push_status(&queue::dead_hosts_status(dead)) {
            tracing::warn!(error = %e, "failed to report dead host count");
        }
        if let Err(e) = st.push_finish() {
            tracing::warn!(
                error = %e,
                "could not deliver finish signal, downstream scanner must be stopped manually"
            );
        }
        drop(st);

        let duration = started.elapsed();
        let summary = ScanSummary {
            targets: self.targets.len() as u64,
            alive,
            dead,
            duration,
        };
        tracing::info!(
            elapsed_s = duration.as_secs(),
            alive = summary.targets - summary.dead,
            targets = summary.targets,
            "alive scan finished"
        );
        Ok(summary)
    }

    /// CONSIDER_ALIVE: no sockets, no sniffer — every target is accounted
    /// directly, still honouring the alive cap.
    fn consider_alive_pass(
        &self,
        state: &Arc<Mutex<ScanState>>,
        alive_cap: &Arc<AtomicBool>,
    ) -> u64 {
        tracing::debug!("consider-alive: marking every target alive without probing");
        let mut checked = 0u64;
        for (key, _) in self.targets.iter() {
            if alive_cap.load(Ordering::Relaxed) {
                break;
            }
            let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
            st.record_reply(key, &self.targets);
            checked += 1;
        }
        checked
    }

    /// The probing states: INIT (sockets, capture) → SNIFFER_STARTING →
    /// PROBING → DRAINING → STOPPING. Teardown runs even when a method pass
    /// fails fatally.
    fn probe_and_sniff(
        &self,
        selector: AliveTest,
        state: &Arc<Mutex<ScanState>>,
        alive_cap: &Arc<AtomicBool>,
    ) -> Result<u64, ScanError> {
        let tcp_ports = if selector.wants_tcp() {
            self.prefs.tcp_probe_ports()?
        } else {
            Vec::new()
        };

        let sockets = SocketSet::open(selector)?;
        let cap = sniffer::open_capture()?;

        // Startup barrier: spawn() returns only once the filter is armed.
        let handle = sniffer::spawn(
            cap,
            Arc::clone(state),
            Arc::clone(&self.targets),
            Arc::clone(alive_cap),
        )?;
        std::thread::sleep(SNIFFER_SETTLE);

        let tcp_flag =
            if selector.contains(AliveTest::TCP_SYN) && !selector.contains(AliveTest::TCP_ACK) {
                TcpFlag::Syn
            } else {
                TcpFlag::Ack
            };
        let emitter = ProbeEmitter::new(
            &sockets,
            &self.targets,
            &tcp_ports,
            tcp_flag,
            Arc::clone(alive_cap),
        );

        let probing = (|| -> Result<u64, ProbeError> {
            let mut checked = 0u64;
            if selector.wants_tcp() {
                checked += emitter.run_method(ProbeMethod::Tcp)?;
            }
            if selector.contains(AliveTest::ICMP) {
                checked += emitter.run_method(ProbeMethod::Icmp)?;
            }
            if selector.contains(AliveTest::ARP) {
                checked += emitter.run_method(ProbeMethod::Arp)?;
            }
            Ok(checked)
        })();

        if probing.is_ok() {
            tracing::debug!("all probes sent, waiting for late replies");
            std::thread::sleep(WAIT_FOR_REPLIES_TIMEOUT);
        }

        if !handle.stop(SNIFFER_BREAK_GRACE) {
            tracing::warn!("sniffer detached, capture handle closes when the thread exits");
        }
        drop(sockets);

        Ok(probing?)
    }
}

/// Guarantees the finish-signal postcondition: attempted on drop whatever
/// path unwound us here. Harmless after a normal completion — the sentinel
/// push is idempotent.
struct FinishGuard {
    state: Arc<Mutex<ScanState>>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = st.push_finish() {
            tracing::warn!(
                error = %e,
                "could not deliver finish signal, downstream scanner must be stopped manually"
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemorySink, QueueMessage};
    use std::net::IpAddr;

    fn target_set(addrs: &[&str]) -> TargetSet {
        addrs
            .iter()
            .map(|s| s.parse::<IpAddr>().unwrap())
            .collect()
    }

    fn consider_alive_prefs() -> ScanPrefs {
        ScanPrefs {
            alive_test: AliveTest::CONSIDER_ALIVE,
            ..ScanPrefs::default()
        }
    }

    #[test]
    fn test_finish_guard_fires_on_drop() {
        let sink = MemorySink::new();
        let state = Arc::new(Mutex::new(ScanState::new(
            ScanRestrictions::new(None, None),
            Box::new(sink.clone()),
        )));
        {
            let _guard = FinishGuard {
                state: Arc::clone(&state),
            };
            // Simulated early bail-out: nothing else published.
        }
        assert_eq!(sink.finish_count(), 1, "guard must deliver the sentinel");
    }

    #[test]
    fn test_finish_guard_does_not_duplicate_sentinel() {
        let sink = MemorySink::new();
        let state = Arc::new(Mutex::new(ScanState::new(
            ScanRestrictions::new(None, None),
            Box::new(sink.clone()),
        )));
        {
            let _guard = FinishGuard {
                state: Arc::clone(&state),
            };
            let mut st = state.lock().unwrap();
            st.push_finish().unwrap();
        }
        assert_eq!(sink.finish_count(), 1);
    }

    #[test]
    fn test_consider_alive_publishes_all_targets_then_finish() {
        // No packets are sent; the queue carries every target in order,
        // then the sentinel, and the dead count is zero.
        let sink = MemorySink::new();
        let scan = AliveScan::new(
            consider_alive_prefs(),
            target_set(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
        );
        let summary = scan.run_with_sink(Box::new(sink.clone())).unwrap();

        assert_eq!(sink.hosts(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(sink.finish_count(), 1);
        assert_eq!(sink.statuses(), vec!["DEADHOST||| ||| ||| |||0"]);
        assert_eq!(summary.alive, 3);
        assert_eq!(summary.dead, 0);
    }

    #[test]
    fn test_consider_alive_respects_scan_cap() {
        let sink = MemorySink::new();
        let prefs = ScanPrefs {
            max_scan_hosts: Some(2),
            ..consider_alive_prefs()
        };
        let scan = AliveScan::new(
            prefs,
            target_set(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
        );
        let summary = scan.run_with_sink(Box::new(sink.clone())).unwrap();

        // The host hitting the cap is published, immediately followed by
        // the sentinel; the third target is suppressed and counted dead.
        assert_eq!(
            sink.messages()[..3],
            [
                QueueMessage::Host("10.0.0.1".into()),
                QueueMessage::Host("10.0.0.2".into()),
                QueueMessage::Finish,
            ]
        );
        assert_eq!(sink.finish_count(), 1);
        assert_eq!(summary.dead, 1);
    }

    #[test]
    fn test_consider_alive_respects_alive_cap() {
        let sink = MemorySink::new();
        let prefs = ScanPrefs {
            max_alive_hosts: Some(2),
            ..consider_alive_prefs()
        };
        let scan = AliveScan::new(
            prefs,
            target_set(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]),
        );
        let summary = scan.run_with_sink(Box::new(sink.clone())).unwrap();

        assert_eq!(sink.hosts(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(summary.alive, 2);
        assert_eq!(summary.dead, 2);
        let statuses = sink.statuses();
        assert_eq!(statuses.len(), 2, "advisory plus dead count");
        assert!(
            statuses[0].starts_with("ERRMSG||| ||| ||| |||Maximum allowed number"),
            "unexpected advisory: {}",
            statuses[0]
        );
        assert!(statuses[0].contains("still 2 hosts"));
        assert_eq!(statuses[1], "DEADHOST||| ||| ||| |||2");
    }

    #[test]
    fn test_empty_target_list_still_finishes() {
        let sink = MemorySink::new();
        let scan = AliveScan::new(consider_alive_prefs(), TargetSet::new());
        let summary = scan.run_with_sink(Box::new(sink.clone())).unwrap();
        assert_eq!(summary.targets, 0);
        assert_eq!(sink.finish_count(), 1);
        assert_eq!(sink.statuses(), vec!["DEADHOST||| ||| ||| |||0"]);
    }

    #[test]
    #[ignore] // Requires CAP_NET_RAW and a loopback-reachable host
    fn test_icmp_scan_of_loopback_publishes_host() {
        let sink = MemorySink::new();
        let prefs = ScanPrefs {
            alive_test: AliveTest::ICMP,
            ..ScanPrefs::default()
        };
        let scan = AliveScan::new(prefs, target_set(&["127.0.0.1"]));
        let summary = scan.run_with_sink(Box::new(sink.clone())).unwrap();
        assert_eq!(summary.alive, 1, "loopback must answer an echo request");
        assert_eq!(sink.hosts(), vec!["127.0.0.1"]);
        assert_eq!(sink.finish_count(), 1);
    }
}
