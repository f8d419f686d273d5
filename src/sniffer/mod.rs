//! Reply sniffer: a dedicated capture thread matching replies against the
//! target set.
//!
//! The thread signals readiness through a condition variable before its
//! first poll — the orchestrator must not emit probes into an unarmed
//! filter. The loop re-checks a stop latch on every poll timeout (100 ms),
//! so an external break takes effect within one tick; if the thread still
//! fails to exit within a grace period it is detached rather than joined
//! forever.

pub mod classify;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use pcap::{Active, Capture};
use thiserror::Error;

use crate::restrictions::ScanState;
use crate::targets::{canonical_str, TargetSet};
use crate::FILTER_PORT;

/// Capture snapshot length — liveness replies are small.
pub const SNAPLEN: i32 = 1500;

/// Poll timeout of the capture handle; bounds break latency.
pub const POLL_TIMEOUT_MS: i32 = 100;

#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("failed to open capture handle: {0}")]
    Capture(#[from] pcap::Error),

    #[error("failed to spawn sniffer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The capture filter: ICMPv6 echo replies (type 129), ICMPv4 echo replies,
/// TCP responses to our probe source port, and ARP replies (opcode 2).
pub fn bpf_filter() -> String {
    format!(
        "(ip6 or ip or arp) and (ip6[40]=129 or icmp[icmptype] = icmp-echoreply \
         or dst port {FILTER_PORT} or arp[6:2]=2)"
    )
}

/// Open the capture handle on the "any" pseudo-device, promiscuous off,
/// with the liveness filter installed.
pub fn open_capture() -> Result<Capture<Active>, SnifferError> {
    let mut cap = Capture::from_device("any")?
        .snaplen(SNAPLEN)
        .promisc(false)
        .timeout(POLL_TIMEOUT_MS)
        .open()?;
    cap.filter(&bpf_filter(), true)?;
    Ok(cap)
}

/// Handle to a running sniffer thread.
pub struct SnifferHandle {
    stop: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl SnifferHandle {
    /// Ask the capture loop to exit at its next poll tick.
    pub fn request_break(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Break the loop and wait up to `grace` for the thread to exit.
    ///
    /// Returns true when the thread was joined; false when it was still
    /// blocked after the grace period and had to be detached (it holds only
    /// `Arc`s, so the shared state stays valid either way).
    pub fn stop(mut self, grace: Duration) -> bool {
        self.request_break();
        match self.done_rx.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.join.take() {
                    if handle.join().is_err() {
                        tracing::warn!("sniffer thread panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("sniffer did not exit within grace period, detaching");
                false
            }
        }
    }
}

/// Spawn the sniffer thread and block until its capture loop is armed.
pub fn spawn(
    cap: Capture<Active>,
    state: Arc<Mutex<ScanState>>,
    targets: Arc<TargetSet>,
    alive_cap: Arc<AtomicBool>,
) -> Result<SnifferHandle, SnifferError> {
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new((Mutex::new(false), Condvar::new()));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let thread_stop = Arc::clone(&stop);
    let thread_ready = Arc::clone(&ready);
    let join = std::thread::Builder::new()
        .name("reply-sniffer".to_string())
        .spawn(move || {
            run_capture_loop(cap, state, targets, alive_cap, thread_stop, thread_ready);
            drop(done_tx);
        })?;

    // Startup barrier: probes must not be emitted before the filter is armed.
    let (lock, cvar) = &*ready;
    let mut armed = lock.lock().unwrap_or_else(|p| p.into_inner());
    while !*armed {
        armed = cvar.wait(armed).unwrap_or_else(|p| p.into_inner());
    }
    drop(armed);

    Ok(SnifferHandle {
        stop,
        done_rx,
        join: Some(join),
    })
}

fn run_capture_loop(
    mut cap: Capture<Active>,
    state: Arc<Mutex<ScanState>>,
    targets: Arc<TargetSet>,
    alive_cap: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ready: Arc<(Mutex<bool>, Condvar)>,
) {
    {
        let (lock, cvar) = &*ready;
        let mut armed = lock.lock().unwrap_or_else(|p| p.into_inner());
        *armed = true;
        cvar.notify_one();
    }

    let link = cap.get_datalink();
    let l3 = classify::l3_offset(link);
    tracing::debug!(linktype = ?link, l3_offset = l3, "capture loop armed");

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match cap.next_packet() {
            Ok(packet) => {
                // Once the alive cap latches, replies are drained but no
                // longer classified.
                if alive_cap.load(Ordering::Relaxed) {
                    continue;
                }
                let Some(src) = classify::extract_source_ip(packet.data, l3) else {
                    tracing::debug!("unclassifiable frame, skipping");
                    continue;
                };
                let addr = canonical_str(src);
                let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
                if guard.record_reply(&addr, &targets) {
                    tracing::debug!(host = %addr, "host is alive");
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "capture loop ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bpf_filter_terms() {
        let filter = bpf_filter();
        assert!(filter.contains("ip6[40]=129"), "ICMPv6 echo reply term");
        assert!(filter.contains("icmp-echoreply"), "ICMPv4 echo reply term");
        assert!(
            filter.contains(&format!("dst port {FILTER_PORT}")),
            "TCP reply term must match the probe source port"
        );
        assert!(filter.contains("arp[6:2]=2"), "ARP reply term");
    }

    #[test]
    fn test_capture_tuning_constants() {
        assert_eq!(SNAPLEN, 1500);
        assert_eq!(POLL_TIMEOUT_MS, 100);
    }

    #[test]
    fn test_v6_echo_reply_frame_reaches_the_queue() {
        // The classification pipeline end to end: a captured ICMPv6 echo
        // reply on a cooked-header handle is parsed, canonicalised and
        // published for the matching v6 target.
        use crate::queue::MemorySink;
        use crate::restrictions::{ScanRestrictions, ScanState};
        use std::net::Ipv6Addr;

        let src: Ipv6Addr = "2001:DB8:0:0:0:0:0:5".parse().unwrap();
        let l3 = classify::l3_offset(pcap::Linktype::LINUX_SLL);
        let mut frame = vec![0u8; l3 + 48];
        frame[l3] = 0x60; // version 6
        frame[l3 + 8..l3 + 24].copy_from_slice(&src.octets());
        frame[l3 + 40] = 129; // echo reply

        let targets: TargetSet = ["2001:db8::5".parse().unwrap()].into_iter().collect();
        let sink = MemorySink::new();
        let mut state = ScanState::new(
            ScanRestrictions::new(None, None),
            Box::new(sink.clone()),
        );

        let ip = classify::extract_source_ip(&frame, l3).expect("frame must classify");
        assert!(state.record_reply(&canonical_str(ip), &targets));
        assert_eq!(sink.hosts(), vec!["2001:db8::5"]);
    }

    #[test]
    #[ignore] // Requires CAP_NET_RAW — run with: sudo cargo test -- --ignored
    fn test_open_capture_and_stop_cleanly() {
        use crate::queue::MemorySink;
        use crate::restrictions::{ScanRestrictions, ScanState};

        let cap = open_capture().expect("capture open needs CAP_NET_RAW");
        let state = Arc::new(Mutex::new(ScanState::new(
            ScanRestrictions::new(None, None),
            Box::new(MemorySink::new()),
        )));
        let targets = Arc::new(TargetSet::new());
        let alive_cap = Arc::new(AtomicBool::new(false));

        let handle = spawn(cap, state, targets, alive_cap).unwrap();
        assert!(
            handle.stop(Duration::from_secs(2)),
            "sniffer must exit within one poll tick of the break request"
        );
    }
}
