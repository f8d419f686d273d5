//! CLI wrapper around the scan engine.
//!
//! Thin by design: parse flags, overlay them on the environment-derived
//! preferences, build the target set, run, report. Everything interesting
//! happens in [`crate::engine`].

use clap::Parser;
use std::net::IpAddr;

use crate::config::ScanPrefs;
use crate::engine::{AliveScan, ScanSummary};
use crate::queue::{MemorySink, QueueMessage};
use crate::targets::TargetSet;
use crate::AliveTest;

/// Petrel — host-liveness preflight scanner.
#[derive(Parser, Debug)]
#[command(name = "petrel", version, about)]
#[command(
    long_about = "Petrel probes a target list with raw ICMP echo, TCP SYN/ACK and ARP/ND \
    solicitations, sniffs for replies and publishes responsive hosts to a Redis work \
    queue for a downstream scanner. Requires CAP_NET_RAW."
)]
pub struct Cli {
    /// Target IP addresses (IPv4 or IPv6)
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Methods: comma-separated names (icmp,tcp_ack,tcp_syn,arp,consider_alive)
    /// or a decimal bitmask
    #[arg(long, default_value = "icmp")]
    pub methods: String,

    /// Queue connection string (redis URL or unix socket path)
    #[arg(long)]
    pub db_address: Option<String>,

    /// Queue database id
    #[arg(long)]
    pub db_id: Option<u32>,

    /// Stop publishing hosts after this many have been queued
    #[arg(long)]
    pub max_scan_hosts: Option<u64>,

    /// Stop probing after this many hosts were identified alive
    #[arg(long)]
    pub max_alive_hosts: Option<u64>,

    /// Fallback TCP probe ports, e.g. "80,443,8000-8100"
    #[arg(long)]
    pub port_range: Option<String>,

    /// Print queue traffic to stdout instead of publishing to Redis
    #[arg(long)]
    pub dry_run: bool,
}

/// Apply CLI flags on top of environment-derived preferences.
fn build_prefs(cli: &Cli) -> Result<ScanPrefs, String> {
    let mut prefs = ScanPrefs::from_env().map_err(|e| e.to_string())?;
    prefs.alive_test = AliveTest::parse(&cli.methods)?;
    if let Some(addr) = &cli.db_address {
        prefs.db_address = addr.clone();
    }
    if let Some(id) = cli.db_id {
        prefs.db_id = id;
    }
    if cli.max_scan_hosts.is_some() {
        prefs.max_scan_hosts = cli.max_scan_hosts;
    }
    if cli.max_alive_hosts.is_some() {
        prefs.max_alive_hosts = cli.max_alive_hosts;
    }
    if let Some(range) = &cli.port_range {
        prefs.port_range = Some(range.clone());
    }
    Ok(prefs)
}

fn build_targets(specs: &[String]) -> Result<TargetSet, String> {
    let mut targets = TargetSet::new();
    for spec in specs {
        let ip: IpAddr = spec
            .parse()
            .map_err(|_| format!("invalid target address '{spec}'"))?;
        targets.insert(ip);
    }
    Ok(targets)
}

pub fn run(cli: Cli) -> Result<(), String> {
    let prefs = build_prefs(&cli)?;
    let targets = build_targets(&cli.targets)?;
    let scan = AliveScan::new(prefs, targets);

    let summary = if cli.dry_run {
        let sink = MemorySink::new();
        let summary = scan
            .run_with_sink(Box::new(sink.clone()))
            .map_err(|e| e.to_string())?;
        for msg in sink.messages() {
            match msg {
                QueueMessage::Host(h) => println!("host   {h}"),
                QueueMessage::Finish => println!("finish"),
                QueueMessage::Status(s) => println!("status {s}"),
            }
        }
        summary
    } else {
        scan.run().map_err(|e| e.to_string())?
    };

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &ScanSummary) {
    println!(
        "{} of {} hosts alive, {} dead, finished in {}s",
        summary.targets - summary.dead,
        summary.targets,
        summary.dead,
        summary.duration.as_secs()
    );
}
