//! petrel — host-liveness preflight scanner.
//!
//! Usage:
//!   petrel <TARGET>... [--methods icmp,arp] [--db-address URL] [--dry-run]
//!
//! Logging via RUST_LOG (default "info"), written to stderr so stdout stays
//! machine-readable.

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = petrel::cli::Cli::parse();
    if let Err(e) = petrel::cli::run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
