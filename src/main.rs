//! Campus Escrow CLI
//!
//! Replays a CSV scenario of marketplace actions through the escrow
//! orchestrator and prints the final transaction ledger.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- scenario.csv > ledger.csv
//! cargo run -- --stale-after-hours 12 --sweep-batch 50 scenario.csv > ledger.csv
//! RUST_LOG=campus_escrow=debug cargo run -- scenario.csv > ledger.csv
//! ```
//!
//! Logs go to stderr so the ledger on stdout stays clean.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (missing arguments, file not found, file not readable, etc.)

use campus_escrow::cli;
use campus_escrow::replay::ScenarioReplay;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("campus_escrow=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::parse_args();
    let replay = ScenarioReplay::new(args.to_config());

    let mut output = std::io::stdout();
    if let Err(e) = replay.process(&args.input_file, &mut output) {
        tracing::error!(error = %e, "replay failed");
        process::exit(1);
    }
}
