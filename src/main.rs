//! Petrel - high-rate stateless single-packet network scanner.
//!
//! Usage:
//!   petrel -p 443 [-r PPS | -B BPS] [CIDR ...]
//!   petrel -p 53 -M dns --probe-args "A,example.com" 8.8.8.0/24
//!   petrel -p 80 --dryrun -n 1 192.0.2.1/32

use tracing_subscriber::EnvFilter;

fn main() {
    // Logs go to stderr (RUST_LOG=debug etc.); scan records own stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(petrel::cli::run());
}
